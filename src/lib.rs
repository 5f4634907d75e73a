pub mod binlog;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod error;
pub mod factory;
pub mod listener;
pub mod mapper;
pub mod schema;

pub use config::{ConsumerConfig, ConsumersConfig};
pub use consumer::{ConsumerState, EntityEventsConsumer};
pub use error::{Error, Result};
pub use factory::{ConsumersFactory, EntityListener};
pub use listener::EntityEventsListener;
pub use mapper::{JsonRowMapper, MappingError, RowMapper};
pub use schema::{ConnectionParams, Entity, EntityMetadata, Platform, SchemaRegistry, SchemaResolver};
