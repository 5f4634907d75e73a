//! Builds consumers from registered listeners.
//!
//! ```rust,ignore
//! let mut factory = ConsumersFactory::new(schema, source);
//! factory.configure_raw("db", json!({
//!     "user": "replication_user",
//!     "password": "replication_password",
//!     "logPositionFile": "var/db_events",
//! }))?;
//! factory.register(MyEntityListener::default());
//!
//! let mut consumer = factory.for_connection("db")?;
//! consumer.start().await?;
//! ```

use serde_json::Value;
use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::binlog::ReplicationSource;
use crate::checkpoint::CheckpointStore;
use crate::config::{ConsumerConfig, ConsumersConfig};
use crate::consumer::EntityEventsConsumer;
use crate::schema::{Entity, SchemaResolver};
use crate::{Error, Result};

/// Handles insert, update and delete events of one entity type.
pub trait EntityListener: Send + Sync + 'static {
    type Entity: Entity;

    /// Identity used in logs.
    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }

    fn on_insert(&self, entity: &Self::Entity) -> anyhow::Result<()>;

    fn on_update(&self, before: &Self::Entity, after: &Self::Entity) -> anyhow::Result<()>;

    fn on_delete(&self, entity: &Self::Entity) -> anyhow::Result<()>;
}

trait RegisteredListener: Send + Sync {
    fn entity_type(&self) -> &'static str;

    fn name(&self) -> String;

    fn bind(&self, consumer: &mut EntityEventsConsumer) -> Result<()>;
}

struct Registration<L>(Arc<L>);

impl<L: EntityListener> RegisteredListener for Registration<L> {
    fn entity_type(&self) -> &'static str {
        L::Entity::ENTITY_TYPE
    }

    fn name(&self) -> String {
        self.0.name()
    }

    fn bind(&self, consumer: &mut EntityEventsConsumer) -> Result<()> {
        let name = self.0.name();
        let (on_insert, on_update, on_delete) = (Arc::clone(&self.0), Arc::clone(&self.0), Arc::clone(&self.0));

        consumer
            .for_entity::<L::Entity>()?
            .inserted_as(name.clone(), move |entity| on_insert.on_insert(entity))
            .updated_as(name.clone(), move |before, after| on_update.on_update(before, after))
            .deleted_as(name, move |entity| on_delete.on_delete(entity));

        Ok(())
    }
}

/// Creates one [`EntityEventsConsumer`] per connection.
///
/// Creating two consumers on the same connection is strongly discouraged:
/// they would share the checkpoint file.
pub struct ConsumersFactory {
    schema: Arc<dyn SchemaResolver>,
    source: Arc<dyn ReplicationSource>,
    config: HashMap<String, Arc<ConsumerConfig>>,
    listeners: Vec<Box<dyn RegisteredListener>>,
}

impl ConsumersFactory {
    pub fn new(schema: Arc<dyn SchemaResolver>, source: Arc<dyn ReplicationSource>) -> Self {
        Self {
            schema,
            source,
            config: HashMap::new(),
            listeners: vec![],
        }
    }

    pub fn with_config(mut self, config: ConsumersConfig) -> Self {
        for (connection, config) in config.connections {
            self.configure(connection, config);
        }
        self
    }

    /// Sets the configuration of `connection`, replacing any previous one.
    pub fn configure(&mut self, connection: impl Into<String>, config: ConsumerConfig) {
        self.config.insert(connection.into(), Arc::new(config));
    }

    /// Same as [`ConsumersFactory::configure`], from a raw mapping.
    pub fn configure_raw(&mut self, connection: impl Into<String>, config: Value) -> Result<()> {
        self.configure(connection, ConsumerConfig::from_value(config)?);
        Ok(())
    }

    /// Adds a listener. It is seen by every later `for_connection` call.
    pub fn register<L: EntityListener>(&mut self, listener: L) {
        self.register_shared(Arc::new(listener));
    }

    pub fn register_shared<L: EntityListener>(&mut self, listener: Arc<L>) {
        self.listeners.push(Box::new(Registration(listener)));
    }

    /// Builds the consumer of `connection`, wired to every listener whose
    /// entity is stored on it. The consumer is returned unstarted.
    ///
    /// # Errors
    ///
    /// - [`Error::EntityNotFound`] if any registered listener declares an
    ///   entity the schema does not know
    /// - [`Error::NoListeners`] if no listener handles an entity of
    ///   `connection`
    pub fn for_connection(&self, connection: &str) -> Result<EntityEventsConsumer> {
        let listeners = self.listeners_for(connection)?;

        if listeners.is_empty() {
            return Err(Error::NoListeners {
                connection: connection.to_string(),
            });
        }

        let config = self.config.get(connection).cloned().unwrap_or_default();
        let configurator = Arc::clone(&config);

        let mut consumer = EntityEventsConsumer::new(Arc::clone(&self.schema), Arc::clone(&self.source))
            .with_checkpoints(CheckpointStore::from_path(config.log_position_file.clone()))
            .with_checkpoint_interval(config.checkpoint_interval())
            .with_configurator(move |builder| configurator.configure(builder));

        for listener in listeners {
            debug!(
                connection,
                listener = %listener.name(),
                entity = listener.entity_type(),
                "Binding listener"
            );
            listener.bind(&mut consumer)?;
        }

        Ok(consumer)
    }

    fn listeners_for(&self, connection: &str) -> Result<Vec<&dyn RegisteredListener>> {
        let mut listeners = vec![];

        for listener in &self.listeners {
            let metadata = self
                .schema
                .resolve(listener.entity_type())
                .ok_or_else(|| Error::EntityNotFound {
                    entity: listener.entity_type().to_string(),
                    listener: listener.name(),
                })?;

            if metadata.connection.name == connection {
                listeners.push(listener.as_ref());
            }
        }

        Ok(listeners)
    }
}
