//! Error types and result handling for entity-cdc.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use entity_cdc::{Error, Result};
//!
//! fn consumer_for(connection: &str) -> Result<()> {
//!     Err(Error::NoListeners {
//!         connection: connection.to_string(),
//!     })
//! }
//!
//! match consumer_for("billing") {
//!     Ok(()) => println!("Consumer ready"),
//!     Err(Error::NoListeners { connection }) => eprintln!("Nothing listens on {}", connection),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use crate::mapper::MappingError;
use thiserror::Error;

/// The main error type for entity-cdc operations.
///
/// Wiring problems (`NoListeners`, `EntityNotFound`, `UnsupportedPlatform`)
/// surface when a consumer is built or started. Failures of user callbacks
/// never show up here: they are logged by the listener registry.
#[derive(Error, Debug)]
pub enum Error {
    /// Generic configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No registered listener handles an entity on the requested connection.
    #[error("Cannot found any entity listeners for connection name \"{connection}\"")]
    NoListeners {
        /// The requested connection name
        connection: String,
    },

    /// The schema resolver does not know the entity a listener declares.
    #[error("The entity \"{entity}\" cannot be found for the listener \"{listener}\"")]
    EntityNotFound {
        /// Declared entity type
        entity: String,
        /// Listener identity
        listener: String,
    },

    /// The schema resolver does not know the entity type.
    #[error("Unknown entity \"{entity}\"")]
    UnknownEntity {
        /// Requested entity type
        entity: String,
    },

    /// The entity lives on a connection that cannot produce a binlog.
    #[error("The connection \"{connection}\" must be a MySQL connection (found {platform})")]
    UnsupportedPlatform {
        /// Connection name
        connection: String,
        /// Platform declared by the connection
        platform: String,
    },

    /// I/O error, typically from checkpoint file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error when encoding checkpoints or raw configs.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file could not be loaded.
    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    /// A row could not be converted to its entity.
    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    /// The replication source refused the requested start position.
    ///
    /// Typically the checkpoint references a purged or rotated log file.
    #[error("Invalid binlog position {position}: {message}")]
    InvalidPosition {
        /// The rejected position
        position: String,
        /// Why the source rejected it
        message: String,
    },

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },
}

/// A convenient Result type alias for entity-cdc operations.
///
/// This is equivalent to `std::result::Result<T, entity_cdc::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
