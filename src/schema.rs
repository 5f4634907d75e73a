//! Entity and connection metadata.
//!
//! The consumer never inspects entity types at runtime: each entity names
//! itself through [`Entity::ENTITY_TYPE`], and a [`SchemaResolver`] maps
//! that name to its table and connection once, when the entity is bound.

use std::collections::HashMap;
use std::fmt;

use crate::mapper::RowMapper;

/// A typed row of a replicated table.
pub trait Entity: Sized + Send + 'static {
    /// Stable identifier used to look the entity up in the schema.
    const ENTITY_TYPE: &'static str;

    /// Mapper converting rows of the entity table into `Self`.
    fn row_mapper(metadata: &EntityMetadata) -> Box<dyn RowMapper<Self>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    MySql,
    MariaDb,
    Other(String),
}

impl Platform {
    pub fn has_binlog(&self) -> bool {
        matches!(self, Platform::MySql | Platform::MariaDb)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::MySql => f.write_str("mysql"),
            Platform::MariaDb => f.write_str("mariadb"),
            Platform::Other(name) => f.write_str(name),
        }
    }
}

/// A named database connection as declared by the application.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub name: String,
    pub platform: Platform,
    pub database: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ConnectionParams {
    pub fn mysql(name: impl Into<String>) -> Self {
        Self::new(name, Platform::MySql)
    }

    pub fn new(name: impl Into<String>, platform: Platform) -> Self {
        Self {
            name: name.into(),
            platform,
            database: None,
            host: None,
            port: None,
            user: None,
            password: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Where an entity is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetadata {
    pub entity_type: String,
    pub table: String,
    pub connection: ConnectionParams,
}

/// Resolves entity types to their storage metadata.
pub trait SchemaResolver: Send + Sync {
    /// Returns `None` when the entity type is unknown.
    fn resolve(&self, entity_type: &str) -> Option<EntityMetadata>;
}

/// Static [`SchemaResolver`] built from declared connections and entities.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    connections: HashMap<String, ConnectionParams>,
    entities: HashMap<String, (String, String)>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(mut self, connection: ConnectionParams) -> Self {
        self.connections.insert(connection.name.clone(), connection);
        self
    }

    /// Declares that `E` is stored in `table` on `connection`.
    pub fn with_entity<E: Entity>(self, table: impl Into<String>, connection: impl Into<String>) -> Self {
        self.with_entity_type(E::ENTITY_TYPE, table, connection)
    }

    pub fn with_entity_type(
        mut self,
        entity_type: impl Into<String>,
        table: impl Into<String>,
        connection: impl Into<String>,
    ) -> Self {
        self.entities
            .insert(entity_type.into(), (table.into(), connection.into()));
        self
    }
}

impl SchemaResolver for SchemaRegistry {
    fn resolve(&self, entity_type: &str) -> Option<EntityMetadata> {
        let (table, connection) = self.entities.get(entity_type)?;
        let connection = self.connections.get(connection)?;

        Some(EntityMetadata {
            entity_type: entity_type.to_string(),
            table: table.clone(),
            connection: connection.clone(),
        })
    }
}
