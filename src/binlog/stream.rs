use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use super::types::{ReplicationEvent, StreamPosition};
use crate::Result;

/// Settings used to open a binlog stream.
///
/// Built through [`StreamConfigBuilder`] by the consumer from its bound
/// entities, then handed to [`ReplicationSource::open`].
#[derive(Clone, PartialEq)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub charset: Option<String>,
    /// Server id announced to the source (must be unique among replicas)
    pub slave_id: u32,
    pub heartbeat_period: Duration,
    pub gtid: Option<String>,
    pub mariadb_gtid: Option<String>,
    pub table_cache_size: Option<usize>,
    /// Databases to subscribe to; empty means all
    pub databases_only: Vec<String>,
    /// Tables to subscribe to; empty means all
    pub tables_only: Vec<String>,
    /// Resume position; `None` starts from the current server position
    pub start_position: Option<StreamPosition>,
}

impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("charset", &self.charset)
            .field("slave_id", &self.slave_id)
            .field("heartbeat_period", &self.heartbeat_period)
            .field("gtid", &self.gtid)
            .field("mariadb_gtid", &self.mariadb_gtid)
            .field("table_cache_size", &self.table_cache_size)
            .field("databases_only", &self.databases_only)
            .field("tables_only", &self.tables_only)
            .field("start_position", &self.start_position)
            .finish()
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: None,
            password: None,
            charset: None,
            slave_id: 100,
            heartbeat_period: Duration::from_secs(3),
            gtid: None,
            mariadb_gtid: None,
            table_cache_size: None,
            databases_only: vec![],
            tables_only: vec![],
            start_position: None,
        }
    }
}

impl StreamConfig {
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::default()
    }

    /// Whether a rows event on `database.table` is part of the subscription.
    pub fn accepts(&self, database: &str, table: &str) -> bool {
        (self.databases_only.is_empty() || self.databases_only.iter().any(|d| d == database))
            && (self.tables_only.is_empty() || self.tables_only.iter().any(|t| t == table))
    }
}

/// Mutable builder for [`StreamConfig`].
///
/// User configurators receive `&mut StreamConfigBuilder` so they can
/// override any value the consumer derived from its entities.
#[derive(Debug, Clone, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    pub fn with_host(&mut self, host: impl Into<String>) -> &mut Self {
        self.config.host = host.into();
        self
    }

    pub fn with_port(&mut self, port: u16) -> &mut Self {
        self.config.port = port;
        self
    }

    pub fn with_user(&mut self, user: impl Into<String>) -> &mut Self {
        self.config.user = Some(user.into());
        self
    }

    pub fn with_password(&mut self, password: impl Into<String>) -> &mut Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn with_charset(&mut self, charset: impl Into<String>) -> &mut Self {
        self.config.charset = Some(charset.into());
        self
    }

    pub fn with_slave_id(&mut self, slave_id: u32) -> &mut Self {
        self.config.slave_id = slave_id;
        self
    }

    pub fn with_heartbeat_period(&mut self, period: Duration) -> &mut Self {
        self.config.heartbeat_period = period;
        self
    }

    pub fn with_gtid(&mut self, gtid: impl Into<String>) -> &mut Self {
        self.config.gtid = Some(gtid.into());
        self
    }

    pub fn with_mariadb_gtid(&mut self, gtid: impl Into<String>) -> &mut Self {
        self.config.mariadb_gtid = Some(gtid.into());
        self
    }

    pub fn with_table_cache_size(&mut self, size: usize) -> &mut Self {
        self.config.table_cache_size = Some(size);
        self
    }

    pub fn with_databases_only(&mut self, databases: Vec<String>) -> &mut Self {
        self.config.databases_only = databases;
        self
    }

    pub fn with_tables_only(&mut self, tables: Vec<String>) -> &mut Self {
        self.config.tables_only = tables;
        self
    }

    pub fn with_start_position(&mut self, position: Option<StreamPosition>) -> &mut Self {
        self.config.start_position = position;
        self
    }

    pub fn start_position(&self) -> Option<&StreamPosition> {
        self.config.start_position.as_ref()
    }

    pub fn build(&self) -> StreamConfig {
        self.config.clone()
    }
}

/// Something that can open binlog streams, e.g. a MySQL server.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Opens a stream positioned at `config.start_position`.
    ///
    /// Must fail with [`crate::Error::InvalidPosition`] when the start
    /// position is unknown to the server, so callers can retry from the
    /// current position.
    async fn open(&self, config: &StreamConfig) -> Result<Box<dyn ReplicationStream>>;
}

/// An open binlog stream.
#[async_trait]
pub trait ReplicationStream: Send {
    /// Reads at most one event. `Ok(None)` means no event was available
    /// within the stream's own wait budget.
    async fn next_event(&mut self) -> Result<Option<ReplicationEvent>>;

    /// Position of the next event the stream would read.
    fn current_position(&self) -> StreamPosition;

    async fn close(&mut self) -> Result<()>;
}
