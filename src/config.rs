use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::binlog::StreamConfigBuilder;
use crate::Result;

/// Settings of the consumer attached to one connection.
///
/// Keys are accepted in snake_case or camelCase. The lowercased camelCase
/// forms are accepted too, since file sources lowercase their keys.
///
/// Every value is optional. Stream settings that are present override what
/// the consumer derives from its entities' connection.
#[derive(Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// File storing the last consumed binlog position
    #[serde(alias = "logPositionFile", alias = "logpositionfile")]
    pub log_position_file: Option<PathBuf>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub charset: Option<String>,
    pub gtid: Option<String>,
    #[serde(alias = "mariaDbGtid", alias = "mariadbgtid")]
    pub mariadb_gtid: Option<String>,
    #[serde(alias = "slaveId", alias = "slaveid")]
    pub slave_id: Option<u32>,
    #[serde(alias = "tableCacheSize", alias = "tablecachesize")]
    pub table_cache_size: Option<usize>,
    /// Heartbeat period in seconds
    #[serde(alias = "heartbeatPeriod", alias = "heartbeatperiod")]
    pub heartbeat_period: Option<f64>,
    /// Flush the checkpoint while consuming, at most this often
    #[serde(alias = "checkpointIntervalSecs", alias = "checkpointintervalsecs")]
    pub checkpoint_interval_secs: Option<u64>,
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("log_position_file", &self.log_position_file)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("charset", &self.charset)
            .field("gtid", &self.gtid)
            .field("mariadb_gtid", &self.mariadb_gtid)
            .field("slave_id", &self.slave_id)
            .field("table_cache_size", &self.table_cache_size)
            .field("heartbeat_period", &self.heartbeat_period)
            .field("checkpoint_interval_secs", &self.checkpoint_interval_secs)
            .finish()
    }
}

impl ConsumerConfig {
    /// Builds a configuration from a raw mapping. Unknown keys are ignored.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn log_position_file(&self) -> Option<&Path> {
        self.log_position_file.as_deref()
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_secs.map(Duration::from_secs)
    }

    /// Applies every tuning value present in this configuration.
    pub fn configure(&self, builder: &mut StreamConfigBuilder) {
        if let Some(user) = &self.user {
            builder.with_user(user.clone());
        }
        if let Some(password) = &self.password {
            builder.with_password(password.clone());
        }
        if let Some(host) = &self.host {
            builder.with_host(host.clone());
        }
        if let Some(port) = self.port {
            builder.with_port(port);
        }
        if let Some(charset) = &self.charset {
            builder.with_charset(charset.clone());
        }
        if let Some(gtid) = &self.gtid {
            builder.with_gtid(gtid.clone());
        }
        if let Some(gtid) = &self.mariadb_gtid {
            builder.with_mariadb_gtid(gtid.clone());
        }
        if let Some(slave_id) = self.slave_id {
            builder.with_slave_id(slave_id);
        }
        if let Some(size) = self.table_cache_size {
            builder.with_table_cache_size(size);
        }
        if let Some(period) = self.heartbeat_period {
            match Duration::try_from_secs_f64(period) {
                Ok(period) => {
                    builder.with_heartbeat_period(period);
                }
                Err(e) => warn!("Ignoring heartbeat period {}: {}", period, e),
            }
        }
    }
}

impl TryFrom<Value> for ConsumerConfig {
    type Error = crate::Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl TryFrom<serde_json::Map<String, Value>> for ConsumerConfig {
    type Error = crate::Error;

    fn try_from(map: serde_json::Map<String, Value>) -> Result<Self> {
        Self::from_value(Value::Object(map))
    }
}

/// Consumer configurations indexed by connection name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ConsumersConfig {
    pub connections: HashMap<String, ConsumerConfig>,
}

impl ConsumersConfig {
    /// Loads configurations from a file, overridden by `ENTITY_CDC_` variables.
    ///
    /// `ENTITY_CDC_DB__PASSWORD=secret` sets the password of connection `db`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ENTITY_CDC")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    pub fn get(&self, connection: &str) -> Option<&ConsumerConfig> {
        self.connections.get(connection)
    }
}
