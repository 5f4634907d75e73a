//! Binlog consumer dispatching row events to entity listeners.
//!
//! [`EntityEventsConsumer`] is pulled by its owner: every call to
//! [`EntityEventsConsumer::consume`] reads at most one event from the
//! stream and runs the matching callbacks before returning. There is no
//! background task; the consumer is meant to be driven by one task.
//!
//! ```rust,ignore
//! let mut consumer = EntityEventsConsumer::new(schema, source)
//!     .with_checkpoint_file("var/events/db");
//!
//! consumer
//!     .for_entity::<Foo>()?
//!     .inserted(|foo| { println!("inserted {:?}", foo); Ok(()) });
//!
//! consumer.start().await?;
//! while running {
//!     consumer.consume().await?;
//! }
//! consumer.stop().await?;
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::binlog::{
    EventPayload, ReplicationSource, ReplicationStream, RowChangeEvent, StreamConfig, StreamConfigBuilder,
    StreamPosition,
};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::listener::{BoundEntity, EntityEventsListener};
use crate::schema::{Entity, SchemaResolver};
use crate::{Error, Result};

/// Callback adjusting the stream configuration before it is opened.
pub type Configurator = Box<dyn Fn(&mut StreamConfigBuilder) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Never started.
    Idle,
    /// A stream is open.
    Streaming,
    /// Stopped after streaming; may be started again.
    Stopped,
}

/// Consumes the binlog of one connection for a set of entities.
///
/// Running two consumers on the same connection and checkpoint file at
/// the same time is not supported.
pub struct EntityEventsConsumer {
    schema: Arc<dyn SchemaResolver>,
    source: Arc<dyn ReplicationSource>,
    checkpoints: CheckpointStore,
    configurator: Option<Configurator>,
    checkpoint_interval: Option<Duration>,
    bindings: Vec<Box<dyn BoundEntity>>,
    by_entity: HashMap<&'static str, usize>,
    by_table: HashMap<String, usize>,
    stream: Option<Box<dyn ReplicationStream>>,
    state: ConsumerState,
    position: Option<StreamPosition>,
    event_count: u64,
    last_flush: Instant,
}

impl EntityEventsConsumer {
    pub fn new(schema: Arc<dyn SchemaResolver>, source: Arc<dyn ReplicationSource>) -> Self {
        Self {
            schema,
            source,
            checkpoints: CheckpointStore::disabled(),
            configurator: None,
            checkpoint_interval: None,
            bindings: vec![],
            by_entity: HashMap::new(),
            by_table: HashMap::new(),
            stream: None,
            state: ConsumerState::Idle,
            position: None,
            event_count: 0,
            last_flush: Instant::now(),
        }
    }

    /// Stores the last consumed position in `path`.
    pub fn with_checkpoint_file(self, path: impl AsRef<Path>) -> Self {
        self.with_checkpoints(CheckpointStore::new(path))
    }

    pub fn with_checkpoints(mut self, checkpoints: CheckpointStore) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Registers a callback run last on the stream configuration, so it
    /// can override any derived value.
    pub fn with_configurator<F>(mut self, configurator: F) -> Self
    where
        F: Fn(&mut StreamConfigBuilder) + Send + Sync + 'static,
    {
        self.configurator = Some(Box::new(configurator));
        self
    }

    /// Also flush the checkpoint while consuming, at most once per `interval`.
    pub fn with_checkpoint_interval(mut self, interval: Option<Duration>) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Position after the last fully processed event, if any.
    pub fn position(&self) -> Option<&StreamPosition> {
        self.position.as_ref()
    }

    /// Number of events consumed since this consumer was created.
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn bound_tables(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.metadata().table.as_str()).collect()
    }

    /// Returns the callback registry of `E`, binding the entity on first use.
    ///
    /// Entities bound while streaming are part of the subscription from
    /// the next `start()` on.
    ///
    /// # Errors
    ///
    /// Fails if the schema does not know `E`, or if its table is already
    /// bound to another entity.
    pub fn for_entity<E: Entity>(&mut self) -> Result<&mut EntityEventsListener<E>> {
        let index = match self.by_entity.get(E::ENTITY_TYPE) {
            Some(&index) => index,
            None => self.bind::<E>()?,
        };

        self.bindings[index]
            .as_any_mut()
            .downcast_mut::<EntityEventsListener<E>>()
            .ok_or_else(|| {
                Error::Config(format!(
                    "Entity type \"{}\" is already bound to another type",
                    E::ENTITY_TYPE
                ))
            })
    }

    fn bind<E: Entity>(&mut self) -> Result<usize> {
        let metadata = self
            .schema
            .resolve(E::ENTITY_TYPE)
            .ok_or_else(|| Error::UnknownEntity {
                entity: E::ENTITY_TYPE.to_string(),
            })?;

        if let Some(&other) = self.by_table.get(&metadata.table) {
            return Err(Error::Config(format!(
                "Table \"{}\" is already bound to entity \"{}\"",
                metadata.table,
                self.bindings[other].metadata().entity_type
            )));
        }

        debug!(
            entity = E::ENTITY_TYPE,
            table = %metadata.table,
            connection = %metadata.connection.name,
            "Binding entity"
        );

        let mapper = E::row_mapper(&metadata);
        let index = self.bindings.len();
        self.by_table.insert(metadata.table.clone(), index);
        self.by_entity.insert(E::ENTITY_TYPE, index);
        self.bindings
            .push(Box::new(EntityEventsListener::new(metadata, mapper)));

        Ok(index)
    }

    /// Opens the stream, resuming from the last known position.
    ///
    /// Does nothing if the consumer is already streaming. A resume position
    /// refused by the server is dropped with a warning. The stream then
    /// opens at the current server position, which replaces the checkpoint.
    pub async fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        if self.position.is_none() {
            self.position = self.checkpoints.load().await?.map(|c| c.position);
        }

        let config = self.stream_config()?;
        debug!(config = ?config, "Opening binlog stream");

        let opened = self.source.open(&config).await;
        let stream = match opened {
            Ok(stream) => stream,
            Err(Error::InvalidPosition { position, message }) if config.start_position.is_some() => {
                warn!(
                    position = %position,
                    "Invalid checkpoint position, restarting from current position : {}",
                    message
                );
                let config = StreamConfig {
                    start_position: None,
                    ..config
                };
                let stream = self.source.open(&config).await?;

                // Replace the rejected checkpoint so the next start opens once.
                self.position = Some(stream.current_position());
                if let Err(e) = self.flush_checkpoint().await {
                    warn!(error = %e, "Failed to replace invalid checkpoint : {}", e);
                }
                stream
            }
            Err(e) => return Err(e),
        };

        info!(
            position = %stream.current_position(),
            tables = ?self.bound_tables(),
            "Started binlog consumer"
        );

        self.stream = Some(stream);
        self.state = ConsumerState::Streaming;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Consumes at most one event, starting the consumer if needed.
    ///
    /// # Errors
    ///
    /// Stream failures and rows that cannot be mapped to their entity are
    /// returned. Listener failures are logged, never returned.
    pub async fn consume(&mut self) -> Result<()> {
        self.start().await?;

        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::Replication {
                message: "binlog stream is not open".to_string(),
            });
        };

        let Some(event) = stream.next_event().await? else {
            return self.flush_if_due().await;
        };

        debug!(position = %event.position, "{}", event);

        if let EventPayload::Rows(rows) = &event.payload {
            self.dispatch(rows)?;
        }

        self.position = Some(event.position);
        self.event_count += 1;
        self.flush_if_due().await
    }

    fn dispatch(&mut self, rows: &RowChangeEvent) -> Result<()> {
        match self.by_table.get(&rows.table) {
            Some(&index) => Ok(self.bindings[index].dispatch(&rows.change)?),
            None => {
                error!(
                    database = %rows.database,
                    table = %rows.table,
                    "Received rows event for a table without bound entity, ignoring it"
                );
                Ok(())
            }
        }
    }

    /// Closes the stream and saves the last consumed position.
    ///
    /// Does nothing if no stream is open.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        let closed = stream.close().await;
        self.state = ConsumerState::Stopped;
        self.flush_checkpoint().await?;

        info!(
            position = ?self.position,
            events = self.event_count,
            "Stopped binlog consumer"
        );

        closed
    }

    /// Consumes until `stop` is set or `limit` events were read, then stops.
    ///
    /// Errors raised by `consume` are logged and consumption continues.
    pub async fn run(&mut self, stop: &AtomicBool, limit: Option<u64>) -> Result<()> {
        let mut consumed = 0u64;

        while !stop.load(Ordering::SeqCst) && limit.map_or(true, |limit| consumed < limit) {
            if let Err(e) = self.consume().await {
                error!(error = %e, "Uncaught error during consume : {}", e);
            }
            consumed += 1;
            tokio::task::yield_now().await;
        }

        self.stop().await
    }

    fn stream_config(&self) -> Result<StreamConfig> {
        let mut databases: Vec<String> = vec![];
        let mut tables: Vec<String> = vec![];
        let mut builder = StreamConfig::builder();
        let (mut host, mut port, mut user, mut password) = (None, None, None, None);

        for binding in &self.bindings {
            let metadata = binding.metadata();
            let connection = &metadata.connection;

            if !connection.platform.has_binlog() {
                return Err(Error::UnsupportedPlatform {
                    connection: connection.name.clone(),
                    platform: connection.platform.to_string(),
                });
            }

            if let Some(database) = &connection.database {
                if !databases.contains(database) {
                    databases.push(database.clone());
                }
            }
            if !tables.contains(&metadata.table) {
                tables.push(metadata.table.clone());
            }

            host = host.or_else(|| connection.host.clone());
            port = port.or(connection.port);
            user = user.or_else(|| connection.user.clone());
            password = password.or_else(|| connection.password.clone());
        }

        builder
            .with_databases_only(databases)
            .with_tables_only(tables)
            .with_start_position(self.position.clone());

        if let Some(host) = host {
            builder.with_host(host);
        }
        if let Some(port) = port {
            builder.with_port(port);
        }
        if let Some(user) = user {
            builder.with_user(user);
        }
        if let Some(password) = password {
            builder.with_password(password);
        }

        if let Some(configurator) = &self.configurator {
            configurator(&mut builder);
        }

        Ok(builder.build())
    }

    async fn flush_if_due(&mut self) -> Result<()> {
        let Some(interval) = self.checkpoint_interval else {
            return Ok(());
        };

        if self.last_flush.elapsed() >= interval {
            self.flush_checkpoint().await?;
            self.last_flush = Instant::now();
        }

        Ok(())
    }

    async fn flush_checkpoint(&self) -> Result<()> {
        match &self.position {
            Some(position) => {
                self.checkpoints
                    .save(&Checkpoint::new(position.clone(), self.event_count))
                    .await
            }
            None => Ok(()),
        }
    }
}
