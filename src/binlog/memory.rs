//! In-process binlog.
//!
//! [`MemoryBinlog`] behaves like a MySQL server's binary log as seen by a
//! replica: events are appended to numbered files, streams resume from a
//! `file:offset` position, positions inside purged files are rejected and
//! rows events outside the subscribed tables are filtered out. It backs the
//! consumer tests and lets applications exercise their listeners without a
//! database.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::stream::{ReplicationSource, ReplicationStream, StreamConfig};
use super::types::{EventPayload, ReplicationEvent, RowChangeEvent, RowValues, StreamPosition, UpdatedRow};
use crate::{Error, Result};

/// Offset of the first event in a binlog file (after the magic header).
pub const FIRST_EVENT_OFFSET: u64 = 4;

const EVENT_HEADER_SIZE: u64 = 19;
const ROW_SIZE: u64 = 48;

#[derive(Debug)]
struct BinlogFile {
    name: String,
    events: Vec<ReplicationEvent>,
    purged: bool,
}

#[derive(Debug)]
struct BinlogState {
    files: Vec<BinlogFile>,
    offset: u64,
    opened: Vec<StreamConfig>,
    pending_failure: Option<String>,
}

impl BinlogState {
    fn current_file(&self) -> &BinlogFile {
        // `files` is never empty: it is created with one file and only grows.
        &self.files[self.files.len() - 1]
    }

    fn end_position(&self) -> StreamPosition {
        StreamPosition::new(self.current_file().name.clone(), self.offset)
    }

    fn push(&mut self, payload: EventPayload, size: u64) -> StreamPosition {
        self.offset += size;
        let position = self.end_position();
        let last = self.files.len() - 1;
        self.files[last]
            .events
            .push(ReplicationEvent::new(position.clone(), payload));
        position
    }

    /// Returns `(file index, event index)` of the first event after `position`.
    fn seek(&self, position: &StreamPosition) -> Result<(usize, usize)> {
        let invalid = |message: &str| Error::InvalidPosition {
            position: position.to_string(),
            message: message.to_string(),
        };

        let file_index = self
            .files
            .iter()
            .position(|f| f.name == position.file)
            .ok_or_else(|| invalid("could not find first log file name in binary log index file"))?;
        let file = &self.files[file_index];

        if file.purged {
            return Err(invalid("requested binlog file has been purged"));
        }

        if position.position == FIRST_EVENT_OFFSET {
            return Ok((file_index, 0));
        }

        file.events
            .iter()
            .rposition(|e| e.position == *position)
            .map(|i| (file_index, i + 1))
            .ok_or_else(|| invalid("position is not at an event boundary"))
    }
}

/// Shared handle on an in-memory binlog. Clones share the same log.
#[derive(Debug, Clone)]
pub struct MemoryBinlog {
    state: Arc<Mutex<BinlogState>>,
}

impl Default for MemoryBinlog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBinlog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BinlogState {
                files: vec![BinlogFile {
                    name: file_name(1),
                    events: vec![],
                    purged: false,
                }],
                offset: FIRST_EVENT_OFFSET,
                opened: vec![],
                pending_failure: None,
            })),
        }
    }

    pub async fn insert(&self, database: &str, table: &str, rows: Vec<RowValues>) -> StreamPosition {
        let size = rows_size(rows.len());
        self.append(EventPayload::Rows(RowChangeEvent::insert(database, table, rows)), size)
            .await
    }

    pub async fn update(&self, database: &str, table: &str, rows: Vec<UpdatedRow>) -> StreamPosition {
        let size = rows_size(rows.len() * 2);
        self.append(EventPayload::Rows(RowChangeEvent::update(database, table, rows)), size)
            .await
    }

    pub async fn delete(&self, database: &str, table: &str, rows: Vec<RowValues>) -> StreamPosition {
        let size = rows_size(rows.len());
        self.append(EventPayload::Rows(RowChangeEvent::delete(database, table, rows)), size)
            .await
    }

    /// Appends a non-row event, e.g. a query or xid event.
    pub async fn other(&self, description: impl Into<String>) -> StreamPosition {
        let payload = EventPayload::Other {
            description: description.into(),
        };
        self.append(payload, EVENT_HEADER_SIZE).await
    }

    /// Emits a heartbeat. Heartbeats carry the current position and do not
    /// occupy space in the log.
    pub async fn heartbeat(&self) -> StreamPosition {
        self.append(EventPayload::Heartbeat, 0).await
    }

    /// Closes the current file and starts the next one.
    pub async fn rotate(&self) -> String {
        let mut state = self.state.lock().await;
        let next_file = file_name(state.files.len() + 1);
        let position = StreamPosition::new(next_file.clone(), FIRST_EVENT_OFFSET);
        let last = state.files.len() - 1;
        state.files[last].events.push(ReplicationEvent::new(
            position,
            EventPayload::Rotate {
                next_file: next_file.clone(),
            },
        ));
        state.files.push(BinlogFile {
            name: next_file.clone(),
            events: vec![],
            purged: false,
        });
        state.offset = FIRST_EVENT_OFFSET;
        debug!("Rotated binlog to {}", next_file);
        next_file
    }

    /// Drops every file older than `file`, like `PURGE BINARY LOGS TO`.
    pub async fn purge_logs_to(&self, file: &str) {
        let mut state = self.state.lock().await;
        for f in state.files.iter_mut().filter(|f| f.name.as_str() < file) {
            f.purged = true;
            f.events.clear();
        }
    }

    /// Makes the next read on any stream fail with a connection error.
    pub async fn fail_next_read(&self, message: impl Into<String>) {
        self.state.lock().await.pending_failure = Some(message.into());
    }

    pub async fn current_position(&self) -> StreamPosition {
        self.state.lock().await.end_position()
    }

    /// Every configuration a stream was opened with, oldest first.
    pub async fn opened_configs(&self) -> Vec<StreamConfig> {
        self.state.lock().await.opened.clone()
    }

    async fn append(&self, payload: EventPayload, size: u64) -> StreamPosition {
        let mut state = self.state.lock().await;
        let position = state.push(payload, size);
        trace!("Appended binlog event ending at {}", position);
        position
    }
}

#[async_trait]
impl ReplicationSource for MemoryBinlog {
    async fn open(&self, config: &StreamConfig) -> Result<Box<dyn ReplicationStream>> {
        let mut state = self.state.lock().await;
        state.opened.push(config.clone());

        let (position, cursor) = match &config.start_position {
            Some(position) => (position.clone(), state.seek(position)?),
            None => {
                let file = state.files.len() - 1;
                (state.end_position(), (file, state.current_file().events.len()))
            }
        };

        debug!("Opened memory binlog stream at {}", position);

        Ok(Box::new(MemoryBinlogStream {
            state: Arc::clone(&self.state),
            config: config.clone(),
            file_index: cursor.0,
            event_index: cursor.1,
            position,
            closed: false,
        }))
    }
}

struct MemoryBinlogStream {
    state: Arc<Mutex<BinlogState>>,
    config: StreamConfig,
    file_index: usize,
    event_index: usize,
    position: StreamPosition,
    closed: bool,
}

#[async_trait]
impl ReplicationStream for MemoryBinlogStream {
    async fn next_event(&mut self) -> Result<Option<ReplicationEvent>> {
        if self.closed {
            return Err(Error::Replication {
                message: "stream is closed".to_string(),
            });
        }

        let mut state = self.state.lock().await;

        if let Some(message) = state.pending_failure.take() {
            return Err(Error::Connection(message));
        }

        loop {
            let file = &state.files[self.file_index];

            if file.purged {
                return Err(Error::Replication {
                    message: format!("binlog file {} was purged while being read", file.name),
                });
            }

            match file.events.get(self.event_index) {
                Some(event) => {
                    self.event_index += 1;
                    self.position = event.position.clone();

                    if let EventPayload::Rows(rows) = &event.payload {
                        if !self.config.accepts(&rows.database, &rows.table) {
                            trace!("Skipping rows event on {}.{}", rows.database, rows.table);
                            continue;
                        }
                    }

                    return Ok(Some(event.clone()));
                }
                None if self.file_index + 1 < state.files.len() => {
                    self.file_index += 1;
                    self.event_index = 0;
                }
                None => return Ok(None),
            }
        }
    }

    fn current_position(&self) -> StreamPosition {
        self.position.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

fn file_name(sequence: usize) -> String {
    format!("mysql-bin.{:06}", sequence)
}

fn rows_size(rows: usize) -> u64 {
    EVENT_HEADER_SIZE + ROW_SIZE * rows as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64) -> RowValues {
        json!({ "id": id }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_fresh_stream_starts_at_current_position() {
        let binlog = MemoryBinlog::new();
        binlog.insert("app", "foo", vec![row(1)]).await;

        let mut stream = binlog.open(&StreamConfig::default()).await.unwrap();
        assert!(stream.next_event().await.unwrap().is_none());

        let position = binlog.insert("app", "foo", vec![row(2)]).await;
        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.position, position);
        assert_eq!(stream.current_position(), position);
    }

    #[tokio::test]
    async fn test_resume_after_position() {
        let binlog = MemoryBinlog::new();
        let first = binlog.insert("app", "foo", vec![row(1)]).await;
        let second = binlog.insert("app", "foo", vec![row(2)]).await;

        let mut builder = StreamConfig::builder();
        builder.with_start_position(Some(first));
        let mut stream = binlog.open(&builder.build()).await.unwrap();

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.position, second);
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_follows_rotation() {
        let binlog = MemoryBinlog::new();
        let mut stream = binlog.open(&StreamConfig::default()).await.unwrap();

        let next_file = binlog.rotate().await;
        let position = binlog.insert("app", "foo", vec![row(1)]).await;

        let rotate = stream.next_event().await.unwrap().unwrap();
        assert!(matches!(rotate.payload, EventPayload::Rotate { .. }));
        assert_eq!(rotate.position, StreamPosition::new(next_file.clone(), FIRST_EVENT_OFFSET));

        let insert = stream.next_event().await.unwrap().unwrap();
        assert_eq!(insert.position, position);
        assert_eq!(insert.position.file, next_file);
    }

    #[tokio::test]
    async fn test_unknown_and_purged_positions_are_rejected() {
        let binlog = MemoryBinlog::new();
        let old = binlog.insert("app", "foo", vec![row(1)]).await;
        let next_file = binlog.rotate().await;
        binlog.purge_logs_to(&next_file).await;

        for position in [old, StreamPosition::new("fakefile", 404)] {
            let mut builder = StreamConfig::builder();
            builder.with_start_position(Some(position));
            let result = binlog.open(&builder.build()).await;
            assert!(matches!(result, Err(Error::InvalidPosition { .. })));
        }
    }

    #[tokio::test]
    async fn test_rows_outside_subscription_are_skipped() {
        let binlog = MemoryBinlog::new();
        let mut builder = StreamConfig::builder();
        builder.with_tables_only(vec!["foo".to_string()]);
        let mut stream = binlog.open(&builder.build()).await.unwrap();

        let skipped = binlog.insert("app", "bar", vec![row(1)]).await;
        let wanted = binlog.insert("app", "foo", vec![row(2)]).await;

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.position, wanted);
        assert!(skipped < wanted);
    }

    #[tokio::test]
    async fn test_injected_failure_does_not_consume_event() {
        let binlog = MemoryBinlog::new();
        let mut stream = binlog.open(&StreamConfig::default()).await.unwrap();
        let position = binlog.insert("app", "foo", vec![row(1)]).await;

        binlog.fail_next_read("connection reset").await;
        assert!(matches!(stream.next_event().await, Err(Error::Connection(_))));

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.position, position);
    }
}
