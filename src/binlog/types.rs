use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Column name to raw value mapping of one row, in table column order.
pub type RowValues = serde_json::Map<String, Value>;

/// Location in the binlog.
///
/// Positions order by file name, then by offset inside the file. MySQL
/// binlog file names carry a zero-padded sequence number so the
/// lexicographic order of names is the order of the files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    /// Binlog file name, e.g. `mysql-bin.000003`
    pub file: String,
    /// Offset of the next event to read inside `file`
    pub position: u64,
    /// Executed GTID set, when the server runs with GTIDs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid: Option<String>,
}

impl StreamPosition {
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Self {
            file: file.into(),
            position,
            gtid: None,
        }
    }

    pub fn with_gtid(mut self, gtid: impl Into<String>) -> Self {
        self.gtid = Some(gtid.into());
        self
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Verb used in dispatch logs.
    pub fn verb(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "write",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

/// Before and after images of an updated row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedRow {
    pub before: RowValues,
    pub after: RowValues,
}

/// Rows touched by one binlog row event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowChange {
    Insert(Vec<RowValues>),
    Update(Vec<UpdatedRow>),
    Delete(Vec<RowValues>),
}

impl RowChange {
    pub fn operation(&self) -> ChangeOperation {
        match self {
            RowChange::Insert(_) => ChangeOperation::Insert,
            RowChange::Update(_) => ChangeOperation::Update,
            RowChange::Delete(_) => ChangeOperation::Delete,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RowChange::Insert(rows) | RowChange::Delete(rows) => rows.len(),
            RowChange::Update(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A write, update or delete rows event on one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    pub database: String,
    pub table: String,
    pub change: RowChange,
}

impl RowChangeEvent {
    pub fn insert(database: impl Into<String>, table: impl Into<String>, rows: Vec<RowValues>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            change: RowChange::Insert(rows),
        }
    }

    pub fn update(database: impl Into<String>, table: impl Into<String>, rows: Vec<UpdatedRow>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            change: RowChange::Update(rows),
        }
    }

    pub fn delete(database: impl Into<String>, table: impl Into<String>, rows: Vec<RowValues>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            change: RowChange::Delete(rows),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Rows(RowChangeEvent),
    Heartbeat,
    /// The server switched to another binlog file.
    Rotate { next_file: String },
    /// Any other binlog event (query, xid, format description...).
    Other { description: String },
}

/// One event read from the replication stream, with the position the
/// stream is at once the event has been read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub position: StreamPosition,
    pub payload: EventPayload,
}

impl ReplicationEvent {
    pub fn new(position: StreamPosition, payload: EventPayload) -> Self {
        Self { position, payload }
    }
}

impl fmt::Display for ReplicationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            EventPayload::Rows(rows) => write!(
                f,
                "{:?} {} row(s) on {}.{} at {}",
                rows.change.operation(),
                rows.change.len(),
                rows.database,
                rows.table,
                self.position
            ),
            EventPayload::Heartbeat => write!(f, "heartbeat at {}", self.position),
            EventPayload::Rotate { next_file } => write!(f, "rotate to {} at {}", next_file, self.position),
            EventPayload::Other { description } => write!(f, "{} at {}", description, self.position),
        }
    }
}
