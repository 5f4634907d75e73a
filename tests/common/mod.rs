#![allow(dead_code)]

use entity_cdc::binlog::{MemoryBinlog, RowValues, UpdatedRow};
use entity_cdc::{
    ConnectionParams, Entity, EntityEventsConsumer, EntityMetadata, JsonRowMapper, RowMapper, SchemaRegistry,
};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

pub const DATABASE: &str = "app";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Foo {
    pub id: i64,
    pub value: String,
}

impl Entity for Foo {
    const ENTITY_TYPE: &'static str = "foo";

    fn row_mapper(_: &EntityMetadata) -> Box<dyn RowMapper<Self>> {
        Box::new(JsonRowMapper::new(Self::ENTITY_TYPE).required("id"))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OtherEntity {
    pub id: i64,
    pub name: String,
}

impl Entity for OtherEntity {
    const ENTITY_TYPE: &'static str = "other_entity";

    fn row_mapper(_: &EntityMetadata) -> Box<dyn RowMapper<Self>> {
        Box::new(JsonRowMapper::new(Self::ENTITY_TYPE).column("other_name", "name"))
    }
}

/// Stored on the `reporting` connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Report {
    pub id: i64,
}

impl Entity for Report {
    const ENTITY_TYPE: &'static str = "report";

    fn row_mapper(_: &EntityMetadata) -> Box<dyn RowMapper<Self>> {
        Box::new(JsonRowMapper::new(Self::ENTITY_TYPE))
    }
}

/// Declared by a listener but absent from the schema.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Unknown;

impl Entity for Unknown {
    const ENTITY_TYPE: &'static str = "unknown";

    fn row_mapper(_: &EntityMetadata) -> Box<dyn RowMapper<Self>> {
        Box::new(JsonRowMapper::new(Self::ENTITY_TYPE))
    }
}

pub fn schema() -> SchemaRegistry {
    SchemaRegistry::new()
        .with_connection(
            ConnectionParams::mysql("test")
                .with_database(DATABASE)
                .with_host("127.0.0.1")
                .with_user("entity_user")
                .with_password("entity_password"),
        )
        .with_connection(ConnectionParams::mysql("reporting").with_database("reports"))
        .with_entity::<Foo>("foo", "test")
        .with_entity::<OtherEntity>("other_entity", "test")
        .with_entity::<Report>("report", "reporting")
}

pub fn consumer(binlog: &MemoryBinlog) -> EntityEventsConsumer {
    EntityEventsConsumer::new(Arc::new(schema()), Arc::new(binlog.clone()))
}

pub fn foo(id: i64, value: &str) -> Foo {
    Foo {
        id,
        value: value.to_string(),
    }
}

pub fn foo_row(id: i64, value: &str) -> RowValues {
    json!({ "id": id, "value": value }).as_object().cloned().unwrap()
}

pub fn foo_update(id: i64, before: &str, after: &str) -> UpdatedRow {
    UpdatedRow {
        before: foo_row(id, before),
        after: foo_row(id, after),
    }
}

pub fn other_row(id: i64, name: &str) -> RowValues {
    json!({ "id": id, "other_name": name }).as_object().cloned().unwrap()
}

/// Shared list filled by test callbacks.
pub type Recorded<T> = Arc<Mutex<Vec<T>>>;

pub fn recorded<T>() -> Recorded<T> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Log records captured from `tracing` during a test.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    records: Arc<Mutex<Vec<(Level, String)>>>,
}

impl CapturedLogs {
    /// Captures every event emitted on the current thread until the guard drops.
    pub fn install() -> (Self, DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::registry().with(logs.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    pub fn count(&self, level: Level, needle: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, message)| *l == level && message.contains(needle))
            .count()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.count(level, needle) > 0
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.records
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.0));
    }
}
