//! Per-entity callback registry.
//!
//! An [`EntityEventsListener`] owns the insert, update and delete callbacks
//! registered for one entity type. Rows are converted with the entity's
//! [`RowMapper`] before callbacks run, and callbacks run in registration
//! order. A failing callback is logged and skipped; it never stops the
//! callbacks after it nor surfaces to the consumer.

use std::any::{type_name, Any};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, info};

use crate::binlog::{ChangeOperation, RowChange, RowValues};
use crate::mapper::{MappingError, RowMapper};
use crate::schema::{Entity, EntityMetadata};

type InsertFn<E> = dyn FnMut(&E) -> anyhow::Result<()> + Send;
type UpdateFn<E> = dyn FnMut(&E, &E) -> anyhow::Result<()> + Send;
type DeleteFn<E> = dyn FnMut(&E) -> anyhow::Result<()> + Send;

struct Named<F: ?Sized> {
    name: String,
    callback: Box<F>,
}

/// Callbacks for one entity type.
///
/// Obtained through [`crate::EntityEventsConsumer::for_entity`]:
///
/// ```rust,ignore
/// consumer
///     .for_entity::<Foo>()?
///     .inserted(|foo| { println!("inserted {:?}", foo); Ok(()) })
///     .updated(|before, after| { println!("{:?} -> {:?}", before, after); Ok(()) })
///     .deleted(|foo| { println!("deleted {:?}", foo); Ok(()) });
/// ```
pub struct EntityEventsListener<E: Entity> {
    metadata: EntityMetadata,
    mapper: Box<dyn RowMapper<E>>,
    inserted: Vec<Named<InsertFn<E>>>,
    updated: Vec<Named<UpdateFn<E>>>,
    deleted: Vec<Named<DeleteFn<E>>>,
}

impl<E: Entity> EntityEventsListener<E> {
    pub fn new(metadata: EntityMetadata, mapper: Box<dyn RowMapper<E>>) -> Self {
        Self {
            metadata,
            mapper,
            inserted: vec![],
            updated: vec![],
            deleted: vec![],
        }
    }

    pub fn metadata(&self) -> &EntityMetadata {
        &self.metadata
    }

    /// Registers an insert callback, identified in logs by its type name.
    pub fn inserted<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&E) -> anyhow::Result<()> + Send + 'static,
    {
        self.inserted_as(type_name::<F>(), callback)
    }

    pub fn inserted_as<F>(&mut self, name: impl Into<String>, callback: F) -> &mut Self
    where
        F: FnMut(&E) -> anyhow::Result<()> + Send + 'static,
    {
        self.inserted.push(Named {
            name: name.into(),
            callback: Box::new(callback),
        });
        self
    }

    /// Registers an update callback receiving `(before, after)`.
    pub fn updated<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&E, &E) -> anyhow::Result<()> + Send + 'static,
    {
        self.updated_as(type_name::<F>(), callback)
    }

    pub fn updated_as<F>(&mut self, name: impl Into<String>, callback: F) -> &mut Self
    where
        F: FnMut(&E, &E) -> anyhow::Result<()> + Send + 'static,
    {
        self.updated.push(Named {
            name: name.into(),
            callback: Box::new(callback),
        });
        self
    }

    pub fn deleted<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnMut(&E) -> anyhow::Result<()> + Send + 'static,
    {
        self.deleted_as(type_name::<F>(), callback)
    }

    pub fn deleted_as<F>(&mut self, name: impl Into<String>, callback: F) -> &mut Self
    where
        F: FnMut(&E) -> anyhow::Result<()> + Send + 'static,
    {
        self.deleted.push(Named {
            name: name.into(),
            callback: Box::new(callback),
        });
        self
    }

    pub fn callback_count(&self, operation: ChangeOperation) -> usize {
        match operation {
            ChangeOperation::Insert => self.inserted.len(),
            ChangeOperation::Update => self.updated.len(),
            ChangeOperation::Delete => self.deleted.len(),
        }
    }

    /// Maps every row of `change`, then runs the matching callbacks row by row.
    ///
    /// Fails only when a row cannot be mapped, in which case no callback has
    /// run for any row of the event.
    pub fn dispatch(&mut self, change: &RowChange) -> Result<(), MappingError> {
        let entity = self.metadata.entity_type.as_str();
        let verb = change.operation().verb();

        match change {
            RowChange::Insert(rows) => {
                let entities = self.map_rows(rows)?;
                for (row, value) in rows.iter().zip(&entities) {
                    info!(entity, values = ?row, "[binlog event] {} on {}", verb, entity);
                    for named in self.inserted.iter_mut() {
                        invoke(entity, &named.name, || (named.callback)(value));
                    }
                }
            }
            RowChange::Update(rows) => {
                let mut pairs = Vec::with_capacity(rows.len());
                for row in rows {
                    pairs.push((
                        self.mapper.from_columns(&row.before)?,
                        self.mapper.from_columns(&row.after)?,
                    ));
                }
                for (row, (before, after)) in rows.iter().zip(&pairs) {
                    info!(entity, before = ?row.before, after = ?row.after, "[binlog event] {} on {}", verb, entity);
                    for named in self.updated.iter_mut() {
                        invoke(entity, &named.name, || (named.callback)(before, after));
                    }
                }
            }
            RowChange::Delete(rows) => {
                let entities = self.map_rows(rows)?;
                for (row, value) in rows.iter().zip(&entities) {
                    info!(entity, values = ?row, "[binlog event] {} on {}", verb, entity);
                    for named in self.deleted.iter_mut() {
                        invoke(entity, &named.name, || (named.callback)(value));
                    }
                }
            }
        }

        Ok(())
    }

    fn map_rows(&self, rows: &[RowValues]) -> Result<Vec<E>, MappingError> {
        rows.iter().map(|row| self.mapper.from_columns(row)).collect()
    }
}

/// Runs one callback, logging its failure or panic.
fn invoke(entity: &str, listener: &str, callback: impl FnOnce() -> anyhow::Result<()>) {
    let message = match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(panic) => panic_message(panic.as_ref()),
    };

    error!(
        listener,
        entity,
        "Error during the execution of listener \"{}\" for entity \"{}\" : {}",
        listener,
        entity,
        message
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

/// Type-erased [`EntityEventsListener`], as stored by the consumer.
pub(crate) trait BoundEntity: Send {
    fn metadata(&self) -> &EntityMetadata;

    fn dispatch(&mut self, change: &RowChange) -> Result<(), MappingError>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<E: Entity> BoundEntity for EntityEventsListener<E> {
    fn metadata(&self) -> &EntityMetadata {
        &self.metadata
    }

    fn dispatch(&mut self, change: &RowChange) -> Result<(), MappingError> {
        EntityEventsListener::dispatch(self, change)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::UpdatedRow;
    use crate::mapper::JsonRowMapper;
    use crate::schema::ConnectionParams;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Foo {
        id: i64,
        value: String,
    }

    impl Entity for Foo {
        const ENTITY_TYPE: &'static str = "foo";

        fn row_mapper(_: &EntityMetadata) -> Box<dyn RowMapper<Self>> {
            Box::new(JsonRowMapper::new(Self::ENTITY_TYPE))
        }
    }

    fn listener() -> EntityEventsListener<Foo> {
        let metadata = EntityMetadata {
            entity_type: "foo".to_string(),
            table: "foo".to_string(),
            connection: ConnectionParams::mysql("test"),
        };
        let mapper = Foo::row_mapper(&metadata);
        EntityEventsListener::new(metadata, mapper)
    }

    fn row(id: i64, value: &str) -> RowValues {
        json!({"id": id, "value": value}).as_object().cloned().unwrap()
    }

    fn foo(id: i64, value: &str) -> Foo {
        Foo {
            id,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut listener = listener();

        for i in 0..3 {
            let calls = Arc::clone(&calls);
            listener.inserted(move |foo: &Foo| {
                calls.lock().unwrap().push((i, foo.id));
                Ok(())
            });
        }

        listener
            .dispatch(&RowChange::Insert(vec![row(1, "a"), row(2, "b")]))
            .unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![(0, 1), (1, 1), (2, 1), (0, 2), (1, 2), (2, 2)]
        );
    }

    #[test]
    fn test_failing_and_panicking_callbacks_are_isolated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listener = listener();
        let sink = Arc::clone(&seen);

        listener
            .inserted(|_: &Foo| anyhow::bail!("my error"))
            .inserted(|_: &Foo| panic!("boom"))
            .inserted(move |foo: &Foo| {
                sink.lock().unwrap().push(foo.clone());
                Ok(())
            });

        listener.dispatch(&RowChange::Insert(vec![row(1, "a")])).unwrap();
        listener.dispatch(&RowChange::Insert(vec![row(2, "b")])).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![foo(1, "a"), foo(2, "b")]);
    }

    #[test]
    fn test_update_passes_before_and_after() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut listener = listener();
        listener.updated(move |before: &Foo, after: &Foo| {
            sink.lock().unwrap().push((before.clone(), after.clone()));
            Ok(())
        });

        listener
            .dispatch(&RowChange::Update(vec![UpdatedRow {
                before: row(1, "Foo"),
                after: row(1, "Bar"),
            }]))
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(foo(1, "Foo"), foo(1, "Bar"))]);
    }

    #[test]
    fn test_mapping_failure_prevents_any_dispatch() {
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let mut listener = listener();
        listener.deleted(move |_: &Foo| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        let bad = json!({"id": "x"}).as_object().cloned().unwrap();
        let result = listener.dispatch(&RowChange::Delete(vec![row(1, "a"), bad]));

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_only_matching_operation_runs() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (on_insert, on_delete) = (Arc::clone(&calls), Arc::clone(&calls));
        let mut listener = listener();
        listener
            .inserted(move |_: &Foo| {
                on_insert.lock().unwrap().push("insert");
                Ok(())
            })
            .deleted(move |_: &Foo| {
                on_delete.lock().unwrap().push("delete");
                Ok(())
            });

        assert_eq!(listener.callback_count(ChangeOperation::Insert), 1);
        assert_eq!(listener.callback_count(ChangeOperation::Update), 0);
        listener.dispatch(&RowChange::Delete(vec![row(1, "a")])).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["delete"]);
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&42), "listener panicked");
    }
}
