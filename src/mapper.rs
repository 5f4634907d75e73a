//! Row to entity conversion.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use thiserror::Error;

use crate::binlog::RowValues;

/// A row could not be turned into an entity.
#[derive(Error, Debug)]
pub enum MappingError {
    #[error("Missing column \"{column}\" for entity \"{entity}\"")]
    MissingColumn { entity: String, column: String },

    #[error("Invalid value for column \"{column}\" of entity \"{entity}\": {message}")]
    InvalidValue {
        entity: String,
        column: String,
        message: String,
    },

    #[error("Cannot build entity \"{entity}\" from row: {source}")]
    Decode {
        entity: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Builds entities of type `E` from raw binlog rows.
pub trait RowMapper<E>: Send + Sync {
    fn from_columns(&self, values: &RowValues) -> Result<E, MappingError>;
}

impl<E, F> RowMapper<E> for F
where
    F: Fn(&RowValues) -> Result<E, MappingError> + Send + Sync,
{
    fn from_columns(&self, values: &RowValues) -> Result<E, MappingError> {
        self(values)
    }
}

/// Mapper deserializing rows through serde.
///
/// Column names are used as field names unless renamed with
/// [`JsonRowMapper::column`]. Columns listed with
/// [`JsonRowMapper::required`] must be present and non-NULL in every row.
pub struct JsonRowMapper<E> {
    entity: String,
    columns: HashMap<String, String>,
    required: Vec<String>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> JsonRowMapper<E> {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            columns: HashMap::new(),
            required: vec![],
            _entity: PhantomData,
        }
    }

    /// Maps the column `column` to the entity field `field`.
    pub fn column(mut self, column: impl Into<String>, field: impl Into<String>) -> Self {
        self.columns.insert(column.into(), field.into());
        self
    }

    pub fn required(mut self, column: impl Into<String>) -> Self {
        self.required.push(column.into());
        self
    }
}

impl<E: DeserializeOwned> RowMapper<E> for JsonRowMapper<E> {
    fn from_columns(&self, values: &RowValues) -> Result<E, MappingError> {
        for column in &self.required {
            match values.get(column) {
                None => {
                    return Err(MappingError::MissingColumn {
                        entity: self.entity.clone(),
                        column: column.clone(),
                    })
                }
                Some(Value::Null) => {
                    return Err(MappingError::InvalidValue {
                        entity: self.entity.clone(),
                        column: column.clone(),
                        message: "required column is NULL".to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        let fields = values
            .iter()
            .map(|(column, value)| {
                let field = self.columns.get(column).unwrap_or(column);
                (field.clone(), value.clone())
            })
            .collect();

        serde_json::from_value(Value::Object(fields)).map_err(|source| MappingError::Decode {
            entity: self.entity.clone(),
            source,
        })
    }
}
