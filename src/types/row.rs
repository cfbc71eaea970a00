//! Result rows

use super::value::{FromValue, Value};
use crate::protocol::FieldDescription;
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Result column metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Data type OID
    pub type_oid: u32,
}

impl From<&FieldDescription> for Column {
    fn from(field: &FieldDescription) -> Self {
        Column {
            name: field.name.clone(),
            type_oid: field.type_oid,
        }
    }
}

/// Something that identifies a column: a position or a name
pub trait ColumnIndex: fmt::Debug {
    /// Position of the column, if present
    fn position(&self, columns: &[Column]) -> Option<usize>;
}

impl ColumnIndex for usize {
    fn position(&self, columns: &[Column]) -> Option<usize> {
        (*self < columns.len()).then_some(*self)
    }
}

impl ColumnIndex for str {
    fn position(&self, columns: &[Column]) -> Option<usize> {
        columns.iter().position(|c| c.name == self)
    }
}

impl<T: ColumnIndex + ?Sized> ColumnIndex for &T {
    fn position(&self, columns: &[Column]) -> Option<usize> {
        (**self).position(columns)
    }
}

/// A decoded result row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        Row { columns, values }
    }

    /// Column metadata
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value by position or name
    pub fn value<I: ColumnIndex>(&self, idx: I) -> Option<&Value> {
        idx.position(&self.columns).and_then(|i| self.values.get(i))
    }

    /// Typed value by position or name
    pub fn get<T: FromValue, I: ColumnIndex>(&self, idx: I) -> Result<T> {
        let value = self
            .value(&idx)
            .ok_or_else(|| Error::Column(format!("no column {:?}", idx)))?;
        T::from_value(value).map_err(|e| match e {
            Error::Column(msg) => Error::Column(format!("column {:?}: {}", idx, msg)),
            other => other,
        })
    }

    /// All values in column order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Take the values out of the row
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}
