//! Values, rows and result cursors

mod cursor;
mod row;
mod value;

pub use cursor::{ExecutionResult, RowCursor};
pub use row::{Column, ColumnIndex, Row};
pub use value::{oid, FromValue, Value};
