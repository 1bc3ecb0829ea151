pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, MigrateError, MigrateResult, Result};
pub use types::{ColumnSpec, Condition, DefaultValue, IndexSpec, Row, RowId};
pub use value::{DataType, Literal, Value};
