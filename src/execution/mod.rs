pub mod executor;
pub mod result;

pub use executor::{decode_row, QueryExecutor, SqliteExecutor};
pub use result::{display_value, ExecutionFailure, ExecutionResult, QueryRows};
