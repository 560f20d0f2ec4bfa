//! Query Result - rows or a captured failure from the executor

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Rows returned by a successful query, in database order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    /// Column names, in projection order
    pub columns: Vec<String>,

    /// One entry per row, aligned with `columns`
    pub rows: Vec<Vec<Value>>,

    /// True when the executor dropped rows past its row cap
    pub truncated: bool,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl QueryRows {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            truncated: false,
            execution_time_ms: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row mappings keyed by column name.
    pub fn records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// A failure captured while running a statement. `message` is raw database
/// text and is only ever shown to the model and the logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub message: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionResult {
    Rows(QueryRows),
    Error(ExecutionFailure),
}

impl ExecutionResult {
    pub fn error(message: impl Into<String>) -> Self {
        ExecutionResult::Error(ExecutionFailure {
            message: message.into(),
            timed_out: false,
        })
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        ExecutionResult::Error(ExecutionFailure {
            message: message.into(),
            timed_out: true,
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionResult::Error(_))
    }

    pub fn row_count(&self) -> Option<usize> {
        match self {
            ExecutionResult::Rows(rows) => Some(rows.len()),
            ExecutionResult::Error(_) => None,
        }
    }
}

/// Render a cell for prompts and plain-text answers.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_records_keep_column_names() {
        let rows = QueryRows::new(
            vec!["season".to_string(), "total_goals".to_string()],
            vec![vec![json!("2010-2011"), json!(74)]],
        );
        let records = rows.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["total_goals"], json!(74));
        assert_eq!(records[0]["season"], json!("2010-2011"));
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&Value::Null), "NULL");
        assert_eq!(display_value(&json!("Feyenoord")), "Feyenoord");
        assert_eq!(display_value(&json!(2.5)), "2.5");
    }
}
