//! Schema Context
//!
//! Read-only snapshot of the queryable tables, loaded once at startup and
//! shared by the generator (as prompt grounding) and the validator (as the
//! list of legal table and column names). Name lookups are
//! case-insensitive, like SQLite identifiers.

use crate::db::DbPool;
use crate::error::{AgentError, Result};
use crate::execution::{decode_row, display_value};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            primary_key: false,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    /// Original DDL as stored by the database, when available
    #[serde(default)]
    pub create_sql: Option<String>,
    /// A few example rows rendered as text, aligned with `columns`
    #[serde(default)]
    pub sample_rows: Vec<Vec<String>>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            create_sql: None,
            sample_rows: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    fn ddl(&self) -> String {
        if let Some(ref sql) = self.create_sql {
            return sql.trim().to_string();
        }
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut line = format!("\t\"{}\" {}", c.name, c.data_type);
                if c.primary_key {
                    line.push_str(" PRIMARY KEY");
                } else if !c.nullable {
                    line.push_str(" NOT NULL");
                }
                line
            })
            .collect();
        format!("CREATE TABLE \"{}\" (\n{}\n)", self.name, columns.join(",\n"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaContext {
    tables: Vec<TableSchema>,
    index: HashMap<String, usize>,
}

impl SchemaContext {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        let index = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.to_lowercase(), i))
            .collect();
        Self { tables, index }
    }

    /// Read tables, columns and a few sample rows from the database.
    pub async fn load(pool: &DbPool, sample_rows: usize) -> Result<Self> {
        let table_rows = sqlx::query(
            "SELECT name, sql FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .fetch_all(pool)
        .await?;

        let mut tables = Vec::with_capacity(table_rows.len());
        for row in table_rows {
            let name: String = row.try_get("name")?;
            let create_sql: Option<String> = row.try_get("sql")?;
            let quoted = quote_identifier(&name);

            let columns = sqlx::query(&format!("PRAGMA table_info({})", quoted))
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|c| -> std::result::Result<ColumnSchema, sqlx::Error> {
                    Ok(ColumnSchema {
                        name: c.try_get("name")?,
                        data_type: c.try_get("type")?,
                        primary_key: c.try_get::<i64, _>("pk")? > 0,
                        nullable: c.try_get::<i64, _>("notnull")? == 0,
                    })
                })
                .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

            let samples = if sample_rows > 0 {
                sqlx::query(&format!("SELECT * FROM {} LIMIT {}", quoted, sample_rows))
                    .fetch_all(pool)
                    .await?
                    .iter()
                    .map(|r| decode_row(r).iter().map(display_value).collect())
                    .collect()
            } else {
                Vec::new()
            };

            debug!("Loaded table {} ({} columns)", name, columns.len());
            tables.push(TableSchema {
                name,
                columns,
                create_sql,
                sample_rows: samples,
            });
        }

        if tables.is_empty() {
            return Err(AgentError::Database(
                "database exposes no tables to query".to_string(),
            ));
        }
        info!("Loaded schema context with {} tables", tables.len());
        Ok(Self::new(tables))
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.index
            .get(&name.to_lowercase())
            .and_then(|&i| self.tables.get(i))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Every column name across the schema, for suggestions.
    pub fn all_column_names(&self) -> Vec<&str> {
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter().map(|c| c.name.as_str()))
            .collect()
    }

    /// Prompt-ready description: DDL for each table followed by its sample
    /// rows.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        for table in &self.tables {
            let mut block = table.ddl();
            if !table.sample_rows.is_empty() {
                let header: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
                block.push_str(&format!(
                    "\n\n/*\n{} rows from {} table:\n{}\n",
                    table.sample_rows.len(),
                    table.name,
                    header.join("\t")
                ));
                for row in &table.sample_rows {
                    block.push_str(&row.join("\t"));
                    block.push('\n');
                }
                block.push_str("*/");
            }
            parts.push(block);
        }
        parts.join("\n\n")
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> SchemaContext {
        let mut matches = TableSchema::new(
            "matches",
            vec![
                ColumnSchema::new("matchId", "INTEGER"),
                ColumnSchema::new("season", "TEXT"),
                ColumnSchema::new("homeClubId", "INTEGER"),
                ColumnSchema::new("homeClubGoals", "INTEGER"),
            ],
        );
        matches.columns[0].primary_key = true;
        matches.sample_rows = vec![vec![
            "1".to_string(),
            "2010-2011".to_string(),
            "1".to_string(),
            "3".to_string(),
        ]];
        SchemaContext::new(vec![
            matches,
            TableSchema::new("clubs", vec![ColumnSchema::new("clubId", "INTEGER")]),
        ])
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let schema = schema();
        assert!(schema.has_table("MATCHES"));
        assert!(schema.table("matches").unwrap().has_column("HOMECLUBGOALS"));
        assert!(!schema.has_table("players"));
        assert_eq!(schema.all_column_names().len(), 5);
    }

    #[test]
    fn test_describe_includes_ddl_and_samples() {
        let description = schema().describe();
        assert!(description.contains("CREATE TABLE \"matches\""));
        assert!(description.contains("\"matchId\" INTEGER PRIMARY KEY"));
        assert!(description.contains("1 rows from matches table:"));
        assert!(description.contains("2010-2011"));
        assert!(description.contains("CREATE TABLE \"clubs\""));
    }

    #[test]
    fn test_quote_identifier_escapes_quotes() {
        assert_eq!(quote_identifier("odd\"name"), "\"odd\"\"name\"");
    }
}
