//! SQL Validator
//!
//! Static checks run on every generated statement before it may reach the
//! database:
//! (a) it parses as exactly one SQLite statement,
//! (b) it is read-only,
//! (c) every table and column it names exists in the schema context,
//! (d) it stays within the limit on unconstrained joins.
//!
//! A rejection carries the reason and the offending fragment so the
//! generator can repair the statement.

use crate::error::{AgentError, ValidationKind};
use crate::schema::{SchemaContext, TableSchema};
use itertools::Itertools;
use sqlparser::ast::{
    Expr, Ident, JoinConstraint, JoinOperator, Query, SelectItem, SetExpr, Statement, TableFactor,
    TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use strsim::jaro_winkler;
use tracing::{debug, warn};

/// Keywords that mark a statement as something other than a plain query.
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM", "REINDEX", "GRANT", "REVOKE", "MERGE",
];

/// Implicit columns every SQLite rowid table carries.
const ROWID_ALIASES: &[&str] = &["rowid", "oid", "_rowid_"];

/// A statement that passed every static check. Only the validator creates
/// these, so holding one proves the SQL was checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql {
    sql: String,
}

impl ValidatedSql {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn into_inner(self) -> String {
        self.sql
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub kind: ValidationKind,
    pub reason: String,
    pub fragment: String,
}

impl ValidationFailure {
    fn new(kind: ValidationKind, reason: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            fragment: fragment.into(),
        }
    }

    pub fn into_error(self) -> AgentError {
        AgentError::Validation {
            kind: self.kind,
            reason: self.reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid(ValidatedSql),
    Invalid(ValidationFailure),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid(_))
    }
}

pub struct SqlValidator {
    schema: Arc<SchemaContext>,
    max_cross_joins: usize,
    suggestion_threshold: f64,
}

impl SqlValidator {
    pub fn new(schema: Arc<SchemaContext>, max_cross_joins: usize) -> Self {
        Self {
            schema,
            max_cross_joins,
            suggestion_threshold: 0.8,
        }
    }

    pub fn validate(&self, sql: &str) -> ValidationResult {
        match self.check(sql) {
            Ok(validated) => {
                debug!("SQL passed validation");
                ValidationResult::Valid(validated)
            }
            Err(failure) => {
                warn!("SQL rejected ({}): {}", failure.kind, failure.reason);
                ValidationResult::Invalid(failure)
            }
        }
    }

    fn check(&self, sql: &str) -> Result<ValidatedSql, ValidationFailure> {
        let sql = sql
            .trim()
            .trim_end_matches(|c: char| c == ';' || c.is_whitespace());
        if sql.is_empty() {
            return Err(ValidationFailure::new(
                ValidationKind::Syntax,
                "the statement is empty",
                "",
            ));
        }

        let dialect = SQLiteDialect {};
        let write_keyword = find_write_keyword(&dialect, sql);

        // (a) syntax
        let statements = match Parser::parse_sql(&dialect, sql) {
            Ok(statements) => statements,
            Err(e) => {
                if let Some(keyword) = write_keyword {
                    return Err(write_rejection(&keyword));
                }
                return Err(ValidationFailure::new(
                    ValidationKind::Syntax,
                    format!("the statement does not parse: {}", e),
                    sql,
                ));
            }
        };

        // (b) read-only
        if let Some(statement) = statements.iter().find(|s| !matches!(s, Statement::Query(_))) {
            let rendered = statement.to_string();
            let verb = rendered.split_whitespace().next().unwrap_or("").to_uppercase();
            return Err(ValidationFailure::new(
                ValidationKind::WriteOperation,
                format!("only SELECT queries are allowed, found a {} statement", verb),
                verb,
            ));
        }
        if let Some(keyword) = write_keyword {
            return Err(write_rejection(&keyword));
        }
        if statements.len() != 1 {
            return Err(ValidationFailure::new(
                ValidationKind::MultipleStatements,
                format!("expected exactly one statement, found {}", statements.len()),
                sql,
            ));
        }

        let mut references = References::default();
        // The collector never breaks early
        let _ = statements[0].visit(&mut references);

        // (c) schema references
        self.check_tables(&references)?;
        self.check_columns(&references)?;

        // (d) unconstrained joins
        if references.unconstrained_joins > self.max_cross_joins {
            return Err(ValidationFailure::new(
                ValidationKind::CrossJoinLimit,
                format!(
                    "the query has {} joins without a join condition (at most {} allowed); join on matching keys instead",
                    references.unconstrained_joins, self.max_cross_joins
                ),
                "CROSS JOIN",
            ));
        }

        Ok(ValidatedSql {
            sql: sql.to_string(),
        })
    }

    fn check_tables(&self, references: &References) -> Result<(), ValidationFailure> {
        for table in &references.tables {
            if self.schema.has_table(&table.name) || references.derived.contains(&table.name) {
                continue;
            }
            let hint = self.hint(&table.name, self.schema.table_names());
            return Err(ValidationFailure::new(
                ValidationKind::UnknownTable,
                format!("table '{}' does not exist{}", table.raw, hint),
                table.raw.clone(),
            ));
        }
        Ok(())
    }

    fn check_columns(&self, references: &References) -> Result<(), ValidationFailure> {
        let in_scope: Vec<&TableSchema> = references
            .tables
            .iter()
            .filter_map(|t| self.schema.table(&t.name))
            .collect();

        for column in &references.columns {
            if ROWID_ALIASES.contains(&column.name.as_str()) {
                continue;
            }
            match column.qualifier {
                Some(ref qualifier) => self.check_qualified(references, &in_scope, qualifier, column)?,
                None => {
                    if references.output_aliases.contains(&column.name)
                        || in_scope.iter().any(|t| t.has_column(&column.name))
                    {
                        continue;
                    }
                    // Columns coming out of CTEs and subqueries are not tracked
                    // individually; accept any real column name there.
                    if !references.derived.is_empty()
                        && self.schema.tables().iter().any(|t| t.has_column(&column.name))
                    {
                        continue;
                    }
                    return Err(self.unknown_column(column, &in_scope, None));
                }
            }
        }
        Ok(())
    }

    fn check_qualified(
        &self,
        references: &References,
        in_scope: &[&TableSchema],
        qualifier: &str,
        column: &ColumnRef,
    ) -> Result<(), ValidationFailure> {
        let target = references.aliases.get(qualifier).cloned().or_else(|| {
            in_scope
                .iter()
                .find(|t| t.name.eq_ignore_ascii_case(qualifier))
                .map(|t| t.name.to_lowercase())
        });

        if let Some(table) = target.as_deref().and_then(|name| self.schema.table(name)) {
            if table.has_column(&column.name) {
                return Ok(());
            }
            return Err(self.unknown_column(column, &[table], Some(table.name.as_str())));
        }

        let source = target.as_deref().unwrap_or(qualifier);
        if references.derived.contains(source) || references.derived.contains(qualifier) {
            if references.output_aliases.contains(&column.name)
                || self.schema.tables().iter().any(|t| t.has_column(&column.name))
            {
                return Ok(());
            }
            return Err(self.unknown_column(column, in_scope, None));
        }

        Err(ValidationFailure::new(
            ValidationKind::UnknownTable,
            format!(
                "'{}' in '{}' is not a table or alias listed in the FROM clause",
                qualifier, column.raw
            ),
            column.raw.clone(),
        ))
    }

    fn unknown_column(
        &self,
        column: &ColumnRef,
        in_scope: &[&TableSchema],
        table: Option<&str>,
    ) -> ValidationFailure {
        let candidates: Vec<&str> = if in_scope.is_empty() {
            self.schema.all_column_names()
        } else {
            in_scope
                .iter()
                .flat_map(|t| t.columns.iter().map(|c| c.name.as_str()))
                .collect()
        };
        let mut reason = match table {
            Some(table) => format!("column '{}' does not exist in table '{}'", column.raw, table),
            None => format!("column '{}' does not exist in the referenced tables", column.raw),
        };
        reason.push_str(&self.hint(&column.name, candidates));
        if column.double_quoted {
            reason.push_str("; string literals must use single quotes");
        }
        ValidationFailure::new(ValidationKind::UnknownColumn, reason, column.raw.clone())
    }

    fn hint<'a>(&self, name: &str, candidates: impl IntoIterator<Item = &'a str>) -> String {
        let name = name.to_lowercase();
        candidates
            .into_iter()
            .map(|c| (jaro_winkler(&name, &c.to_lowercase()), c))
            .filter(|(score, _)| *score >= self.suggestion_threshold)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, c)| format!(" (did you mean '{}'?)", c))
            .unwrap_or_default()
    }
}

fn write_rejection(keyword: &str) -> ValidationFailure {
    ValidationFailure::new(
        ValidationKind::WriteOperation,
        format!("the statement uses {}, but only read-only SELECT queries are allowed", keyword),
        keyword,
    )
}

/// First unquoted write keyword in the statement. Comments, string literals
/// and quoted identifiers never match; case and spacing do not matter.
fn find_write_keyword(dialect: &SQLiteDialect, sql: &str) -> Option<String> {
    match Tokenizer::new(dialect, sql).tokenize() {
        Ok(tokens) => tokens.into_iter().find_map(|token| match token {
            Token::Word(word) if word.quote_style.is_none() => {
                let upper = word.value.to_uppercase();
                WRITE_KEYWORDS.contains(&upper.as_str()).then_some(upper)
            }
            _ => None,
        }),
        // Unterminated strings and the like: fall back to a plain word scan
        Err(_) => sql
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .map(|w| w.to_uppercase())
            .find(|w| WRITE_KEYWORDS.contains(&w.as_str())),
    }
}

fn normalize(ident: &Ident) -> String {
    ident.value.to_lowercase()
}

#[derive(Debug)]
struct TableRef {
    name: String,
    raw: String,
}

#[derive(Debug)]
struct ColumnRef {
    qualifier: Option<String>,
    name: String,
    raw: String,
    double_quoted: bool,
}

/// Everything the statement names, gathered in one walk. Scopes are
/// flattened: an alias or CTE defined anywhere counts everywhere.
#[derive(Debug, Default)]
struct References {
    tables: Vec<TableRef>,
    aliases: HashMap<String, String>,
    derived: HashSet<String>,
    output_aliases: HashSet<String>,
    columns: Vec<ColumnRef>,
    unconstrained_joins: usize,
}

impl References {
    fn collect_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.output_aliases.insert(normalize(alias));
                    }
                }
                for from in &select.from {
                    self.collect_table_with_joins(from);
                }
                // Comma joins are only unconstrained when nothing filters them
                if select.from.len() > 1 && select.selection.is_none() {
                    self.unconstrained_joins += select.from.len() - 1;
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left);
                self.collect_set_expr(right);
            }
            _ => {}
        }
    }

    fn collect_table_with_joins(&mut self, table: &TableWithJoins) {
        self.collect_factor(&table.relation);
        for join in &table.joins {
            self.collect_factor(&join.relation);
            if is_unconstrained(&join.join_operator) {
                self.unconstrained_joins += 1;
            }
        }
    }

    fn collect_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, args, .. } => {
                let Some(last) = name.0.last() else {
                    return;
                };
                let table = normalize(last);
                // Table-valued functions such as json_each are not schema tables
                if args.is_some() {
                    self.derived.insert(table);
                    if let Some(alias) = alias {
                        self.derived.insert(normalize(&alias.name));
                    }
                    return;
                }
                if let Some(alias) = alias {
                    self.aliases.insert(normalize(&alias.name), table.clone());
                }
                self.tables.push(TableRef {
                    name: table,
                    raw: name.to_string(),
                });
            }
            TableFactor::Derived { alias, .. } => {
                if let Some(alias) = alias {
                    self.derived.insert(normalize(&alias.name));
                    for column in &alias.columns {
                        self.output_aliases.insert(normalize(column));
                    }
                }
            }
            TableFactor::NestedJoin {
                table_with_joins,
                alias,
            } => {
                self.collect_table_with_joins(table_with_joins);
                if let Some(alias) = alias {
                    self.derived.insert(normalize(&alias.name));
                }
            }
            _ => {}
        }
    }
}

fn is_unconstrained(operator: &JoinOperator) -> bool {
    match operator {
        JoinOperator::CrossJoin => true,
        JoinOperator::Inner(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint) => matches!(constraint, JoinConstraint::None),
        _ => false,
    }
}

impl Visitor for References {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(ref with) = query.with {
            for cte in &with.cte_tables {
                self.derived.insert(normalize(&cte.alias.name));
                for column in &cte.alias.columns {
                    self.output_aliases.insert(normalize(column));
                }
            }
        }
        self.collect_set_expr(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(ColumnRef {
                qualifier: None,
                name: normalize(ident),
                raw: ident.value.clone(),
                double_quoted: ident.quote_style == Some('"'),
            }),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let n = parts.len();
                self.columns.push(ColumnRef {
                    qualifier: Some(normalize(&parts[n - 2])),
                    name: normalize(&parts[n - 1]),
                    raw: parts.iter().map(|p| p.value.as_str()).join("."),
                    double_quoted: false,
                });
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
