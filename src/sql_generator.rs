//! SQL Generator
//!
//! Turns a question plus schema and conversation grounding into one candidate
//! SQLite statement. On retries every earlier rejected statement is shown to
//! the model together with the reason it was rejected.

use crate::error::{AgentError, Result};
use crate::few_shot::FewShotStore;
use crate::llm::CompletionService;
use crate::schema::SchemaContext;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

lazy_static! {
    static ref FENCED_SQL: Regex = Regex::new(r"(?is)```[ \t]*sql[ \t]*\r?\n(.*?)```").unwrap();
    static ref FENCED_ANY: Regex =
        Regex::new(r"(?s)```(?:[A-Za-z0-9_-]*[ \t]*\r?\n)?(.*?)```").unwrap();
    // Keywords in one case only, so a sentence starting with "Select" is prose
    static ref STATEMENT_LINE: Regex = Regex::new(
        r"(?m)^[ \t]*(?:WITH|SELECT|INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|PRAGMA|ATTACH|REPLACE|with|select|insert|update|delete|drop|alter|create|pragma|attach|replace)\b"
    )
    .unwrap();
    static ref BLANK_LINE: Regex = Regex::new(r"\r?\n[ \t]*\r?\n").unwrap();
}

/// A statement proposed by the model, with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub sql: String,
    pub attempt: u32,
    pub prompt: String,
}

/// An earlier statement and why it was not accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairFeedback {
    pub sql: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub question: &'a str,
    pub conversation: &'a str,
    pub prior_attempts: &'a [RepairFeedback],
    pub attempt: u32,
}

pub struct SqlGenerator {
    llm: Arc<dyn CompletionService>,
    schema: Arc<SchemaContext>,
    few_shot: Option<Arc<FewShotStore>>,
    few_shot_examples: usize,
}

impl SqlGenerator {
    pub fn new(llm: Arc<dyn CompletionService>, schema: Arc<SchemaContext>) -> Self {
        Self {
            llm,
            schema,
            few_shot: None,
            few_shot_examples: 0,
        }
    }

    pub fn with_few_shot(mut self, store: Arc<FewShotStore>, examples: usize) -> Self {
        self.few_shot = Some(store);
        self.few_shot_examples = examples;
        self
    }

    pub async fn generate(&self, request: &GenerationRequest<'_>) -> Result<SqlCandidate> {
        info!("Generating SQL, attempt {}", request.attempt);
        let prompt = self.build_prompt(request);
        let response = self.llm.complete(&prompt).await?;

        match extract_sql(&response) {
            Some(sql) => {
                debug!("Candidate SQL: {}", sql);
                Ok(SqlCandidate {
                    sql,
                    attempt: request.attempt,
                    prompt,
                })
            }
            None => {
                warn!("Model response contained no SQL statement");
                Err(AgentError::Generation(
                    "the model response did not contain a SQL statement".to_string(),
                ))
            }
        }
    }

    pub fn build_prompt(&self, request: &GenerationRequest<'_>) -> String {
        let mut prompt = String::from(
            r#"You are an expert SQLite analyst for a database with the historical statistics of the football club Feyenoord.
Write a SQL query that answers the user's question.

Rules:
- Write exactly one read-only SQLite SELECT statement (a WITH clause is allowed).
- Use only the tables and columns listed in the schema below.
- Use single quotes for string literals.
- Join tables on their key columns; never produce a cartesian product.
- Return the query in a ```sql code block and nothing else.

Schema:
"#,
        );
        prompt.push_str(&self.schema.describe());

        if let Some(ref store) = self.few_shot {
            let examples = store.select(request.question, self.few_shot_examples);
            if !examples.is_empty() {
                prompt.push_str("\n\nExamples of questions and their SQL:\n");
                for example in examples {
                    prompt.push_str(&format!(
                        "\nQuestion: {}\n```sql\n{}\n```\n",
                        example.question,
                        example.sql.trim()
                    ));
                }
            }
        }

        if !request.conversation.trim().is_empty() {
            prompt.push_str("\n\nConversation so far (use it to resolve references like \"that season\" or \"he\"):\n");
            prompt.push_str(request.conversation);
        }

        if !request.prior_attempts.is_empty() {
            prompt.push_str("\n\nYour previous queries were not accepted. Do not repeat these mistakes:\n");
            for (i, prior) in request.prior_attempts.iter().enumerate() {
                prompt.push_str(&format!(
                    "\nAttempt {}:\n```sql\n{}\n```\nProblem: {}\n",
                    i + 1,
                    prior.sql.trim(),
                    prior.reason
                ));
            }
        }

        prompt.push_str(&format!("\n\nQuestion: {}\n", request.question));
        prompt
    }
}

/// Pull a single statement out of a model response. Fenced ```sql blocks win,
/// then any fenced block, then the paragraph starting at the first line that
/// opens with a SQL keyword. Anything after the first top-level `;` is dropped.
pub fn extract_sql(response: &str) -> Option<String> {
    let body = FENCED_SQL
        .captures(response)
        .or_else(|| FENCED_ANY.captures(response))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .or_else(|| STATEMENT_LINE.find(response).map(|m| unfenced(&response[m.start()..])))?;

    let statement = first_statement(body).trim();
    if statement.is_empty() {
        None
    } else {
        Some(statement.to_string())
    }
}

/// An unfenced statement ends at the first blank line.
fn unfenced(text: &str) -> &str {
    match BLANK_LINE.find(text) {
        Some(m) => &text[..m.start()],
        None => text,
    }
}

/// Everything before the first `;` outside quotes and comments.
fn first_statement(sql: &str) -> &str {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 1;
            }
            b';' => return &sql[..i],
            _ => {}
        }
        i += 1;
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::few_shot::FewShotExample;
    use crate::schema::{ColumnSchema, TableSchema};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder {
        response: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionService for Recorder {
        async fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.response.clone())
        }
    }

    fn schema() -> Arc<SchemaContext> {
        Arc::new(SchemaContext::new(vec![TableSchema::new(
            "matches",
            vec![
                ColumnSchema::new("season", "TEXT"),
                ColumnSchema::new("homeClubGoals", "INTEGER"),
            ],
        )]))
    }

    #[test]
    fn test_extract_prefers_sql_fence() {
        let response = "Here you go:\n```python\nprint(1)\n```\n```sql\nSELECT season FROM matches;\n```";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT season FROM matches"));
    }

    #[test]
    fn test_extract_any_fence() {
        let response = "```\nSELECT 1\n```";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT 1"));
    }

    #[test]
    fn test_extract_keyword_line() {
        let response = "Sure! The query is:\n  select season from matches where season = 'a;b'; -- done\nThanks";
        assert_eq!(
            extract_sql(response).as_deref(),
            Some("select season from matches where season = 'a;b'")
        );
    }

    #[test]
    fn test_extract_stops_at_trailing_prose() {
        let response = "Here is the query:\nSELECT season FROM matches\n\nThis lists every season.";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT season FROM matches"));
    }

    #[test]
    fn test_extract_inline_fence_without_language() {
        assert_eq!(
            extract_sql("```SELECT season FROM matches```").as_deref(),
            Some("SELECT season FROM matches")
        );
    }

    #[test]
    fn test_extract_skips_capitalized_prose() {
        let response = "Select the seasons with:\nSELECT season FROM matches;";
        assert_eq!(extract_sql(response).as_deref(), Some("SELECT season FROM matches"));
    }

    #[test]
    fn test_extract_ignores_quotes_in_comments() {
        let response = "SELECT season -- don't worry\nFROM matches;\nDone.";
        assert_eq!(
            extract_sql(response).as_deref(),
            Some("SELECT season -- don't worry\nFROM matches")
        );
        let block = "SELECT season /* it's; fine */ FROM matches; SELECT 2";
        assert_eq!(
            extract_sql(block).as_deref(),
            Some("SELECT season /* it's; fine */ FROM matches")
        );
    }

    #[test]
    fn test_extract_nothing() {
        assert_eq!(extract_sql("I cannot answer that."), None);
        assert_eq!(extract_sql("```sql\n;\n```"), None);
    }

    #[tokio::test]
    async fn test_prompt_carries_grounding_and_prior_attempts() {
        let llm = Arc::new(Recorder {
            response: "```sql\nSELECT SUM(homeClubGoals) FROM matches\n```".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let store = Arc::new(FewShotStore::new(vec![FewShotExample {
            question: "How many goals in 2005?".to_string(),
            sql: "SELECT 5".to_string(),
        }]));
        let generator = SqlGenerator::new(llm.clone(), schema()).with_few_shot(store, 1);
        let prior = vec![RepairFeedback {
            sql: "DELETE FROM matches".to_string(),
            reason: "only SELECT queries are allowed".to_string(),
        }];

        let candidate = generator
            .generate(&GenerationRequest {
                question: "How many goals in 2010?",
                conversation: "User: hi\nAssistant: hello",
                prior_attempts: &prior,
                attempt: 2,
            })
            .await
            .unwrap();

        assert_eq!(candidate.sql, "SELECT SUM(homeClubGoals) FROM matches");
        assert_eq!(candidate.attempt, 2);
        let prompt = &llm.prompts.lock().unwrap()[0];
        assert!(prompt.contains("CREATE TABLE \"matches\""));
        assert!(prompt.contains("SELECT 5"));
        assert!(prompt.contains("Assistant: hello"));
        assert!(prompt.contains("DELETE FROM matches"));
        assert!(prompt.contains("only SELECT queries are allowed"));
        assert!(prompt.trim_end().ends_with("Question: How many goals in 2010?"));
    }

    #[tokio::test]
    async fn test_no_sql_is_generation_error() {
        let llm = Arc::new(Recorder {
            response: "No idea.".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = SqlGenerator::new(llm, schema());
        let result = generator
            .generate(&GenerationRequest {
                question: "?",
                conversation: "",
                prior_attempts: &[],
                attempt: 1,
            })
            .await;
        assert!(matches!(result, Err(AgentError::Generation(_))));
    }
}
