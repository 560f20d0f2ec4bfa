//! Answer Composer
//!
//! Turns result rows into the reply the user sees. Failed runs get a fixed
//! apology; database error text never reaches the user.

use crate::execution::{display_value, QueryRows};
use crate::llm::CompletionService;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Answered,
    GenerationFailed,
    ExecutionFailed,
    DeadlineExceeded,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Answered => "answered",
            Outcome::GenerationFailed => "generation_failed",
            Outcome::ExecutionFailed => "execution_failed",
            Outcome::DeadlineExceeded => "deadline_exceeded",
        }
    }

    /// Fixed user-facing text for runs that did not produce an answer.
    pub fn apology(&self) -> Option<&'static str> {
        match self {
            Outcome::Answered => None,
            Outcome::GenerationFailed => Some(
                "Sorry, I couldn't turn that question into a query I trust. Could you rephrase it?",
            ),
            Outcome::ExecutionFailed => Some(
                "Sorry, something went wrong while looking that up in the Feyenoord statistics. Please try again.",
            ),
            Outcome::DeadlineExceeded => Some(
                "Sorry, that took too long to answer. Please try again or ask a simpler question.",
            ),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// The statement whose rows produced the answer
    pub sql: Option<String>,
    pub outcome: Outcome,
    /// Generation attempts used by the run
    pub attempts: u32,
}

impl Answer {
    pub fn answered(text: impl Into<String>, sql: impl Into<String>, attempts: u32) -> Self {
        Self {
            text: text.into(),
            sql: Some(sql.into()),
            outcome: Outcome::Answered,
            attempts,
        }
    }

    pub fn failed(outcome: Outcome, attempts: u32) -> Self {
        Self {
            text: outcome.apology().unwrap_or_default().to_string(),
            sql: None,
            outcome,
            attempts,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.outcome == Outcome::Answered
    }
}

/// Composed answer text. `fallback` holds the model failure when the rows
/// were listed deterministically instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Composed {
    pub text: String,
    pub fallback: Option<String>,
}

impl Composed {
    fn direct(text: String) -> Self {
        Self { text, fallback: None }
    }
}

const NO_RESULTS: &str =
    "I couldn't find any data matching that question in the Feyenoord statistics.";

pub struct AnswerComposer {
    llm: Arc<dyn CompletionService>,
    display_rows: usize,
    timeout: Duration,
}

impl AnswerComposer {
    pub fn new(llm: Arc<dyn CompletionService>, display_rows: usize, timeout: Duration) -> Self {
        Self {
            llm,
            display_rows,
            timeout,
        }
    }

    /// Answer text for successful rows. Never fails: empty results and model
    /// failures both have deterministic answers.
    pub async fn compose(&self, question: &str, conversation: &str, sql: &str, rows: &QueryRows) -> Composed {
        if rows.is_empty() {
            debug!("No rows, answering without the model");
            return Composed::direct(NO_RESULTS.to_string());
        }

        let prompt = self.build_prompt(question, conversation, sql, rows);
        let failure = match tokio::time::timeout(self.timeout, self.llm.complete(&prompt)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => return Composed::direct(text.trim().to_string()),
            Ok(Ok(_)) => "model returned an empty answer".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("answer composition timed out after {:?}", self.timeout),
        };
        warn!("Listing rows instead of a model answer: {}", failure);
        Composed {
            text: fallback_answer(rows, self.display_rows),
            fallback: Some(failure),
        }
    }

    fn build_prompt(&self, question: &str, conversation: &str, sql: &str, rows: &QueryRows) -> String {
        let mut prompt = String::from(
            "You are an enthusiastic Feyenoord supporter who knows the club's history inside out.\n\
             Answer the user's question using only the query result below. Answer in the language \
             the question was asked in, be concise, and do not mention SQL or databases.\n",
        );
        if !conversation.trim().is_empty() {
            prompt.push_str(&format!("\nConversation so far:\n{}\n", conversation));
        }
        prompt.push_str(&format!(
            "\nQuestion: {}\n\nQuery:\n{}\n\nResult:\n{}\n\nAnswer:",
            question,
            sql,
            render_rows(rows, self.display_rows)
        ));
        prompt
    }
}

/// Pipe-separated table of at most `limit` rows, with a marker for the rest.
pub fn render_rows(rows: &QueryRows, limit: usize) -> String {
    let mut lines = vec![rows.columns.join(" | ")];
    for row in rows.rows.iter().take(limit) {
        lines.push(row.iter().map(display_value).collect::<Vec<_>>().join(" | "));
    }
    if rows.len() > limit {
        lines.push(format!("+{} more rows", rows.len() - limit));
    }
    if rows.truncated {
        lines.push("(result was capped; more rows exist)".to_string());
    }
    lines.join("\n")
}

fn fallback_answer(rows: &QueryRows, limit: usize) -> String {
    if rows.len() == 1 && rows.columns.len() == 1 {
        return format!("The answer is {}.", display_value(&rows.rows[0][0]));
    }
    format!("Here is what I found:\n{}", render_rows(rows, limit))
}
