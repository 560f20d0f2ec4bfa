//! Conversation Context
//!
//! Two-tier memory for one chat session: a window of recent turns kept
//! verbatim, and an append-only summary of everything that fell out of the
//! window. Turns that leave the window are staged until their combined length
//! crosses the configured threshold, then compacted into the summary in one
//! go.

use crate::error::{AgentError, Result};
use crate::llm::CompletionService;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("User"),
            Role::Assistant => f.write_str("Assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            at: Utc::now(),
        }
    }

    fn render(&self) -> String {
        format!("{}: {}", self.role, self.text)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    recent: VecDeque<Turn>,
    #[serde(default)]
    staged: Vec<Turn>,
    #[serde(default)]
    summary: String,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recent(&self) -> impl Iterator<Item = &Turn> {
        self.recent.iter()
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn staged(&self) -> &[Turn] {
        &self.staged
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.staged.is_empty() && self.summary.is_empty()
    }

    fn staged_chars(&self) -> usize {
        self.staged.iter().map(|t| t.text.chars().count()).sum()
    }

    /// Summary first, then staged and recent turns in chronological order.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if !self.summary.is_empty() {
            parts.push(format!("Summary of earlier conversation:\n{}", self.summary));
        }
        let turns: Vec<String> = self
            .staged
            .iter()
            .chain(self.recent.iter())
            .map(Turn::render)
            .collect();
        if !turns.is_empty() {
            parts.push(format!("Recent messages:\n{}", turns.join("\n")));
        }
        parts.join("\n\n")
    }
}

#[derive(Debug, Clone)]
pub struct ConversationPolicy {
    pub recent_messages_kept: usize,
    pub older_messages_char_threshold: usize,
    /// Per-turn cut-off used by the deterministic summary fallback
    pub fallback_turn_chars: usize,
    pub summarize_timeout: Duration,
}

impl Default for ConversationPolicy {
    fn default() -> Self {
        Self {
            recent_messages_kept: 25,
            older_messages_char_threshold: 3000,
            fallback_turn_chars: 200,
            summarize_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ConversationManager {
    policy: ConversationPolicy,
    summarizer: Option<Arc<dyn CompletionService>>,
}

impl ConversationManager {
    pub fn new(policy: ConversationPolicy, summarizer: Option<Arc<dyn CompletionService>>) -> Self {
        Self { policy, summarizer }
    }

    pub fn policy(&self) -> &ConversationPolicy {
        &self.policy
    }

    pub fn render_context(&self, context: &ConversationContext) -> String {
        context.render()
    }

    /// Append a turn, moving overflow out of the verbatim window and
    /// compacting the staging buffer once it grows past the threshold.
    pub async fn append_turn(&self, context: &mut ConversationContext, role: Role, text: &str) {
        context.recent.push_back(Turn::new(role, text));

        while context.recent.len() > self.policy.recent_messages_kept {
            if let Some(oldest) = context.recent.pop_front() {
                context.staged.push(oldest);
            }
        }

        if context.staged_chars() > self.policy.older_messages_char_threshold {
            let chunk = self.summarize(&context.summary, &context.staged).await;
            if !context.summary.is_empty() {
                context.summary.push('\n');
            }
            context.summary.push_str(chunk.trim());
            info!(
                "Compacted {} older turns into summary ({} chars)",
                context.staged.len(),
                context.summary.len()
            );
            context.staged.clear();
        }
    }

    async fn summarize(&self, existing: &str, turns: &[Turn]) -> String {
        if let Some(ref llm) = self.summarizer {
            match self.summarize_with_model(llm.as_ref(), existing, turns).await {
                Ok(summary) => return summary,
                Err(e) => warn!("Summarization failed, using truncated transcript: {}", e),
            }
        }
        self.fallback_summary(turns)
    }

    async fn summarize_with_model(
        &self,
        llm: &dyn CompletionService,
        existing: &str,
        turns: &[Turn],
    ) -> Result<String> {
        let transcript: Vec<String> = turns.iter().map(Turn::render).collect();
        let prompt = format!(
            r#"Summarize the following part of a conversation about Feyenoord statistics.
Keep every club, player, season, number and result that was mentioned, and what the user was interested in.
Do not repeat what the existing summary already says. Return only the summary text.

Existing summary:
{}

Conversation:
{}"#,
            if existing.is_empty() { "(none)" } else { existing },
            transcript.join("\n")
        );

        let summary = tokio::time::timeout(self.policy.summarize_timeout, llm.complete(&prompt))
            .await
            .map_err(|_| AgentError::Timeout {
                step: "summarize".to_string(),
                after: self.policy.summarize_timeout,
            })??;

        if summary.trim().is_empty() {
            return Err(AgentError::Llm("empty summary".to_string()));
        }
        debug!("Model summary: {} chars", summary.len());
        Ok(summary)
    }

    fn fallback_summary(&self, turns: &[Turn]) -> String {
        turns
            .iter()
            .map(|t| {
                let text: String = t.text.chars().take(self.policy.fallback_turn_chars).collect();
                if t.text.chars().count() > self.policy.fallback_turn_chars {
                    format!("{}: {}...", t.role, text)
                } else {
                    format!("{}: {}", t.role, text)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
