//! Sessions
//!
//! One conversation context per conversation id. A run holds its
//! conversation's lock for its whole duration, so two questions in the same
//! conversation are answered one after the other while different
//! conversations proceed independently.

use crate::answer::Answer;
use crate::conversation::ConversationContext;
use crate::error::Result;
use crate::workflow::{Question, WorkflowManager};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct SessionStore {
    workflow: Arc<WorkflowManager>,
    sessions: DashMap<String, Arc<Mutex<ConversationContext>>>,
}

impl SessionStore {
    pub fn new(workflow: Arc<WorkflowManager>) -> Self {
        Self {
            workflow,
            sessions: DashMap::new(),
        }
    }

    fn session(&self, conversation_id: &str) -> Arc<Mutex<ConversationContext>> {
        // Clone the Arc out so no map shard lock is held across an await
        self.sessions
            .entry(conversation_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    pub async fn ask(&self, conversation_id: &str, text: &str, cancel: &CancellationToken) -> Result<Answer> {
        let session = self.session(conversation_id);
        let mut context = session.lock().await;
        let question = Question::new(conversation_id, text);
        self.workflow.run(&question, &mut context, cancel).await
    }

    /// Drop a conversation's context. Returns false if it did not exist.
    pub fn end_session(&self, conversation_id: &str) -> bool {
        debug!("Ending session {}", conversation_id);
        self.sessions.remove(conversation_id).is_some()
    }

    /// Copy of a conversation's current context, waiting for any running
    /// question to finish first.
    pub async fn context_snapshot(&self, conversation_id: &str) -> Option<ConversationContext> {
        let session = self.sessions.get(conversation_id).map(|s| s.value().clone())?;
        let context = session.lock().await;
        Some(context.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
