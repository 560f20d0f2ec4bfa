#![allow(dead_code)]

use async_trait::async_trait;
use feyod_agent::answer::AnswerComposer;
use feyod_agent::conversation::{ConversationManager, ConversationPolicy};
use feyod_agent::error::{AgentError, Result};
use feyod_agent::execution::{ExecutionResult, QueryExecutor, QueryRows};
use feyod_agent::llm::CompletionService;
use feyod_agent::observability::ExecutionLog;
use feyod_agent::schema::{ColumnSchema, SchemaContext, TableSchema};
use feyod_agent::sql_generator::SqlGenerator;
use feyod_agent::sql_validator::{SqlValidator, ValidatedSql};
use feyod_agent::workflow::{WorkflowManager, WorkflowPolicy};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TOTAL_GOALS_SQL: &str = "SELECT SUM(CASE WHEN m.homeClubId = c.clubId THEN m.homeClubGoals ELSE m.awayClubGoals END) AS total_goals \
FROM matches m JOIN clubs c ON c.clubId IN (m.homeClubId, m.awayClubId) \
WHERE c.clubName = 'Feyenoord' AND m.season = '2010-2011'";

#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
    /// Answers after a delay
    Slow(Duration, String),
    /// Never answers within any test timeout
    Hang,
}

pub fn sql_block(sql: &str) -> Reply {
    Reply::Text(format!("```sql\n{}\n```", sql))
}

pub fn text(text: &str) -> Reply {
    Reply::Text(text.to_string())
}

/// Completion service that replays scripted replies. Generation prompts and
/// every other prompt (answers, summaries) have separate scripts.
#[derive(Default)]
pub struct ScriptedLlm {
    sql: Mutex<VecDeque<Reply>>,
    other: Mutex<VecDeque<Reply>>,
    pub sql_prompts: Mutex<Vec<String>>,
    pub other_prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sql(self, reply: Reply) -> Self {
        self.sql.lock().unwrap().push_back(reply);
        self
    }

    pub fn answer(self, reply: Reply) -> Self {
        self.other.lock().unwrap().push_back(reply);
        self
    }

    pub fn sql_calls(&self) -> usize {
        self.sql_prompts.lock().unwrap().len()
    }

    pub fn sql_prompt(&self, index: usize) -> String {
        self.sql_prompts.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedLlm {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let is_generation = prompt.contains("Write a SQL query that answers the user's question");
        let reply = if is_generation {
            self.sql_prompts.lock().unwrap().push(prompt.to_string());
            self.sql.lock().unwrap().pop_front()
        } else {
            self.other_prompts.lock().unwrap().push(prompt.to_string());
            self.other.lock().unwrap().pop_front()
        };

        match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(AgentError::Llm(message)),
            Some(Reply::Slow(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AgentError::Llm("hung".to_string()))
            }
            None => Err(AgentError::Llm("script exhausted".to_string())),
        }
    }
}

/// Executor that replays scripted results and records what it was asked to
/// run.
#[derive(Default)]
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<ExecutionResult>>,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, result: ExecutionResult) -> Self {
        self.results.lock().unwrap().push_back(result);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn execute(&self, statement: &ValidatedSql) -> ExecutionResult {
        self.executed.lock().unwrap().push(statement.sql().to_string());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ExecutionResult::error("no scripted result"))
    }
}

pub fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> ExecutionResult {
    ExecutionResult::Rows(QueryRows::new(
        columns.iter().map(|c| c.to_string()).collect(),
        rows,
    ))
}

pub fn schema() -> Arc<SchemaContext> {
    Arc::new(SchemaContext::new(vec![
        TableSchema::new(
            "matches",
            vec![
                ColumnSchema::new("matchId", "INTEGER"),
                ColumnSchema::new("season", "TEXT"),
                ColumnSchema::new("homeClubId", "INTEGER"),
                ColumnSchema::new("awayClubId", "INTEGER"),
                ColumnSchema::new("homeClubGoals", "INTEGER"),
                ColumnSchema::new("awayClubGoals", "INTEGER"),
            ],
        ),
        TableSchema::new(
            "clubs",
            vec![
                ColumnSchema::new("clubId", "INTEGER"),
                ColumnSchema::new("clubName", "TEXT"),
            ],
        ),
    ]))
}

pub fn fast_policy() -> WorkflowPolicy {
    WorkflowPolicy {
        max_generation_attempts: 3,
        max_execution_attempts: 2,
        llm_timeout: Duration::from_secs(5),
        run_deadline: Duration::from_secs(10),
        retry_backoff: Duration::from_millis(1),
    }
}

pub fn workflow(
    llm: Arc<ScriptedLlm>,
    executor: Arc<ScriptedExecutor>,
    policy: WorkflowPolicy,
) -> (WorkflowManager, Arc<ExecutionLog>) {
    let schema = schema();
    let log = Arc::new(ExecutionLog::default());
    let conversation = Arc::new(ConversationManager::new(ConversationPolicy::default(), None));
    let manager = WorkflowManager::new(
        conversation,
        SqlGenerator::new(llm.clone(), schema.clone()),
        SqlValidator::new(schema, 1),
        executor,
        AnswerComposer::new(llm, 25, policy.llm_timeout),
        log.clone(),
        policy,
    );
    (manager, log)
}
