//! Execution Log
//!
//! Structured events for every workflow step and one record per run. The
//! default sink forwards everything to `tracing`, optionally appends JSON
//! lines to a file, and keeps a bounded in-memory tail for inspection.

use crate::answer::Outcome;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    ContextAssembly,
    Generation,
    Validation,
    Execution,
    Composition,
    ContextUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    pub run_id: Uuid,
    pub conversation_id: String,
    pub step: Step,
    pub attempt: u32,
    pub duration_ms: u64,
    pub success: bool,
    /// Rejection reason, error text or a short result note
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub conversation_id: String,
    pub question: String,
    pub sql: Option<String>,
    /// `None` when the run was cancelled
    pub outcome: Option<Outcome>,
    pub generation_attempts: u32,
    pub execution_attempts: u32,
    /// Raw error text, never shown to the user
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

pub trait ObservabilitySink: Send + Sync {
    fn record_step(&self, event: StepEvent);
    fn record_run(&self, record: RunRecord);
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogLine<'a> {
    Step(&'a StepEvent),
    Run(&'a RunRecord),
}

pub struct ExecutionLog {
    log_file: Option<PathBuf>,
    steps: Mutex<VecDeque<StepEvent>>,
    runs: Mutex<VecDeque<RunRecord>>,
    max_in_memory: usize,
}

impl ExecutionLog {
    pub fn new(log_file: Option<PathBuf>, max_in_memory: usize) -> Self {
        Self {
            log_file,
            steps: Mutex::new(VecDeque::new()),
            runs: Mutex::new(VecDeque::new()),
            max_in_memory,
        }
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: usize) -> Vec<RunRecord> {
        lock(&self.runs).iter().rev().take(limit).cloned().collect()
    }

    /// Step events of one run, in order.
    pub fn steps_for(&self, run_id: Uuid) -> Vec<StepEvent> {
        lock(&self.steps)
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    fn remember<T>(&self, buffer: &Mutex<VecDeque<T>>, item: T) {
        let mut buffer = lock(buffer);
        buffer.push_back(item);
        while buffer.len() > self.max_in_memory {
            buffer.pop_front();
        }
    }

    fn append(&self, line: &LogLine<'_>) -> Result<()> {
        if let Some(ref path) = self.log_file {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", serde_json::to_string(line)?)?;
        }
        Ok(())
    }
}

impl Default for ExecutionLog {
    fn default() -> Self {
        Self::new(None, 1000)
    }
}

impl ObservabilitySink for ExecutionLog {
    fn record_step(&self, event: StepEvent) {
        info!(
            run_id = %event.run_id,
            step = ?event.step,
            attempt = event.attempt,
            duration_ms = event.duration_ms,
            success = event.success,
            "{}",
            event.detail.as_deref().unwrap_or("")
        );
        if let Err(e) = self.append(&LogLine::Step(&event)) {
            warn!("Failed to write step event to execution log: {}", e);
        }
        self.remember(&self.steps, event);
    }

    fn record_run(&self, record: RunRecord) {
        info!(
            run_id = %record.run_id,
            conversation_id = %record.conversation_id,
            outcome = record.outcome.map(|o| o.as_str()).unwrap_or("cancelled"),
            generation_attempts = record.generation_attempts,
            duration_ms = record.duration_ms,
            "Run finished"
        );
        if let Some(ref error) = record.error {
            warn!(run_id = %record.run_id, "Run error: {}", error);
        }
        if let Err(e) = self.append(&LogLine::Run(&record)) {
            warn!("Failed to write run record to execution log: {}", e);
        }
        self.remember(&self.runs, record);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves plain data behind; keep using it
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(question: &str) -> RunRecord {
        RunRecord {
            run_id: Uuid::new_v4(),
            conversation_id: "c1".to_string(),
            question: question.to_string(),
            sql: None,
            outcome: Some(Outcome::Answered),
            generation_attempts: 1,
            execution_attempts: 1,
            error: None,
            duration_ms: 5,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_in_memory_tail_is_bounded() {
        let log = ExecutionLog::new(None, 2);
        for q in ["a", "b", "c"] {
            log.record_run(run(q));
        }
        let recent: Vec<String> = log.recent_runs(10).into_iter().map(|r| r.question).collect();
        assert_eq!(recent, vec!["c", "b"]);
    }

    #[test]
    fn test_steps_are_grouped_by_run() {
        let log = ExecutionLog::default();
        let run_id = Uuid::new_v4();
        for (attempt, step) in [(1, Step::Generation), (1, Step::Validation)] {
            log.record_step(StepEvent {
                run_id,
                conversation_id: "c1".to_string(),
                step,
                attempt,
                duration_ms: 1,
                success: true,
                detail: None,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(log.steps_for(run_id).len(), 2);
        assert!(log.steps_for(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_json_lines_file() {
        let path = std::env::temp_dir().join(format!("feyod-agent-log-{}.jsonl", Uuid::new_v4()));
        let log = ExecutionLog::new(Some(path.clone()), 10);
        log.record_run(run("how many goals"));

        let contents = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["kind"], "run");
        assert_eq!(line["question"], "how many goals");
        assert_eq!(line["outcome"], "answered");
        let _ = std::fs::remove_file(path);
    }
}
