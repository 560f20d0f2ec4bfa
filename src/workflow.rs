//! Workflow Orchestrator
//!
//! Drives one question through
//! `Start → ContextAssembled → SqlPending → SqlValid → Executed → AnswerReady`.
//! Invalid statements and execution errors loop back to `SqlPending` with
//! the failure as repair context until a budget runs out; the run then ends
//! in `GenerationFailed` or `ExecutionFailed` with an apology.
//!
//! The conversation context is only replaced after the run has finished
//! every await, so cancellation, deadlines and failures leave it untouched.

use crate::answer::{Answer, AnswerComposer, Outcome};
use crate::config::AppConfig;
use crate::conversation::{ConversationContext, ConversationManager, Role};
use crate::error::{AgentError, Result};
use crate::execution::{ExecutionResult, QueryExecutor};
use crate::observability::{ObservabilitySink, RunRecord, Step, StepEvent};
use crate::sql_generator::{GenerationRequest, RepairFeedback, SqlCandidate, SqlGenerator};
use crate::sql_validator::{SqlValidator, ValidationResult};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Start,
    ContextAssembled,
    SqlPending,
    SqlValid,
    Executed,
    AnswerReady,
    GenerationFailed,
    ExecutionFailed,
}

impl WorkflowState {
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, next),
            (Start, ContextAssembled)
                | (ContextAssembled, SqlPending)
                | (SqlPending, SqlPending)
                | (SqlPending, SqlValid)
                | (SqlPending, GenerationFailed)
                | (SqlValid, Executed)
                | (Executed, AnswerReady)
                | (Executed, SqlPending)
                | (Executed, ExecutionFailed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::AnswerReady | WorkflowState::GenerationFailed | WorkflowState::ExecutionFailed
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub conversation_id: String,
    pub text: String,
    pub asked_at: DateTime<Utc>,
}

impl Question {
    pub fn new(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            text: text.into(),
            asked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowPolicy {
    pub max_generation_attempts: u32,
    pub max_execution_attempts: u32,
    pub llm_timeout: Duration,
    pub run_deadline: Duration,
    pub retry_backoff: Duration,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        Self {
            max_generation_attempts: 3,
            max_execution_attempts: 2,
            llm_timeout: Duration::from_secs(30),
            run_deadline: Duration::from_secs(120),
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl From<&AppConfig> for WorkflowPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_generation_attempts: config.max_generation_attempts,
            max_execution_attempts: config.max_execution_attempts,
            llm_timeout: config.llm_timeout,
            run_deadline: config.run_deadline,
            retry_backoff: config.retry_backoff,
        }
    }
}

/// Per-run bookkeeping. Budgets are counted here and nowhere else.
struct RunState {
    run_id: Uuid,
    conversation_id: String,
    current: WorkflowState,
    generation_attempts: u32,
    execution_attempts: u32,
    sql: Option<String>,
    last_error: Option<AgentError>,
}

impl RunState {
    fn new(question: &Question) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            conversation_id: question.conversation_id.clone(),
            current: WorkflowState::Start,
            generation_attempts: 0,
            execution_attempts: 0,
            sql: None,
            last_error: None,
        }
    }

    fn transition(&mut self, next: WorkflowState) {
        if !self.current.can_transition_to(next) {
            warn!("Unexpected workflow transition {} -> {}", self.current, next);
        }
        debug!("{} -> {}", self.current, next);
        self.current = next;
    }
}

struct Finished {
    answer: Answer,
    context: Option<ConversationContext>,
}

pub struct WorkflowManager {
    conversation: Arc<ConversationManager>,
    generator: SqlGenerator,
    validator: SqlValidator,
    executor: Arc<dyn QueryExecutor>,
    composer: AnswerComposer,
    sink: Arc<dyn ObservabilitySink>,
    policy: WorkflowPolicy,
}

impl WorkflowManager {
    pub fn new(
        conversation: Arc<ConversationManager>,
        generator: SqlGenerator,
        validator: SqlValidator,
        executor: Arc<dyn QueryExecutor>,
        composer: AnswerComposer,
        sink: Arc<dyn ObservabilitySink>,
        policy: WorkflowPolicy,
    ) -> Self {
        Self {
            conversation,
            generator,
            validator,
            executor,
            composer,
            sink,
            policy,
        }
    }

    pub fn policy(&self) -> &WorkflowPolicy {
        &self.policy
    }

    /// Answer one question. Returns `Err(AgentError::Cancelled)` if `cancel`
    /// fires first; every other ending is an `Answer`, failures included.
    pub async fn run(
        &self,
        question: &Question,
        context: &mut ConversationContext,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let mut state = RunState::new(question);
        let started = Instant::now();
        let span = info_span!(
            "run",
            run_id = %state.run_id,
            conversation_id = %question.conversation_id
        );
        info!(parent: &span, "Question: {}", question.text);

        let finished = {
            let drive = self.drive(&mut state, question, context).instrument(span.clone());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout(self.policy.run_deadline, drive) => Some(result),
            }
        };

        let (answer, updated) = match finished {
            None => {
                info!(parent: &span, "Run cancelled in state {}", state.current);
                self.record_run(&state, question, None, started);
                return Err(AgentError::Cancelled);
            }
            Some(Err(_)) => {
                warn!(parent: &span, "Run deadline of {:?} exceeded in state {}", self.policy.run_deadline, state.current);
                state.last_error = Some(AgentError::Timeout {
                    step: format!("run ({})", state.current),
                    after: self.policy.run_deadline,
                });
                (Answer::failed(Outcome::DeadlineExceeded, state.generation_attempts), None)
            }
            Some(Ok(finished)) => (finished.answer, finished.context),
        };

        if let Some(updated) = updated {
            *context = updated;
        }
        self.record_run(&state, question, Some(answer.outcome), started);
        Ok(answer)
    }

    async fn drive(
        &self,
        state: &mut RunState,
        question: &Question,
        context: &ConversationContext,
    ) -> Finished {
        let step_started = Instant::now();
        let rendered = self.conversation.render_context(context);
        state.transition(WorkflowState::ContextAssembled);
        self.emit(state, Step::ContextAssembly, 0, step_started, true, None);

        let mut prior: Vec<RepairFeedback> = Vec::new();
        state.transition(WorkflowState::SqlPending);

        loop {
            if state.generation_attempts >= self.policy.max_generation_attempts {
                return self.fail(state, Outcome::GenerationFailed);
            }
            state.generation_attempts += 1;
            let attempt = state.generation_attempts;

            let candidate = match self.generate(state, question, &rendered, &prior, attempt).await {
                Some(candidate) => candidate,
                None => continue,
            };

            let step_started = Instant::now();
            let validated = match self.validator.validate(&candidate.sql) {
                ValidationResult::Valid(validated) => validated,
                ValidationResult::Invalid(failure) => {
                    let detail = format!("{}: {}", failure.kind, failure.reason);
                    self.emit(state, Step::Validation, attempt, step_started, false, Some(detail));
                    prior.push(RepairFeedback {
                        sql: candidate.sql,
                        reason: failure.reason.clone(),
                    });
                    state.last_error = Some(failure.into_error());
                    state.transition(WorkflowState::SqlPending);
                    continue;
                }
            };
            self.emit(state, Step::Validation, attempt, step_started, true, None);
            state.transition(WorkflowState::SqlValid);
            state.sql = Some(validated.sql().to_string());

            let step_started = Instant::now();
            state.execution_attempts += 1;
            let result = self.executor.execute(&validated).await;
            state.transition(WorkflowState::Executed);

            let rows = match result {
                ExecutionResult::Rows(rows) => rows,
                ExecutionResult::Error(failure) => {
                    self.emit(
                        state,
                        Step::Execution,
                        state.execution_attempts,
                        step_started,
                        false,
                        Some(failure.message.clone()),
                    );
                    state.last_error = Some(AgentError::Execution(failure.message.clone()));
                    if state.execution_attempts >= self.policy.max_execution_attempts
                        || state.generation_attempts >= self.policy.max_generation_attempts
                    {
                        return self.fail(state, Outcome::ExecutionFailed);
                    }
                    let reason = if failure.timed_out {
                        "the query took too long; write a simpler, more selective query".to_string()
                    } else {
                        format!("the database rejected the query: {}", failure.message)
                    };
                    prior.push(RepairFeedback {
                        sql: validated.into_inner(),
                        reason,
                    });
                    state.transition(WorkflowState::SqlPending);
                    continue;
                }
            };
            self.emit(
                state,
                Step::Execution,
                state.execution_attempts,
                step_started,
                true,
                Some(format!("{} rows", rows.len())),
            );

            let step_started = Instant::now();
            let composed = self
                .composer
                .compose(&question.text, &rendered, validated.sql(), &rows)
                .await;
            let text = composed.text;
            self.emit(
                state,
                Step::Composition,
                attempt,
                step_started,
                composed.fallback.is_none(),
                composed.fallback,
            );

            let step_started = Instant::now();
            let mut updated = context.clone();
            self.conversation
                .append_turn(&mut updated, Role::User, &question.text)
                .await;
            self.conversation
                .append_turn(&mut updated, Role::Assistant, &text)
                .await;
            self.emit(state, Step::ContextUpdate, attempt, step_started, true, None);

            state.transition(WorkflowState::AnswerReady);
            return Finished {
                answer: Answer::answered(text, validated.into_inner(), state.generation_attempts),
                context: Some(updated),
            };
        }
    }

    /// One generation call under the LLM timeout. Transient failures back off
    /// before the next attempt; every failure costs its budget unit.
    async fn generate(
        &self,
        state: &mut RunState,
        question: &Question,
        rendered: &str,
        prior: &[RepairFeedback],
        attempt: u32,
    ) -> Option<SqlCandidate> {
        let step_started = Instant::now();
        let request = GenerationRequest {
            question: &question.text,
            conversation: rendered,
            prior_attempts: prior,
            attempt,
        };

        let result = match tokio::time::timeout(self.policy.llm_timeout, self.generator.generate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                step: "generate".to_string(),
                after: self.policy.llm_timeout,
            }),
        };

        match result {
            Ok(candidate) => {
                self.emit(state, Step::Generation, attempt, step_started, true, Some(candidate.sql.clone()));
                Some(candidate)
            }
            Err(e) => {
                warn!("Generation attempt {} failed: {}", attempt, e);
                self.emit(state, Step::Generation, attempt, step_started, false, Some(e.to_string()));
                state.transition(WorkflowState::SqlPending);
                let transient = e.is_transient();
                state.last_error = Some(e);
                if transient && attempt < self.policy.max_generation_attempts {
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                None
            }
        }
    }

    /// Exponential backoff with up to 50% random jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.policy.retry_backoff.saturating_mul(1 << attempt.saturating_sub(1).min(6));
        let jitter_ms = (base.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        base + Duration::from_millis(jitter)
    }

    fn fail(&self, state: &mut RunState, outcome: Outcome) -> Finished {
        let (terminal, what, attempts) = match outcome {
            Outcome::ExecutionFailed => (WorkflowState::ExecutionFailed, "execution", state.execution_attempts),
            _ => (WorkflowState::GenerationFailed, "generation", state.generation_attempts),
        };
        state.transition(terminal);
        let last = state
            .last_error
            .take()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no candidate was produced".to_string());
        state.last_error = Some(AgentError::ExhaustedRetries {
            what: what.to_string(),
            attempts,
            last,
        });
        warn!(
            "Run ended in {} after {} generation and {} execution attempts",
            terminal, state.generation_attempts, state.execution_attempts
        );
        Finished {
            answer: Answer::failed(outcome, state.generation_attempts),
            context: None,
        }
    }

    fn emit(
        &self,
        state: &RunState,
        step: Step,
        attempt: u32,
        started: Instant,
        success: bool,
        detail: Option<String>,
    ) {
        self.sink.record_step(StepEvent {
            run_id: state.run_id,
            conversation_id: state.conversation_id.clone(),
            step,
            attempt,
            duration_ms: started.elapsed().as_millis() as u64,
            success,
            detail,
            timestamp: Utc::now(),
        });
    }

    fn record_run(&self, state: &RunState, question: &Question, outcome: Option<Outcome>, started: Instant) {
        self.sink.record_run(RunRecord {
            run_id: state.run_id,
            conversation_id: state.conversation_id.clone(),
            question: question.text.clone(),
            sql: state.sql.clone(),
            outcome,
            generation_attempts: state.generation_attempts,
            execution_attempts: state.execution_attempts,
            error: state.last_error.as_ref().map(|e| e.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use WorkflowState::*;
        let path = [Start, ContextAssembled, SqlPending, SqlValid, Executed, AnswerReady];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(AnswerReady.is_terminal());
    }

    #[test]
    fn test_failure_exits_come_from_their_states() {
        use WorkflowState::*;
        assert!(SqlPending.can_transition_to(GenerationFailed));
        assert!(Executed.can_transition_to(ExecutionFailed));
        assert!(Executed.can_transition_to(SqlPending));
        assert!(!SqlValid.can_transition_to(GenerationFailed));
        assert!(!Start.can_transition_to(SqlValid));
        assert!(!AnswerReady.can_transition_to(SqlPending));
    }

    #[test]
    fn test_policy_from_config_defaults() {
        let policy = WorkflowPolicy::default();
        assert_eq!(policy.max_generation_attempts, 3);
        assert_eq!(policy.max_execution_attempts, 2);
    }
}
