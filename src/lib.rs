pub mod answer;
pub mod app;
pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod execution;
pub mod few_shot;
pub mod llm;
pub mod observability;
pub mod schema;
pub mod session;
pub mod sql_generator;
pub mod sql_validator;
pub mod workflow;

pub use answer::{Answer, Outcome};
pub use error::{AgentError, Result};
pub use workflow::{Question, WorkflowManager, WorkflowState};
