//! Wiring
//!
//! Builds the full question-answering stack from an `AppConfig`: database
//! pool, schema snapshot, model client, optional few-shot store and the
//! workflow behind a session store.

use crate::answer::AnswerComposer;
use crate::config::AppConfig;
use crate::conversation::{ConversationManager, ConversationPolicy};
use crate::db::{init_read_only_pool, DbPool};
use crate::error::Result;
use crate::execution::SqliteExecutor;
use crate::few_shot::FewShotStore;
use crate::llm::{CompletionService, LlmClient};
use crate::observability::ExecutionLog;
use crate::schema::SchemaContext;
use crate::session::SessionStore;
use crate::sql_generator::SqlGenerator;
use crate::sql_validator::SqlValidator;
use crate::workflow::{WorkflowManager, WorkflowPolicy};
use std::sync::Arc;
use tracing::{info, warn};

const POOL_CONNECTIONS: u32 = 5;
const IN_MEMORY_LOG_ENTRIES: usize = 1000;

pub struct App {
    config: AppConfig,
    schema: Arc<SchemaContext>,
    log: Arc<ExecutionLog>,
    sessions: SessionStore,
}

impl App {
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let model = config.require_model()?.clone();
        let pool = init_read_only_pool(&config.database_url, POOL_CONNECTIONS).await?;
        let schema = Arc::new(SchemaContext::load(&pool, config.schema_sample_rows).await?);

        info!("Using model {} via {}", model.model, model.provider);
        let llm: Arc<dyn CompletionService> = Arc::new(
            LlmClient::new(model, config.llm_timeout)?
                .with_system_prompt("You help football supporters explore Feyenoord's historical statistics."),
        );

        let mut generator = SqlGenerator::new(llm.clone(), schema.clone());
        if let Some(store) = load_few_shot(&config).await {
            generator = generator.with_few_shot(Arc::new(store), config.few_shot_examples);
        }

        let conversation = Arc::new(ConversationManager::new(
            ConversationPolicy {
                recent_messages_kept: config.recent_messages_kept,
                older_messages_char_threshold: config.older_messages_char_threshold,
                summarize_timeout: config.llm_timeout,
                ..ConversationPolicy::default()
            },
            Some(llm.clone()),
        ));
        let log = Arc::new(ExecutionLog::new(config.execution_log_file.clone(), IN_MEMORY_LOG_ENTRIES));

        let workflow = WorkflowManager::new(
            conversation,
            generator,
            SqlValidator::new(schema.clone(), config.max_cross_joins),
            Arc::new(executor(pool, &config)),
            AnswerComposer::new(llm, config.display_rows, config.llm_timeout),
            log.clone(),
            WorkflowPolicy::from(&config),
        );

        Ok(Self {
            config,
            schema,
            log,
            sessions: SessionStore::new(Arc::new(workflow)),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn schema(&self) -> &SchemaContext {
        &self.schema
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn execution_log(&self) -> &ExecutionLog {
        &self.log
    }
}

/// Load only what the schema and validator need, without a model client.
pub async fn load_schema(config: &AppConfig) -> Result<SchemaContext> {
    let pool = init_read_only_pool(&config.database_url, 1).await?;
    SchemaContext::load(&pool, config.schema_sample_rows).await
}

fn executor(pool: DbPool, config: &AppConfig) -> SqliteExecutor {
    SqliteExecutor::new(pool, config.query_timeout, config.max_result_rows)
}

async fn load_few_shot(config: &AppConfig) -> Option<FewShotStore> {
    let url = config.few_shot_database_url.as_deref()?;
    let loaded = match init_read_only_pool(url, 1).await {
        Ok(pool) => FewShotStore::load(&pool).await,
        Err(e) => Err(e),
    };
    match loaded {
        Ok(store) if !store.is_empty() => Some(store),
        Ok(_) => {
            warn!("Few-shot database has no examples, continuing without them");
            None
        }
        Err(e) => {
            warn!("Could not load few-shot examples, continuing without them: {}", e);
            None
        }
    }
}
