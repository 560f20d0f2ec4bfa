use feyod_agent::app::{load_schema, App};
use feyod_agent::config::AppConfig;
use feyod_agent::sql_validator::{SqlValidator, ValidationResult};
use feyod_agent::{AgentError, Answer};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "feyod-agent")]
#[command(about = "Ask questions about Feyenoord's history in plain language")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single question
    Ask {
        /// The question, e.g. "How many goals did Feyenoord score in 2010-2011?"
        question: String,

        /// Print the SQL behind the answer
        #[arg(long)]
        show_sql: bool,
    },
    /// Interactive conversation on stdin; Ctrl-C cancels the current question
    Chat {
        /// Print the SQL behind each answer
        #[arg(long)]
        show_sql: bool,
    },
    /// Print the schema description given to the model
    Schema,
    /// Run the static SQL checks on a statement without executing it
    Validate {
        sql: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    debug!("Configuration: {:?}", config);

    match args.command {
        Commands::Ask { question, show_sql } => ask(config, question, show_sql).await,
        Commands::Chat { show_sql } => chat(config, show_sql).await,
        Commands::Schema => {
            let schema = load_schema(&config).await?;
            println!("{}", schema.describe());
            Ok(())
        }
        Commands::Validate { sql } => validate(config, sql).await,
    }
}

async fn ask(config: AppConfig, question: String, show_sql: bool) -> Result<()> {
    let app = App::from_config(config).await?;
    let conversation_id = uuid::Uuid::new_v4().to_string();
    match ask_cancellable(&app, &conversation_id, &question).await {
        Ok(answer) => print_answer(&answer, show_sql),
        Err(AgentError::Cancelled) => println!("Cancelled."),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn chat(config: AppConfig, show_sql: bool) -> Result<()> {
    let app = App::from_config(config).await?;
    let conversation_id = uuid::Uuid::new_v4().to_string();
    info!("Started conversation {}", conversation_id);
    println!("Ask me anything about Feyenoord. Type 'exit' to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("exit") || question.eq_ignore_ascii_case("quit") {
            break;
        }
        match ask_cancellable(&app, &conversation_id, question).await {
            Ok(answer) => print_answer(&answer, show_sql),
            Err(AgentError::Cancelled) => println!("Cancelled."),
            Err(e) => return Err(e.into()),
        }
    }

    app.sessions().end_session(&conversation_id);
    Ok(())
}

/// Run one question, cancelling it if Ctrl-C arrives first.
async fn ask_cancellable(app: &App, conversation_id: &str, question: &str) -> feyod_agent::Result<Answer> {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let result = app.sessions().ask(conversation_id, question, &cancel).await;
    watcher.abort();
    result
}

fn print_answer(answer: &Answer, show_sql: bool) {
    println!("\n{}\n", answer.text);
    if show_sql {
        if let Some(ref sql) = answer.sql {
            println!("SQL ({} attempt(s)):\n{}\n", answer.attempts, sql);
        }
    }
}

async fn validate(config: AppConfig, sql: String) -> Result<()> {
    let schema = Arc::new(load_schema(&config).await?);
    let validator = SqlValidator::new(schema, config.max_cross_joins);
    match validator.validate(&sql) {
        ValidationResult::Valid(statement) => println!("valid: {}", statement.sql()),
        ValidationResult::Invalid(failure) => {
            println!("invalid ({}): {}", failure.kind, failure.reason);
            if !failure.fragment.is_empty() {
                println!("offending fragment: {}", failure.fragment);
            }
        }
    }
    Ok(())
}
