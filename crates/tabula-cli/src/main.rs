//! Tabula CLI
//!
//! ```bash
//! tabula --db sales.db ask "Which region sold the most last year?"
//! tabula --db sales.db chat
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use tabula_core::{
    CancellationToken, DatasetSchema, LlmProviderKind, Settings, SqliteExecutor, TerminatedReason,
    WorkflowDetails, WorkflowOrchestrator,
};

/// Tabula - ask analytical questions about a dataset in plain language
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: $TABULA_CONFIG or ./tabula.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// SQLite database to query
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    /// One-line description of what the dataset contains
    #[arg(long, global = true)]
    domain: Option<String>,

    /// LLM provider (openai, azure_openai, anthropic, ollama, openai_compatible)
    #[arg(long, global = true)]
    provider: Option<LlmProviderKind>,

    /// Model name
    #[arg(long, global = true)]
    model: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single question
    Ask {
        question: String,

        /// Also print the statement, confidence and attempts
        #[arg(long)]
        details: bool,

        /// Print the full details as JSON
        #[arg(long)]
        json: bool,
    },

    /// Interactive session; Ctrl-C cancels the question in flight
    Chat,

    /// Print the schema context given to the model
    Schema,

    /// List tables with row counts
    Tables,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = load_settings(&cli)?;

    match &cli.command {
        Commands::Ask {
            question,
            details,
            json,
        } => {
            let orchestrator = build_orchestrator(&settings)?;
            let outcome = orchestrator.ask_with_details(question).await;
            if *json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_answer(&outcome);
                if *details {
                    print_details(&outcome);
                }
            }
        }
        Commands::Chat => {
            let orchestrator = build_orchestrator(&settings)?;
            run_chat(&orchestrator).await?;
        }
        Commands::Schema => {
            let schema = DatasetSchema::from_settings(&settings.database)?;
            println!("{}", schema.render_context());
        }
        Commands::Tables => {
            let schema = DatasetSchema::from_settings(&settings.database)?;
            for table in &schema.tables {
                println!(
                    "{:<32} {:>10} rows  {} columns",
                    table.name,
                    table.row_count,
                    table.columns.len()
                );
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

/// Logs go to stderr so `--json` output stays clean
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref())?;

    if let Some(db) = &cli.db {
        settings.database.path = db.clone();
    }
    if let Some(domain) = &cli.domain {
        settings.database.domain = domain.clone();
    }
    if let Some(provider) = cli.provider {
        settings.llm.provider = provider;
    }
    if let Some(model) = &cli.model {
        settings.llm.model = model.clone();
    }

    settings.validate()?;
    Ok(settings)
}

fn build_orchestrator(settings: &Settings) -> Result<WorkflowOrchestrator> {
    let executor = SqliteExecutor::from_settings(&settings.database, &settings.workflow);
    executor
        .check()
        .with_context(|| format!("cannot open dataset {}", settings.database.path.display()))?;

    let schema = DatasetSchema::from_settings(&settings.database)?;
    tracing::info!(tables = schema.tables.len(), "Dataset schema loaded");

    let inference = tabula_agent::inference_from_settings(&settings.llm)?;
    Ok(WorkflowOrchestrator::from_capabilities(
        settings,
        inference,
        Arc::new(executor),
        &schema,
    ))
}

async fn run_chat(orchestrator: &WorkflowOrchestrator) -> Result<()> {
    println!("Ask a question about your data. Type 'exit' or press Ctrl-D to leave.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("{} ", ">".bold());
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question, "exit" | "quit") {
            break;
        }

        let token = CancellationToken::new();
        let ask = orchestrator.ask_with_cancellation(question, token.clone());
        tokio::pin!(ask);

        let outcome = tokio::select! {
            outcome = &mut ask => outcome,
            _ = tokio::signal::ctrl_c() => {
                token.cancel();
                ask.await
            }
        };
        print_answer(&outcome);
        println!();
    }

    Ok(())
}

fn print_answer(details: &WorkflowDetails) {
    match details.terminated_reason {
        None => println!("{}", details.response),
        Some(TerminatedReason::MaxRetriesExhausted) if details.best_effort => {
            println!("{}", details.response.yellow())
        }
        Some(_) => println!("{}", details.response.dimmed()),
    }
}

fn print_details(details: &WorkflowDetails) {
    println!();
    println!("{}", "Details".bold());
    println!("  question id : {}", details.question_id);
    println!("  outcome     : {}", details.phase);
    println!("  attempts    : {}", details.attempt_count + 1);
    if let Some(statement) = &details.statement {
        println!("  statement   : {}", statement);
    }
    if let Some(rows) = details.row_count {
        let note = if details.truncated { " (truncated)" } else { "" };
        println!("  rows        : {}{}", rows, note);
    }
    if let Some(validation) = &details.validation {
        println!("  confidence  : {:.2}", validation.confidence);
        for issue in &validation.issues {
            println!("    - {}", issue);
        }
    }
    if let Some(kind) = &details.failure_kind {
        println!("  failure     : {}", kind);
    }
}
