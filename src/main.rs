//! sqlwizard CLI - generate MySQL queries from natural language
//!
//! Usage:
//!   sqlwizard generate <connection> "<request>"
//!   sqlwizard schema <connection>
//!   sqlwizard models
//!   sqlwizard test model|database|ssh [connection]

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use sqlwizard::services::llm::available_models;
use sqlwizard::services::{JsonSettingsStore, SettingsStore};
use sqlwizard::{CancellationToken, GenerationRequest, Orchestrator, OutputSink, WizardError};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sqlwizard")]
#[command(about = "Generate MySQL queries from natural language using your live schema")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to ~/.sqlwizard/settings.json)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a generated query to stdout
    Generate {
        /// Saved connection id
        connection: String,
        /// What the query should do
        prompt: String,
    },

    /// Print the introspected schema as JSON
    Schema {
        connection: String,
    },

    /// List supported models
    Models,

    /// Check connection settings
    Test {
        #[command(subcommand)]
        target: TestTarget,
    },
}

#[derive(Subcommand)]
enum TestTarget {
    /// Send a minimal request to the configured model
    Model,
    /// Connect to the database and run SELECT 1
    Database { connection: String },
    /// Authenticate against the SSH bastion
    Ssh { connection: String },
}

/// Writes fragments to stdout as they arrive.
struct StdoutSink;

#[async_trait]
impl OutputSink for StdoutSink {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, text: &str) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_interrupt(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Cancel `cancel` on Ctrl-C. The returned task must be kept alive.
fn watch_interrupt(cancel: CancellationToken) -> smol::Task<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, on_interrupt as libc::sighandler_t);
    }

    smol::spawn(async move {
        while !INTERRUPTED.load(Ordering::SeqCst) {
            smol::Timer::after(Duration::from_millis(100)).await;
        }
        tracing::info!("Interrupted, cancelling");
        cancel.cancel();
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sqlwizard=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Models = cli.command {
        for model in available_models() {
            println!(
                "{:<32} {:<16} {:>6}  {}",
                model.id,
                model.backend.name(),
                model.max_tokens,
                model.display_name
            );
        }
        return ExitCode::SUCCESS;
    }

    let store = match cli.settings {
        Some(path) => JsonSettingsStore::load(path),
        None => JsonSettingsStore::load_default(),
    };
    let store = match store {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: failed to load settings: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let store: Arc<dyn SettingsStore> = Arc::new(store);

    smol::block_on(async {
        let orchestrator = Orchestrator::new(store.clone());
        let result = run(&orchestrator, store.as_ref(), cli.command).await;
        orchestrator.shutdown().await;

        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {}", e.user_message());
                ExitCode::FAILURE
            }
        }
    })
}

async fn run(
    orchestrator: &Orchestrator,
    store: &dyn SettingsStore,
    command: Commands,
) -> Result<(), WizardError> {
    match command {
        Commands::Generate { connection, prompt } => {
            let cancel = CancellationToken::new();
            let _interrupt = watch_interrupt(cancel.clone());

            let request = GenerationRequest::new(connection, prompt);
            let result = orchestrator.generate(&request, &StdoutSink, &cancel).await?;
            println!();
            eprintln!("\n{}", result.explanation);
            Ok(())
        }
        Commands::Schema { connection } => {
            let schema = orchestrator.schema(&connection).await?;
            match serde_json::to_string_pretty(schema.as_ref()) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("Error: failed to serialize schema: {}", e),
            }
            Ok(())
        }
        Commands::Models => Ok(()),
        Commands::Test { target } => match target {
            TestTarget::Model => {
                orchestrator.test_model_connection(None).await?;
                println!("Model connection OK");
                Ok(())
            }
            TestTarget::Database { connection } => {
                let config = lookup(store, &connection)?;
                orchestrator.test_database_connection(&config).await?;
                println!("Database connection OK");
                Ok(())
            }
            TestTarget::Ssh { connection } => {
                let config = lookup(store, &connection)?;
                orchestrator.test_ssh_connection(&config).await?;
                println!("SSH connection OK");
                Ok(())
            }
        },
    }
}

fn lookup(
    store: &dyn SettingsStore,
    connection: &str,
) -> Result<sqlwizard::services::settings::DatabaseConnectionConfig, WizardError> {
    store
        .connection(connection)
        .ok_or_else(|| sqlwizard::ConfigurationError::UnknownConnection(connection.to_string()).into())
}
