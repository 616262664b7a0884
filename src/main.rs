use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use tabloom::bridge::{self, BridgeConfig};
use tabloom::consts::{DEFAULT_MODEL, DEFAULT_OLLAMA_URL, DEFAULT_TARGET, HEARTBEAT_INTERVAL, default_db_path};
use tabloom::engine::{EngineManager, ManagerConfig};
use tabloom::events::EventBus;
use tabloom::router::Router;
use tabloom::runtime::ollama::{OllamaCacheProbe, OllamaRuntime};
use tabloom::store::{self, Store};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Provider {
    Local,
    Cloud,
}

impl From<Provider> for store::Provider {
    fn from(provider: Provider) -> Self {
        match provider {
            Provider::Local => store::Provider::Local,
            Provider::Cloud => store::Provider::Cloud,
        }
    }
}

#[derive(Parser)]
#[command(name = "tabloom", version, about = "Local model host for tab grouping and chat.")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// SQLite database path for persisted status (use :memory: for ephemeral)
    #[arg(short, long)]
    db: Option<String>,

    /// Base URL of the Ollama daemon
    #[arg(long, default_value = DEFAULT_OLLAMA_URL)]
    ollama_url: String,

    /// Model used when a request does not name one
    #[arg(short, long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Only messages addressed to this target are handled
    #[arg(short, long, default_value = DEFAULT_TARGET)]
    target: String,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = HEARTBEAT_INTERVAL.as_secs())]
    heartbeat_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Serve JSON requests on stdin/stdout (default)
    Serve,
    /// Print the persisted engine status
    Status,
    /// Set the preferred inference provider
    Prefer {
        #[arg(value_enum)]
        provider: Provider,
    },
    /// Clear the persisted engine status
    Forget,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let store = Arc::new(open_store(cli.db.as_deref())?);

    match cli.command.as_ref().unwrap_or(&Command::Serve) {
        Command::Serve => serve(&cli, store).await,
        Command::Status => {
            let status = store.load_status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Prefer { provider } => {
            store.set_provider((*provider).into())?;
            println!("✓ Preferred provider set to {provider:?}.");
            Ok(())
        }
        Command::Forget => {
            store.clear_status()?;
            println!("✓ Persisted engine status cleared.");
            Ok(())
        }
    }
}

async fn serve(cli: &Cli, store: Arc<Store>) -> anyhow::Result<()> {
    let bus = Arc::new(EventBus::default());
    let manager = EngineManager::new(
        Arc::new(OllamaRuntime::new(&cli.ollama_url)),
        Arc::new(OllamaCacheProbe::new(&cli.ollama_url)),
        Arc::clone(&bus),
        Some(store),
        ManagerConfig {
            default_model: cli.model.clone(),
        },
    );
    let router = Arc::new(Router::new(manager, &cli.target));

    tracing::info!(
        ollama = %cli.ollama_url,
        model = %cli.model,
        target = %cli.target,
        "serving on stdin/stdout"
    );

    bridge::serve(
        router,
        bus,
        BridgeConfig {
            heartbeat_period: Duration::from_secs(cli.heartbeat_secs.max(1)),
        },
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

fn open_store(db: Option<&str>) -> anyhow::Result<Store> {
    let path = match db {
        Some(path) => PathBuf::from(path),
        None => default_db_path().context("could not determine home directory")?,
    };
    if path.as_os_str() != ":memory:" {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Store::open(&path.to_string_lossy())
}
