mod collaborators;
mod config;
mod handlers;
mod server;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gpulease_core::infrastructure::StateStore;
use gpulease_core::recovery::recover;

#[derive(Parser)]
#[command(
    name = "gpulease",
    about = "GPU lease and handoff orchestrator for the prime/study services",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3100")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Storage backend: "memory" or "sqlite:<path>"
        #[arg(long, default_value = "memory", env = "GPULEASE_STORAGE")]
        storage: String,

        /// YAML configuration file (timeouts, endpoints, service groups)
        #[arg(long, env = "GPULEASE_CONFIG")]
        config: Option<String>,

        /// Bearer token required on every route except /health
        #[arg(long, env = "GPULEASE_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Maximum number of requests served at once
        #[arg(long, default_value = "256")]
        max_concurrency: usize,
    },

    /// Run crash recovery against a store and print the report
    Recover {
        #[arg(long, env = "GPULEASE_STORAGE")]
        storage: String,
    },

    /// Print the persisted lease, handoff history and health snapshots
    History {
        #[arg(long, env = "GPULEASE_STORAGE")]
        storage: String,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            storage,
            config,
            api_key,
            max_concurrency,
        } => {
            let settings = config::Settings::load(config.as_deref())?;
            server::run(server::ServeOptions {
                host,
                port,
                storage,
                settings,
                api_key: api_key.filter(|k| !k.is_empty()),
                max_concurrency,
            })
            .await?;
        }
        Commands::Recover { storage } => {
            let store = server::create_store(&storage)?;
            let report = recover(&mut *store.lock())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::History { storage } => {
            let store = server::create_store(&storage)?;
            let store = store.lock();
            let history = serde_json::json!({
                "lease": store.load_lease()?,
                "handoffs": store.load_handoffs()?,
                "health": store.load_health()?,
            });
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Version => {
            println!("gpulease {}", env!("CARGO_PKG_VERSION"));
            println!("GPU lease arbitration and handoff kernel");
        }
    }

    Ok(())
}
