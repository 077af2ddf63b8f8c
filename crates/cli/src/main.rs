//! Stepwise CLI: the main entry point.
//!
//! Commands:
//! - `run`: Solve one request, or read requests from stdin
//! - `capabilities`: List what the configured servers offer
//! - `memory`: Inspect or prune the long-term store
//! - `config`: Show, locate, validate, or initialize configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "stepwise",
    about = "Stepwise: a bounded perceive-plan-act agent",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent on a request
    Run {
        /// Solve a single request instead of reading them from stdin
        #[arg(short, long)]
        message: Option<String>,

        /// Use the built-in capabilities instead of configured servers
        #[arg(long)]
        local: bool,

        /// Session id to record memories under (one is generated otherwise)
        #[arg(long)]
        session: Option<String>,

        /// Override the per-session step budget
        #[arg(long)]
        max_steps: Option<usize>,

        /// Print the per-step trace as JSON after the answer
        #[arg(long)]
        trace: bool,
    },

    /// List available capabilities
    Capabilities {
        /// Use the built-in capabilities instead of configured servers
        #[arg(long)]
        local: bool,
    },

    /// Long-term memory management
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Show store statistics
    Stats,

    /// Search stored memories
    Search {
        query: String,

        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,

        /// Only items from this session
        #[arg(long)]
        session: Option<String>,

        /// Only items with this tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Delete every item of one session
    Purge { session: String },

    /// Delete everything
    Clear {
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Check the configuration for problems
    Validate,
    /// Write a default config file if none exists
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so answers on stdout stay pipeable
    let filter = if cli.verbose { "debug" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run {
            message,
            local,
            session,
            max_steps,
            trace,
        } => commands::run::run(message, local, session, max_steps, trace).await?,
        Commands::Capabilities { local } => commands::capabilities::run(local).await?,
        Commands::Memory { action } => match action {
            MemoryAction::Stats => commands::memory::stats().await?,
            MemoryAction::Search {
                query,
                top_k,
                session,
                tag,
            } => commands::memory::search(&query, top_k, session, tag).await?,
            MemoryAction::Purge { session } => commands::memory::purge(&session).await?,
            MemoryAction::Clear { confirm } => commands::memory::clear(confirm).await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Init => commands::config_cmd::init().await?,
        },
    }

    Ok(())
}
