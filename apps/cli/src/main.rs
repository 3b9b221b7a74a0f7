//! dlbridge CLI - replay scripted engine downloads and inspect their history
//!
//! Downloads run through the same coordinator an embedding application
//! uses, driven by the scripted engine.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// dlbridge - one download lifecycle over two engine download APIs
#[derive(Parser)]
#[command(name = "dlbridge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for dlbridge
    #[arg(long, env = "DLBRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

/// Download APIs the scripted engine pretends to expose
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum EngineApis {
    All,
    Legacy,
    Modern,
    None,
}

impl EngineApis {
    fn capabilities(self) -> dlbridge_core::EngineCapabilities {
        use dlbridge_core::EngineCapabilities;
        match self {
            EngineApis::All => EngineCapabilities::all(),
            EngineApis::Legacy => EngineCapabilities::legacy_only(),
            EngineApis::Modern => EngineCapabilities::modern_only(),
            EngineApis::None => EngineCapabilities::none(),
        }
    }
}

/// How a replayed download is driven
#[derive(clap::Args, Clone, Debug)]
struct ReplayOptions {
    /// Directory to save into (defaults to the configured download directory)
    #[arg(short, long)]
    dest: Option<PathBuf>,

    /// Cancel the download after this many milliseconds
    #[arg(long)]
    cancel_after: Option<u64>,

    /// Answer every redirect decision with cancel
    #[arg(long)]
    decline_redirects: bool,

    /// User for authentication challenges
    #[arg(long, requires = "password")]
    user: Option<String>,

    /// Password for authentication challenges
    #[arg(long, requires = "user")]
    password: Option<String>,

    /// Download APIs the engine exposes
    #[arg(long, default_value = "all")]
    engine: EngineApis,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a recorded download script
    Replay {
        /// Path to the script JSON
        script: PathBuf,

        /// URL to request instead of the script's own
        #[arg(long)]
        url: Option<String>,

        #[command(flatten)]
        options: ReplayOptions,
    },

    /// Retry a stored download, replaying a script for the engine's side
    Retry {
        /// Download ID
        id: String,

        /// Path to the script JSON
        script: PathBuf,

        #[command(flatten)]
        options: ReplayOptions,
    },

    /// List stored downloads
    History {
        /// Filter by state
        #[arg(short, long)]
        state: Option<String>,

        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show a stored download
    Show {
        /// Download ID
        id: String,
    },

    /// Remove a stored download
    Forget {
        /// Download ID
        id: String,
    },

    /// Show/update settings
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "warn" })
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        use clap::CommandFactory;
        clap_complete::generate(shell, &mut Cli::command(), "dlbridge", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = cli.data_dir.unwrap_or_else(dlbridge_core::default_data_dir);

    let engine_apis = match &cli.command {
        Commands::Replay { options, .. } | Commands::Retry { options, .. } => options.engine,
        _ => EngineApis::All,
    };
    let engine = Arc::new(dlbridge_core::scripted::ScriptedEngine::new(
        engine_apis.capabilities(),
    ));
    let core = dlbridge_core::DlbridgeCore::new(data_dir, engine.clone()).await?;

    match cli.command {
        Commands::Replay {
            script,
            url,
            options,
        } => commands::replay(&core, &engine, &script, url, &options, cli.output).await?,

        Commands::Retry {
            id,
            script,
            options,
        } => commands::retry(&core, &engine, &id, &script, &options, cli.output).await?,

        Commands::History { state, all } => {
            commands::history(&core, state, all, cli.output).await?
        }

        Commands::Show { id } => commands::show(&core, &id, cli.output).await?,

        Commands::Forget { id } => commands::forget(&core, &id, cli.output).await?,

        Commands::Config { action } => commands::config_action(&core, action, cli.output).await?,

        Commands::Completions { .. } => {}
    }

    Ok(())
}
