//! Tollgate CLI: the operator entry point.
//!
//! Commands:
//! - `route`   Dry-run an admission decision
//! - `caps`    Show a caller's resolved capability record
//! - `tool`    Check a tool invocation
//! - `usage`   Show persisted ledger usage
//! - `serve`   Answer JSON-line admission requests on stdin
//! - `config`  Validate, show or initialize configuration

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "tollgate",
    about = "Tollgate: admission control for AI agents",
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

    /// Config file (defaults to ~/.tollgate/config.toml)
    #[arg(long, global = true, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Workspace permissions overlay
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
}

/// Who is asking.
#[derive(Args, Debug, Clone)]
pub struct CallerArgs {
    /// Caller id as reported by the channel
    #[arg(long)]
    caller: String,

    /// Channel the request arrived on
    #[arg(long, default_value = "cli")]
    channel: String,

    /// Treat the caller as authenticated by the channel
    #[arg(long)]
    trusted: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Dry-run a routing decision
    Route {
        #[command(flatten)]
        caller: CallerArgs,

        /// Task complexity in [0, 1]
        #[arg(long)]
        complexity: f64,

        /// Estimated prompt size
        #[arg(long, default_value_t = 1000)]
        input_tokens: u32,

        /// Requested output cap
        #[arg(long)]
        max_output: Option<u32>,

        /// Explicit model (needs override permission)
        #[arg(long)]
        model: Option<String>,

        /// Settle the reservation with this many output tokens and persist the ledger
        #[arg(long)]
        settle_output: Option<u32>,
    },

    /// Print the resolved capability record
    Caps {
        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Check whether a tool may be invoked
    Tool {
        #[command(flatten)]
        caller: CallerArgs,

        /// Tool name
        name: String,
    },

    /// Show ledger usage
    Usage {
        /// Limit output to one caller
        #[arg(long)]
        caller: Option<String>,

        /// Channel of `--caller`
        #[arg(long, default_value = "cli")]
        channel: String,
    },

    /// Answer JSON-line admission requests on stdin until EOF
    Serve {
        /// Channel whose callers the upstream process authenticates (repeatable)
        #[arg(long = "trust", value_name = "CHANNEL")]
        trusted_channels: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Check the configuration for errors
    Validate,
    /// Print the effective configuration
    Show,
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let filter = if cli.verbose { "debug" } else { "info" };
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

    let paths = commands::Paths {
        config: cli.config,
        workspace: cli.workspace,
    };

    match cli.command {
        Commands::Route {
            caller,
            complexity,
            input_tokens,
            max_output,
            model,
            settle_output,
        } => {
            let request = commands::route::RouteArgs {
                complexity,
                input_tokens,
                max_output,
                model,
                settle_output,
            };
            commands::route::run(&paths, caller.into(), request).await?
        }
        Commands::Caps { caller } => commands::caps::run(&paths, caller.into()).await?,
        Commands::Tool { caller, name } => commands::tool::run(&paths, caller.into(), &name).await?,
        Commands::Usage { caller, channel } => commands::usage::run(&paths, caller, &channel).await?,
        Commands::Serve { trusted_channels } => commands::serve::run(&paths, trusted_channels).await?,
        Commands::Config { action } => match action {
            ConfigAction::Validate => commands::config_cmd::validate(&paths).await?,
            ConfigAction::Show => commands::config_cmd::show(&paths).await?,
            ConfigAction::Init { force } => commands::config_cmd::init(&paths, force).await?,
        },
    }

    Ok(())
}

impl From<CallerArgs> for tollgate_core::Identity {
    fn from(args: CallerArgs) -> Self {
        if args.trusted {
            Self::trusted(args.caller, args.channel)
        } else {
            Self::untrusted(args.caller, args.channel)
        }
    }
}
