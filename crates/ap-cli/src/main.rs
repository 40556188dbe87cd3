//! `ap` -- turn a natural-language intent into a plan and run it.

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::run::RunOverrides;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// autoplan CLI -- decompose an intent into todos and execute them.
#[derive(Parser)]
#[command(name = "ap", version, about)]
struct Cli {
    /// Config file (default: ~/.autoplan/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace root the plan runs against.
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute an intent from scratch.
    Run {
        /// What you want done, in plain language.
        intent: String,
        #[command(flatten)]
        overrides: RunOverrides,
        /// Print the final result as JSON on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Recover a run that stopped mid-flight (crash or kill) from its snapshot.
    Resume {
        /// The intent the stopped run was started with.
        intent: String,
        #[command(flatten)]
        overrides: RunOverrides,
        #[arg(long)]
        json: bool,
    },

    /// Show the saved state of the current run.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Delete the saved state of the current run.
    Discard,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    commands::init_logging(&config, cli.json_logs);

    match cli.command {
        Commands::Run {
            intent,
            overrides,
            json,
        } => {
            let opts = commands::run::RunOptions {
                intent,
                overrides,
                json,
                resume: false,
            };
            commands::run::run(config, &cli.workspace, opts).await
        }
        Commands::Resume {
            intent,
            overrides,
            json,
        } => {
            let opts = commands::run::RunOptions {
                intent,
                overrides,
                json,
                resume: true,
            };
            commands::run::run(config, &cli.workspace, opts).await
        }
        Commands::Status { json } => {
            commands::status::run(&config, &cli.workspace, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Discard => {
            commands::discard::run(&config, &cli.workspace)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
