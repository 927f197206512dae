use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use bizimatch::config::BizimatchConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "bizimatch")]
#[command(version, about = "AI-powered development pipeline: prompt in, reviewed code out")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to bizimatch.toml (defaults to .bizimatch/bizimatch.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the run database location
    #[arg(long, global = true, env = "BIZIMATCH_DB_PATH")]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP + WebSocket API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (permissive CORS for a local front end)
        #[arg(long)]
        dev: bool,
    },
    /// Run a prompt through the pipeline in this process
    Run {
        prompt: String,

        /// Approve the review gate automatically
        #[arg(long)]
        auto_approve: bool,
    },
    /// Approve or reject a run waiting at the review gate, then follow it
    Approve {
        run_id: String,

        #[arg(long)]
        reject: bool,

        #[arg(short, long)]
        comment: Option<String>,
    },
    /// Cancel a run
    Cancel { run_id: String },
    /// Show one run, or list all runs
    Status { run_id: Option<String> },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    Show,
    Validate,
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    cmd::init_tracing(cli.verbose, cli.log_json);

    let config = BizimatchConfig::with_cli_args(cli.config.clone(), cli.verbose, cli.db_path.clone())?;

    match &cli.command {
        Commands::Serve { port, host, dev } => {
            cmd::cmd_serve(config, *port, host.clone(), *dev).await?;
        }
        Commands::Run {
            prompt,
            auto_approve,
        } => cmd::cmd_run(&config, prompt, *auto_approve).await?,
        Commands::Approve {
            run_id,
            reject,
            comment,
        } => cmd::cmd_approve(&config, run_id, *reject, comment.as_deref()).await?,
        Commands::Cancel { run_id } => cmd::cmd_cancel(&config, run_id).await?,
        Commands::Status { run_id } => cmd::cmd_status(&config, run_id.as_deref()).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
