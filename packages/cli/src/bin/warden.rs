use clap::{Parser, Subcommand};
use colored::*;
use std::process;
use warden_config::{AdapterMode, ResourceTier};

mod cli;

use cli::context::Context;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden - per-tenant sandboxes for agent workspaces")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the idle reaper and stats monitor until interrupted
    Daemon,
    /// List persisted sandboxes
    List,
    /// Get or create a tenant's sandbox
    Ensure {
        tenant: String,
        /// Seconds to wait for creation (0 = return immediately)
        #[arg(long, default_value = "60")]
        wait_seconds: u64,
        /// Resource tier for a new sandbox
        #[arg(long)]
        tier: Option<ResourceTier>,
    },
    /// Run a command in the tenant's workspace
    Exec {
        tenant: String,
        /// Working directory relative to the workspace root
        #[arg(long)]
        cwd: Option<String>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Show live resource usage of a tenant's sandbox
    Stats { tenant: String },
    /// Start a stopped sandbox
    Start { tenant: String },
    /// Stop a running sandbox, keeping it for restart
    Stop { tenant: String },
    /// Remove a tenant's sandbox
    Destroy {
        tenant: String,
        /// Also delete the workspace volume
        #[arg(long)]
        purge_volume: bool,
    },
    /// Run one idle sweep
    Reap,
    /// Show or set a tenant's adapter mode
    Mode {
        tenant: String,
        mode: Option<AdapterMode>,
    },
    /// Print the tenant's file tree
    Ls {
        tenant: String,
        #[arg(default_value = "/")]
        path: String,
        #[arg(long, default_value = "2")]
        depth: usize,
    },
    /// List the tenant's conversation sessions
    Sessions {
        tenant: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();

    match handle_command(cli.command).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<i32> {
    let ctx = Context::load().await?;

    match command {
        Commands::Daemon => cli::sandbox::daemon(&ctx).await?,
        Commands::List => cli::sandbox::list(&ctx).await?,
        Commands::Ensure {
            tenant,
            wait_seconds,
            tier,
        } => cli::sandbox::ensure(&ctx, &tenant, wait_seconds, tier).await?,
        Commands::Exec {
            tenant,
            cwd,
            command,
        } => return cli::workspace::exec(&ctx, &tenant, cwd, &command).await,
        Commands::Stats { tenant } => cli::sandbox::stats(&ctx, &tenant).await?,
        Commands::Start { tenant } => cli::sandbox::start(&ctx, &tenant).await?,
        Commands::Stop { tenant } => cli::sandbox::stop(&ctx, &tenant).await?,
        Commands::Destroy {
            tenant,
            purge_volume,
        } => cli::sandbox::destroy(&ctx, &tenant, purge_volume).await?,
        Commands::Reap => cli::sandbox::reap(&ctx).await?,
        Commands::Mode { tenant, mode } => cli::workspace::mode(&ctx, &tenant, mode).await?,
        Commands::Ls {
            tenant,
            path,
            depth,
        } => cli::workspace::ls(&ctx, &tenant, &path, depth).await?,
        Commands::Sessions {
            tenant,
            project,
            offset,
            limit,
        } => {
            cli::workspace::sessions(&ctx, &tenant, project.as_deref(), offset, limit).await?
        }
    }
    Ok(0)
}
