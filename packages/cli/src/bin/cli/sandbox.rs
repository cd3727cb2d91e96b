// ABOUTME: CLI commands for tenant sandbox lifecycle: list, ensure, stats, start, stop, destroy, reap
// ABOUTME: Also runs the background daemon hosting the idle reaper and stats monitor

use super::context::Context;
use anyhow::Result;
use chrono::Utc;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use std::time::Duration;
use tracing::info;
use warden_config::ResourceTier;
use warden_sandbox::{
    CreateOptions, IdleReaper, SandboxError, SandboxStatus, StatsMonitor, WaitPolicy,
};

fn status_label(status: SandboxStatus) -> ColoredString {
    match status {
        SandboxStatus::Running => status.as_str().green(),
        SandboxStatus::Creating => status.as_str().yellow(),
        SandboxStatus::Stopped => status.as_str().blue(),
        SandboxStatus::Destroyed => status.as_str().dimmed(),
    }
}

/// Run the reaper and stats monitor until Ctrl-C
pub async fn daemon(ctx: &Context) -> Result<()> {
    let reaper = IdleReaper::new(ctx.manager.clone(), &ctx.config.reaper);
    let monitor = StatsMonitor::new(ctx.manager.clone(), ctx.config.stats_interval);

    reaper.start().await;
    monitor.start().await;
    println!(
        "{} Warden daemon running (stop idle after {}m, destroy after {}m). Press Ctrl-C to exit.",
        "🛡".cyan(),
        ctx.config.reaper.idle_stop_after.as_secs() / 60,
        ctx.config.reaper.idle_destroy_after.as_secs() / 60
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    reaper.stop().await;
    monitor.stop().await;
    println!("{}", "Warden daemon stopped".yellow());
    Ok(())
}

pub async fn list(ctx: &Context) -> Result<()> {
    let sandboxes = ctx.manager.list().await?;
    if sandboxes.is_empty() {
        println!("{}", "No sandboxes found".yellow());
        println!("{}", "Use 'warden ensure <tenant>' to create one".dimmed());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Tenant", "Name", "Status", "Tier", "Created", "Last activity"]);

    for sandbox in &sandboxes {
        table.add_row(vec![
            sandbox.tenant_id.clone(),
            sandbox.name.clone(),
            status_label(sandbox.status).to_string(),
            sandbox.tier.to_string(),
            sandbox.created_at.format("%Y-%m-%d %H:%M").to_string(),
            sandbox.last_activity_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }

    println!("{}", table);
    println!("{} sandbox(es)", sandboxes.len());
    Ok(())
}

pub async fn ensure(
    ctx: &Context,
    tenant: &str,
    wait_seconds: u64,
    tier: Option<ResourceTier>,
) -> Result<()> {
    let options = CreateOptions {
        tier,
        ..Default::default()
    };
    let policy = if wait_seconds == 0 {
        WaitPolicy::no_wait()
    } else {
        WaitPolicy::wait(Duration::from_secs(wait_seconds))
    };

    match ctx.manager.get_or_create(tenant, options, policy).await {
        Ok(descriptor) => {
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
            Ok(())
        }
        Err(e @ SandboxError::NotReady { .. }) => {
            println!("{} {}", "⏳".yellow(), e);
            println!("{}", "Creation continues in the background; run again to check".dimmed());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn stats(ctx: &Context, tenant: &str) -> Result<()> {
    let stats = ctx.manager.stats(tenant).await?;
    let memory_percent = if stats.memory_limit_mb > 0 {
        stats.memory_usage_mb as f64 / stats.memory_limit_mb as f64 * 100.0
    } else {
        0.0
    };
    println!("{} {}", "📊 Resource usage for".blue().bold(), tenant.bold());
    println!("CPU:      {:.1}%", stats.cpu_usage_percent);
    println!(
        "Memory:   {} MB / {} MB ({:.1}%)",
        stats.memory_usage_mb, stats.memory_limit_mb, memory_percent
    );
    println!(
        "Network:  {} B received, {} B sent",
        stats.network_rx_bytes, stats.network_tx_bytes
    );
    Ok(())
}

pub async fn start(ctx: &Context, tenant: &str) -> Result<()> {
    let descriptor = ctx.manager.start(tenant).await?;
    println!(
        "{} Sandbox {} is {}",
        "✅".green(),
        descriptor.name,
        status_label(descriptor.status)
    );
    Ok(())
}

pub async fn stop(ctx: &Context, tenant: &str) -> Result<()> {
    ctx.manager.stop(tenant).await?;
    println!("{} Stopped sandbox for {}", "✅".green(), tenant);
    Ok(())
}

pub async fn destroy(ctx: &Context, tenant: &str, purge_volume: bool) -> Result<()> {
    ctx.manager.destroy(tenant, !purge_volume).await?;
    if purge_volume {
        println!("{} Destroyed sandbox and workspace volume for {}", "✅".green(), tenant);
    } else {
        println!("{} Destroyed sandbox for {} (volume kept)", "✅".green(), tenant);
    }
    Ok(())
}

/// One sweep with the configured idle thresholds
pub async fn reap(ctx: &Context) -> Result<()> {
    let reaper = IdleReaper::new(ctx.manager.clone(), &ctx.config.reaper);
    let report = reaper.sweep(Utc::now()).await?;
    if report.is_empty() {
        println!("{}", "Nothing idle to reap".green());
        return Ok(());
    }

    for (label, tenants) in [
        ("Stopped".blue(), &report.stopped),
        ("Destroyed".red(), &report.destroyed),
        ("Skipped".yellow(), &report.skipped),
        ("Failed".red().bold(), &report.failed),
    ] {
        if !tenants.is_empty() {
            println!("{}: {}", label, tenants.join(", "));
        }
    }
    Ok(())
}
