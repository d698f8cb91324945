//! CLI entry point for EVOX.
//!
//! This binary provides the `evox` command with subcommands for running the
//! runtime, reporting backend and admission status, and validating
//! configuration.

mod cli;
mod config;
mod runtime;

use anyhow::{Context, Result};
use clap::Parser;
use evox_store::Sealer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::{EvoxConfig, LogFormat};
use crate::runtime::Runtime;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = EvoxConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Status { json } => cmd_status(config, json).await,
        Commands::CheckConfig => cmd_check_config(&config),
        Commands::GenKey => cmd_gen_key(),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(config: EvoxConfig) -> Result<()> {
    init_tracing(&config.log_level, config.log_format);
    info!(version = env!("CARGO_PKG_VERSION"), "starting evox");

    let runtime = Runtime::build(&config).await?;
    runtime.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("interrupt received, shutting down");

    runtime.shutdown().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(config: EvoxConfig, json: bool) -> Result<()> {
    init_tracing("warn", config.log_format);

    let runtime = Runtime::build(&config).await?;
    runtime.gateway.manager().check_all().await;
    let report = runtime.report();
    runtime.gateway.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("  EVOX Status");
    println!("  ===========");
    println!();
    println!(
        "  System:           {} (load {:.0}%)",
        report.system_status,
        report.load_factor * 100.0
    );
    for bucket in &report.admission.buckets {
        println!(
            "  Queue {:<8}    {} queued, {}/{} in flight, limit {}",
            bucket.priority.to_string(),
            bucket.queued,
            bucket.in_flight,
            bucket.ceiling,
            bucket.queue_limit
        );
    }
    println!();
    println!("  Backends:");
    for backend in &report.backends {
        let health = if backend.healthy { "OK" } else { "UNHEALTHY" };
        let circuit = format!("circuit {}", backend.circuit);
        match &backend.last_error {
            Some(error) => println!(
                "    {:<16} {:<10} {health:<10} {circuit} ({error})",
                backend.name,
                backend.kind.to_string()
            ),
            None => println!(
                "    {:<16} {:<10} {health:<10} {circuit}",
                backend.name,
                backend.kind.to_string()
            ),
        }
    }
    if !report.custom_intents.is_empty() {
        println!();
        println!("  Custom intents:   {}", report.custom_intents.join(", "));
    }
    println!("  Routes:           {}", report.routes);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: check-config
// ---------------------------------------------------------------------------

fn cmd_check_config(config: &EvoxConfig) -> Result<()> {
    config.validate()?;
    let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
    println!("# configuration is valid; effective settings:");
    println!("{rendered}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: gen-key
// ---------------------------------------------------------------------------

fn cmd_gen_key() -> Result<()> {
    let key = Sealer::generate_key().context("failed to generate key")?;
    println!("{key}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber.  `RUST_LOG` overrides `default_level`.
fn init_tracing(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().with_current_span(false).init(),
        LogFormat::Compact => builder.with_target(true).compact().init(),
    }
}
