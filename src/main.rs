//! Lazarus - self-healing engine
//!
//! Samples health probes, detects problems and runs recovery strategies
//! configured in `lazarus.toml`.

use lazarus::bridge::Bridge;
use lazarus::cli::{Cli, Commands};
use lazarus::error::Result;
use lazarus::flare::Flare;
use lazarus::manifest::{self, EngineConfig};
use lazarus::sickbay::{CommandProbe, HealthSampler};

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(())
        }
        Commands::Check => {
            let config = manifest::load(&cli.config)?;
            print_summary(&config);
            println!("Configuration OK: {}", cli.config.display());
            Ok(())
        }
        Commands::Probe { json } => {
            init_tracing(cli.verbose);
            let config = manifest::load(&cli.config)?;
            runtime()?.block_on(probe_once(config, json))
        }
        Commands::Supervise { status_interval } => {
            init_tracing(cli.verbose);
            let config = manifest::load(&cli.config)?;
            runtime()?.block_on(supervise(config, status_interval))
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

fn print_summary(config: &EngineConfig) {
    println!("Engine:");
    println!("  healing:          {}", on_off(config.engine.healing_enabled));
    println!("  auto-recovery:    {}", on_off(config.engine.auto_recovery));
    println!("  circuit breakers: {}", on_off(config.engine.circuit_breaker_enabled));
    println!("  sample interval:  {}s", config.sampler.interval);
    println!();

    println!("Probes ({}):", config.probes.len());
    for probe in &config.probes {
        println!(
            "  {:<24} {:<20} {:<11} timeout {}s",
            probe.name,
            probe.resource,
            probe.signal.to_string(),
            probe.timeout
        );
    }

    if !config.restart.is_empty() {
        println!("Restart handlers:");
        for action in &config.restart {
            println!("  {:<24} {}", action.target, action.command);
        }
    }
    if !config.fallback.is_empty() {
        println!("Fallback handlers:");
        for action in &config.fallback {
            println!("  {:<24} {}", action.target, action.command);
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

async fn probe_once(config: EngineConfig, json: bool) -> Result<()> {
    if config.probes.is_empty() {
        println!("No probes defined in configuration.");
        return Ok(());
    }

    let sampler = config
        .probes
        .iter()
        .cloned()
        .fold(HealthSampler::new(config.sampler.clone()), |sampler, def| {
            sampler.with_probe(Arc::new(CommandProbe::new(def)))
        });
    let snapshot = sampler.sample().await;

    if json {
        let out = serde_json::to_string_pretty(&snapshot)?;
        println!("{}", out);
        return Ok(());
    }

    println!("{:<24} {:<8} VALUE", "PROBE", "STATUS");
    for (name, ok) in &snapshot.checks {
        let value = snapshot.metrics.get(name).copied().unwrap_or_default();
        println!("{:<24} {:<8} {}", name, if *ok { "ok" } else { "FAILED" }, value);
    }
    println!();
    println!("Overall: {}", snapshot.overall());
    Ok(())
}

async fn supervise(config: EngineConfig, status_interval: u64) -> Result<()> {
    let (flare, alert_task) = Flare::spawn(&config.alerts, Flare::sinks_from(&config.alerts));
    let bridge = Arc::new(Bridge::from_config(config, flare));

    let runner = Arc::clone(&bridge);
    let loop_task = tokio::spawn(async move { runner.run().await });

    let status_task = (status_interval > 0).then(|| {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(status_interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let status = bridge.status();
                println!(
                    "health={} breakers={} active={} escalations={} alerts_dropped={}",
                    status.health,
                    status.breakers.len(),
                    status.active.len(),
                    status.escalations.len(),
                    status.alerts_dropped
                );
            }
        })
    });

    println!(
        "Lazarus supervising {} probe(s). Press Ctrl+C to stop.",
        bridge.probe_count()
    );

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    let cancelled = bridge.shutdown();
    if !cancelled.is_empty() {
        println!("Cancelled {} active recovery attempt(s)", cancelled.len());
    }
    if let Some(task) = status_task {
        task.abort();
    }
    let _ = loop_task.await;

    drop(bridge);
    // Let queued alerts drain
    let _ = tokio::time::timeout(Duration::from_secs(2), alert_task).await;
    Ok(())
}
