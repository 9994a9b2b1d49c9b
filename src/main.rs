//! airoute - capability-aware AI provider router
//!
//! Serves the routing API, validates configuration and lists providers.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airoute::config::{Config, KeySource};

#[derive(Parser)]
#[command(name = "airoute")]
#[command(about = "Capability-aware AI provider routing with fallback and cost accounting")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the routing server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Show configured providers, their task kinds and costs
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn load(path: &PathBuf) -> anyhow::Result<(Config, Vec<(String, KeySource)>)> {
    Config::from_file_with_env(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise the config's logging level when it can be read
    let default_level = match &cli.command {
        Commands::Serve { config, .. } => Config::from_file_with_env(config)
            .map(|(c, _)| c.logging.level)
            .unwrap_or_else(|_| "info".to_string()),
        _ => "info".to_string(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("airoute={},tower_http=info", default_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve { config, listen } => {
            tracing::info!(config = %config.display(), "Loading configuration");
            let (mut cfg, key_sources) = load(&config)?;

            for (provider, source) in &key_sources {
                tracing::info!(provider = %provider, key_source = %source, "Provider API key");
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            airoute::api::run_server(cfg, Some(config)).await
        }

        Commands::Check { config } => {
            let (cfg, key_sources) = load(&config)?;
            println!("Configuration OK: {}", config.display());
            println!("  listen: {}", cfg.server.listen);
            println!(
                "  health: threshold {}, cooldown {}s (max {}s), probe every {}s",
                cfg.health.failure_threshold,
                cfg.health.cooldown_secs,
                cfg.health.max_cooldown_secs,
                cfg.health.probe_interval_secs
            );
            println!(
                "  routing: default deadline {}ms, race {:?} (width {})",
                cfg.routing.default_deadline_ms, cfg.routing.race, cfg.routing.race_width
            );
            for (provider, source) in &key_sources {
                println!("  {}: api key {}", provider, source);
            }
            Ok(())
        }

        Commands::Providers { config } => {
            let (cfg, _) = load(&config)?;
            if cfg.providers.is_empty() {
                println!("No providers configured");
                return Ok(());
            }
            for p in &cfg.providers {
                let tasks: Vec<&str> = p.tasks.iter().map(|k| k.as_str()).collect();
                println!(
                    "{}{} ({}) priority {}",
                    p.id,
                    if p.local { " [local]" } else { "" },
                    p.url,
                    p.priority
                );
                println!("  tasks: {}", tasks.join(", "));
                for (kind, cost) in &p.cost {
                    println!("  cost/{}: {}", kind, cost);
                }
                if let Some(limit) = p.rate_limit_per_minute {
                    println!("  rate limit: {}/min", limit);
                }
            }
            Ok(())
        }
    }
}
