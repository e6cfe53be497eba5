//! convoyd — the convoy daemon.
//!
//! # Usage
//!
//! ```text
//! convoyd scaffold --service web --repository registry.local/web --port 8080 > convoy.toml
//! convoyd validate --config convoy.toml
//! convoyd standalone --config convoy.toml --port 8443 --data-dir /var/lib/convoy
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use convoy_core::ConvoyConfig;
use convoy_platform::memory::{InMemoryPlatform, InMemoryRegistry, InMemoryScanner, StaticBuilder};
use convoy_state::StateStore;
use convoyd::{Collaborators, System};

#[derive(Parser)]
#[command(name = "convoyd", about = "Convoy deployment daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every subsystem in one process against in-memory platform
    /// collaborators.
    Standalone {
        /// Path to convoy.toml.
        #[arg(long, default_value = "convoy.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/convoy")]
        data_dir: PathBuf,
    },

    /// Check a config file and print the derived bounds.
    Validate {
        #[arg(long, default_value = "convoy.toml")]
        config: PathBuf,
    },

    /// Print a starter config file.
    Scaffold {
        #[arg(long)]
        service: String,

        #[arg(long)]
        repository: String,

        #[arg(long, default_value = "8080")]
        port: u16,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            "info,convoyd=debug,convoy_rollout=debug,convoy_autoscale=debug,convoy_pipeline=debug",
        )
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Standalone {
            config,
            port,
            data_dir,
        } => run_standalone(config, port, data_dir).await,
        Command::Validate { config } => validate(config),
        Command::Scaffold {
            service,
            repository,
            port,
        } => {
            let config = ConvoyConfig::scaffold(&service, &repository, port);
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let config = ConvoyConfig::from_file(&path)?;
    let r = &config.rollout;
    let desired = config.service.desired_count;
    println!("{}: ok", path.display());
    println!(
        "  service {} ({}), port {}, desired {}",
        config.service.id, config.service.repository, config.service.port, desired
    );
    println!(
        "  rollout: min healthy {} task(s), max total {} task(s)",
        (desired * r.min_healthy_percent).div_ceil(100),
        desired * r.max_surge_percent / 100
    );
    println!(
        "  scaling: {} target {} in [{}, {}], cooldown {}s",
        config.scaling.metric,
        config.scaling.target_value,
        config.scaling.min_capacity,
        config.scaling.max_capacity,
        config.scaling.cooldown_seconds
    );
    println!(
        "  gate: block at {} and above, {} ignored CVE(s)",
        config.gate.severity_threshold,
        config.gate.ignore.len()
    );
    Ok(())
}

async fn run_standalone(config_path: PathBuf, port: u16, data_dir: PathBuf) -> anyhow::Result<()> {
    info!("convoy daemon starting in standalone mode");

    let config = ConvoyConfig::from_file(&config_path)?;
    info!(path = ?config_path, service = %config.service.id, "config loaded");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("convoy.redb");
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let collaborators = Collaborators::in_memory(
        Arc::new(StaticBuilder::new()),
        Arc::new(InMemoryRegistry::new()),
        Arc::new(InMemoryScanner::new()),
        Arc::new(InMemoryPlatform::new()),
    );
    let system = System::start(&config, state, collaborators).await?;

    // ── Start API server ───────────────────────────────────────

    let router = system.router();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
        })
        .await?;

    system.shutdown().await;
    info!("convoy daemon stopped");
    Ok(())
}
