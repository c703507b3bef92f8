//! dynhc - dynamic active health checking for upstream groups
//!
//! Usage:
//!     dynhc --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::thread;
use tracing::{error, info};

use dynhc::config::{Config, ConfigWatcher, load_config};
use dynhc::health::RefreshScheduler;
use dynhc::metrics::MetricsServer;
use dynhc::state::AppState;
use dynhc::util::init_logging;

/// Active health checker for load-balanced upstream groups.
#[derive(Parser, Debug)]
#[command(name = "dynhc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Upstreams: {}", config.upstreams.len());
        for upstream in &config.upstreams {
            let check = upstream.check_options(&config.healthcheck);
            println!(
                "    - [{}] {} ({} servers) check={}",
                upstream.module,
                upstream.name,
                upstream.servers.len(),
                check.check_type.map_or("none", |t| t.as_str())
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        upstreams = config.upstreams.len(),
        workers = config.global.workers,
        "dynhc starting"
    );

    for upstream in &config.upstreams {
        info!(
            module = %upstream.module,
            upstream = %upstream.name,
            servers = upstream.servers.len(),
            "configured upstream"
        );
    }

    run(cli.config, config)
}

/// Run the checker with the given configuration.
fn run(config_path: PathBuf, config: Config) -> Result<()> {
    let state = AppState::new(config).context("failed to build upstream registry")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let workers = spawn_workers(&state)?;
    let result = runtime.block_on(run_async(config_path, state.clone()));

    state.trigger_shutdown();
    for worker in workers {
        if worker.join().is_err() {
            error!("worker thread panicked");
        }
    }

    info!("dynhc shut down complete");
    result
}

/// Start one thread per worker, each with its own single-threaded runtime.
fn spawn_workers(state: &AppState) -> Result<Vec<thread::JoinHandle<()>>> {
    let global = state.config().global.clone();
    let mut handles = Vec::with_capacity(global.workers);

    for index in 0..global.workers {
        let scheduler = RefreshScheduler::new(
            index,
            global.workers,
            global.tick,
            state.registry().clone(),
            state.metrics().clone(),
            state.shutdown().clone(),
        );

        let handle = thread::Builder::new()
            .name(format!("dynhc-worker-{index}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(worker = index, error = %e, "failed to create worker runtime");
                        return;
                    }
                };
                runtime.block_on(scheduler.run());
            })
            .with_context(|| format!("failed to spawn worker {index}"))?;
        handles.push(handle);
    }

    Ok(handles)
}

async fn run_async(config_path: PathBuf, state: AppState) -> Result<()> {
    let mut handles = Vec::new();

    let metrics_config = state.config().global.metrics.clone();
    if metrics_config.enabled {
        let server = MetricsServer::new(
            metrics_config.address,
            metrics_config.path,
            state.metrics().clone(),
        );
        let shutdown_rx = state.shutdown().subscribe();
        handles.push(tokio::spawn(async move {
            server.run(shutdown_rx).await;
        }));
    }

    let reload_state = state.clone();
    let watcher = ConfigWatcher::new(
        config_path,
        Box::new(move |config| {
            // Failures are logged by reload(); the current registry stays.
            let _ = reload_state.reload(config);
        }),
    );
    let shutdown_rx = state.shutdown().subscribe();
    handles.push(tokio::spawn(async move {
        watcher.run(shutdown_rx).await;
    }));

    info!("dynhc is running");
    info!("press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal");
        }
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }

    // In-flight sessions abort; the main loop does not wait for them.
    state.trigger_shutdown();

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
