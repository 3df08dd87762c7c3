use std::io;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use taskd::{lifecycle::Lifecycle, service, Cli, Components, Settings};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::resolve(&cli)?;

    init_tracing(&cli, &settings);
    info!("{}", taskd_build_info::banner("taskd", SERVICE_VERSION));

    if settings.uses_default_secret() {
        warn!("Using the default dispatch secret; set TASKD_DISPATCH_SECRET in production");
    }

    let components = Components::production(&settings);
    let running = service::start(settings, components).await?;
    spawn_signal_handlers(running.lifecycle().clone());

    running.run_until_shutdown().await
}

fn init_tracing(cli: &Cli, settings: &Settings) {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if let Some(level) = settings.log_level.as_deref() {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn spawn_signal_handlers(lifecycle: Arc<Lifecycle>) {
    let ctrl_c = lifecycle.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down");
            ctrl_c.begin_shutdown();
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down");
                lifecycle.begin_shutdown();
            }
        });
    }
}
