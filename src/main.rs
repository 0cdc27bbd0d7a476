//! Daemon entry point: logging, configuration, socket and control-loop
//! wiring, signal handling.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sensord::config::Settings;
use sensord::daemon::{self, ControlEvent};
use sensord::loader::PluginRegistry;
use sensord::manager::SensorManager;
use sensord::pipe;
use sensord::socket::UnixSocketHandler;
use sensord::transport::LocalTransport;

#[derive(Parser)]
#[command(name = "sensord", about = "Sensor multiplexing daemon", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the sample socket path.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Extra plugins to load on top of the configuration.
    #[arg(long = "plugin")]
    plugins: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    if let Some(socket_path) = cli.socket {
        settings.socket_path = socket_path;
    }

    let (sink, samples) = pipe::channel(settings.pipe_capacity);
    let (socket, lost_sessions) = UnixSocketHandler::listen(&settings.socket_path)?;

    let mut manager = SensorManager::new(
        socket,
        Box::new(LocalTransport::new()),
        sink,
        PluginRegistry::with_builtin_plugins(),
    );
    manager
        .register_service()
        .context("registering manager on the naming transport")?;

    for name in settings.plugins.iter().chain(cli.plugins.iter()) {
        if let Err(err) = manager.load_plugin(name) {
            warn!(plugin = %name, %err, "plugin load failed, continuing");
        }
    }
    for adaptor in &settings.adaptors {
        manager.register_adaptor_slot(&adaptor.id, &adaptor.type_tag, adaptor.properties.clone());
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // SIGUSR1 dumps the registry to the log.
    let mut usr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let status_tx = events_tx.clone();
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            if status_tx.send(ControlEvent::PrintStatus).is_err() {
                break;
            }
        }
    });

    let control = tokio::spawn(daemon::run(
        manager,
        samples,
        lost_sessions,
        events_rx,
        shutdown_rx,
    ));

    info!("sensord running");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");

    let _ = shutdown_tx.send(());
    drop(events_tx);
    let manager = control.await.context("joining control loop")?;
    drop(manager);
    Ok(())
}
