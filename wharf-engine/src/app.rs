use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::database::Database;
use crate::orchestrator::{Orchestrator, Platform};
use crate::server::AppServer;

/// The application object for when the engine is running as a server.
pub struct App {
    /// The orchestration facade, shared with embedding surfaces.
    _orchestrator: Arc<Orchestrator>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HTTP server.
    server: JoinHandle<()>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        let db = Database::new(config.clone()).await.context("error opening engine database")?;
        let platform = Arc::new(Platform::new(config.clone(), db).context("error wiring platform context")?);
        let orchestrator = Arc::new(Orchestrator::new(platform));

        let server = AppServer::new(config, shutdown_tx.clone()).spawn()?;

        Ok(Self {
            _orchestrator: orchestrator,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("wharf engine is shutting down");
        if let Err(err) = self.server.await {
            tracing::error!(error = ?err, "error joining HTTP server task");
        }

        tracing::debug!("wharf engine shutdown complete");
        Ok(())
    }
}
