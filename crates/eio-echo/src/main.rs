//! # eio-echo
//!
//! Demo server on the eio engine: every message a client sends is sent
//! straight back to it.

#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use eio_server::{Connection, EioServer, SocketEvent};
use eio_settings::EioSettings;
use tracing::{debug, info};

/// Echo server over the eio engine.
#[derive(Parser, Debug)]
#[command(name = "eio-echo", about = "Echo server over the eio engine")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter used when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, settings: &mut EioSettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

/// Echo every message on `connection` until it closes.
async fn echo(connection: Connection) {
    let Connection { socket, mut events } = connection;
    info!(sid = %socket.id(), transport = %socket.transport(), "client connected");

    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Message(data) => socket.send(data),
            SocketEvent::Upgrade(kind) => debug!(sid = %socket.id(), transport = %kind, "client upgraded"),
            SocketEvent::Close {
                reason,
                description,
            } => {
                info!(sid = %socket.id(), reason = %reason, ?description, "client disconnected");
                break;
            }
            SocketEvent::Heartbeat | SocketEvent::Drain => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = eio_settings::settings_path();
    let mut settings = eio_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    cli.apply(&mut settings);

    eio_core::logging::init_subscriber(&settings.logging.level);

    let server = Arc::new(EioServer::new(&settings));
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    info!("eio-echo listening on http://{addr}{}", settings.server.path);

    let acceptor = {
        let server = server.clone();
        tokio::spawn(async move {
            while let Some(connection) = server.accept().await {
                let _ = tokio::spawn(echo(connection));
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down...");
    server.shutdown(handle).await;
    acceptor.abort();

    info!("Shutdown complete");
    Ok(())
}
