//! `EioServer`: the engine mounted on an axum HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use eio_settings::{EioSettings, ServerSettings};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::errors::{Result, ServerError};
use crate::http;
use crate::registry::SessionRegistry;
use crate::session::Connection;
use crate::shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, ShutdownCoordinator};

/// The engine server.
pub struct EioServer {
    settings: ServerSettings,
    registry: SessionRegistry,
    connections: Mutex<mpsc::UnboundedReceiver<Connection>>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl EioServer {
    /// Create a server from loaded settings.
    pub fn new(settings: &EioSettings) -> Self {
        let (registry, connections) = SessionRegistry::new(settings.engine.clone());
        Self {
            settings: settings.server.clone(),
            registry,
            connections: Mutex::new(connections),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// Router with the engine mounted at the configured path.
    pub fn router(&self) -> Router {
        http::router(self.registry.clone(), &self.settings.path)
    }

    /// Bind the configured address and serve in the background.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener.local_addr().map_err(ServerError::LocalAddr)?;

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server stopped with error");
            }
        });

        info!(addr = %local, path = %self.settings.path, "engine listening");
        Ok((local, handle))
    }

    /// Next handshaken session. `None` once the registry is gone.
    pub async fn accept(&self) -> Option<Connection> {
        self.connections.lock().await.recv().await
    }

    /// Close every session, stop accepting, and wait for `server` to wind
    /// down.
    pub async fn shutdown(&self, server: JoinHandle<()>) {
        info!(sessions = self.registry.len(), "shutting down");
        self.registry.close_all();
        self.shutdown.track(server);
        let _ = self.shutdown.graceful_shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
    }

    /// The session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Listener settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}
