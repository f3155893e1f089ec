//! Server runtime: listener, background health checks and graceful shutdown.

use axum::middleware::from_fn_with_state;
use gateway_config::GatewayConfig;
use gateway_routing::{HealthProber, HealthProberConfig};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::routes::create_router;
use crate::shutdown::{shutdown_signal, track_in_flight, ShutdownCoordinator};
use crate::state::AppState;

/// Server startup and runtime failures
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The health prober could not be created
    #[error("Failed to start health checks: {0}")]
    HealthProber(#[from] reqwest::Error),

    /// The accept loop failed
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Time allowed for in-flight requests after shutdown starts
    pub shutdown_timeout: Duration,
    /// Health prober settings; `None` disables probing
    pub health_check: Option<HealthProberConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for ServerConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            shutdown_timeout: config.server.shutdown_timeout,
            health_check: config
                .health_check
                .enabled
                .then(|| config.health_check.prober_config()),
        }
    }
}

impl ServerConfig {
    /// `host:port`
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The gateway HTTP server
pub struct Server {
    config: ServerConfig,
    state: AppState,
    coordinator: Arc<ShutdownCoordinator>,
}

impl Server {
    /// Create a server
    #[must_use]
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown_timeout));
        Self {
            config,
            state,
            coordinator,
        }
    }

    /// Handle for triggering shutdown from outside the server
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Bind and serve until a shutdown signal arrives
    ///
    /// # Errors
    /// Returns an error if binding fails, the prober cannot start or the
    /// accept loop fails
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    /// Returns an error if the prober cannot start or the accept loop fails
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let coordinator = self.coordinator;

        let prober = match &self.config.health_check {
            Some(probe_config) => Some(
                HealthProber::new(Arc::clone(&self.state.balancer), probe_config.clone())?
                    .spawn(coordinator.subscribe()),
            ),
            None => None,
        };

        let app = create_router(self.state)
            .layer(from_fn_with_state(Arc::clone(&coordinator), track_in_flight))
            .into_make_service_with_connect_info::<SocketAddr>();

        let local_addr = listener.local_addr().map_err(ServerError::Serve)?;
        info!(address = %local_addr, "Gateway listening");

        let signal_coordinator = Arc::clone(&coordinator);
        let graceful = async move {
            tokio::select! {
                name = shutdown_signal() => signal_coordinator.trigger(name),
                () = signal_coordinator.triggered() => {}
            }
        };

        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(graceful)
            .into_future();
        let grace = self.config.shutdown_timeout;
        let deadline = async {
            coordinator.triggered().await;
            coordinator.drain().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = serve => result.map_err(ServerError::Serve)?,
            () = deadline => warn!("Connections still open after grace period; closing"),
        }

        if let Some(handle) = prober {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Health prober did not stop in time");
            }
        }

        info!("Gateway stopped");
        Ok(())
    }
}
