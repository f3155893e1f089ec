//! Graceful shutdown.
//!
//! The coordinator tracks in-flight requests and fans the shutdown trigger out
//! to background tasks (the health prober) through a `watch` channel.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::error::ApiError;

/// Coordinates shutdown between the listener, handlers and background tasks
#[derive(Debug)]
pub struct ShutdownCoordinator {
    grace_period: Duration,
    triggered: AtomicBool,
    in_flight: AtomicU64,
    notify: Notify,
    background: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    /// Create a coordinator that waits up to `grace_period` for requests to drain
    #[must_use]
    pub fn new(grace_period: Duration) -> Self {
        let (background, _) = watch::channel(false);
        Self {
            grace_period,
            triggered: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            notify: Notify::new(),
            background,
        }
    }

    /// Whether shutdown has started
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Requests currently being handled
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` when shutdown starts
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.background.subscribe()
    }

    /// Resolves once shutdown has been triggered
    pub async fn triggered(&self) {
        let notified = self.notify.notified();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    /// Start shutdown; later calls are no-ops
    pub fn trigger(&self, reason: &str) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Shutdown already triggered");
            return;
        }
        info!(reason = %reason, in_flight = self.in_flight_count(), "Initiating graceful shutdown");
        self.background.send_replace(true);
        self.notify.notify_waiters();
    }

    /// Wait for in-flight requests, up to the grace period
    ///
    /// Returns `true` when every request finished in time.
    pub async fn drain(&self) -> bool {
        let wait = async {
            while self.in_flight_count() > 0 {
                sleep(Duration::from_millis(50)).await;
            }
        };
        match timeout(self.grace_period, wait).await {
            Ok(()) => {
                info!("All in-flight requests completed");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.in_flight_count(),
                    grace_ms = self.grace_period.as_millis() as u64,
                    "Grace period exceeded, forcing shutdown"
                );
                false
            }
        }
    }
}

/// Counts a request as in flight until dropped
#[derive(Debug)]
pub struct RequestGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl RequestGuard {
    /// Register a request; `None` once shutdown has started
    #[must_use]
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Option<Self> {
        if coordinator.is_shutting_down() {
            return None;
        }
        coordinator.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(Self { coordinator })
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.coordinator.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Middleware that tracks in-flight requests and refuses new ones while draining
pub async fn track_in_flight(
    State(coordinator): State<Arc<ShutdownCoordinator>>,
    request: Request,
    next: Next,
) -> Response {
    match RequestGuard::new(coordinator) {
        Some(_guard) => next.run(request).await,
        None => ApiError::service_unavailable("Server is shutting down").into_response(),
    }
}

/// Wait for Ctrl+C or SIGTERM, returning the signal name
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        "ctrl+c"
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
        "sigterm"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    let name = tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    };
    info!(signal = name, "Received shutdown signal");
    name
}
