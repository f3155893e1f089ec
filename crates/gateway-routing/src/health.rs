//! Periodic out-of-band instance health probing.
//!
//! The prober runs on its own task and only flips instance health flags;
//! request dispatch never waits on it.

use crate::load_balancer::{BackendPool, Instance, LoadBalancer};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Health prober settings
#[derive(Debug, Clone)]
pub struct HealthProberConfig {
    /// Time between probe rounds
    pub interval: Duration,
    /// Per-probe time budget
    pub timeout: Duration,
}

impl Default for HealthProberConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of one probe round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    /// Instances probed
    pub probed: usize,
    /// Instances that answered 2xx
    pub healthy: usize,
    /// Instances that changed state this round
    pub transitions: usize,
}

/// Probes every instance of every backend on an interval
pub struct HealthProber {
    balancer: Arc<LoadBalancer>,
    client: reqwest::Client,
    config: HealthProberConfig,
}

impl HealthProber {
    /// Create a prober
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built
    pub fn new(balancer: Arc<LoadBalancer>, config: HealthProberConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()?;
        Ok(Self {
            balancer,
            client,
            config,
        })
    }

    /// Probe every instance once, concurrently
    pub async fn probe_all(&self) -> ProbeSummary {
        let targets: Vec<(Arc<BackendPool>, Arc<Instance>)> = self
            .balancer
            .pools()
            .into_iter()
            .flat_map(|pool| {
                pool.instances()
                    .into_iter()
                    .map(move |instance| (Arc::clone(&pool), instance))
                    .collect::<Vec<_>>()
            })
            .collect();

        let results = join_all(
            targets
                .iter()
                .map(|(pool, instance)| self.probe(pool, instance)),
        )
        .await;

        ProbeSummary {
            probed: results.len(),
            healthy: results.iter().filter(|(healthy, _)| *healthy).count(),
            transitions: results.iter().filter(|(_, changed)| *changed).count(),
        }
    }

    /// Returns (healthy, changed)
    async fn probe(&self, pool: &BackendPool, instance: &Instance) -> (bool, bool) {
        let url = format!("{}{}", instance.url(), pool.health_path());
        let outcome = self.client.get(&url).send().await;

        let (healthy, reason) = match outcome {
            Ok(response) if response.status().is_success() => (true, String::new()),
            Ok(response) => (false, format!("status {}", response.status().as_u16())),
            Err(e) if e.is_timeout() => (false, "timeout".to_string()),
            Err(e) => (false, e.to_string()),
        };

        let was_healthy = instance.set_healthy(healthy);
        let changed = was_healthy != healthy;

        if changed && healthy {
            info!(backend = %pool.name(), instance = %instance.address(), "Instance is now healthy");
        } else if changed {
            warn!(
                backend = %pool.name(),
                instance = %instance.address(),
                reason = %reason,
                "Instance is now unhealthy"
            );
        } else if !healthy {
            debug!(backend = %pool.name(), instance = %instance.address(), reason = %reason, "Health check failed");
        }

        (healthy, changed)
    }

    /// Run probe rounds until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "Started backend health checks"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = self.probe_all().await;
                        debug!(
                            probed = summary.probed,
                            healthy = summary.healthy,
                            transitions = summary.transitions,
                            "Health check round complete"
                        );
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Stopped backend health checks");
        })
    }
}
