//! Subscriber installation with optional OpenTelemetry spans.

use crate::error::TelemetryError;
use crate::logging::{env_filter, fmt_layer, LoggingConfig};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::{
    trace::{Config, RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// OpenTelemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Attach the OpenTelemetry layer
    #[serde(rename = "tracing_enabled")]
    pub enabled: bool,
    /// Service name resource attribute
    pub service_name: String,
    /// Service version resource attribute
    pub service_version: String,
    /// Deployment environment
    pub environment: String,
    /// Sampling ratio (0.0 - 1.0)
    pub sampling_rate: f64,
    /// Extra resource attributes
    pub attributes: HashMap<String, String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "api-gateway".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            sampling_rate: 1.0,
            attributes: HashMap::new(),
        }
    }
}

impl TracingConfig {
    /// Enabled configuration for `service_name`
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            enabled: true,
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Logging only
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Set the environment
    #[must_use]
    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.environment = env.into();
        self
    }

    /// Set the sampling rate
    #[must_use]
    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Add a resource attribute
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    fn sampler(&self) -> Sampler {
        if self.sampling_rate >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sampling_rate <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sampling_rate)
        }
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new("service.name", self.service_name.clone()),
            KeyValue::new("service.version", self.service_version.clone()),
            KeyValue::new("deployment.environment", self.environment.clone()),
        ];
        attributes.extend(
            self.attributes
                .iter()
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
        );
        Resource::new(attributes)
    }

    fn provider(&self) -> TracerProvider {
        let config = Config::default()
            .with_sampler(self.sampler())
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(self.resource());
        TracerProvider::builder().with_config(config).build()
    }
}

/// Install the global subscriber
///
/// Returns the tracer provider when OpenTelemetry is enabled so the caller can
/// flush it on shutdown.
///
/// # Errors
/// Returns an error if the filter is invalid or a subscriber is already set
pub fn init_tracing(
    logging: &LoggingConfig,
    tracing: &TracingConfig,
) -> Result<Option<TracerProvider>, TelemetryError> {
    let filter = env_filter(&logging.level)?;
    let provider = tracing.enabled.then(|| tracing.provider());
    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer(tracing.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(logging))
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    if tracing.enabled {
        info!(
            service = %tracing.service_name,
            environment = %tracing.environment,
            sampling_rate = tracing.sampling_rate,
            "Tracing initialized"
        );
    }

    Ok(provider)
}

/// Flush and drop the tracer provider
pub fn shutdown_tracing(provider: Option<TracerProvider>) {
    if let Some(provider) = provider {
        for result in provider.force_flush() {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to flush spans");
            }
        }
        drop(provider);
        info!("Tracing shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let config = TracingConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.service_name, "api-gateway");
        assert!(TracingConfig::new("edge").enabled);
    }

    #[test]
    fn test_sampler_selection() {
        assert!(matches!(TracingConfig::default().sampler(), Sampler::AlwaysOn));
        assert!(matches!(
            TracingConfig::default().with_sampling_rate(0.0).sampler(),
            Sampler::AlwaysOff
        ));
        assert!(matches!(
            TracingConfig::default().with_sampling_rate(0.25).sampler(),
            Sampler::TraceIdRatioBased(r) if (r - 0.25).abs() < f64::EPSILON
        ));
        assert!((TracingConfig::default().with_sampling_rate(4.0).sampling_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_key_is_tracing_enabled() {
        let config: TracingConfig =
            serde_json::from_str(r#"{"tracing_enabled":true,"sampling_rate":0.5}"#)
                .expect("should parse");
        assert!(config.enabled);
        assert_eq!(config.service_name, "api-gateway");
    }
}
