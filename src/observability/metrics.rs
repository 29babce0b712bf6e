//! Prometheus metrics.

use crate::config::{EnvLookup, parse_bool};
use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const DEFAULT_PORT: u16 = 9090;

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,
    /// Address to bind the metrics exporter.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
        }
    }
}

impl MetricsConfig {
    /// Applies `MEMKEEP_METRICS_ENABLED` and `MEMKEEP_METRICS_PORT`.
    #[must_use]
    pub fn with_overrides(mut self, env: &EnvLookup<'_>) -> Self {
        if let Some(enabled) = env("MEMKEEP_METRICS_ENABLED") {
            self.enabled = parse_bool(&enabled);
        }
        if let Some(port) = env("MEMKEEP_METRICS_PORT").and_then(|v| v.trim().parse::<u16>().ok())
        {
            self.listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        }
        self
    }
}

/// Handle to the installed Prometheus recorder.
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    prometheus: PrometheusHandle,
}

impl MetricsHandle {
    /// Renders the current metrics in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.prometheus.render()
    }
}

/// Installs the Prometheus recorder, and the HTTP listener when `expose` is set.
///
/// Returns `Ok(None)` when metrics are disabled.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed or the
/// listener cannot be started.
pub fn install_prometheus(config: &MetricsConfig, expose: bool) -> Result<Option<MetricsHandle>> {
    if !config.enabled {
        return Ok(None);
    }

    let builder = PrometheusBuilder::new();
    let prometheus = if expose {
        let (recorder, exporter) = builder
            .with_http_listener(config.listen_addr)
            .build()
            .map_err(|e| Error::operation("metrics_exporter_build", e))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| Error::operation("metrics_recorder_install", e))?;
        spawn_exporter(exporter)?;
        tracing::info!(addr = %config.listen_addr, "Prometheus listener started");
        handle
    } else {
        builder
            .install_recorder()
            .map_err(|e| Error::operation("metrics_recorder_install", e))?
    };

    Ok(Some(MetricsHandle { prometheus }))
}

/// Drives the exporter future on a dedicated thread.
fn spawn_exporter(exporter: metrics_exporter_prometheus::ExporterFuture) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::operation("metrics_runtime_init", e))?;
    std::thread::Builder::new()
        .name("metrics-exporter-prometheus-http".to_string())
        .spawn(move || {
            if let Err(e) = runtime.block_on(exporter) {
                tracing::warn!(error = ?e, "Prometheus exporter stopped");
            }
        })
        .map_err(|e| Error::operation("metrics_runtime_thread", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_smoke() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!("test_metrics_registry_total").increment(1);
        });
        let rendered = handle.render();
        assert!(rendered.contains("test_metrics_registry_total"));
    }

    #[test]
    fn test_disabled_metrics_install_nothing() {
        let handle = install_prometheus(&MetricsConfig::default(), false).unwrap();
        assert!(handle.is_none());
    }

    #[test]
    fn test_overrides() {
        let env = |key: &str| match key {
            "MEMKEEP_METRICS_ENABLED" => Some("yes".to_string()),
            "MEMKEEP_METRICS_PORT" => Some("9300".to_string()),
            _ => None,
        };
        let config = MetricsConfig::default().with_overrides(&env);
        assert!(config.enabled);
        assert_eq!(config.listen_addr.port(), 9300);
    }
}
