//! Prometheus metrics hub shared across the workspace

use anyhow::Result;
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::warn;

/// Wrapper around a shared prometheus registry honouring a global enabled
/// flag. With metrics disabled every gauge request returns `None` and the
/// callers fall back to map-only bookkeeping.
#[derive(Clone)]
pub struct MetricsHub {
    enabled: bool,
    registry: Arc<Registry>,
}

impl MetricsHub {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            registry: Arc::new(Registry::new()),
        }
    }

    /// Hub with the metrics sink switched off
    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Create and register an integer gauge, or `None` when metrics are
    /// disabled or the name is already taken.
    pub fn int_gauge(&self, name: &str, help: &str) -> Option<IntGauge> {
        if !self.enabled {
            return None;
        }
        let gauge = match IntGauge::with_opts(Opts::new(name, help)) {
            Ok(gauge) => gauge,
            Err(e) => {
                warn!("Failed to create gauge {}: {}", name, e);
                return None;
            }
        };
        match self.registry.register(Box::new(gauge.clone())) {
            Ok(()) => Some(gauge),
            Err(e) => {
                warn!("Failed to register gauge {}: {}", name, e);
                None
            }
        }
    }

    /// Remove a gauge from the registry entirely
    pub fn delete_metric(&self, gauge: &IntGauge) {
        if let Err(e) = self.registry.unregister(Box::new(gauge.clone())) {
            warn!("Failed to unregister gauge: {}", e);
        }
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_registration_and_gather() {
        let hub = MetricsHub::new(true);
        let gauge = hub.int_gauge("portal_test_total", "Test gauge").expect("gauge");
        gauge.set(3);

        let text = hub.gather().expect("gather");
        assert!(text.contains("# HELP"));
        assert!(text.contains("portal_test_total 3"));
    }

    #[test]
    fn test_disabled_hub_returns_no_gauge() {
        let hub = MetricsHub::disabled();
        assert!(!hub.is_enabled());
        assert!(hub.int_gauge("portal_test_total", "Test gauge").is_none());
    }

    #[test]
    fn test_delete_metric_removes_from_exposition() {
        let hub = MetricsHub::new(true);
        let gauge = hub.int_gauge("portal_doomed_total", "Doomed gauge").expect("gauge");
        gauge.set(1);
        hub.delete_metric(&gauge);

        let text = hub.gather().expect("gather");
        assert!(!text.contains("portal_doomed_total"));
    }
}
