//! Prometheus metrics for routing and run lifecycle
//!
//! Each [`CoordinatorMetrics`] owns its own `prometheus::Registry` instead of
//! registering globally, so several orchestrators (or tests) can coexist in
//! one process.

use flowpod_core::{EventKind, Phase};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors creating or rendering metrics
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics output is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Signal channel a delivery went to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalChannel {
    Ready,
    Update,
}

impl SignalChannel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Update => "update",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorMetrics {
    registry: Registry,
    watch_events_total: IntCounterVec,          // cardinality: 3 (kind)
    watch_events_discarded_total: IntCounter,   // cardinality: 1
    signals_delivered_total: IntCounterVec,     // cardinality: 2 (channel)
    runs_completed_total: IntCounterVec,        // cardinality: 3 (phase)
    creation_failures_total: IntCounter,        // cardinality: 1
    runs_in_flight: IntGauge,                   // cardinality: 1
}

impl CoordinatorMetrics {
    /// Create metrics whose names are prefixed with `namespace`
    ///
    /// # Errors
    ///
    /// Returns `MetricsError` if a metric cannot be created or registered.
    pub fn new(namespace: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let watch_events_total = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_watch_events_total"),
                "Watch notifications received by kind",
            ),
            &["kind"],
        )?;
        let watch_events_discarded_total = IntCounter::with_opts(Opts::new(
            format!("{namespace}_watch_events_discarded_total"),
            "Watch notifications for untracked identities or malformed items",
        ))?;
        let signals_delivered_total = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_signals_delivered_total"),
                "Signals delivered to channel groups by channel",
            ),
            &["channel"],
        )?;
        let runs_completed_total = IntCounterVec::new(
            Opts::new(
                format!("{namespace}_runs_completed_total"),
                "Runs that reached a terminal phase by phase",
            ),
            &["phase"],
        )?;
        let creation_failures_total = IntCounter::with_opts(Opts::new(
            format!("{namespace}_creation_failures_total"),
            "Resource creation requests rejected by the cluster",
        ))?;
        let runs_in_flight = IntGauge::with_opts(Opts::new(
            format!("{namespace}_runs_in_flight"),
            "Runs currently registered and awaiting a terminal phase",
        ))?;

        registry.register(Box::new(watch_events_total.clone()))?;
        registry.register(Box::new(watch_events_discarded_total.clone()))?;
        registry.register(Box::new(signals_delivered_total.clone()))?;
        registry.register(Box::new(runs_completed_total.clone()))?;
        registry.register(Box::new(creation_failures_total.clone()))?;
        registry.register(Box::new(runs_in_flight.clone()))?;

        Ok(Self {
            registry,
            watch_events_total,
            watch_events_discarded_total,
            signals_delivered_total,
            runs_completed_total,
            creation_failures_total,
            runs_in_flight,
        })
    }

    pub fn record_watch_event(&self, kind: EventKind) {
        self.watch_events_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn record_discarded(&self) {
        self.watch_events_discarded_total.inc();
    }

    pub fn record_signal(&self, channel: SignalChannel) {
        self.signals_delivered_total
            .with_label_values(&[channel.as_str()])
            .inc();
    }

    pub fn record_completed(&self, phase: Phase) {
        self.runs_completed_total
            .with_label_values(&[phase.as_str()])
            .inc();
    }

    pub fn record_creation_failure(&self) {
        self.creation_failures_total.inc();
    }

    pub fn run_started(&self) {
        self.runs_in_flight.inc();
    }

    pub fn run_finished(&self) {
        self.runs_in_flight.dec();
    }

    pub fn runs_in_flight(&self) -> i64 {
        self.runs_in_flight.get()
    }

    pub fn discarded(&self) -> u64 {
        self.watch_events_discarded_total.get()
    }

    pub fn completed(&self, phase: Phase) -> u64 {
        self.runs_completed_total
            .with_label_values(&[phase.as_str()])
            .get()
    }

    /// Render all metrics in the Prometheus text exposition format
    ///
    /// # Errors
    ///
    /// Returns `MetricsError` if encoding fails.
    pub fn gather_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_gauge() {
        let metrics = CoordinatorMetrics::new("test").unwrap();

        metrics.record_watch_event(EventKind::Add);
        metrics.record_discarded();
        metrics.record_completed(Phase::Succeeded);
        metrics.run_started();
        metrics.run_started();
        metrics.run_finished();

        assert_eq!(metrics.discarded(), 1);
        assert_eq!(metrics.completed(Phase::Succeeded), 1);
        assert_eq!(metrics.completed(Phase::Failed), 0);
        assert_eq!(metrics.runs_in_flight(), 1);
    }

    #[test]
    fn test_independent_registries() {
        let a = CoordinatorMetrics::new("flowpod").unwrap();
        let b = CoordinatorMetrics::new("flowpod").unwrap();
        a.record_discarded();
        assert_eq!(b.discarded(), 0);
    }

    #[test]
    fn test_gather_text() {
        let metrics = CoordinatorMetrics::new("flowpod").unwrap();
        metrics.record_signal(SignalChannel::Ready);
        metrics.record_creation_failure();

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("flowpod_signals_delivered_total{channel=\"ready\"} 1"));
        assert!(text.contains("flowpod_creation_failures_total 1"));
        assert!(text.contains("flowpod_runs_in_flight 0"));
    }
}
