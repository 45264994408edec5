//! Prometheus collectors for publish/consume accounting and broker health.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

const LABELS: &[&str] = &["queue", "exchange"];

/// Handles to the collectors updated by the messaging layer.
///
/// Cloning is cheap; clones update the same series.
#[derive(Clone)]
pub struct Metrics {
    published: IntCounterVec,
    publish_errors: IntCounterVec,
    consumed: IntCounterVec,
    unacked: IntGaugeVec,
    broker_up: IntGauge,
}

impl Metrics {
    /// Create the collectors and register them with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            published: IntCounterVec::new(
                Opts::new("mq_messages_published_total", "Messages published"),
                LABELS,
            )?,
            publish_errors: IntCounterVec::new(
                Opts::new(
                    "mq_messages_published_errored_total",
                    "Messages that failed to publish",
                ),
                LABELS,
            )?,
            consumed: IntCounterVec::new(
                Opts::new("mq_messages_consumed_total", "Messages delivered to handlers"),
                LABELS,
            )?,
            unacked: IntGaugeVec::new(
                Opts::new("mq_messages_unacked", "Deliveries not yet acknowledged or rejected"),
                LABELS,
            )?,
            broker_up: IntGauge::new("mq_broker_up", "1 while the broker connection is up")?,
        };

        registry.register(Box::new(metrics.published.clone()))?;
        registry.register(Box::new(metrics.publish_errors.clone()))?;
        registry.register(Box::new(metrics.consumed.clone()))?;
        registry.register(Box::new(metrics.unacked.clone()))?;
        registry.register(Box::new(metrics.broker_up.clone()))?;

        Ok(metrics)
    }

    pub fn record_published(&self, queue: &str, exchange: &str) {
        self.published.with_label_values(&[queue, exchange]).inc();
    }

    pub fn record_publish_error(&self, queue: &str, exchange: &str) {
        self.publish_errors.with_label_values(&[queue, exchange]).inc();
    }

    /// A delivery arrived: one more consumed, one more outstanding.
    pub fn record_delivery(&self, queue: &str, exchange: &str) {
        self.consumed.with_label_values(&[queue, exchange]).inc();
        self.unacked.with_label_values(&[queue, exchange]).inc();
    }

    /// A delivery was acknowledged or rejected.
    pub fn record_settled(&self, queue: &str, exchange: &str) {
        self.unacked.with_label_values(&[queue, exchange]).dec();
    }

    pub fn set_broker_up(&self, up: bool) {
        self.broker_up.set(i64::from(up));
    }

    pub fn published(&self, queue: &str, exchange: &str) -> u64 {
        self.published.with_label_values(&[queue, exchange]).get()
    }

    pub fn publish_errors(&self, queue: &str, exchange: &str) -> u64 {
        self.publish_errors.with_label_values(&[queue, exchange]).get()
    }

    pub fn consumed(&self, queue: &str, exchange: &str) -> u64 {
        self.consumed.with_label_values(&[queue, exchange]).get()
    }

    pub fn unacked(&self, queue: &str, exchange: &str) -> i64 {
        self.unacked.with_label_values(&[queue, exchange]).get()
    }

    pub fn broker_up(&self) -> i64 {
        self.broker_up.get()
    }
}
