//! Query and connection metrics (`metrics` feature) and tracing spans
//! (`tracing` feature).
//!
//! Instruments are created on the global OpenTelemetry meter; installing an
//! exporter is left to the application.

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};
#[cfg(feature = "metrics")]
use std::time::Duration;

#[cfg(feature = "metrics")]
pub static METRICS: Lazy<QuarryMetrics> = Lazy::new(QuarryMetrics::init);

#[cfg(feature = "metrics")]
pub struct QuarryMetrics {
    pub queries_total: Counter<u64>,
    pub query_errors_total: Counter<u64>,
    pub reconnects_total: Counter<u64>,
    pub query_duration: Histogram<f64>,
    pub connect_duration: Histogram<f64>,
}

#[cfg(feature = "metrics")]
impl QuarryMetrics {
    pub fn init() -> Self {
        let meter = global::meter("quarry");

        let queries_total = meter.u64_counter("quarry_queries_total")
            .with_description("Total statements executed").build();

        let query_errors_total = meter.u64_counter("quarry_query_errors_total")
            .with_description("Statements that returned an error").build();

        let reconnects_total = meter.u64_counter("quarry_reconnects_total")
            .with_description("Connections re-established after going stale").build();

        let query_duration = meter.f64_histogram("quarry_query_duration_seconds")
            .with_description("Duration of statements").build();

        let connect_duration = meter.f64_histogram("quarry_connect_duration_seconds")
            .with_description("Time spent establishing connections").build();

        Self {
            queries_total,
            query_errors_total,
            reconnects_total,
            query_duration,
            connect_duration,
        }
    }

    pub fn record_query(&self, elapsed: Duration) {
        self.queries_total.add(1, &[]);
        self.query_duration.record(elapsed.as_secs_f64(), &[]);
    }

    pub fn record_query_error(&self) {
        self.query_errors_total.add(1, &[]);
    }

    pub fn record_reconnect(&self) {
        self.reconnects_total.add(1, &[]);
    }

    pub fn record_connect(&self, elapsed: Duration) {
        self.connect_duration.record(elapsed.as_secs_f64(), &[]);
    }
}

/// Span constructors shared by the connection, handle and transaction code.
#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{debug_span, Span};

    pub fn execute_query_span(sql: &str) -> Span {
        debug_span!("quarry.execute", sql = %sql)
    }

    pub fn acquire_connection_span() -> Span {
        debug_span!("quarry.connect")
    }

    pub fn begin_transaction_span() -> Span {
        debug_span!("quarry.begin")
    }

    pub fn commit_transaction_span() -> Span {
        debug_span!("quarry.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        debug_span!("quarry.rollback")
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_record_without_exporter() {
        // The global no-op meter accepts recordings before any exporter is set.
        METRICS.record_query(Duration::from_millis(3));
        METRICS.record_query_error();
        METRICS.record_reconnect();
        METRICS.record_connect(Duration::from_millis(1));
    }
}
