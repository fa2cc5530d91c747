//! Observability: structured logging setup and the in-memory metrics collector.
//!
//! - **Logging**: `tracing` subscriber setup with pretty, JSON or compact output
//! - **Metrics**: bounded performance, quality and cost logs with threshold
//!   alerts, windowed aggregation and a retention sweep

mod collector;
mod logging;
mod metrics;

pub use collector::MetricsCollector;
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use metrics::{
    AggregatedMetrics, AlertKind, CostMetric, HealthReport, MetricAlert, PerformanceMetric,
    QualityMetric, Timeframe,
};
