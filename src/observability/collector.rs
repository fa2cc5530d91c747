use crate::config::{CostLimits, MetricsConfig, PerformanceThresholds};
use crate::observability::metrics::{
    AggregatedMetrics, AlertKind, CostMetric, HealthReport, MetricAlert, PerformanceMetric,
    QualityMetric, Timeframe,
};
use chrono::{DateTime, Datelike, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// In-memory metric logs with threshold alerts and windowed aggregation.
///
/// Each log is bounded: once it grows past `capacity` it is trimmed to the
/// most recent `capacity * trim_ratio` records. Threshold checks only log
/// and remember the alert; they never fail the record call.
pub struct MetricsCollector {
    config: MetricsConfig,
    thresholds: PerformanceThresholds,
    cost_limits: CostLimits,
    performance: Mutex<VecDeque<PerformanceMetric>>,
    quality: Mutex<VecDeque<QualityMetric>>,
    cost: Mutex<VecDeque<CostMetric>>,
    alerts: Mutex<VecDeque<MetricAlert>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(
            MetricsConfig::default(),
            PerformanceThresholds::default(),
            CostLimits::default(),
        )
    }
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new(
        config: MetricsConfig,
        thresholds: PerformanceThresholds,
        cost_limits: CostLimits,
    ) -> Self {
        Self {
            config,
            thresholds,
            cost_limits,
            performance: Mutex::new(VecDeque::new()),
            quality: Mutex::new(VecDeque::new()),
            cost: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    /// Thresholds the record calls alert against.
    pub fn thresholds(&self) -> &PerformanceThresholds {
        &self.thresholds
    }

    /// Processing time above which a call is reported as slow. Falls back to
    /// `max_processing_time` when `warn_ratio` gives no usable duration.
    pub fn slow_call_limit(&self) -> Duration {
        let max = self.thresholds.max_processing_time;
        Duration::try_from_secs_f64(max.as_secs_f64() * self.thresholds.warn_ratio).unwrap_or(max)
    }

    /// Appends a timing record; raises `SlowProcessing` past [`slow_call_limit`].
    ///
    /// [`slow_call_limit`]: MetricsCollector::slow_call_limit
    pub fn record_performance(&self, metric: PerformanceMetric) {
        let limit = self.slow_call_limit();
        let alert = (metric.processing_time > limit).then(|| MetricAlert {
            kind: AlertKind::SlowProcessing,
            operation: metric.operation.clone(),
            value: metric.processing_time.as_secs_f64() * 1000.0,
            threshold: limit.as_secs_f64() * 1000.0,
            timestamp: metric.timestamp,
        });

        self.push(&self.performance, metric);
        if let Some(alert) = alert {
            self.raise(alert);
        }
    }

    /// Appends a quality record; raises `LowConfidence` below `min_confidence`.
    pub fn record_quality(&self, metric: QualityMetric) {
        let alert = (metric.confidence < self.thresholds.min_confidence).then(|| MetricAlert {
            kind: AlertKind::LowConfidence,
            operation: metric.operation.clone(),
            value: metric.confidence,
            threshold: self.thresholds.min_confidence,
            timestamp: metric.timestamp,
        });

        self.push(&self.quality, metric);
        if let Some(alert) = alert {
            self.raise(alert);
        }
    }

    /// Appends a cost record.
    ///
    /// Raises `ExpensiveCall` when the call alone passes the per-call warn
    /// fraction, and `BudgetThreshold` once month-to-date spend reaches the
    /// alert fraction of the monthly budget.
    pub fn record_cost(&self, metric: CostMetric) {
        let mut alerts = Vec::new();

        let per_call_limit =
            self.cost_limits.max_cost_per_analysis * self.cost_limits.per_call_warn_ratio;
        if metric.cost > per_call_limit {
            alerts.push(MetricAlert {
                kind: AlertKind::ExpensiveCall,
                operation: metric.operation.clone(),
                value: metric.cost,
                threshold: per_call_limit,
                timestamp: metric.timestamp,
            });
        }

        let operation = metric.operation.clone();
        let recorded_at = metric.timestamp;
        self.push(&self.cost, metric);

        let month_to_date = self.month_to_date_cost(Utc::now());
        let budget_limit = self.cost_limits.monthly_budget * self.cost_limits.alert_threshold;
        if month_to_date >= budget_limit {
            alerts.push(MetricAlert {
                kind: AlertKind::BudgetThreshold,
                operation,
                value: month_to_date,
                threshold: budget_limit,
                timestamp: recorded_at,
            });
        }

        for alert in alerts {
            self.raise(alert);
        }
    }

    /// Spend recorded in the calendar month (UTC) containing `now`.
    pub fn month_to_date_cost(&self, now: DateTime<Utc>) -> f64 {
        self.cost
            .lock()
            .iter()
            .filter(|m| m.timestamp.year() == now.year() && m.timestamp.month() == now.month())
            .map(|m| m.cost)
            .sum()
    }

    fn push<T>(&self, log: &Mutex<VecDeque<T>>, record: T) {
        let mut log = log.lock();
        log.push_back(record);
        if log.len() > self.config.capacity {
            let keep = ((self.config.capacity as f64) * self.config.trim_ratio) as usize;
            let excess = log.len() - keep.min(log.len());
            log.drain(..excess);
            tracing::debug!(kept = log.len(), dropped = excess, "Trimmed metric log");
        }
    }

    fn raise(&self, alert: MetricAlert) {
        tracing::warn!(
            kind = ?alert.kind,
            operation = %alert.operation,
            value = alert.value,
            threshold = alert.threshold,
            "Metric threshold crossed"
        );
        if self.config.alert_history == 0 {
            return;
        }
        let mut alerts = self.alerts.lock();
        while alerts.len() >= self.config.alert_history {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    /// Aggregates records in `[start, end]`.
    ///
    /// `end` defaults to now and `start` to `end - timeframe`.
    pub fn aggregated(
        &self,
        timeframe: Timeframe,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> AggregatedMetrics {
        let end = end.unwrap_or_else(Utc::now);
        let start = start.unwrap_or_else(|| end - timeframe.duration());
        let in_window = |ts: &DateTime<Utc>| *ts >= start && *ts <= end;

        let mut aggregated = AggregatedMetrics {
            timeframe,
            start,
            end,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_processing_time: Duration::ZERO,
            average_confidence: 0.0,
            cache_hits: 0,
            cache_misses: 0,
            cache_hit_rate: 0.0,
            error_rate: 0.0,
            total_cost: 0.0,
            total_tokens: 0,
            errors_by_category: BTreeMap::new(),
            requests_by_type: BTreeMap::new(),
            cost_by_provider: BTreeMap::new(),
        };

        let mut total_time = Duration::ZERO;
        for metric in self.performance.lock().iter().filter(|m| in_window(&m.timestamp)) {
            aggregated.total_requests += 1;
            total_time += metric.processing_time;
            if metric.success {
                aggregated.successful_requests += 1;
            } else {
                aggregated.failed_requests += 1;
                if let Some(category) = metric.error_category {
                    *aggregated.errors_by_category.entry(category).or_insert(0) += 1;
                }
            }
            if metric.cache_hit {
                aggregated.cache_hits += 1;
            } else {
                aggregated.cache_misses += 1;
            }
            *aggregated
                .requests_by_type
                .entry(metric.request_type.clone())
                .or_insert(0) += 1;
        }

        if aggregated.total_requests > 0 {
            let total = aggregated.total_requests as f64;
            let divisor = u32::try_from(aggregated.total_requests).unwrap_or(u32::MAX);
            aggregated.average_processing_time = total_time / divisor;
            aggregated.cache_hit_rate = aggregated.cache_hits as f64 / total;
            aggregated.error_rate = aggregated.failed_requests as f64 / total;
        }

        let (confidence_sum, quality_count) = self
            .quality
            .lock()
            .iter()
            .filter(|m| in_window(&m.timestamp))
            .fold((0.0, 0usize), |(sum, n), m| (sum + m.confidence, n + 1));
        if quality_count > 0 {
            aggregated.average_confidence = confidence_sum / quality_count as f64;
        }

        for metric in self.cost.lock().iter().filter(|m| in_window(&m.timestamp)) {
            aggregated.total_cost += metric.cost;
            aggregated.total_tokens += metric.total_tokens();
            *aggregated
                .cost_by_provider
                .entry(metric.provider.clone())
                .or_insert(0.0) += metric.cost;
        }

        aggregated
    }

    /// Flags an error rate or mean processing time above the thresholds.
    pub fn health(&self, timeframe: Timeframe) -> HealthReport {
        let metrics = self.aggregated(timeframe, None, None);
        let mut issues = Vec::new();

        if metrics.error_rate > self.thresholds.max_error_rate {
            issues.push(format!(
                "error rate {:.1}% exceeds {:.1}%",
                metrics.error_rate * 100.0,
                self.thresholds.max_error_rate * 100.0
            ));
        }
        if metrics.average_processing_time > self.thresholds.max_processing_time {
            issues.push(format!(
                "average processing time {}ms exceeds {}ms",
                metrics.average_processing_time.as_millis(),
                self.thresholds.max_processing_time.as_millis()
            ));
        }

        HealthReport {
            healthy: issues.is_empty(),
            issues,
            metrics,
        }
    }

    /// The newest `limit` performance records, oldest first.
    pub fn recent_performance(&self, limit: usize) -> Vec<PerformanceMetric> {
        tail(&self.performance, limit)
    }

    /// Up to `limit` most recent quality records, oldest first.
    pub fn recent_quality(&self, limit: usize) -> Vec<QualityMetric> {
        tail(&self.quality, limit)
    }

    /// Up to `limit` most recent cost records, oldest first.
    pub fn recent_cost(&self, limit: usize) -> Vec<CostMetric> {
        tail(&self.cost, limit)
    }

    /// Up to `limit` most recent alerts, oldest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<MetricAlert> {
        tail(&self.alerts, limit)
    }

    /// Record counts as (performance, quality, cost).
    pub fn len(&self) -> (usize, usize, usize) {
        (
            self.performance.lock().len(),
            self.quality.lock().len(),
            self.cost.lock().len(),
        )
    }

    /// Drops records older than the retention period. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::weeks(1));
        self.purge_older_than(Utc::now() - retention)
    }

    /// Drops records timestamped before `cutoff`.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        removed += retain_recent(&self.performance, cutoff, |m| m.timestamp);
        removed += retain_recent(&self.quality, cutoff, |m| m.timestamp);
        removed += retain_recent(&self.cost, cutoff, |m| m.timestamp);
        if removed > 0 {
            tracing::info!(removed = removed, "Swept expired metrics");
        }
        removed
    }

    /// Drops every record and alert.
    pub fn clear(&self) {
        self.performance.lock().clear();
        self.quality.lock().clear();
        self.cost.lock().clear();
        self.alerts.lock().clear();
    }

    /// Spawns the periodic retention sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                collector.sweep();
            }
        })
    }
}

fn tail<T: Clone>(log: &Mutex<VecDeque<T>>, limit: usize) -> Vec<T> {
    let log = log.lock();
    let skip = log.len().saturating_sub(limit);
    log.iter().skip(skip).cloned().collect()
}

fn retain_recent<T>(
    log: &Mutex<VecDeque<T>>,
    cutoff: DateTime<Utc>,
    timestamp: impl Fn(&T) -> DateTime<Utc>,
) -> usize {
    let mut log = log.lock();
    let before = log.len();
    log.retain(|record| timestamp(record) >= cutoff);
    before - log.len()
}
