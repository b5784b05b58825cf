use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

/// Counters describing tracker progress
#[derive(Debug)]
pub struct Metrics {
    /// Logs returned by the log source
    pub logs_seen: AtomicU64,
    /// Events stored, keyed by event name (including UnknownEvent)
    pub events_by_type: Mutex<HashMap<String, u64>>,
    /// Logs stored as UnknownEvent
    pub unknown_events: AtomicU64,
    /// Block ranges fully processed
    pub ranges_processed: AtomicU64,
    /// Block ranges that failed and were left for a later pass
    pub ranges_failed: AtomicU64,
    /// Head subscriptions re-established after the stream ended
    pub resubscriptions: AtomicU64,
    pub rpc_calls: AtomicU64,
    pub rpc_failures: AtomicU64,
    pub start_time: Instant,
    pub db_inserts: AtomicU64,
    pub db_insert_failures: AtomicU64,
    /// Inserts rejected by the uniqueness constraint
    pub duplicate_events: AtomicU64,
    /// Logs whose topic 0 matched but whose payload did not decode
    pub decode_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            logs_seen: AtomicU64::new(0),
            events_by_type: Mutex::new(HashMap::new()),
            unknown_events: AtomicU64::new(0),
            ranges_processed: AtomicU64::new(0),
            ranges_failed: AtomicU64::new(0),
            resubscriptions: AtomicU64::new(0),
            rpc_calls: AtomicU64::new(0),
            rpc_failures: AtomicU64::new(0),
            start_time: Instant::now(),
            db_inserts: AtomicU64::new(0),
            db_insert_failures: AtomicU64::new(0),
            duplicate_events: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
        }
    }

    pub fn record_logs(&self, count: usize) {
        self.logs_seen.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a stored event
    pub fn record_event(&self, event_type: &str, unknown: bool) {
        if unknown {
            self.unknown_events.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut map) = self.events_by_type.lock() {
            *map.entry(event_type.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_range(&self, failed: bool) {
        if failed {
            self.ranges_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ranges_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_resubscription(&self) {
        self.resubscriptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an RPC call
    pub fn record_rpc_call(&self, failed: bool) {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.rpc_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a database insert
    pub fn record_db_insert(&self, failed: bool, duplicate: bool) {
        if duplicate {
            self.duplicate_events.fetch_add(1, Ordering::Relaxed);
        } else if failed {
            self.db_insert_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.db_inserts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Stored events per second since start
    pub fn events_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.db_inserts.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let events_by_type = self
            .events_by_type
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            logs_seen: self.logs_seen.load(Ordering::Relaxed),
            events_by_type,
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
            ranges_processed: self.ranges_processed.load(Ordering::Relaxed),
            ranges_failed: self.ranges_failed.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            rpc_failures: self.rpc_failures.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
            events_per_second: self.events_per_second(),
            db_inserts: self.db_inserts.load(Ordering::Relaxed),
            db_insert_failures: self.db_insert_failures.load(Ordering::Relaxed),
            duplicate_events: self.duplicate_events.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }

    /// Log current metrics summary
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            "Metrics Summary: {} logs seen, {} stored ({:.2} events/sec), {} duplicates, {} unknown, {} ranges ({} failed), {} RPC calls ({} failed)",
            snapshot.logs_seen,
            snapshot.db_inserts,
            snapshot.events_per_second,
            snapshot.duplicate_events,
            snapshot.unknown_events,
            snapshot.ranges_processed,
            snapshot.ranges_failed,
            snapshot.rpc_calls,
            snapshot.rpc_failures
        );
        debug!("Events by type: {:?}", snapshot.events_by_type);
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub logs_seen: u64,
    pub events_by_type: HashMap<String, u64>,
    pub unknown_events: u64,
    pub ranges_processed: u64,
    pub ranges_failed: u64,
    pub resubscriptions: u64,
    pub rpc_calls: u64,
    pub rpc_failures: u64,
    pub uptime_seconds: u64,
    pub events_per_second: f64,
    pub db_inserts: u64,
    pub db_insert_failures: u64,
    pub duplicate_events: u64,
    pub decode_failures: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "logs_seen": self.logs_seen,
            "events_by_type": self.events_by_type,
            "unknown_events": self.unknown_events,
            "ranges_processed": self.ranges_processed,
            "ranges_failed": self.ranges_failed,
            "resubscriptions": self.resubscriptions,
            "rpc_calls": self.rpc_calls,
            "rpc_failures": self.rpc_failures,
            "uptime_seconds": self.uptime_seconds,
            "events_per_second": self.events_per_second,
            "db_inserts": self.db_inserts,
            "db_insert_failures": self.db_insert_failures,
            "duplicate_events": self.duplicate_events,
            "decode_failures": self.decode_failures,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check derived from tracker metrics
pub struct HealthCheck {
    metrics: Arc<Metrics>,
    max_resubscriptions: u64,
    max_failure_rate: f64,
}

impl HealthCheck {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            max_resubscriptions: 10,
            max_failure_rate: 0.5,
        }
    }

    /// Resubscriptions tolerated before marking as degraded
    pub fn with_max_resubscriptions(mut self, max: u64) -> Self {
        self.max_resubscriptions = max;
        self
    }

    /// RPC failure rate tolerated before marking as degraded
    pub fn with_max_failure_rate(mut self, rate: f64) -> Self {
        self.max_failure_rate = rate;
        self
    }

    pub fn check(&self) -> HealthStatus {
        let resubscriptions = self.metrics.resubscriptions.load(Ordering::Relaxed);
        let rpc_calls = self.metrics.rpc_calls.load(Ordering::Relaxed);
        let rpc_failures = self.metrics.rpc_failures.load(Ordering::Relaxed);

        if resubscriptions > self.max_resubscriptions * 2 {
            return HealthStatus::Unhealthy;
        }

        if rpc_calls > 0 {
            let failure_rate = rpc_failures as f64 / rpc_calls as f64;
            if failure_rate > self.max_failure_rate {
                return HealthStatus::Degraded;
            }
        }

        if resubscriptions > self.max_resubscriptions {
            return HealthStatus::Degraded;
        }

        HealthStatus::Healthy
    }

    pub fn health_check(&self) -> HealthCheckResult {
        let status = self.check();

        HealthCheckResult {
            status,
            metrics: self.metrics.snapshot(),
            message: match status {
                HealthStatus::Healthy => "All systems operational".to_string(),
                HealthStatus::Degraded => "System performance degraded".to_string(),
                HealthStatus::Unhealthy => "System unhealthy".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub metrics: MetricsSnapshot,
    pub message: String,
}

impl HealthCheckResult {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status.to_string(),
            "message": self.message,
            "metrics": self.metrics.to_json(),
        })
    }
}
