//! Metrics collection for TensorBridge
//!
//! This module provides Prometheus metrics for observability of the
//! out-of-process path: task outcomes, shared memory segment churn and
//! worker process lifetimes.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for TensorBridge
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub tasks: TaskMetrics,
    pub segments: SegmentMetrics,
    pub execution: ExecutionMetrics,
}

/// Task protocol metrics
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    /// Tasks submitted to a worker
    pub submitted: IntCounter,

    /// Tasks that reached COMPLETED
    pub completed: IntCounter,

    /// Tasks that reached FAILED
    pub failed: IntCounter,

    /// Tasks that reached CANCELED
    pub canceled: IntCounter,

    /// Tasks that reached CRASHED
    pub crashed: IntCounter,

    /// Time from submission to terminal status
    pub duration: Histogram,
}

/// Shared memory metrics
#[derive(Debug, Clone)]
pub struct SegmentMetrics {
    /// Segments created
    pub created: IntCounter,

    /// Segments released
    pub released: IntCounter,

    /// Best-effort releases that failed
    pub release_failures: IntCounter,

    /// Bytes copied into segments
    pub bytes_written: IntCounter,
}

/// Execution facade and worker process metrics
#[derive(Debug, Clone)]
pub struct ExecutionMetrics {
    /// Worker processes spawned
    pub workers_spawned: IntCounter,

    /// Worker processes currently alive
    pub active_workers: IntGauge,

    /// Inference runs started
    pub runs_total: IntCounter,

    /// Inference runs that raised
    pub runs_failed: IntCounter,

    /// Inference run duration
    pub run_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(histogram.clone()))
        .expect("histogram registered once");
    histogram
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());
        let latency_buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

        let tasks = TaskMetrics {
            submitted: counter(&registry, "tasks_submitted_total", "Total number of tasks submitted to a worker"),
            completed: counter(&registry, "tasks_completed_total", "Total number of tasks that completed"),
            failed: counter(&registry, "tasks_failed_total", "Total number of tasks the worker reported as failed"),
            canceled: counter(&registry, "tasks_canceled_total", "Total number of canceled tasks"),
            crashed: counter(&registry, "tasks_crashed_total", "Total number of tasks lost to a worker crash"),
            duration: histogram(
                &registry,
                "task_duration_seconds",
                "Time from task submission to terminal status",
                latency_buckets.clone(),
            ),
        };

        let segments = SegmentMetrics {
            created: counter(&registry, "shm_segments_created_total", "Total number of shared memory segments created"),
            released: counter(&registry, "shm_segments_released_total", "Total number of shared memory segments released"),
            release_failures: counter(
                &registry,
                "shm_segment_release_failures_total",
                "Total number of segment releases that failed",
            ),
            bytes_written: counter(&registry, "shm_bytes_written_total", "Total bytes copied into shared memory"),
        };

        let execution = ExecutionMetrics {
            workers_spawned: counter(&registry, "workers_spawned_total", "Total number of worker processes spawned"),
            active_workers: gauge(&registry, "workers_active", "Current number of live worker processes"),
            runs_total: counter(&registry, "inference_runs_total", "Total number of inference runs"),
            runs_failed: counter(&registry, "inference_runs_failed_total", "Total number of failed inference runs"),
            run_duration: histogram(
                &registry,
                "inference_run_duration_seconds",
                "Inference run duration in seconds",
                latency_buckets,
            ),
        };

        MetricsRegistry {
            registry,
            tasks,
            segments,
            execution,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
