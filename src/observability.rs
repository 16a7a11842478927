use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ErrorKind;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub runs_published: u64,
    pub runs_failed: u64,
    pub inputs_rejected: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
    pub passthroughs: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn global() -> &'static MetricsCollector {
        static INSTANCE: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);
        &INSTANCE
    }

    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    /// Wall time across runs; accumulates so concurrent runs add up.
    pub fn record_total_duration(&self, duration: Duration) {
        self.update(|snapshot| snapshot.total_duration_ms += duration.as_secs_f64() * 1_000.0);
    }

    pub fn record_bytes(&self, stage: &str, bytes_in: u64, bytes_out: u64) {
        self.update(|snapshot| {
            let metrics = snapshot.stages.entry(stage.to_string()).or_default();
            metrics.bytes_in += bytes_in;
            metrics.bytes_out += bytes_out;
        });
    }

    pub fn record_passthrough(&self, stage: &str) {
        self.update(|snapshot| {
            snapshot
                .stages
                .entry(stage.to_string())
                .or_default()
                .passthroughs += 1;
        });
    }

    pub fn record_published(&self, bytes_in: u64, bytes_out: u64) {
        self.update(|snapshot| {
            snapshot.runs_published += 1;
            snapshot.bytes_in += bytes_in;
            snapshot.bytes_out += bytes_out;
        });
    }

    pub fn record_failed(&self, kind: ErrorKind) {
        self.update(|snapshot| {
            snapshot.runs_failed += 1;
            *snapshot
                .failures_by_kind
                .entry(kind.as_str().to_string())
                .or_default() += 1;
        });
    }

    pub fn record_rejected(&self) {
        self.update(|snapshot| snapshot.inputs_rejected += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        self.update(|snapshot| *snapshot = MetricsSnapshot::default());
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut guard);
        }
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms, "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        runs_published = snapshot.runs_published,
        runs_failed = snapshot.runs_failed,
        inputs_rejected = snapshot.inputs_rejected,
        bytes_in = snapshot.bytes_in,
        bytes_out = snapshot.bytes_out,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            passthroughs = metrics.passthroughs,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let mut counter = |name: &str, help: &str, value: u64| {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(output, "{name} {value}");
        };
        counter(
            "bunker_mesh_runs_published_total",
            "Runs that published an artifact",
            self.runs_published,
        );
        counter(
            "bunker_mesh_runs_failed_total",
            "Runs that ended in the failed state",
            self.runs_failed,
        );
        counter(
            "bunker_mesh_inputs_rejected_total",
            "Inputs rejected before any stage ran",
            self.inputs_rejected,
        );
        counter(
            "bunker_mesh_bytes_in_total",
            "Original bytes of published runs",
            self.bytes_in,
        );
        counter(
            "bunker_mesh_bytes_out_total",
            "Published bytes of published runs",
            self.bytes_out,
        );

        output.push_str("# HELP bunker_mesh_run_failures_total Failed runs by error kind\n");
        output.push_str("# TYPE bunker_mesh_run_failures_total counter\n");
        for (kind, count) in &self.failures_by_kind {
            let _ = writeln!(output, "bunker_mesh_run_failures_total{{kind=\"{kind}\"}} {count}");
        }

        output.push_str("# HELP bunker_mesh_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE bunker_mesh_stage_calls_total counter\n");
        output.push_str(
            "# HELP bunker_mesh_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE bunker_mesh_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP bunker_mesh_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE bunker_mesh_stage_duration_seconds_max gauge\n");
        output.push_str(
            "# HELP bunker_mesh_stage_passthrough_total Stage fallbacks that carried input forward\n",
        );
        output.push_str("# TYPE bunker_mesh_stage_passthrough_total counter\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(
                output,
                "bunker_mesh_stage_calls_total{{stage=\"{stage}\"}} {}",
                metrics.calls
            );
            let _ = writeln!(
                output,
                "bunker_mesh_stage_duration_seconds_total{{stage=\"{stage}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "bunker_mesh_stage_duration_seconds_max{{stage=\"{stage}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "bunker_mesh_stage_passthrough_total{{stage=\"{stage}\"}} {}",
                metrics.passthroughs
            );
        }
        output.push_str("# HELP bunker_mesh_pipeline_duration_seconds Total pipeline duration\n");
        output.push_str("# TYPE bunker_mesh_pipeline_duration_seconds gauge\n");
        let _ = writeln!(
            output,
            "bunker_mesh_pipeline_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}
