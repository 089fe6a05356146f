//! Resource Monitor (C8): periodic sampling of the supervisor process's own
//! resource indicators, plus simple leak heuristics.
//!
//! Sampling follows `MemoryMonitor::start`'s `tokio::spawn` + `sleep` loop
//! pattern, refreshing a single `sysinfo::System` instead of reconstructing
//! it every tick. The sliding window of retained samples follows
//! `UsageStats`'s bounded-`Vec` "drop oldest past the cap" approach.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::RwLock;

/// One point-in-time resource sample.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub thread_count: u64,
    pub memory_mb: u64,
    pub active_sessions: u64,
    pub background_processes: u64,
}

/// A warning emitted when a sample exceeds the configured leak thresholds.
#[derive(Debug, Clone, Serialize)]
pub struct LeakWarning {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

struct Baseline {
    thread_count: u64,
    memory_mb: u64,
}

struct Inner {
    samples: Vec<ResourceSample>,
    baseline: Option<Baseline>,
    warnings: Vec<LeakWarning>,
}

/// Samples the supervisor process's own resource usage on a fixed interval.
///
/// `force_gc` clears the retained sample window and baseline; Rust has no
/// runtime garbage collector to trigger, so callers that want the "re-sample
/// immediately" half of the tool-surface contract follow it with
/// [`ResourceMonitor::sample_now`] (see `get_resource_status`).
pub struct ResourceMonitor {
    pid: Pid,
    window: usize,
    task_count_threshold: u64,
    memory_threshold_mb: u64,
    inner: Arc<RwLock<Inner>>,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new(window: usize, task_count_threshold: u64, memory_threshold_mb: u64) -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
            window,
            task_count_threshold,
            memory_threshold_mb,
            inner: Arc::new(RwLock::new(Inner {
                samples: Vec::new(),
                baseline: None,
                warnings: Vec::new(),
            })),
        }
    }

    /// Spawn the periodic sampling loop. The returned handle should be kept
    /// alive for the supervisor's lifetime and dropped (or aborted) on shutdown.
    ///
    /// `active_sessions` is async because the counts it reports live behind
    /// the Supervisor's own async locks (registry + per-session state).
    pub fn spawn<F, Fut>(self: &Arc<Self>, interval: Duration, active_sessions: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = (u64, u64)> + Send,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut sys = System::new();
            loop {
                tokio::time::sleep(interval).await;
                let (sessions, background) = active_sessions().await;
                monitor.sample_once(&mut sys, sessions, background).await;
            }
        })
    }

    /// Sample once, on demand, with a fresh `System` handle -- used by
    /// `get_resource_status`/`force_resource_cleanup` to report an immediate
    /// reading instead of waiting for the next periodic tick.
    pub async fn sample_now(&self, active_sessions: u64, background_processes: u64) -> Option<ResourceSample> {
        let mut sys = System::new();
        self.sample_once(&mut sys, active_sessions, background_processes).await;
        self.latest().await
    }

    async fn sample_once(&self, sys: &mut System, active_sessions: u64, background_processes: u64) {
        sys.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let Some(process) = sys.process(self.pid) else {
            return;
        };
        let memory_mb = process.memory() / 1024 / 1024;
        let thread_count = sys.processes().values().filter(|p| p.parent() == Some(self.pid)).count() as u64 + 1;

        let sample = ResourceSample {
            timestamp: Utc::now(),
            thread_count,
            memory_mb,
            active_sessions,
            background_processes,
        };

        let mut inner = self.inner.write().await;
        let baseline = inner
            .baseline
            .get_or_insert(Baseline { thread_count, memory_mb });
        let baseline_threads = baseline.thread_count;
        let baseline_memory = baseline.memory_mb;

        if thread_count.saturating_sub(baseline_threads) > self.task_count_threshold {
            inner.warnings.push(LeakWarning {
                timestamp: sample.timestamp,
                message: format!(
                    "thread count {thread_count} exceeds baseline {baseline_threads} by more than {}",
                    self.task_count_threshold
                ),
            });
        }
        if memory_mb.saturating_sub(baseline_memory) > self.memory_threshold_mb {
            inner.warnings.push(LeakWarning {
                timestamp: sample.timestamp,
                message: format!(
                    "memory {memory_mb} MB exceeds baseline {baseline_memory} MB by more than {} MB",
                    self.memory_threshold_mb
                ),
            });
        }

        inner.samples.push(sample);
        if inner.samples.len() > self.window {
            let excess = inner.samples.len() - self.window;
            inner.samples.drain(..excess);
        }
    }

    pub async fn latest(&self) -> Option<ResourceSample> {
        self.inner.read().await.samples.last().cloned()
    }

    pub async fn samples(&self) -> Vec<ResourceSample> {
        self.inner.read().await.samples.clone()
    }

    pub async fn warnings(&self) -> Vec<LeakWarning> {
        self.inner.read().await.warnings.clone()
    }

    /// No-op beyond clearing the retained sample window and baseline so the
    /// next sample re-establishes them; there is no GC to trigger.
    pub async fn force_gc(&self) {
        let mut inner = self.inner.write().await;
        inner.samples.clear();
        inner.baseline = None;
    }

    /// Re-evaluate the latest sample against `threshold` (task-count growth
    /// over baseline), falling back to the configured default when `None`.
    /// Used by `check_resource_leaks`, which lets a caller probe with a
    /// stricter or looser threshold than the configured one without
    /// mutating it.
    pub async fn analyze_leaks(&self, threshold: Option<u64>) -> LeakAnalysis {
        let inner = self.inner.read().await;
        let threshold = threshold.unwrap_or(self.task_count_threshold);
        let latest = inner.samples.last().cloned();
        let baseline_threads = inner.baseline.as_ref().map(|b| b.thread_count);
        let exceeds_task_threshold = match (latest.as_ref(), baseline_threads) {
            (Some(sample), Some(baseline)) => sample.thread_count.saturating_sub(baseline) > threshold,
            _ => false,
        };
        let exceeds_memory_threshold = match (latest.as_ref(), inner.baseline.as_ref()) {
            (Some(sample), Some(baseline)) => sample.memory_mb.saturating_sub(baseline.memory_mb) > self.memory_threshold_mb,
            _ => false,
        };
        LeakAnalysis {
            latest,
            warnings: inner.warnings.clone(),
            exceeds_task_threshold,
            exceeds_memory_threshold,
            threshold_used: threshold,
        }
    }
}

/// Result of an on-demand leak probe, returned by `check_resource_leaks`.
#[derive(Debug, Clone, Serialize)]
pub struct LeakAnalysis {
    pub latest: Option<ResourceSample>,
    pub warnings: Vec<LeakWarning>,
    pub exceeds_task_threshold: bool,
    pub exceeds_memory_threshold: bool,
    pub threshold_used: u64,
}
