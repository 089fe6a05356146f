//! Supervisor (C6): creates/destroys sessions, routes command execution,
//! enforces global caps, runs periodic cleanup, exposes query APIs.
//!
//! The shutdown flag follows `MonitorService`'s `Arc<AtomicBool>` +
//! task-handle-list pattern rather than pulling in `tokio_util`'s
//! `CancellationToken`, which isn't in this crate's dependency set.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::background::BackgroundProcessStatus;
use crate::config::Config;
use crate::error::{SupervisorError, SupervisorResult};
use crate::history::{CommandFilter, CommandRecord, HistoryStore, SessionWithStats};
use crate::ratelimit::RateLimiter;
use crate::resource::{ResourceMonitor, ResourceSample};
use crate::session::{ExecuteOutcome, Session};
use crate::workspace;

/// Which part of the resource-cleanup pass `force_resource_cleanup` should
/// run on demand, selected by the tool call's `cleanup_type` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupType {
    Gc,
    Sessions,
    Processes,
    All,
}

impl std::str::FromStr for CleanupType {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gc" => Ok(CleanupType::Gc),
            "sessions" => Ok(CleanupType::Sessions),
            "processes" => Ok(CleanupType::Processes),
            "all" => Ok(CleanupType::All),
            other => Err(SupervisorError::validation(format!(
                "cleanup_type must be one of gc,sessions,processes,all, got '{other}'"
            ))),
        }
    }
}

/// Before/after resource snapshot returned by `force_resource_cleanup`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CleanupReport {
    pub before: Option<ResourceSample>,
    pub after: Option<ResourceSample>,
    pub sessions_evicted: u64,
    pub processes_evicted: u64,
    pub history_rows_trimmed: u64,
}

/// In-memory session summary, used as the store-unavailable fallback for `list_sessions`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub working_dir: String,
    pub is_active: bool,
    pub command_count: u64,
    pub success_count: u64,
    pub total_duration_ms: u64,
}

pub struct Manager {
    registry: RwLock<HashMap<String, Arc<Session>>>,
    config: Config,
    history: Option<Arc<HistoryStore>>,
    shutdown: Arc<AtomicBool>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
    rate_limiter: RateLimiter,
    resource_monitor: Arc<ResourceMonitor>,
}

impl Manager {
    #[must_use]
    pub fn new(config: Config, history: Option<Arc<HistoryStore>>) -> Arc<Self> {
        let rate_limiter = RateLimiter::new(config.server.rate_limit_burst, config.server.rate_limit_per_minute);
        let resource_monitor = Arc::new(ResourceMonitor::new(
            config.monitoring.sample_window,
            config.monitoring.task_count_threshold,
            config.monitoring.memory_threshold_mb,
        ));
        Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            config,
            history,
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: RwLock::new(Vec::new()),
            rate_limiter,
            resource_monitor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resource_monitor(&self) -> &Arc<ResourceMonitor> {
        &self.resource_monitor
    }

    /// Consume one token from the inbound tool-call rate limiter.
    pub async fn check_rate_limit(&self) -> Result<(), std::time::Duration> {
        self.rate_limiter.check().await
    }

    /// Current live-session and running-background-process counts, as seen
    /// by the resource sampler and by `get_resource_status`'s `force_gc` path.
    pub async fn session_and_background_counts(&self) -> (u64, u64) {
        let registry = self.registry.read().await;
        let sessions = registry.len() as u64;
        let mut background = 0u64;
        for session in registry.values() {
            background += session.background_process_count().await as u64;
        }
        (sessions, background)
    }

    /// Start the two independent periodic cleanup timers. Each tick runs as
    /// its own spawned task so a panic inside one cleanup pass never kills
    /// the timer loop -- the loop just logs and backs off before the next tick.
    pub async fn spawn_cleanup_tasks(self: &Arc<Self>) {
        let inactive = Arc::clone(self);
        let inactive_handle = tokio::spawn(async move {
            run_with_backoff("inactive-session cleanup", inactive.config.cleanup_interval(), move || {
                let mgr = Arc::clone(&inactive);
                async move { mgr.cleanup_inactive_sessions().await }
            })
            .await;
        });

        let resource = Arc::clone(self);
        let resource_handle = tokio::spawn(async move {
            run_with_backoff("resource cleanup", resource.config.resource_cleanup_interval(), move || {
                let mgr = Arc::clone(&resource);
                async move { mgr.cleanup_resources().await }
            })
            .await;
        });

        let sampler = Arc::clone(self);
        let sample_interval = Duration::from_secs(self.config.monitoring.sample_interval_secs);
        let resource_monitor = Arc::clone(&self.resource_monitor);
        let sample_handle = resource_monitor.spawn(sample_interval, move || {
            let mgr = Arc::clone(&sampler);
            async move { mgr.session_and_background_counts().await }
        });

        let mut tasks = self.tasks.write().await;
        tasks.push(inactive_handle);
        tasks.push(resource_handle);
        tasks.push(sample_handle);
    }

    async fn cleanup_inactive_sessions(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let timeout = self.config.default_timeout();
        let stale_ids: Vec<String> = {
            let registry = self.registry.read().await;
            let mut ids = Vec::new();
            for (id, session) in registry.iter() {
                let age = Utc::now().signed_duration_since(session.last_used_at().await);
                if age.to_std().unwrap_or_default() > timeout {
                    ids.push(id.clone());
                }
            }
            ids
        };

        for id in stale_ids {
            info!(session_id = %id, "closing inactive session");
            self.close_session(&id).await;
        }
    }

    /// Removes a session from the live registry and marks it inactive in the
    /// history store, but -- unlike [`Manager::delete_session`] -- leaves its
    /// persisted commands in place: `search_terminal_history` should still
    /// find work done in a session that timed out or was closed at shutdown,
    /// as opposed to one explicitly deleted with `confirm=true`. Used by both
    /// the inactivity-cleanup timer and `shutdown` -- both close a session,
    /// neither deletes one.
    async fn close_session(&self, id: &str) {
        let session = {
            let mut registry = self.registry.write().await;
            registry.remove(id)
        };
        let Some(session) = session else {
            return;
        };
        session.close(self.config.termination_grace_period()).await;

        if let Some(store) = &self.history {
            if let Err(e) = store.deactivate_session(id).await {
                warn!(error = %e, "failed to deactivate inactive session in history store");
            }
        }
    }

    async fn cleanup_resources(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        // (a) evict oldest sessions past the global cap.
        self.evict_sessions_over_cap().await;

        // (b)/(c) per-session background-process cap + output-buffer ceiling.
        let sessions: Vec<Arc<Session>> = self.registry.read().await.values().cloned().collect();
        for session in sessions {
            session.evict_excess_background(self.config.session.max_background_processes).await;
            session.enforce_output_cap(self.config.session.output_buffer_max_length).await;
        }

        // (d) history store batch cleanup, best-effort.
        if let Some(store) = &self.history {
            match store.cleanup_excess_commands(self.config.session.max_commands_per_session as u32).await {
                Ok(n) if n > 0 => info!(rows = n, "trimmed excess command history"),
                Err(e) => warn!(error = %e, "cleanup_excess_commands failed"),
                _ => {}
            }
            let retention = chrono::Duration::hours(self.config.streaming.stream_chunk_retention_hours as i64);
            if let Err(e) = store.cleanup_old_stream_chunks(retention).await {
                warn!(error = %e, "cleanup_old_stream_chunks failed");
            }
        }
    }

    /// On-demand counterpart to the periodic resource-cleanup pass, driven
    /// by the `force_resource_cleanup` tool rather than a timer tick.
    /// Reports a before/after resource sample around whichever portion of
    /// the pass `cleanup_type` selects.
    pub async fn force_cleanup_now(&self, cleanup_type: CleanupType) -> CleanupReport {
        let (sessions_before, background_before) = self.session_and_background_counts().await;
        let before = self.resource_monitor.sample_now(sessions_before, background_before).await;

        let mut sessions_evicted = 0u64;
        let mut processes_evicted = 0u64;
        let mut history_rows_trimmed = 0u64;

        if matches!(cleanup_type, CleanupType::Gc | CleanupType::All) {
            self.resource_monitor.force_gc().await;
        }

        if matches!(cleanup_type, CleanupType::Sessions | CleanupType::All) {
            let before_count = self.registry.read().await.len();
            self.evict_sessions_over_cap().await;
            let after_count = self.registry.read().await.len();
            sessions_evicted = before_count.saturating_sub(after_count) as u64;
        }

        if matches!(cleanup_type, CleanupType::Processes | CleanupType::All) {
            let sessions: Vec<Arc<Session>> = self.registry.read().await.values().cloned().collect();
            for session in &sessions {
                let before_count = session.background_process_count().await;
                session.evict_excess_background(self.config.session.max_background_processes).await;
                session.enforce_output_cap(self.config.session.output_buffer_max_length).await;
                let after_count = session.background_process_count().await;
                processes_evicted += before_count.saturating_sub(after_count) as u64;
            }
        }

        if matches!(cleanup_type, CleanupType::All) {
            if let Some(store) = &self.history {
                if let Ok(n) = store.cleanup_excess_commands(self.config.session.max_commands_per_session as u32).await {
                    history_rows_trimmed = n;
                }
                let retention = chrono::Duration::hours(self.config.streaming.stream_chunk_retention_hours as i64);
                let _ = store.cleanup_old_stream_chunks(retention).await;
            }
        }

        let (sessions_after, background_after) = self.session_and_background_counts().await;
        let after = self.resource_monitor.sample_now(sessions_after, background_after).await;

        CleanupReport {
            before,
            after,
            sessions_evicted,
            processes_evicted,
            history_rows_trimmed,
        }
    }

    /// Evict the oldest-by-`last_used_at` *stale* sessions (idle longer than
    /// `default_timeout`) until the registry holds at most `target`, or until
    /// stale candidates run out -- whichever comes first. A session still
    /// within its timeout is never an eviction target: the `(N+1)`th
    /// creation must fail with `SessionLimitReached` when every live session
    /// is "fresh", so eviction must not fall back to plain LRU once the stale
    /// pool is exhausted.
    ///
    /// Used two ways: the periodic/forced cleanup passes call it with
    /// `max_sessions` (trim anything that crept over the cap), while
    /// `create_session` calls it with `max_sessions - 1` to make room for the
    /// session it's about to insert -- evicting at a session count already
    /// `<= max` would otherwise be a no-op.
    async fn evict_sessions_over_cap_to(&self, target: usize) {
        let timeout = self.config.default_timeout();
        let now = Utc::now();
        let stale_ids: Vec<String> = {
            let registry = self.registry.read().await;
            if registry.len() <= target {
                return;
            }
            let mut entries: Vec<(String, chrono::DateTime<Utc>)> = Vec::new();
            for (id, session) in registry.iter() {
                let last_used = session.last_used_at().await;
                let age = now.signed_duration_since(last_used).to_std().unwrap_or_default();
                if age > timeout {
                    entries.push((id.clone(), last_used));
                }
            }
            entries.sort_by_key(|(_, last_used)| *last_used);
            let excess = registry.len() - target;
            entries.into_iter().take(excess).map(|(id, _)| id).collect()
        };
        for id in stale_ids {
            let _ = self.delete_session(&id).await;
        }
    }

    async fn evict_sessions_over_cap(&self) {
        self.evict_sessions_over_cap_to(self.config.server.max_sessions).await;
    }

    /// Create a new session, evicting the oldest (by `last_used_at`) if the
    /// registry is at capacity.
    pub async fn create_session(&self, name: String, project_id: Option<String>, working_dir: Option<String>) -> SupervisorResult<Arc<Session>> {
        {
            let registry = self.registry.read().await;
            if registry.len() >= self.config.server.max_sessions {
                drop(registry);
                self.evict_sessions_over_cap_to(self.config.server.max_sessions.saturating_sub(1)).await;
                let registry = self.registry.read().await;
                if registry.len() >= self.config.server.max_sessions {
                    return Err(SupervisorError::session_limit_reached(self.config.server.max_sessions));
                }
            }
        }

        let resolved_dir = match working_dir {
            Some(dir) if !dir.is_empty() => std::path::PathBuf::from(dir),
            _ => workspace::detect_working_dir(&std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."))),
        };
        std::fs::create_dir_all(&resolved_dir).map_err(|e| {
            SupervisorError::new(crate::error::ErrorKind::FilesystemPath, format!("cannot create working dir: {e}"))
        })?;

        let project_id = project_id.unwrap_or_else(|| workspace::derive_project_id(&resolved_dir));

        let session = Session::new(
            name,
            project_id,
            resolved_dir,
            self.config.session.output_buffer_max_length,
            self.config.session.max_background_processes,
            self.config.security.blocked_commands.clone(),
        );

        self.registry.write().await.insert(session.id.clone(), Arc::clone(&session));

        if let Some(store) = &self.history {
            let env = std::env::vars().collect();
            if let Err(e) = store
                .create_session(&session.id, &session.name, &session.project_id, &session.working_dir().await.to_string_lossy(), &env, session.created_at)
                .await
            {
                warn!(error = %e, "failed to persist new session");
            }
        }

        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> SupervisorResult<Arc<Session>> {
        self.registry
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::session_not_found(id))
    }

    pub async fn execute(&self, session_id: &str, command: &str, timeout: Option<Duration>) -> SupervisorResult<ExecuteOutcome> {
        let session = self.get_session(session_id).await?;
        let timeout = timeout.or_else(|| Some(self.config.default_timeout()));
        let outcome = session.execute(command, timeout).await?;

        if let Some(store) = &self.history {
            let record = CommandRecord {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session.id.clone(),
                project_id: session.project_id.clone(),
                command: command.to_string(),
                output: outcome.output.clone(),
                error_output: outcome.error_output.clone(),
                success: outcome.success,
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                working_dir: outcome.working_dir.clone(),
                timestamp: Utc::now(),
                tags: Vec::new(),
            };
            if let Err(e) = store.store_command(&record).await {
                warn!(error = %e, "failed to persist command history");
            }
            if let Err(e) = store.update_session_activity(&session.id, &outcome.working_dir, Utc::now()).await {
                warn!(error = %e, "failed to update session activity");
            }
        }

        Ok(outcome)
    }

    pub async fn execute_background(&self, session_id: &str, command: &str) -> SupervisorResult<String> {
        let session = self.get_session(session_id).await?;
        session.execute_background(command).await
    }

    /// List background processes across every session, optionally narrowed
    /// to one session or one project. `session_id` and `project_id` are
    /// independent filters (both may be supplied; both may be omitted).
    pub async fn list_background_filtered(&self, session_id: Option<&str>, project_id: Option<&str>) -> Vec<BackgroundProcessStatus> {
        let sessions: Vec<Arc<Session>> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .filter(|s| session_id.map(|id| s.id == id).unwrap_or(true))
                .filter(|s| project_id.map(|pid| s.project_id == pid).unwrap_or(true))
                .cloned()
                .collect()
        };
        let mut out = Vec::new();
        for session in sessions {
            for record in session.list_bg().await {
                out.push(record.snapshot().await);
            }
        }
        out
    }

    pub async fn check_background(&self, session_id: &str, process_id: &str) -> SupervisorResult<BackgroundProcessStatus> {
        let session = self.get_session(session_id).await?;
        let record = session.get_bg(process_id).await?;
        Ok(record.snapshot().await)
    }

    pub async fn terminate_background(&self, session_id: &str, process_id: &str, force: bool) -> SupervisorResult<()> {
        let session = self.get_session(session_id).await?;
        session
            .terminate_background(process_id, force, self.config.termination_grace_period())
            .await
    }

    pub async fn delete_session(&self, id: &str) -> SupervisorResult<()> {
        let session = {
            let mut registry = self.registry.write().await;
            registry.remove(id)
        };
        let Some(session) = session else {
            return Err(SupervisorError::session_not_found(id));
        };
        session.close(self.config.termination_grace_period()).await;

        if let Some(store) = &self.history {
            if let Err(e) = store.delete_session(id).await {
                warn!(error = %e, "failed to delete session history");
            }
        }
        Ok(())
    }

    /// Delete every session in `project_id`, returning the ids actually removed.
    pub async fn delete_project_sessions(&self, project_id: &str) -> SupervisorResult<Vec<String>> {
        let ids: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .values()
                .filter(|s| s.project_id == project_id)
                .map(|s| s.id.clone())
                .collect()
        };
        let mut deleted = Vec::with_capacity(ids.len());
        for id in &ids {
            if self.delete_session(id).await.is_ok() {
                deleted.push(id.clone());
            }
        }

        if let Some(store) = &self.history {
            if let Err(e) = store.delete_project_sessions(project_id).await {
                warn!(error = %e, "failed to delete project session history");
            }
        }

        Ok(deleted)
    }

    /// Prefer the store's joined-stats view; fall back to an in-memory
    /// snapshot if the store is unavailable.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        if let Some(store) = &self.history {
            if store.health_check().await {
                if let Ok(rows) = store.get_sessions_with_stats().await {
                    return rows.into_iter().map(session_with_stats_to_summary).collect();
                }
            }
        }

        let registry = self.registry.read().await;
        let mut out = Vec::with_capacity(registry.len());
        for session in registry.values() {
            let (command_count, success_count, total_duration) = session.snapshot_counters().await;
            out.push(SessionSummary {
                id: session.id.clone(),
                name: session.name.clone(),
                project_id: session.project_id.clone(),
                working_dir: session.working_dir().await.to_string_lossy().into_owned(),
                is_active: session.is_active().await,
                command_count,
                success_count,
                total_duration_ms: total_duration.as_millis() as u64,
            });
        }
        out
    }

    pub async fn search_history(&self, filter: &CommandFilter, limit: u32) -> SupervisorResult<Vec<crate::history::CommandRow>> {
        let Some(store) = &self.history else {
            return Ok(Vec::new());
        };
        store.search_commands(filter, limit).await.map_err(|e| SupervisorError::store(e.to_string()))
    }

    /// Cancel the root shutdown flag, stop both cleanup timers, and close
    /// every live session (cascading to every background process).
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.write().await);
        for handle in handles {
            handle.abort();
        }

        let ids: Vec<String> = self.registry.read().await.keys().cloned().collect();
        for id in ids {
            self.close_session(&id).await;
        }
        info!("supervisor shutdown complete");
    }
}

/// Run `body` every `interval`. Each tick is spawned as its own task so a
/// panic inside it is caught by the `JoinHandle` rather than killing this
/// timer loop; the loop logs and backs off one second before the next tick.
async fn run_with_backoff<F, Fut>(label: &str, interval: Duration, mut body: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    loop {
        tokio::time::sleep(interval).await;
        let tick = tokio::spawn(body());
        if let Err(panic) = tick.await {
            error!(task = label, error = %panic, "cleanup task panicked, restarting after backoff");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

fn session_with_stats_to_summary(row: SessionWithStats) -> SessionSummary {
    SessionSummary {
        id: row.id,
        name: row.name,
        project_id: row.project_id,
        working_dir: row.working_dir,
        is_active: row.is_active,
        command_count: row.command_count.max(0) as u64,
        success_count: row.success_count.max(0) as u64,
        total_duration_ms: row.total_duration_ms.max(0) as u64,
    }
}

