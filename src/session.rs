//! Session (C4): one logical shell context.
//!
//! A `Session` holds no live shell process -- it owns
//! `working_dir`/`environment`/counters/background-process
//! map, and delegates every command to a fresh Child Runner invocation
//! (see [`crate::process`]). There is no persistent interactive shell, only
//! state carried forward between one-shot children.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::background::{BackgroundProcessRecord, ProcessState};
use crate::error::{ErrorKind, SupervisorError, SupervisorResult};
use crate::output::OutputBuffer;
use crate::process::{self, ChildRunConfig};

/// Result of a single foreground `execute` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteOutcome {
    pub output: String,
    pub error_output: String,
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
    pub working_dir: String,
}

/// Mutable session state, guarded by the session's single readers/writer lock.
struct Inner {
    working_dir: PathBuf,
    environment: HashMap<String, String>,
    last_used_at: DateTime<Utc>,
    is_active: bool,
    command_count: u64,
    success_count: u64,
    total_duration: std::time::Duration,
    background_processes: HashMap<String, Arc<BackgroundProcessRecord>>,
}

/// One logical shell context, owned by the Supervisor's session registry.
pub struct Session {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    output_buffer_cap: usize,
    max_background_processes: usize,
    configured_block_list: Vec<String>,
    bg_counter: AtomicU64,
    inner: RwLock<Inner>,
}

impl Session {
    #[must_use]
    pub fn new(
        name: String,
        project_id: String,
        working_dir: PathBuf,
        output_buffer_cap: usize,
        max_background_processes: usize,
        configured_block_list: Vec<String>,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            name,
            project_id,
            created_at: now,
            output_buffer_cap,
            max_background_processes,
            configured_block_list,
            bg_counter: AtomicU64::new(0),
            inner: RwLock::new(Inner {
                working_dir,
                environment: std::env::vars().collect(),
                last_used_at: now,
                is_active: true,
                command_count: 0,
                success_count: 0,
                total_duration: std::time::Duration::ZERO,
                background_processes: HashMap::new(),
            }),
        })
    }

    pub async fn working_dir(&self) -> PathBuf {
        self.inner.read().await.working_dir.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.inner.read().await.is_active
    }

    pub async fn last_used_at(&self) -> DateTime<Utc> {
        self.inner.read().await.last_used_at
    }

    pub async fn snapshot_counters(&self) -> (u64, u64, std::time::Duration) {
        let inner = self.inner.read().await;
        (inner.command_count, inner.success_count, inner.total_duration)
    }

    pub async fn background_process_count(&self) -> usize {
        self.inner.read().await.background_processes.len()
    }

    /// Execute `command` as a foreground child, waiting for it to finish or
    /// time out. Updates `working_dir` on a successful `cd`, refreshes
    /// `last_used_at`, and advances the session's counters.
    pub async fn execute(&self, command: &str, timeout: Option<std::time::Duration>) -> SupervisorResult<ExecuteOutcome> {
        let mut inner = self.inner.write().await;
        if !inner.is_active {
            return Err(SupervisorError::session_inactive(&self.id));
        }
        inner.last_used_at = Utc::now();

        if let Err(reason) = process::validate_command(command, &self.configured_block_list) {
            return Err(SupervisorError::command_blocked(command, &reason));
        }

        let working_dir = inner.working_dir.clone();
        let env: Vec<(String, String)> = inner.environment.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        drop(inner);

        let stdout = OutputBuffer::new(self.output_buffer_cap);
        let stderr = OutputBuffer::new(self.output_buffer_cap);

        let config = ChildRunConfig {
            command: command.to_string(),
            working_dir: working_dir.clone(),
            env,
            timeout,
        };

        let outcome = process::run(&config, &stdout, &stderr, &self.configured_block_list, |_pid| async {}).await;
        let success = outcome.exit_code == 0;

        let mut inner = self.inner.write().await;
        inner.command_count += 1;
        if success {
            inner.success_count += 1;
        }
        inner.total_duration += outcome.duration;
        inner.last_used_at = Utc::now();

        if success {
            if let Some(new_dir) = detect_cd_target(command, &working_dir) {
                inner.working_dir = new_dir;
            }
        }
        let resolved_working_dir = inner.working_dir.to_string_lossy().into_owned();
        drop(inner);

        Ok(ExecuteOutcome {
            output: stdout.snapshot_string().await,
            error_output: stderr.snapshot_string().await,
            exit_code: outcome.exit_code,
            success,
            duration_ms: outcome.duration.as_millis() as u64,
            working_dir: resolved_working_dir,
        })
    }

    /// Start `command` detached, returning its process id. Rejects new work
    /// once the per-session cap of *still-running* processes is reached.
    pub async fn execute_background(&self, command: &str) -> SupervisorResult<String> {
        let mut inner = self.inner.write().await;
        if !inner.is_active {
            return Err(SupervisorError::session_inactive(&self.id));
        }

        let running = inner
            .background_processes
            .values()
            .filter(|r| !r.is_finished_hint())
            .count();
        if running >= self.max_background_processes {
            return Err(SupervisorError::process_limit_reached(self.max_background_processes));
        }

        if let Err(reason) = process::validate_command(command, &self.configured_block_list) {
            return Err(SupervisorError::command_blocked(command, &reason));
        }

        let working_dir = inner.working_dir.clone();
        let env: Vec<(String, String)> = inner.environment.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        inner.last_used_at = Utc::now();

        let seq = self.bg_counter.fetch_add(1, Ordering::SeqCst);
        let process_id = format!("{}-{seq}", &self.id[..8.min(self.id.len())]);

        let record = BackgroundProcessRecord::new(
            process_id.clone(),
            command.to_string(),
            self.id.clone(),
            self.output_buffer_cap,
        );
        inner.background_processes.insert(process_id.clone(), Arc::clone(&record));
        drop(inner);

        let config = ChildRunConfig {
            command: command.to_string(),
            working_dir,
            env,
            timeout: None,
        };
        let block_list = self.configured_block_list.clone();
        let record_for_task = Arc::clone(&record);

        tokio::spawn(async move {
            let on_spawn_target = Arc::clone(&record_for_task);
            let outcome = process::run(&config, &record_for_task.stdout, &record_for_task.stderr, &block_list, move |pid| {
                let record = Arc::clone(&on_spawn_target);
                async move {
                    record.set_pid(pid);
                    record.mark_running().await;
                }
            })
            .await;
            record_for_task.mark_finished(outcome.exit_code).await;
        });

        Ok(process_id)
    }

    /// Look up a background process by id; an empty id selects the most
    /// recently started record.
    pub async fn get_bg(&self, process_id: &str) -> SupervisorResult<Arc<BackgroundProcessRecord>> {
        let inner = self.inner.read().await;
        if process_id.is_empty() {
            return inner
                .background_processes
                .values()
                .max_by_key(|r| r.started_at)
                .cloned()
                .ok_or_else(|| SupervisorError::process_not_found("<latest>"));
        }
        inner
            .background_processes
            .get(process_id)
            .cloned()
            .ok_or_else(|| SupervisorError::process_not_found(process_id))
    }

    pub async fn list_bg(&self) -> Vec<Arc<BackgroundProcessRecord>> {
        self.inner.read().await.background_processes.values().cloned().collect()
    }

    /// Terminate a background process: `force` sends `SIGKILL` immediately;
    /// otherwise `SIGTERM`, wait `grace_period`, then `SIGKILL` if still alive.
    pub async fn terminate_background(
        &self,
        process_id: &str,
        force: bool,
        grace_period: std::time::Duration,
    ) -> SupervisorResult<()> {
        let record = self.get_bg(process_id).await?;
        if record.state().await == ProcessState::Finished {
            return Ok(());
        }

        record.mark_terminating().await;
        let Some(pid) = record.pid() else {
            return Ok(());
        };

        if force {
            let _ = process::send_signal_to_pid(pid, nix::sys::signal::Signal::SIGKILL);
        } else {
            let _ = process::send_signal_to_pid(pid, nix::sys::signal::Signal::SIGTERM);
            tokio::time::sleep(grace_period).await;
            if record.state().await != ProcessState::Finished {
                let _ = process::send_signal_to_pid(pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
        Ok(())
    }

    pub async fn set_env(&self, vars: HashMap<String, String>) {
        let mut inner = self.inner.write().await;
        inner.environment.extend(vars);
    }

    pub async fn unset_env(&self, keys: &[String]) {
        let mut inner = self.inner.write().await;
        for key in keys {
            inner.environment.remove(key);
        }
    }

    pub async fn get_env(&self, key: &str) -> Option<String> {
        self.inner.read().await.environment.get(key).cloned()
    }

    /// Cancel this session: kill every background process and mark it inactive.
    pub async fn close(&self, grace_period: std::time::Duration) {
        let ids: Vec<String> = {
            let inner = self.inner.read().await;
            inner.background_processes.keys().cloned().collect()
        };
        for id in ids {
            let _ = self.terminate_background(&id, false, grace_period).await;
        }
        let mut inner = self.inner.write().await;
        inner.is_active = false;
    }

    /// Truncate every background process's stdout/stderr buffers to `cap`
    /// bytes, used by the Supervisor's resource-cleanup pass.
    pub async fn enforce_output_cap(&self, cap: usize) {
        let records: Vec<Arc<BackgroundProcessRecord>> = {
            let inner = self.inner.read().await;
            inner.background_processes.values().cloned().collect()
        };
        for record in records {
            record.stdout.truncate_to(cap).await;
            record.stderr.truncate_to(cap).await;
        }
    }

    /// Drop finished background processes oldest-first until at most
    /// `keep` remain, as part of the resource-cleanup pass.
    pub async fn evict_excess_background(&self, keep: usize) {
        let mut inner = self.inner.write().await;
        if inner.background_processes.len() <= keep {
            return;
        }
        let mut entries: Vec<(String, DateTime<Utc>)> = inner
            .background_processes
            .iter()
            .map(|(id, record)| (id.clone(), record.started_at))
            .collect();
        entries.sort_by_key(|(_, started_at)| *started_at);
        let excess = entries.len() - keep;
        for (id, _) in entries.into_iter().take(excess) {
            inner.background_processes.remove(&id);
        }
    }
}

/// If `command` is a directory-change, compute the resolved absolute path.
/// Relative paths are joined to `current_dir`; `..` segments are resolved
/// textually (not via `std::fs::canonicalize`, so a target directory need
/// not exist on the supervisor's host for the path math itself).
fn detect_cd_target(command: &str, current_dir: &Path) -> Option<PathBuf> {
    let trimmed = command.trim();
    let rest = trimmed.strip_prefix("cd")?;
    // "cd" must be a whole word: reject "cdk deploy --all" and the like,
    // where the next character glues onto a different command name.
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim();
    if rest.is_empty() || rest == "~" {
        return dirs::home_dir();
    }

    let target = rest.split_whitespace().next().unwrap_or(rest);
    let target = target.trim_matches(|c| c == '"' || c == '\'');

    let candidate = Path::new(target);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        current_dir.join(candidate)
    };

    Some(normalize_dots(&joined))
}

/// Textually resolve `.` and `..` components without touching the filesystem.
fn normalize_dots(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
