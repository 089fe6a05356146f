//! Background Process Record (C3): the bookkeeping a session keeps for a
//! command launched with `run_background_process`.
//!
//! A record's state machine only moves forward: `Starting -> Running ->
//! (Terminating ->) Finished`. Nothing ever resets a record to an earlier
//! state; [`BackgroundProcessRecord::transition`] enforces this with an
//! assertion rather than silently ignoring an out-of-order call, since an
//! attempted backward transition means a bug in the caller (the Child
//! Runner or the Supervisor), not a race to paper over.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::output::OutputBuffer;

/// Lifecycle state of a background process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Terminating,
    Finished,
}

impl ProcessState {
    /// Ordinal used to enforce monotonic transitions.
    fn rank(self) -> u8 {
        match self {
            ProcessState::Starting => 0,
            ProcessState::Running => 1,
            ProcessState::Terminating => 2,
            ProcessState::Finished => 3,
        }
    }
}

/// Mutable fields of a background process record, behind a single lock so
/// state/exit-code/finished-at updates are never observed half-applied.
struct Inner {
    state: ProcessState,
    exit_code: Option<i32>,
    finished_at: Option<DateTime<Utc>>,
}

/// A live or finished background process, owned by exactly one [`Session`](crate::session::Session).
///
/// `pid` is the process-group leader id (negated to signal the whole group);
/// it is set once at spawn time and never changes, so it lives outside the
/// lock as a plain atomic.
pub struct BackgroundProcessRecord {
    pub id: String,
    pub command: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
    pid: AtomicI32,
    /// Present only while the runner's wait-loop is draining; used by
    /// `check_background_process` to report a best-effort "still alive" pid.
    exit_code_hint: AtomicU32,
    inner: RwLock<Inner>,
}

/// Serializable snapshot of a record's state, returned by tool calls.
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundProcessStatus {
    pub id: String,
    pub session_id: String,
    pub command: String,
    pub state: ProcessState,
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout_len: usize,
    pub stderr_len: usize,
}

impl BackgroundProcessRecord {
    #[must_use]
    pub fn new(id: String, command: String, session_id: String, output_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            command,
            session_id,
            started_at: Utc::now(),
            stdout: OutputBuffer::new(output_cap),
            stderr: OutputBuffer::new(output_cap),
            pid: AtomicI32::new(0),
            exit_code_hint: AtomicU32::new(0),
            inner: RwLock::new(Inner {
                state: ProcessState::Starting,
                exit_code: None,
                finished_at: None,
            }),
        })
    }

    /// Record the spawned process-group id once the child has actually started.
    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub async fn state(&self) -> ProcessState {
        self.inner.read().await.state
    }

    /// Move to `next`, panicking if that would be a backward or repeated
    /// transition. Call sites only ever drive the state machine forward.
    pub async fn transition(&self, next: ProcessState) {
        let mut inner = self.inner.write().await;
        assert!(
            next.rank() > inner.state.rank(),
            "illegal background process transition: {:?} -> {:?}",
            inner.state,
            next,
        );
        inner.state = next;
    }

    pub async fn mark_running(&self) {
        self.transition(ProcessState::Running).await;
    }

    pub async fn mark_terminating(&self) {
        self.transition(ProcessState::Terminating).await;
    }

    /// Mark the record finished and record its exit code. Idempotent against
    /// double-delivery from the wait task: a second call with the already
    /// recorded state is a no-op rather than a panic.
    pub async fn mark_finished(&self, exit_code: i32) {
        let mut inner = self.inner.write().await;
        if inner.state == ProcessState::Finished {
            return;
        }
        assert!(
            ProcessState::Finished.rank() > inner.state.rank(),
            "illegal background process transition: {:?} -> Finished",
            inner.state,
        );
        inner.state = ProcessState::Finished;
        inner.exit_code = Some(exit_code);
        inner.finished_at = Some(Utc::now());
        self.exit_code_hint.store(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_finished_hint(&self) -> bool {
        self.exit_code_hint.load(Ordering::SeqCst) == 1
    }

    pub async fn snapshot(&self) -> BackgroundProcessStatus {
        let inner = self.inner.read().await;
        BackgroundProcessStatus {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            command: self.command.clone(),
            state: inner.state,
            pid: self.pid(),
            exit_code: inner.exit_code,
            started_at: self.started_at,
            finished_at: inner.finished_at,
            stdout_len: self.stdout.len().await,
            stderr_len: self.stderr.len().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Arc<BackgroundProcessRecord> {
        BackgroundProcessRecord::new("bg-1".into(), "sleep 10".into(), "sess-1".into(), 4096)
    }

    #[tokio::test]
    async fn starts_in_starting_state() {
        let rec = record();
        assert_eq!(rec.state().await, ProcessState::Starting);
    }

    #[tokio::test]
    async fn forward_transitions_succeed() {
        let rec = record();
        rec.mark_running().await;
        assert_eq!(rec.state().await, ProcessState::Running);
        rec.mark_terminating().await;
        assert_eq!(rec.state().await, ProcessState::Terminating);
        rec.mark_finished(0).await;
        assert_eq!(rec.state().await, ProcessState::Finished);
    }

    #[tokio::test]
    async fn mark_finished_is_idempotent() {
        let rec = record();
        rec.mark_running().await;
        rec.mark_finished(0).await;
        rec.mark_finished(0).await;
        let snap = rec.snapshot().await;
        assert_eq!(snap.exit_code, Some(0));
    }

    #[tokio::test]
    #[should_panic(expected = "illegal background process transition")]
    async fn backward_transition_panics() {
        let rec = record();
        rec.mark_running().await;
        rec.mark_terminating().await;
        rec.transition(ProcessState::Running).await;
    }

    #[tokio::test]
    async fn pid_round_trips() {
        let rec = record();
        assert_eq!(rec.pid(), None);
        rec.set_pid(4242);
        assert_eq!(rec.pid(), Some(4242));
    }
}
