//! The supervisor's error taxonomy.
//!
//! Every fallible operation in this crate returns a [`SupervisorError`]
//! rather than a bare `String`. Each variant carries a machine-readable
//! `code`, a human `message`, and optionally a `retry_after` hint and a
//! `remediation` string -- the shape the tool surface turns into a
//! structured error object for the calling agent.

use std::time::Duration;
use thiserror::Error;

/// A structured error returned from any supervisor operation.
#[derive(Debug, Error, Clone)]
#[error("{kind}: {message}")]
pub struct SupervisorError {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub remediation: Option<String>,
}

impl SupervisorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            remediation: None,
        }
    }

    pub fn with_remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation = Some(hint.into());
        self
    }

    pub fn with_retry_after(mut self, dur: Duration) -> Self {
        self.retry_after = Some(dur);
        self
    }

    /// Machine-readable code for the structured error object, e.g. `"session.not_found"`.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Whether retrying the same operation later has a chance of succeeding.
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::new(ErrorKind::SessionNotFound, format!("no session with id '{id}'"))
    }

    pub fn session_inactive(id: &str) -> Self {
        Self::new(ErrorKind::SessionInactive, format!("session '{id}' is not active"))
    }

    pub fn session_limit_reached(max: usize) -> Self {
        Self::new(
            ErrorKind::SessionLimitReached,
            format!("session limit reached ({max}/{max}) and no session was eligible for eviction"),
        )
        .with_remediation("close an existing session before creating another")
    }

    pub fn process_not_found(id: &str) -> Self {
        Self::new(ErrorKind::ProcessNotFound, format!("no background process with id '{id}'"))
    }

    pub fn process_limit_reached(max: usize) -> Self {
        Self::new(
            ErrorKind::ProcessLimitReached,
            format!("background process limit reached ({max}) for this session"),
        )
        .with_remediation("terminate an existing background process before starting another")
    }

    pub fn command_blocked(command: &str, pattern: &str) -> Self {
        Self::new(
            ErrorKind::CommandBlocked,
            format!("command matches blocked pattern '{pattern}': {command}"),
        )
    }

    pub fn command_timeout() -> Self {
        Self::new(ErrorKind::CommandTimeout, "command exceeded its timeout and was terminated")
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationMissingRequired, message.into())
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::new(ErrorKind::RateLimitExceeded, "rate limit exceeded")
            .with_retry_after(retry_after)
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreConnectivity, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message.into())
    }
}

/// The kinds of errors the supervisor can surface, grouped by subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Session
    SessionNotFound,
    SessionAlreadyExists,
    SessionInvalid,
    SessionLimitReached,
    SessionInactive,
    // Process
    ProcessNotFound,
    ProcessLimitReached,
    ProcessStartFailed,
    ProcessTerminated,
    // Command
    CommandBlocked,
    CommandTimeout,
    CommandFailed,
    CommandValidationFailed,
    // Store
    StoreConnectivity,
    StoreQuery,
    // Filesystem
    FilesystemPath,
    FilesystemPermission,
    // Rate limit
    RateLimitExceeded,
    // Validation
    ValidationMissingRequired,
    ValidationInvalidFormat,
    // Internal
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::SessionNotFound => "session.not_found",
            ErrorKind::SessionAlreadyExists => "session.already_exists",
            ErrorKind::SessionInvalid => "session.invalid",
            ErrorKind::SessionLimitReached => "session.limit_reached",
            ErrorKind::SessionInactive => "session.inactive",
            ErrorKind::ProcessNotFound => "process.not_found",
            ErrorKind::ProcessLimitReached => "process.limit_reached",
            ErrorKind::ProcessStartFailed => "process.start_failed",
            ErrorKind::ProcessTerminated => "process.terminated",
            ErrorKind::CommandBlocked => "command.blocked",
            ErrorKind::CommandTimeout => "command.timeout",
            ErrorKind::CommandFailed => "command.failed",
            ErrorKind::CommandValidationFailed => "command.validation_failed",
            ErrorKind::StoreConnectivity => "store.connectivity_error",
            ErrorKind::StoreQuery => "store.query_error",
            ErrorKind::FilesystemPath => "filesystem.path_error",
            ErrorKind::FilesystemPermission => "filesystem.permission_error",
            ErrorKind::RateLimitExceeded => "rate_limit.exceeded",
            ErrorKind::ValidationMissingRequired => "validation.missing_required",
            ErrorKind::ValidationInvalidFormat => "validation.invalid_format",
            ErrorKind::Internal => "internal.unhandled",
        }
    }

    /// Only `RateLimit` is unconditionally retryable; `Internal` never is.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimitExceeded)
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
