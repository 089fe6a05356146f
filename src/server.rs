//! MCP server: the tool surface exposed over JSON-RPC stdio.
//!
//! `SupervisorServer` wraps an [`Manager`] (and, through it, the rate
//! limiter and resource monitor) and exposes every tool-call bit-exactly:
//! names, required/optional arguments, and return shapes follow the
//! external-interfaces table. Every tool starts by consuming one token from
//! the rate limiter before touching the supervisor, since an inbound tool
//! call is exactly what C7 exists to throttle.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;

use crate::error::SupervisorError;
use crate::history::CommandFilter;
use crate::manager::{CleanupType, Manager};
use crate::output;

/// Line budget handed to [`output::window`] when shaping a `run_command`
/// response: generous enough that most command output passes through
/// untouched, small enough to keep a runaway build log from flooding the
/// calling agent's context.
const RUN_COMMAND_WINDOW_LINES: usize = 200;

/// Upper bound on rows fetched from the store when `sort_by` requests an
/// order other than `timestamp`: the store can only apply `LIMIT` to its own
/// `ORDER BY timestamp DESC`, so sorting by anything else must pull a wide
/// enough page to re-sort over before truncating to the caller's `limit`,
/// or an older-but-otherwise-matching row outside the most-recent-`limit`
/// window would never be considered.
const MAX_SEARCH_FETCH: u32 = 10_000;

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CreateTerminalSessionParams {
    /// Caller-supplied label for the session.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ListTerminalSessionsParams {}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct RunCommandParams {
    pub session_id: String,
    pub command: String,
    /// Timeout in seconds, capped at 300.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct RunBackgroundProcessParams {
    pub session_id: String,
    pub command: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ListBackgroundProcessesParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct TerminateBackgroundProcessParams {
    pub session_id: String,
    pub process_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CheckBackgroundProcessParams {
    pub session_id: String,
    /// Latest-started process is reported if omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SearchTerminalHistoryParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// One of `timestamp`, `duration_ms`, `command` (default `timestamp`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    /// Sort direction; defaults to `true` (descending) regardless of `sort_by`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_desc: Option<bool>,
    /// Whether to include full `output`/`error_output` text (default true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_output: Option<bool>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct DeleteSessionParams {
    pub confirm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct GetResourceStatusParams {
    #[serde(default)]
    pub force_gc: bool,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CheckResourceLeaksParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ForceResourceCleanupParams {
    pub confirm: bool,
    /// One of `gc`, `sessions`, `processes`, `all` (default `all`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_type: Option<String>,
}

// ---------------------------------------------------------------------------
// Response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ErrorObject {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remediation: Option<String>,
}

impl From<&SupervisorError> for ErrorObject {
    fn from(e: &SupervisorError) -> Self {
        Self {
            code: e.code(),
            message: e.message.clone(),
            retry_after_secs: e.retry_after.map(|d| d.as_secs()),
            remediation: e.remediation.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct CommandHistoryRow {
    id: String,
    session_id: String,
    project_id: String,
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_output: Option<String>,
    success: bool,
    exit_code: i32,
    duration_ms: i64,
    working_dir: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    tags: Vec<String>,
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn error_result(err: &SupervisorError) -> Result<CallToolResult, McpError> {
    let obj = ErrorObject::from(err);
    let json = serde_json::to_string_pretty(&obj).unwrap_or_else(|_| err.message.clone());
    Ok(CallToolResult::error(vec![Content::text(json)]))
}

fn validation_error(message: impl Into<String>) -> Result<CallToolResult, McpError> {
    error_result(&SupervisorError::validation(message))
}

/// The structured MCP server: every tool delegates to the [`Manager`] after
/// first checking the inbound rate limiter.
#[derive(Clone)]
pub struct SupervisorServer {
    manager: Arc<Manager>,
    tool_router: ToolRouter<SupervisorServer>,
}

impl SupervisorServer {
    #[must_use]
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }

    /// Consume one rate-limit token. `Some` carries the structured
    /// `RateLimited` error response the caller should return immediately
    /// instead of running the tool body.
    async fn admit(&self) -> Option<Result<CallToolResult, McpError>> {
        match self.manager.check_rate_limit().await {
            Ok(()) => None,
            Err(retry_after) => Some(error_result(&SupervisorError::rate_limited(retry_after))),
        }
    }
}

macro_rules! admit_or_return {
    ($self:expr) => {
        if let Some(result) = $self.admit().await {
            return result;
        }
    };
}

#[tool_router]
impl SupervisorServer {
    #[tool(description = "Create an isolated shell session: a working directory, environment map, and counters that persist across subsequent run_command/run_background_process calls. Returns the session id and metadata.")]
    async fn create_terminal_session(
        &self,
        Parameters(params): Parameters<CreateTerminalSessionParams>,
    ) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        if params.name.trim().is_empty() {
            return validation_error("name must not be empty");
        }
        match self.manager.create_session(params.name, params.project_id, params.working_dir).await {
            Ok(session) => json_content(&serde_json::json!({
                "id": session.id,
                "name": session.name,
                "project_id": session.project_id,
                "working_dir": session.working_dir().await.to_string_lossy(),
                "created_at": session.created_at,
            })),
            Err(e) => error_result(&e),
        }
    }

    #[tool(description = "List every live terminal session with its stats (command/success counts, total duration, active flag).")]
    async fn list_terminal_sessions(&self, Parameters(_params): Parameters<ListTerminalSessionsParams>) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        json_content(&self.manager.list_sessions().await)
    }

    #[tool(description = "Run a foreground command inside a session's shell context (inherits working directory and environment, and updates working_dir if the command is `cd ...` and succeeds). Blocks until completion or timeout (default per-config, capped at 300s). Returns combined output, exit code, and duration, plus a `summary` (head/tail window and extracted error lines) for quick triage of long output.")]
    async fn run_command(&self, Parameters(params): Parameters<RunCommandParams>) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        if params.command.trim().is_empty() {
            return validation_error("command must not be empty");
        }
        let timeout = params.timeout.map(|secs| Duration::from_secs(secs.min(300)));
        match self.manager.execute(&params.session_id, &params.command, timeout).await {
            Ok(outcome) => {
                let stdout_lines: Vec<String> = output::strip_ansi(&outcome.output).lines().map(str::to_owned).collect();
                let stderr_lines: Vec<String> = output::strip_ansi(&outcome.error_output).lines().map(str::to_owned).collect();
                let mut combined = stdout_lines;
                combined.extend(stderr_lines);
                let summary = output::window(&combined, RUN_COMMAND_WINDOW_LINES);

                let mut value = serde_json::to_value(&outcome)
                    .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("summary".to_string(), serde_json::to_value(&summary).unwrap_or_default());
                }
                json_content(&value)
            }
            Err(e) => error_result(&e),
        }
    }

    #[tool(description = "Start a command detached from the calling tool call. Returns a process_id immediately; poll it with check_background_process or list_background_processes. Subject to the session's max_background_processes cap.")]
    async fn run_background_process(&self, Parameters(params): Parameters<RunBackgroundProcessParams>) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        if params.command.trim().is_empty() {
            return validation_error("command must not be empty");
        }
        match self.manager.execute_background(&params.session_id, &params.command).await {
            Ok(process_id) => json_content(&serde_json::json!({ "process_id": process_id })),
            Err(e) => error_result(&e),
        }
    }

    #[tool(description = "List background processes, optionally narrowed to one session_id and/or one project_id. Omitting both lists across every live session.")]
    async fn list_background_processes(&self, Parameters(params): Parameters<ListBackgroundProcessesParams>) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        let records = self
            .manager
            .list_background_filtered(params.session_id.as_deref(), params.project_id.as_deref())
            .await;
        json_content(&records)
    }

    #[tool(description = "Request termination of a background process. force=true sends SIGKILL immediately; otherwise SIGTERM, a grace period, then SIGKILL if still alive. Idempotent: terminating an already-finished process succeeds.")]
    async fn terminate_background_process(
        &self,
        Parameters(params): Parameters<TerminateBackgroundProcessParams>,
    ) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        match self.manager.terminate_background(&params.session_id, &params.process_id, params.force).await {
            Ok(()) => json_content(&serde_json::json!({ "ok": true })),
            Err(e) => error_result(&e),
        }
    }

    #[tool(description = "Fetch the current record of a background process: state, pid, exit code (if finished), and buffered output lengths. If process_id is omitted, reports the most recently started process in the session.")]
    async fn check_background_process(
        &self,
        Parameters(params): Parameters<CheckBackgroundProcessParams>,
    ) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        let process_id = params.process_id.unwrap_or_default();
        match self.manager.check_background(&params.session_id, &process_id).await {
            Ok(status) => json_content(&status),
            Err(e) => error_result(&e),
        }
    }

    #[tool(description = "Search persisted command history with conjoined filters: session_id, project_id, command (substring), output (substring), success, start_time/end_time, working_dir (substring), tags (any match). Results are sorted by sort_by (timestamp|duration_ms|command, default timestamp) and sort_desc (default true). Set include_output=false to omit the full output/error_output text.")]
    async fn search_terminal_history(
        &self,
        Parameters(params): Parameters<SearchTerminalHistoryParams>,
    ) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        let filter = CommandFilter {
            session_id: params.session_id.clone(),
            project_id: params.project_id.clone(),
            command_like: params.command.clone(),
            output_like: params.output.clone(),
            success: params.success,
            since: params.start_time,
            until: params.end_time,
            working_dir_like: params.working_dir.clone(),
            tags_any: params.tags.clone(),
        };
        let limit = params.limit.unwrap_or(100).min(1000);

        // `search_commands` can only push `ORDER BY timestamp DESC LIMIT ?`
        // down into SQL. A non-timestamp sort needs the full matching set
        // (up to MAX_SEARCH_FETCH) fetched first, sorted here, and only then
        // truncated to `limit` -- otherwise a row that matches the filters
        // but falls outside the most-recent-`limit` window by timestamp
        // would never surface under a duration/command sort.
        let is_timestamp_sort = matches!(params.sort_by.as_deref(), None | Some("timestamp"));
        let fetch_limit = if is_timestamp_sort { limit } else { MAX_SEARCH_FETCH };

        let mut rows = match self.manager.search_history(&filter, fetch_limit).await {
            Ok(rows) => rows,
            Err(e) => return error_result(&e),
        };

        let sort_desc = params.sort_desc.unwrap_or(true);
        match params.sort_by.as_deref() {
            Some("duration_ms") => rows.sort_by_key(|r| r.duration_ms),
            Some("command") => rows.sort_by(|a, b| a.command.cmp(&b.command)),
            _ => rows.sort_by_key(|r| r.timestamp),
        }
        if sort_desc {
            rows.reverse();
        }
        rows.truncate(limit as usize);

        let include_output = params.include_output.unwrap_or(true);
        let out: Vec<CommandHistoryRow> = rows
            .into_iter()
            .map(|r| CommandHistoryRow {
                id: r.id,
                session_id: r.session_id,
                project_id: r.project_id,
                command: r.command,
                output: include_output.then_some(r.output),
                error_output: include_output.then_some(r.error_output),
                success: r.success,
                exit_code: r.exit_code,
                duration_ms: r.duration_ms,
                working_dir: r.working_dir,
                timestamp: r.timestamp,
                tags: r.tags,
            })
            .collect();
        json_content(&out)
    }

    #[tool(description = "Delete a session or every session in a project (cascading to its history rows and terminating any background processes). Requires confirm=true and exactly one of session_id or project_id. Returns the deleted session ids.")]
    async fn delete_session(&self, Parameters(params): Parameters<DeleteSessionParams>) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        if !params.confirm {
            return validation_error("confirm must be true to delete a session");
        }
        match (&params.session_id, &params.project_id) {
            (Some(id), None) => match self.manager.delete_session(id).await {
                Ok(()) => json_content(&serde_json::json!({ "deleted_ids": [id] })),
                Err(e) => error_result(&e),
            },
            (None, Some(project_id)) => match self.manager.delete_project_sessions(project_id).await {
                Ok(ids) => json_content(&serde_json::json!({ "deleted_ids": ids })),
                Err(e) => error_result(&e),
            },
            _ => validation_error("exactly one of session_id or project_id is required"),
        }
    }

    #[tool(description = "Report the supervisor's own resource usage: thread/task count, memory, active session/background-process counts. Pass force_gc=true to clear the retained sample window and baseline, then re-sample immediately (there is no runtime GC to trigger beyond that).")]
    async fn get_resource_status(&self, Parameters(params): Parameters<GetResourceStatusParams>) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        let monitor = self.manager.resource_monitor();
        let latest = if params.force_gc {
            monitor.force_gc().await;
            let (sessions, background) = self.manager.session_and_background_counts().await;
            monitor.sample_now(sessions, background).await
        } else {
            monitor.latest().await
        };
        let samples = monitor.samples().await;
        json_content(&serde_json::json!({
            "latest": latest,
            "window_len": samples.len(),
        }))
    }

    #[tool(description = "Analyze the latest resource sample for leak indicators: task-count growth over baseline beyond threshold (default from config), and memory growth over baseline. Does not act on findings, only reports.")]
    async fn check_resource_leaks(&self, Parameters(params): Parameters<CheckResourceLeaksParams>) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        let analysis = self.manager.resource_monitor().analyze_leaks(params.threshold).await;
        json_content(&analysis)
    }

    #[tool(description = "Force an out-of-cycle resource cleanup pass: gc (clear the sample window), sessions (evict oldest over max_sessions), processes (evict excess background processes and truncate output buffers), or all (every pass plus history trimming). Requires confirm=true. Returns before/after resource samples and counts evicted.")]
    async fn force_resource_cleanup(&self, Parameters(params): Parameters<ForceResourceCleanupParams>) -> Result<CallToolResult, McpError> {
        admit_or_return!(self);
        if !params.confirm {
            return validation_error("confirm must be true to force a resource cleanup");
        }
        let cleanup_type = match CleanupType::from_str(params.cleanup_type.as_deref().unwrap_or("all")) {
            Ok(ct) => ct,
            Err(e) => return error_result(&e),
        };
        let report = self.manager.force_cleanup_now(cleanup_type).await;
        json_content(&report)
    }
}

#[tool_handler]
impl ServerHandler for SupervisorServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "terminal-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "terminal-mcp supervises isolated shell sessions for an external agent.\n\n\
                 Call create_terminal_session once per logical task to get a session_id, \
                 then run_command(session_id, command) for foreground work -- working \
                 directory and environment persist across calls within that session via \
                 `cd` and environment changes, but there is no interactive PTY: programs \
                 that require a real terminal will not behave as they would in one.\n\n\
                 For long-running or detached work, use run_background_process and poll \
                 it with check_background_process or list_background_processes; \
                 terminate_background_process stops it (gracefully by default, \
                 force=true for immediate SIGKILL).\n\n\
                 search_terminal_history queries persisted command history across \
                 sessions and projects. delete_session removes a session (or every \
                 session in a project) and its history; it requires confirm=true.\n\n\
                 get_resource_status/check_resource_leaks/force_resource_cleanup expose \
                 the supervisor's own resource accounting -- useful for noticing runaway \
                 background work rather than for controlling it precisely."
                    .to_string(),
            ),
        }
    }
}
