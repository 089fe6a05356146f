//! Child Runner (C2): spawns one shell command, captures its output into
//! caller-supplied [`OutputBuffer`]s, and enforces the cancellation and
//! blocked-command contracts.
//!
//! Every command -- foreground or background -- is its own `/bin/bash -c`
//! child with no persistent shell state; the owning [`Session`](crate::session::Session)
//! is responsible for carrying `cwd`/env across calls.

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::output::OutputBuffer;

/// Hard ceiling on any command's timeout.
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

/// Grace period between `SIGTERM` and `SIGKILL`.
const KILL_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Size of each read chunk drained from a child's stdout/stderr pipe. Reading
/// in bounded chunks rather than scanning unbounded `lines()` keeps a single
/// pathological line (e.g. minified JSON with no newlines) from growing an
/// intermediate buffer past this size before it reaches the capped
/// [`OutputBuffer`].
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Clamp a caller-supplied timeout to [`MAX_TIMEOUT_SECONDS`].
#[must_use]
pub fn clamp_timeout(timeout: Option<u64>) -> Option<u64> {
    timeout.map(|t| t.min(MAX_TIMEOUT_SECONDS))
}

/// Quote `value` for safe interpolation into a shell command line: wrap in
/// single quotes, escaping any embedded single quote as `'"'"'`. Applies to
/// working directories and any other untrusted literal interpolated into a
/// shell invocation.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// Build the `cd <quoted-dir> && <command>` line the Child Runner actually executes.
#[must_use]
pub fn build_shell_line(working_dir: &Path, command: &str) -> String {
    format!("cd {} && {}", shell_quote(&working_dir.to_string_lossy()), command)
}

// ---------------------------------------------------------------------------
// Blocked-command policy
// ---------------------------------------------------------------------------

/// System-critical paths that must never be the target of a recursive
/// delete, chmod, or chown.
const PROTECTED_PATHS: &[&str] = &[
    "/", "/*", "/bin", "/sbin", "/usr", "/etc", "/var", "/home", "/root", "/lib", "/lib64",
    "/opt", "/boot", "/dev", "/sys", "/proc",
];

struct DangerousPattern {
    regex: Regex,
    description: &'static str,
}

static DANGEROUS_PATTERNS: LazyLock<Vec<DangerousPattern>> = LazyLock::new(|| {
    vec![
        DangerousPattern {
            regex: Regex::new(r":\(\)\s*\{.*\|.*&\s*\}\s*;").unwrap(),
            description: "fork bomb",
        },
        DangerousPattern {
            regex: Regex::new(r"\bmkfs\b").unwrap(),
            description: "filesystem format (mkfs)",
        },
        DangerousPattern {
            regex: Regex::new(r"\bdd\b.*\bof=/dev/").unwrap(),
            description: "raw write to block device (dd of=/dev/...)",
        },
        DangerousPattern {
            regex: Regex::new(r">\s*/dev/(sd|nvme|hd|vd|xvd|disk|mapper/)").unwrap(),
            description: "redirect to block device",
        },
        DangerousPattern {
            regex: Regex::new(r"\b(shutdown|reboot|halt|poweroff)\b").unwrap(),
            description: "system shutdown/reboot",
        },
        DangerousPattern {
            regex: Regex::new(r"\binit\s+[06]\b").unwrap(),
            description: "system halt/reboot via init",
        },
    ]
});

/// Validate `command` against the built-in dangerous-pattern list plus the
/// caller-supplied (configured) block list. Returns the offending pattern's
/// description on rejection.
pub fn validate_command(command: &str, configured_block_list: &[String]) -> Result<(), String> {
    for pattern in DANGEROUS_PATTERNS.iter() {
        if pattern.regex.is_match(command) {
            return Err(pattern.description.to_string());
        }
    }

    for blocked in configured_block_list {
        if !blocked.is_empty() && command.contains(blocked.as_str()) {
            return Err(format!("matches configured blocked pattern '{blocked}'"));
        }
    }

    check_destructive_on_protected_paths(command)
}

fn check_destructive_on_protected_paths(command: &str) -> Result<(), String> {
    for subcmd in split_subcommands(command.trim()) {
        let subcmd = subcmd.trim();
        if subcmd.is_empty() {
            continue;
        }
        if is_dangerous_recursive(subcmd, "rm") {
            return Err(format!("recursive delete targeting a protected system path: {subcmd}"));
        }
        if is_dangerous_recursive(subcmd, "chmod") {
            return Err(format!("recursive chmod on a protected system path: {subcmd}"));
        }
        if is_dangerous_recursive(subcmd, "chown") {
            return Err(format!("recursive chown on a protected system path: {subcmd}"));
        }
    }
    Ok(())
}

fn split_subcommands(cmd: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut remaining = cmd;
    while !remaining.is_empty() {
        if let Some(pos) = remaining
            .find("&&")
            .into_iter()
            .chain(remaining.find("||"))
            .chain(remaining.find(';'))
            .min()
        {
            parts.push(&remaining[..pos]);
            let sep_len = if remaining[pos..].starts_with("&&") || remaining[pos..].starts_with("||") {
                2
            } else {
                1
            };
            remaining = &remaining[pos + sep_len..];
        } else {
            parts.push(remaining);
            break;
        }
    }
    parts
}

fn is_dangerous_recursive(subcmd: &str, cmd_name: &str) -> bool {
    let words: Vec<&str> = subcmd.split_whitespace().collect();
    let Some(cmd_pos) = words.iter().position(|w| *w == cmd_name) else {
        return false;
    };
    let args = &words[cmd_pos + 1..];

    let has_recursive = args.iter().any(|a| {
        *a == "-r"
            || *a == "-R"
            || *a == "--recursive"
            || (a.starts_with('-') && !a.starts_with("--") && (a.contains('r') || a.contains('R')))
    });
    if !has_recursive {
        return false;
    }

    args.iter().any(|arg| {
        if arg.starts_with('-') {
            return false;
        }
        let path = arg.trim_end_matches('/');
        let path = if path.is_empty() { "/" } else { path };
        *arg == "/*" || PROTECTED_PATHS.iter().any(|p| p.trim_end_matches('/') == path || (p == &"/" && path == "/"))
    })
}

// ---------------------------------------------------------------------------
// Spawning and waiting
// ---------------------------------------------------------------------------

/// Parameters for one Child Runner invocation.
#[derive(Debug, Clone)]
pub struct ChildRunConfig {
    pub command: String,
    pub working_dir: std::path::PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

/// Outcome of a completed (or cancelled) invocation.
#[derive(Debug, Clone)]
pub struct ChildRunOutcome {
    /// `-1` for spawn failure, `124` for timeout/cancellation, `1` for a
    /// wait error, otherwise the child's actual exit status.
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Spawn `config.command` under a fresh process group, draining stdout/stderr
/// into `stdout_buf`/`stderr_buf`, and wait for completion or timeout.
///
/// Blocked commands never spawn: they report `exit_code = -1` immediately,
/// with the rejection reason written to `stderr_buf`, following the same
/// "spawn failure -> immediate return with exit code -1" contract as any
/// other pipe/spawn failure.
pub async fn run<F, Fut>(
    config: &ChildRunConfig,
    stdout_buf: &OutputBuffer,
    stderr_buf: &OutputBuffer,
    configured_block_list: &[String],
    on_spawn: F,
) -> ChildRunOutcome
where
    F: FnOnce(i32) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let start = Instant::now();

    if let Err(reason) = validate_command(&config.command, configured_block_list) {
        tracing::warn!(command = %config.command, reason = %reason, "blocked command rejected");
        stderr_buf
            .write_line(&format!("blocked: command matches a disallowed pattern ({reason})"))
            .await;
        return ChildRunOutcome {
            exit_code: -1,
            duration: start.elapsed(),
            timed_out: false,
        };
    }

    let shell_line = build_shell_line(&config.working_dir, &config.command);

    let mut cmd = Command::new("/bin/bash");
    cmd.arg("-c").arg(&shell_line);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    // SAFETY: pre_exec runs in the forked child before exec; it only calls
    // an async-signal-safe libc wrapper.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            stderr_buf.write_line(&format!("failed to spawn process: {e}")).await;
            return ChildRunOutcome {
                exit_code: -1,
                duration: start.elapsed(),
                timed_out: false,
            };
        }
    };

    if let Some(pid) = child.id() {
        on_spawn(pid as i32).await;
    }

    let Some(stdout) = child.stdout.take() else {
        return ChildRunOutcome {
            exit_code: -1,
            duration: start.elapsed(),
            timed_out: false,
        };
    };
    let Some(stderr) = child.stderr.take() else {
        return ChildRunOutcome {
            exit_code: -1,
            duration: start.elapsed(),
            timed_out: false,
        };
    };

    let stdout_sink = stdout_buf.clone();
    let stdout_task = tokio::spawn(async move { drain_stream(stdout, stdout_sink).await });
    let stderr_sink = stderr_buf.clone();
    let stderr_task = tokio::spawn(async move { drain_stream(stderr, stderr_sink).await });

    let (timed_out, exit_code) = match config.timeout {
        Some(dur) => match tokio::time::timeout(dur, child.wait()).await {
            Ok(Ok(status)) => (false, status.code().unwrap_or(1)),
            Ok(Err(_)) => (false, 1),
            Err(_) => {
                let _ = kill_child(&child, KILL_GRACE_PERIOD).await;
                let _ = child.wait().await;
                (true, 124)
            }
        },
        None => match child.wait().await {
            Ok(status) => (false, status.code().unwrap_or(1)),
            Err(_) => (false, 1),
        },
    };

    // Bounded join: the drain tasks should finish almost immediately once
    // the pipes close with the child, but never block shutdown on a stuck reader.
    let _ = tokio::time::timeout(Duration::from_secs(2), stdout_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), stderr_task).await;

    ChildRunOutcome {
        exit_code,
        duration: start.elapsed(),
        timed_out,
    }
}

async fn drain_stream<R>(mut reader: R, sink: OutputBuffer)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink.write(&chunk[..n]).await,
            Err(_) => break,
        }
    }
}

/// Send `SIGTERM` to the child's process group, wait up to `grace_period`,
/// then send `SIGKILL` if it hasn't exited.
pub async fn kill_child(child: &tokio::process::Child, grace_period: Duration) -> Result<(), String> {
    send_signal(child, nix::sys::signal::Signal::SIGTERM)?;
    tokio::time::sleep(grace_period).await;
    send_signal(child, nix::sys::signal::Signal::SIGKILL)
}

/// Send `signal` to a child's process group (negative PID, since the Child
/// Runner always calls `setsid` before exec).
pub fn send_signal(child: &tokio::process::Child, signal: nix::sys::signal::Signal) -> Result<(), String> {
    let pid = child
        .id()
        .ok_or_else(|| "process has no PID (already exited?)".to_string())?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(-(pid as i32)), signal)
        .map_err(|e| format!("failed to signal process group: {e}"))
}

/// Send `signal` to a process group identified by its raw leader PID, for
/// use once the `Child` handle itself has been dropped (e.g. a background
/// process whose wait task owns the handle).
pub fn send_signal_to_pid(pid: i32, signal: nix::sys::signal::Signal) -> Result<(), String> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(-pid), signal)
        .map_err(|e| format!("failed to signal process group {pid}: {e}"))
}
