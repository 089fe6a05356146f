//! Workspace-root detection for sessions created without an explicit
//! `working_dir`, and a thin project-id fallback.
//!
//! Project-id slug generation proper is an external collaborator -- this
//! module only provides the minimal passthrough the Supervisor needs when a
//! caller omits `project_id`.

use std::path::{Path, PathBuf};

/// Ordered list of files/directories whose presence marks a directory as a
/// workspace root. Order is priority: the first match wins when multiple
/// indicators exist at different ancestor levels.
pub const WORKSPACE_INDICATORS: &[&str] = &[
    ".vscode/",
    ".git/",
    "package.json",
    "go.mod",
    "requirements.txt",
    "Cargo.toml",
    "pom.xml",
    "build.gradle",
    "composer.json",
    "Gemfile",
    "tsconfig.json",
    ".project",
    "pyproject.toml",
    "Dockerfile",
    "docker-compose.yml",
];

/// Environment variables that, if set to an existing directory, are treated
/// as an explicit workspace root (checked before the upward filesystem walk).
const WORKSPACE_ENV_VARS: &[&str] = &["WORKSPACE_ROOT", "PROJECT_ROOT", "TERMINAL_MCP_WORKSPACE"];

/// Maximum number of ancestor directories to climb while looking for an
/// indicator file.
const MAX_ASCENTS: usize = 10;

/// Resolve a working directory for a new session with no explicit override.
///
/// Priority order: (1) workspace-indicating environment variables, (2)
/// walking upward from `start` looking for an indicator file, (3) `start`
/// itself, (4) the user's home directory. The first existing directory
/// wins.
#[must_use]
pub fn detect_working_dir(start: &Path) -> PathBuf {
    if let Some(from_env) = workspace_from_env() {
        return from_env;
    }

    if let Some(found) = walk_up_for_indicator(start) {
        return found;
    }

    if start.exists() {
        return start.to_path_buf();
    }

    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

fn workspace_from_env() -> Option<PathBuf> {
    for var in WORKSPACE_ENV_VARS {
        if let Ok(val) = std::env::var(var) {
            let path = PathBuf::from(val);
            if path.is_dir() {
                return Some(path);
            }
        }
    }
    None
}

fn walk_up_for_indicator(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    for _ in 0..=MAX_ASCENTS {
        if has_indicator(&dir) {
            return Some(dir);
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => break,
        }
    }
    None
}

fn has_indicator(dir: &Path) -> bool {
    WORKSPACE_INDICATORS
        .iter()
        .any(|indicator| dir.join(indicator.trim_end_matches('/')).exists())
}

/// Derive a simple project-id slug from a working directory when the caller
/// didn't supply one. This is a thin passthrough (last path component,
/// lowercased, non-alphanumerics collapsed to `-`) -- the full slug
/// algorithm lives outside this crate's scope.
#[must_use]
pub fn derive_project_id(working_dir: &Path) -> String {
    let name = working_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string());

    let mut slug = String::with_capacity(name.len());
    let mut prev_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            slug.push('-');
            prev_dash = true;
        }
    }
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed.to_string()
    }
}
