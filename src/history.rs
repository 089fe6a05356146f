//! History Store (C5): durable record of sessions, commands, and stream
//! chunks, backed by SQLite via `sqlx`.
//!
//! Mirrors `PersistenceLayer::new` from the reference persistence layer this
//! module is grounded on: a connection pool, WAL journaling, and
//! `sqlx::raw_sql` schema bootstrap. Every operation here is best-effort
//! from the Supervisor's point of view -- a failure is logged and converted
//! to a warning, never propagated as a fatal error.

use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    project_id TEXT NOT NULL,
    working_dir TEXT NOT NULL,
    environment_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_used_at TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    command_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS commands (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    project_id TEXT NOT NULL,
    command TEXT NOT NULL,
    output TEXT NOT NULL,
    error_output TEXT NOT NULL,
    success INTEGER NOT NULL,
    exit_code INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    working_dir TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    tags_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stream_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    command_id TEXT NOT NULL REFERENCES commands(id) ON DELETE CASCADE,
    chunk_type TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    sequence_num INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_project_id ON sessions(project_id);
CREATE INDEX IF NOT EXISTS idx_sessions_last_used_at ON sessions(last_used_at);
CREATE INDEX IF NOT EXISTS idx_commands_session_id ON commands(session_id);
CREATE INDEX IF NOT EXISTS idx_commands_project_id ON commands(project_id);
CREATE INDEX IF NOT EXISTS idx_commands_timestamp ON commands(timestamp);
CREATE INDEX IF NOT EXISTS idx_stream_chunks_command_id ON stream_chunks(command_id);
CREATE INDEX IF NOT EXISTS idx_stream_chunks_session_id ON stream_chunks(session_id);
";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub is_active: bool,
    pub command_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionWithStats {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub is_active: bool,
    pub command_count: i64,
    pub success_count: i64,
    pub total_duration_ms: i64,
}

#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub id: String,
    pub session_id: String,
    pub project_id: String,
    pub command: String,
    pub output: String,
    pub error_output: String,
    pub success: bool,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub working_dir: String,
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRow {
    pub id: String,
    pub session_id: String,
    pub project_id: String,
    pub command: String,
    pub output: String,
    pub error_output: String,
    pub success: bool,
    pub exit_code: i32,
    pub duration_ms: i64,
    pub working_dir: String,
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<String>,
}

/// Filters accepted by [`HistoryStore::search_commands`]. Every field is
/// optional and conditions are conjoined.
#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub session_id: Option<String>,
    pub project_id: Option<String>,
    pub command_like: Option<String>,
    pub output_like: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub working_dir_like: Option<String>,
    /// Rows whose `tags_json` contains any one of these, OR'd together.
    pub tags_any: Option<Vec<String>>,
}

pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub async fn new(db_path: impl AsRef<Path>, max_connections: u32, busy_timeout_ms: u64) -> HistoryResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect(&database_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout = {busy_timeout_ms}")).execute(&pool).await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn create_session(
        &self,
        id: &str,
        name: &str,
        project_id: &str,
        working_dir: &str,
        environment: &std::collections::HashMap<String, String>,
        created_at: DateTime<Utc>,
    ) -> HistoryResult<()> {
        let env_json = serde_json::to_string(environment).unwrap_or_default();
        sqlx::query(
            "INSERT INTO sessions (id, name, project_id, working_dir, environment_json, created_at, last_used_at, is_active, command_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, 0)",
        )
        .bind(id)
        .bind(name)
        .bind(project_id)
        .bind(working_dir)
        .bind(env_json)
        .bind(created_at)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> HistoryResult<Option<SessionRow>> {
        let row = sqlx::query(
            "SELECT id, name, project_id, working_dir, created_at, last_used_at, is_active, command_count FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_session(&r)))
    }

    pub async fn list_sessions(&self, project_filter: Option<&str>) -> HistoryResult<Vec<SessionRow>> {
        let rows = match project_filter {
            Some(project_id) => {
                sqlx::query(
                    "SELECT id, name, project_id, working_dir, created_at, last_used_at, is_active, command_count
                     FROM sessions WHERE project_id = ? ORDER BY last_used_at DESC",
                )
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, name, project_id, working_dir, created_at, last_used_at, is_active, command_count
                     FROM sessions ORDER BY last_used_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(row_to_session).collect())
    }

    pub async fn update_session_activity(&self, id: &str, working_dir: &str, last_used_at: DateTime<Utc>) -> HistoryResult<()> {
        sqlx::query("UPDATE sessions SET working_dir = ?, last_used_at = ?, command_count = command_count + 1 WHERE id = ?")
            .bind(working_dir)
            .bind(last_used_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deactivate_session(&self, id: &str) -> HistoryResult<()> {
        sqlx::query("UPDATE sessions SET is_active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, id: &str) -> HistoryResult<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn delete_project_sessions(&self, project_id: &str) -> HistoryResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn store_command(&self, record: &CommandRecord) -> HistoryResult<()> {
        let tags_json = serde_json::to_string(&record.tags).unwrap_or_default();
        sqlx::query(
            "INSERT INTO commands (id, session_id, project_id, command, output, error_output, success, exit_code, duration_ms, working_dir, timestamp, tags_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.session_id)
        .bind(&record.project_id)
        .bind(&record.command)
        .bind(&record.output)
        .bind(&record.error_output)
        .bind(record.success)
        .bind(record.exit_code)
        .bind(record.duration_ms as i64)
        .bind(&record.working_dir)
        .bind(record.timestamp)
        .bind(tags_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn search_commands(&self, filter: &CommandFilter, limit: u32) -> HistoryResult<Vec<CommandRow>> {
        let mut sql = String::from(
            "SELECT id, session_id, project_id, command, output, error_output, success, exit_code, duration_ms, working_dir, timestamp, tags_json FROM commands WHERE 1=1",
        );
        if filter.session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if filter.project_id.is_some() {
            sql.push_str(" AND project_id = ?");
        }
        if filter.command_like.is_some() {
            sql.push_str(" AND command LIKE ?");
        }
        if filter.output_like.is_some() {
            sql.push_str(" AND output LIKE ?");
        }
        if filter.success.is_some() {
            sql.push_str(" AND success = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        if filter.working_dir_like.is_some() {
            sql.push_str(" AND working_dir LIKE ?");
        }
        if let Some(tags) = &filter.tags_any {
            if !tags.is_empty() {
                sql.push_str(" AND (");
                for i in 0..tags.len() {
                    if i > 0 {
                        sql.push_str(" OR ");
                    }
                    sql.push_str("tags_json LIKE ?");
                }
                sql.push(')');
            }
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(v) = &filter.session_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.project_id {
            query = query.bind(v);
        }
        if let Some(v) = &filter.command_like {
            query = query.bind(format!("%{v}%"));
        }
        if let Some(v) = &filter.output_like {
            query = query.bind(format!("%{v}%"));
        }
        if let Some(v) = filter.success {
            query = query.bind(v);
        }
        if let Some(v) = filter.since {
            query = query.bind(v);
        }
        if let Some(v) = filter.until {
            query = query.bind(v);
        }
        if let Some(v) = &filter.working_dir_like {
            query = query.bind(format!("%{v}%"));
        }
        if let Some(tags) = &filter.tags_any {
            for tag in tags {
                query = query.bind(format!("%{tag}%"));
            }
        }
        query = query.bind(limit);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_command).collect())
    }

    /// `LEFT JOIN`-derived per-session stats view.
    pub async fn get_sessions_with_stats(&self) -> HistoryResult<Vec<SessionWithStats>> {
        let rows = sqlx::query(
            r"
            SELECT
                s.id, s.name, s.project_id, s.working_dir, s.created_at, s.last_used_at, s.is_active,
                COUNT(c.id) AS command_count,
                COALESCE(SUM(CASE WHEN c.success THEN 1 ELSE 0 END), 0) AS success_count,
                COALESCE(SUM(c.duration_ms), 0) AS total_duration_ms
            FROM sessions s
            LEFT JOIN commands c ON c.session_id = s.id
            GROUP BY s.id
            ORDER BY s.last_used_at DESC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| SessionWithStats {
                id: r.get("id"),
                name: r.get("name"),
                project_id: r.get("project_id"),
                working_dir: r.get("working_dir"),
                created_at: r.get("created_at"),
                last_used_at: r.get("last_used_at"),
                is_active: r.get::<i64, _>("is_active") != 0,
                command_count: r.get("command_count"),
                success_count: r.get("success_count"),
                total_duration_ms: r.get("total_duration_ms"),
            })
            .collect())
    }

    /// For every session, delete all but the newest `n_per_session` commands.
    /// Returns total rows deleted.
    pub async fn cleanup_excess_commands(&self, n_per_session: u32) -> HistoryResult<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM commands
            WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (PARTITION BY session_id ORDER BY timestamp DESC) AS rn
                    FROM commands
                ) ranked
                WHERE rn > ?
            )
            ",
        )
        .bind(n_per_session)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn cleanup_old_stream_chunks(&self, older_than: ChronoDuration) -> HistoryResult<u64> {
        let cutoff = Utc::now() - older_than;
        let result = sqlx::query("DELETE FROM stream_chunks WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Connectivity ping: one trivial query, no rows inspected.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> SessionRow {
    SessionRow {
        id: row.get("id"),
        name: row.get("name"),
        project_id: row.get("project_id"),
        working_dir: row.get("working_dir"),
        created_at: row.get("created_at"),
        last_used_at: row.get("last_used_at"),
        is_active: row.get::<i64, _>("is_active") != 0,
        command_count: row.get("command_count"),
    }
}

fn row_to_command(row: &sqlx::sqlite::SqliteRow) -> CommandRow {
    let tags_json: String = row.get("tags_json");
    CommandRow {
        id: row.get("id"),
        session_id: row.get("session_id"),
        project_id: row.get("project_id"),
        command: row.get("command"),
        output: row.get("output"),
        error_output: row.get("error_output"),
        success: row.get::<i64, _>("success") != 0,
        exit_code: row.get("exit_code"),
        duration_ms: row.get("duration_ms"),
        working_dir: row.get("working_dir"),
        timestamp: row.get("timestamp"),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store() -> (HistoryStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.db"), 5, 5000).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn health_check_succeeds_on_fresh_db() {
        let (store, _dir) = store().await;
        assert!(store.health_check().await);
    }

    #[tokio::test]
    async fn create_and_fetch_session_round_trips() {
        let (store, _dir) = store().await;
        let env = std::collections::HashMap::new();
        store.create_session("s1", "test", "proj", "/tmp", &env, Utc::now()).await.unwrap();
        let row = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(row.id, "s1");
        assert!(row.is_active);
    }

    #[tokio::test]
    async fn delete_session_cascades_to_commands() {
        let (store, _dir) = store().await;
        let env = std::collections::HashMap::new();
        store.create_session("s1", "test", "proj", "/tmp", &env, Utc::now()).await.unwrap();
        store
            .store_command(&CommandRecord {
                id: "c1".into(),
                session_id: "s1".into(),
                project_id: "proj".into(),
                command: "echo hi".into(),
                output: "hi\n".into(),
                error_output: String::new(),
                success: true,
                exit_code: 0,
                duration_ms: 5,
                working_dir: "/tmp".into(),
                timestamp: Utc::now(),
                tags: vec![],
            })
            .await
            .unwrap();

        store.delete_session("s1").await.unwrap();
        let remaining = store.search_commands(&CommandFilter::default(), 100).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn search_commands_filters_by_success() {
        let (store, _dir) = store().await;
        let env = std::collections::HashMap::new();
        store.create_session("s1", "test", "proj", "/tmp", &env, Utc::now()).await.unwrap();
        for (i, success) in [true, false, true].into_iter().enumerate() {
            store
                .store_command(&CommandRecord {
                    id: format!("c{i}"),
                    session_id: "s1".into(),
                    project_id: "proj".into(),
                    command: "echo".into(),
                    output: String::new(),
                    error_output: String::new(),
                    success,
                    exit_code: if success { 0 } else { 1 },
                    duration_ms: 1,
                    working_dir: "/tmp".into(),
                    timestamp: Utc::now(),
                    tags: vec![],
                })
                .await
                .unwrap();
        }

        let filter = CommandFilter {
            success: Some(true),
            ..Default::default()
        };
        let rows = store.search_commands(&filter, 100).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_excess_commands_keeps_newest_n() {
        let (store, _dir) = store().await;
        let env = std::collections::HashMap::new();
        store.create_session("s1", "test", "proj", "/tmp", &env, Utc::now()).await.unwrap();
        for i in 0..5 {
            store
                .store_command(&CommandRecord {
                    id: format!("c{i}"),
                    session_id: "s1".into(),
                    project_id: "proj".into(),
                    command: "echo".into(),
                    output: String::new(),
                    error_output: String::new(),
                    success: true,
                    exit_code: 0,
                    duration_ms: 1,
                    working_dir: "/tmp".into(),
                    timestamp: Utc::now(),
                    tags: vec![],
                })
                .await
                .unwrap();
        }
        let deleted = store.cleanup_excess_commands(2).await.unwrap();
        assert_eq!(deleted, 3);
        let remaining = store.search_commands(&CommandFilter::default(), 100).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn get_sessions_with_stats_aggregates_commands() {
        let (store, _dir) = store().await;
        let env = std::collections::HashMap::new();
        store.create_session("s1", "test", "proj", "/tmp", &env, Utc::now()).await.unwrap();
        store
            .store_command(&CommandRecord {
                id: "c1".into(),
                session_id: "s1".into(),
                project_id: "proj".into(),
                command: "echo".into(),
                output: String::new(),
                error_output: String::new(),
                success: true,
                exit_code: 0,
                duration_ms: 42,
                working_dir: "/tmp".into(),
                timestamp: Utc::now(),
                tags: vec![],
            })
            .await
            .unwrap();

        let stats = store.get_sessions_with_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].command_count, 1);
        assert_eq!(stats[0].success_count, 1);
        assert_eq!(stats[0].total_duration_ms, 42);
    }
}
