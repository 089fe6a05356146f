//! Integration tests for the History Store (C5) beyond history.rs's own
//! `#[cfg(test)]` module: operations that only make sense across multiple
//! sessions/rows at once, or that exercise the store the way `Manager`
//! actually drives it (activity updates, project-scoped deletes).

use std::collections::HashMap;

use chrono::Utc;
use terminal_mcp::history::{CommandFilter, CommandRecord, HistoryStore};

async fn store() -> (HistoryStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::new(dir.path().join("history.db"), 5, 5000).await.unwrap();
    (store, dir)
}

fn command(id: &str, session_id: &str) -> CommandRecord {
    CommandRecord {
        id: id.into(),
        session_id: session_id.into(),
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
    }
}

#[tokio::test]
async fn update_session_activity_bumps_last_used_at_and_command_count() {
    let (store, _dir) = store().await;
    let env = HashMap::new();
    let created_at = Utc::now();
    store.create_session("s1", "main", "proj", "/tmp", &env, created_at).await.unwrap();

    let later = created_at + chrono::Duration::seconds(5);
    store.update_session_activity("s1", "/tmp/sub", later).await.unwrap();

    let row = store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(row.working_dir, "/tmp/sub");
    assert_eq!(row.command_count, 1);
    assert!(row.last_used_at > created_at);
}

#[tokio::test]
async fn deactivate_session_flips_is_active_without_deleting_history() {
    let (store, _dir) = store().await;
    let env = HashMap::new();
    store.create_session("s1", "main", "proj", "/tmp", &env, Utc::now()).await.unwrap();
    store.store_command(&command("c1", "s1")).await.unwrap();

    store.deactivate_session("s1").await.unwrap();

    let row = store.get_session("s1").await.unwrap().unwrap();
    assert!(!row.is_active);
    let rows = store.search_commands(&CommandFilter { session_id: Some("s1".into()), ..Default::default() }, 10).await.unwrap();
    assert_eq!(rows.len(), 1, "deactivation must not cascade to commands");
}

#[tokio::test]
async fn delete_project_sessions_cascades_commands_for_every_matched_session() {
    let (store, _dir) = store().await;
    let env = HashMap::new();
    store.create_session("s1", "a", "proj", "/tmp", &env, Utc::now()).await.unwrap();
    store.create_session("s2", "b", "proj", "/tmp", &env, Utc::now()).await.unwrap();
    store.create_session("s3", "c", "other-proj", "/tmp", &env, Utc::now()).await.unwrap();
    store.store_command(&command("c1", "s1")).await.unwrap();
    store.store_command(&command("c2", "s2")).await.unwrap();
    store.store_command(&command("c3", "s3")).await.unwrap();

    let deleted = store.delete_project_sessions("proj").await.unwrap();
    assert_eq!(deleted, 2);

    assert!(store.get_session("s1").await.unwrap().is_none());
    assert!(store.get_session("s3").await.unwrap().is_some());
    let remaining = store.search_commands(&CommandFilter::default(), 100).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].session_id, "s3");
}

#[tokio::test]
async fn search_commands_combines_text_and_tag_filters() {
    let (store, _dir) = store().await;
    let env = HashMap::new();
    store.create_session("s1", "main", "proj", "/tmp", &env, Utc::now()).await.unwrap();

    let mut build = command("c1", "s1");
    build.command = "cargo build --release".into();
    build.tags = vec!["build".into()];
    store.store_command(&build).await.unwrap();

    let mut test_cmd = command("c2", "s1");
    test_cmd.command = "cargo test".into();
    test_cmd.tags = vec!["test".into()];
    store.store_command(&test_cmd).await.unwrap();

    let filter = CommandFilter {
        command_like: Some("cargo".into()),
        tags_any: Some(vec!["build".into()]),
        ..Default::default()
    };
    let rows = store.search_commands(&filter, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "c1");
}

#[tokio::test]
async fn list_sessions_orders_by_last_used_at_descending_and_respects_project_filter() {
    let (store, _dir) = store().await;
    let env = HashMap::new();
    let t0 = Utc::now() - chrono::Duration::seconds(10);
    store.create_session("older", "a", "proj", "/tmp", &env, t0).await.unwrap();
    store.create_session("newer", "b", "proj", "/tmp", &env, Utc::now()).await.unwrap();
    store.create_session("unrelated", "c", "other-proj", "/tmp", &env, Utc::now()).await.unwrap();

    let all = store.list_sessions(None).await.unwrap();
    assert_eq!(all.len(), 3);

    let scoped = store.list_sessions(Some("proj")).await.unwrap();
    assert_eq!(scoped.len(), 2);
    assert_eq!(scoped[0].id, "newer", "newest last_used_at should sort first");
}

#[tokio::test]
async fn cleanup_old_stream_chunks_is_a_no_op_on_an_empty_table() {
    let (store, _dir) = store().await;
    let deleted = store.cleanup_old_stream_chunks(chrono::Duration::hours(24)).await.unwrap();
    assert_eq!(deleted, 0);
}
