//! Integration tests for the engine over a shared in-memory store.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;

use coalesce_sync::{Differ, JsonDiffer, LocalSave, SyncStatus};

use common::{memory_factory, settle, spawn_json_engine, wait_until};

fn make_log<T: Send + 'static>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn has_subsequence<T: PartialEq>(log: &[T], pattern: &[T]) -> bool {
    let mut needle = pattern.iter();
    let mut next = needle.next();
    for item in log {
        if let Some(expected) = next {
            if item == expected {
                next = needle.next();
            }
        }
    }
    next.is_none()
}

// ============================================================================
// Single client
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_client_two_edits_form_a_chain() {
    let factory = memory_factory();
    let (engine, store) = spawn_json_engine(&factory, "doc", "user-1", "client-1");

    let first = engine
        .update_doc(json!({}), b"init".to_vec(), None)
        .unwrap()
        .expect("first edit creates a commit");
    let second = engine
        .update_doc(json!({"hello": "world"}), b"add".to_vec(), None)
        .unwrap()
        .expect("second edit creates a commit");

    let mut flushed = 0;
    for _ in 0..100 {
        flushed = store
            .get_local_commits_event(None)
            .await
            .unwrap()
            .commits
            .len();
        if flushed == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(flushed, 2, "both commits should flush to the store");

    let event = store.get_local_commits_event(None).await.unwrap();
    assert_eq!(event.commits.len(), 2);
    assert_eq!(event.commits[0].ref_, first);
    assert_eq!(event.commits[1].ref_, second);
    assert_eq!(event.commits[0].base_ref, None);
    assert_eq!(event.commits[1].base_ref.as_deref(), Some(first.as_str()));

    // Content addressing holds for what was persisted.
    let differ = JsonDiffer::new();
    for commit in &event.commits {
        let recomputed = differ.compute_ref(
            commit.base_ref.as_deref(),
            commit.merge_ref.as_deref(),
            commit.merge_base_ref.as_deref(),
            commit.delta.as_deref(),
            &commit.edit_metadata,
        );
        assert_eq!(recomputed, commit.ref_);
    }

    assert_eq!(engine.doc(), Some(json!({"hello": "world"})));
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_document_creates_no_commit() {
    let factory = memory_factory();
    let (engine, store) = spawn_json_engine(&factory, "doc", "user-1", "client-1");

    engine
        .update_doc(json!({"n": 1}), b"init".to_vec(), None)
        .unwrap();
    let second = engine
        .update_doc(json!({"n": 1}), b"same".to_vec(), None)
        .unwrap();
    assert!(second.is_none(), "identical document should not commit");

    settle().await;
    let event = store.get_local_commits_event(None).await.unwrap();
    assert_eq!(event.commits.len(), 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_commit_doc_recomputes_older_states() {
    let factory = memory_factory();
    let (engine, _store) = spawn_json_engine(&factory, "doc", "user-1", "client-1");

    let first = engine
        .update_doc(json!({"v": 1}), b"one".to_vec(), None)
        .unwrap()
        .unwrap();
    engine
        .update_doc(json!({"v": 2}), b"two".to_vec(), None)
        .unwrap()
        .unwrap();

    let older = engine.get_commit_doc(&first).unwrap();
    assert_eq!(older.doc, json!({"v": 1}));
    assert_eq!(older.metadata, b"one".to_vec());
    assert_eq!(engine.doc(), Some(json!({"v": 2})));
    engine.shutdown().await.unwrap();
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn doc_subscriber_fires_immediately_then_on_change() {
    let factory = memory_factory();
    let (engine, _store) = spawn_json_engine(&factory, "doc", "user-1", "client-1");

    let calls = make_log::<Option<serde_json::Value>>();
    let calls_clone = Arc::clone(&calls);
    let _unsub = engine.subscribe_doc(move |doc| {
        calls_clone.lock().unwrap().push(doc.cloned());
    });

    {
        let log = calls.lock().unwrap();
        assert_eq!(log.len(), 1, "fires immediately on subscribe");
        assert!(log[0].is_none());
    }

    engine
        .update_doc(json!({"x": 1}), b"edit".to_vec(), None)
        .unwrap();

    let log = calls.lock().unwrap();
    assert_eq!(log.len(), 2, "synchronous notification on update_doc");
    assert_eq!(log[1], Some(json!({"x": 1})));
    drop(log);
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribed_doc_callback_stops_firing() {
    let factory = memory_factory();
    let (engine, _store) = spawn_json_engine(&factory, "doc", "user-1", "client-1");

    let calls = make_log::<Option<serde_json::Value>>();
    let calls_clone = Arc::clone(&calls);
    let unsub = engine.subscribe_doc(move |doc| {
        calls_clone.lock().unwrap().push(doc.cloned());
    });

    unsub();
    engine
        .update_doc(json!({"x": 1}), b"edit".to_vec(), None)
        .unwrap();

    assert_eq!(calls.lock().unwrap().len(), 1, "only the immediate call");
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_save_traces_pending_saving_ready() {
    let factory = memory_factory();
    let (engine, _store) = spawn_json_engine(&factory, "doc", "user-1", "client-1");

    let statuses = make_log::<SyncStatus>();
    let statuses_clone = Arc::clone(&statuses);
    let _unsub = engine.subscribe_sync_status(move |s| {
        statuses_clone.lock().unwrap().push(*s);
    });

    engine
        .update_doc(json!({"x": 1}), b"edit".to_vec(), None)
        .unwrap();

    assert!(
        wait_until(1_000, || {
            let log = statuses.lock().unwrap();
            let saves: Vec<LocalSave> = log.iter().map(|s| s.local_save).collect();
            has_subsequence(
                &saves,
                &[LocalSave::Pending, LocalSave::Saving, LocalSave::Ready],
            )
        })
        .await,
        "local save should trace pending -> saving -> ready"
    );
    engine.shutdown().await.unwrap();
}

// ============================================================================
// Two clients, one store
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_edit_arrives_without_creating_new_commits() {
    let factory = memory_factory();
    let (engine_a, store_a) = spawn_json_engine(&factory, "doc", "user-a", "client-a");
    let (engine_b, _store_b) = spawn_json_engine(&factory, "doc", "user-b", "client-b");

    engine_a
        .update_doc(json!({"hello": "world"}), b"init".to_vec(), None)
        .unwrap();

    assert!(
        wait_until(2_000, || engine_b.doc() == Some(json!({"hello": "world"}))).await,
        "peer should observe the edit"
    );

    let event = store_a.get_local_commits_event(None).await.unwrap();
    assert_eq!(event.commits.len(), 1, "no extra commit for the reader");
    assert!(event.commits.iter().all(|c| c.client_id == "client-a"));

    engine_a.shutdown().await.unwrap();
    engine_b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn roster_tracks_joins_presence_and_leaves() {
    let factory = memory_factory();
    let (engine_a, _store_a) = spawn_json_engine(&factory, "doc", "user-a", "client-a");
    let (engine_b, _store_b) = spawn_json_engine(&factory, "doc", "user-b", "client-b");

    assert!(
        wait_until(2_000, || engine_a.clients().len() == 2 && engine_b.clients().len() == 2).await,
        "both rosters should hold both clients"
    );

    engine_b.update_presence(Some(json!({"cursor": 7})));
    assert!(
        wait_until(2_000, || {
            engine_a
                .clients()
                .iter()
                .any(|c| c.client_id == "client-b" && c.presence == Some(json!({"cursor": 7})))
        })
        .await,
        "presence payload should reach the peer"
    );

    engine_b.shutdown().await.unwrap();
    assert!(
        wait_until(2_000, || {
            engine_a.clients().iter().all(|c| c.client_id != "client-b")
        })
        .await,
        "departed client should leave the roster"
    );
    engine_a.shutdown().await.unwrap();
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operations_after_shutdown_fail_fast() {
    let factory = memory_factory();
    let (engine, store) = spawn_json_engine(&factory, "doc", "user-1", "client-1");

    engine
        .update_doc(json!({"x": 1}), b"edit".to_vec(), None)
        .unwrap();
    engine.shutdown().await.unwrap();

    assert!(matches!(
        engine.update_doc(json!({"x": 2}), b"late".to_vec(), None),
        Err(coalesce_sync::SyncError::Shutdown)
    ));
    assert!(store.get_local_commits_event(None).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_flushes_pending_edits() {
    let factory = memory_factory();
    let (engine, _store) = spawn_json_engine(&factory, "doc", "user-1", "client-1");
    let (engine_b, store_b) = spawn_json_engine(&factory, "doc", "user-2", "client-2");

    engine
        .update_doc(json!({"x": 1}), b"edit".to_vec(), None)
        .unwrap();
    // Shut down immediately; the pending buffer must still land.
    engine.shutdown().await.unwrap();

    assert!(
        wait_until(2_000, || engine_b.doc() == Some(json!({"x": 1}))).await,
        "flush-on-shutdown should persist the edit"
    );
    let event = store_b.get_local_commits_event(None).await.unwrap();
    assert_eq!(event.commits.len(), 1);
    engine_b.shutdown().await.unwrap();
}
