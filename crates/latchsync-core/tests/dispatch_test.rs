//! Dispatcher behavior: single-flight, coalescing, retry policy, and
//! connectivity-driven deferral.
#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use latchsync_core::{
    DispatchEvent, EffectError, EntityId, ErrorKind, KvCache, OperationKey, OperationKind,
    SubmitOutcome, SyncError,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_test::assert_ready_ok;

use common::{MockExecutor, Step, offline_session, online_session};

const KEY: &str = "lock:hub-1";

fn key() -> OperationKey {
    OperationKey::from(KEY)
}

// ── Single-flight ───────────────────────────────────────────────────

#[tokio::test]
async fn repeated_taps_run_one_effect_with_last_payload() {
    let exec = MockExecutor::new();
    let (session, _) = online_session(exec.clone()).await;

    let (a, b, c) = tokio::join!(
        session.submit(KEY, OperationKind::Unlock, json!({ "state": "unlocked" })),
        session.submit(KEY, OperationKind::Lock, json!({ "state": "locked" })),
        session.submit(KEY, OperationKind::Lock, json!({ "state": "locked", "via": "widget" })),
    );

    let calls = exec.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, OperationKind::Lock);
    assert_eq!(calls[0].payload, json!({ "state": "locked", "via": "widget" }));

    for outcome in [a, b, c] {
        assert!(matches!(outcome.unwrap(), SubmitOutcome::Succeeded(_)));
    }
    assert_eq!(session.dispatcher().pending_count(), 0);
}

#[tokio::test]
async fn submission_during_flight_reruns_with_newest_intent() {
    let exec = MockExecutor::gated();
    let (session, _) = online_session(exec.clone()).await;

    let first = tokio::spawn({
        let session = session.clone();
        async move { session.submit(KEY, OperationKind::Unlock, json!({ "state": "unlocked" })).await }
    });
    exec.wait_calls(1).await;

    let second = tokio::spawn({
        let session = session.clone();
        async move { session.submit(KEY, OperationKind::Lock, json!({ "state": "locked" })).await }
    });
    while session.dispatcher().operation(&key()).map(|op| op.revision) != Some(1) {
        tokio::task::yield_now().await;
    }
    // Still only the original effect in flight.
    assert_eq!(exec.calls().len(), 1);

    exec.release(2);
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first, second);

    let calls = exec.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].payload, json!({ "state": "unlocked" }));
    assert_eq!(calls[1].payload, json!({ "state": "locked" }));
    assert_eq!(calls[0].operation_id, calls[1].operation_id);

    let snapshot = session.snapshot(&EntityId::from("hub-1")).unwrap();
    assert_eq!(snapshot.field_str("state"), Some("locked"));
}

#[tokio::test]
async fn different_keys_run_concurrently() {
    let exec = MockExecutor::gated();
    let (session, _) = online_session(exec.clone()).await;

    let tasks: Vec<_> = ["lock:hub-1", "lock:hub-2", "settings:hub-1"]
        .into_iter()
        .map(|key| {
            let session = session.clone();
            tokio::spawn(async move { session.submit(key, OperationKind::Lock, json!({})).await })
        })
        .collect();

    // All three effects start before any completes.
    exec.wait_calls(3).await;
    exec.release(3);
    for task in tasks {
        assert!(matches!(task.await.unwrap().unwrap(), SubmitOutcome::Succeeded(_)));
    }
}

// ── Failure policy ──────────────────────────────────────────────────

#[tokio::test]
async fn policy_rejection_is_terminal_and_surfaced() {
    let exec = MockExecutor::new();
    exec.script([Step::Fail(EffectError::rejected(
        "permission_denied",
        "guest key expired",
    ))]);
    let (session, cache) = online_session(exec.clone()).await;

    let outcome = session
        .submit(KEY, OperationKind::Unlatch, json!({}))
        .await
        .unwrap();
    let error = match outcome {
        SubmitOutcome::Failed(error) => error,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(error.kind, ErrorKind::PolicyRejection);
    assert_eq!(error.code.as_deref(), Some("permission_denied"));

    assert_eq!(exec.calls().len(), 1);
    let progress = session.read_progress(&key());
    assert!(!progress.loading);
    assert_eq!(progress.error, Some(error));
    assert_eq!(session.dispatcher().pending_count(), 0);
    assert!(cache.list_keys("queue/").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_backoff_then_succeed() {
    let exec = MockExecutor::new();
    exec.script([
        Step::Fail(EffectError::transport("connection reset")),
        Step::Hang,
    ]);
    let (session, _) = online_session(exec.clone()).await;
    let mut events = session.dispatcher().subscribe_events();

    let outcome = session
        .submit(KEY, OperationKind::Lock, json!({ "state": "locked" }))
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Succeeded(_)));

    let attempts: Vec<u32> = exec.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2]);

    let mut retries = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DispatchEvent::Retrying { attempt, delay, .. } = event {
            retries.push((attempt, delay));
        }
    }
    assert_eq!(retries.len(), 2);
    // Second delay is roughly double the first.
    assert!(retries[0].1 >= Duration::from_millis(75));
    assert!(retries[1].1 > retries[0].1);

    let progress = session.read_progress(&key());
    assert!(!progress.loading);
    assert!(progress.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn progress_stays_loading_without_error_while_retrying() {
    let exec = MockExecutor::new();
    exec.script([Step::Fail(EffectError::transport("offline"))]);
    let (session, _) = online_session(exec.clone()).await;
    let mut events = session.dispatcher().subscribe_events();

    let submit = tokio::spawn({
        let session = session.clone();
        async move { session.submit(KEY, OperationKind::Lock, json!({})).await }
    });

    loop {
        if let DispatchEvent::Retrying { .. } = events.recv().await.unwrap() {
            break;
        }
    }
    let progress = session.read_progress(&key());
    assert!(progress.loading);
    assert!(progress.error.is_none());
    assert_eq!(progress.message.as_deref(), Some("retrying"));

    assert!(matches!(submit.await.unwrap().unwrap(), SubmitOutcome::Succeeded(_)));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_operation() {
    let exec = MockExecutor::new();
    exec.script([
        Step::Fail(EffectError::transport("unreachable")),
        Step::Fail(EffectError::transport("unreachable")),
        Step::Fail(EffectError::transport("unreachable")),
    ]);
    let (session, cache) = online_session(exec.clone()).await;

    let outcome = session
        .submit(KEY, OperationKind::Lock, json!({}))
        .await
        .unwrap();
    let error = match outcome {
        SubmitOutcome::Failed(error) => error,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(error.kind, ErrorKind::RetriesExhausted);
    assert_eq!(exec.calls().len(), 3);
    assert_eq!(session.read_progress(&key()).error, Some(error));
    assert!(cache.get("queue/lock:hub-1").await.unwrap().is_none());
}

// ── Connectivity ────────────────────────────────────────────────────

#[tokio::test]
async fn offline_submit_returns_immediately() {
    let exec = MockExecutor::new();
    let (session, cache) = offline_session(exec.clone()).await;

    let mut submit = tokio_test::task::spawn(session.submit(
        KEY,
        OperationKind::Lock,
        json!({ "state": "locked" }),
    ));
    let outcome = assert_ready_ok!(submit.poll());
    assert_eq!(outcome, SubmitOutcome::Deferred);

    let progress = session.read_progress(&key());
    assert!(!progress.loading);
    assert_eq!(progress.message.as_deref(), Some("queued"));
    assert!(progress.error.is_none());

    assert!(exec.calls().is_empty());
    assert!(cache.get("queue/lock:hub-1").await.unwrap().is_some());
}

#[tokio::test]
async fn reconnect_drains_queue_oldest_first() {
    let exec = MockExecutor::new();
    let (session, _) = offline_session(exec.clone()).await;

    for key in ["lock:hub-2", "lock:hub-1", "settings:hub-1"] {
        let outcome = session
            .submit(key, OperationKind::Lock, json!({}))
            .await
            .unwrap();
        assert!(outcome.is_deferred());
    }
    assert_eq!(session.dispatcher().pending_count(), 3);

    session.connectivity().report(true);
    session.wait_idle().await;

    let order: Vec<String> = exec.calls().iter().map(|c| c.key.to_string()).collect();
    assert_eq!(order, vec!["lock:hub-2", "lock:hub-1", "settings:hub-1"]);
}

#[tokio::test]
async fn dropping_offline_before_start_defers_waiting_callers() {
    let exec = MockExecutor::new();
    let (session, _) = online_session(exec.clone()).await;
    let mut events = session.dispatcher().subscribe_events();

    let (outcome, ()) = tokio::join!(
        session.submit(KEY, OperationKind::Lock, json!({})),
        async {
            session.connectivity().report(false);
        },
    );
    assert_eq!(outcome.unwrap(), SubmitOutcome::Deferred);
    assert!(exec.calls().is_empty());
    assert_eq!(session.dispatcher().pending_count(), 1);
    assert_eq!(
        events.recv().await.unwrap(),
        DispatchEvent::Deferred { key: key() }
    );

    session.connectivity().report(true);
    session.wait_idle().await;
    assert_eq!(exec.calls().len(), 1);
}

#[tokio::test]
async fn submissions_after_shutdown_are_rejected() {
    let (session, _) = online_session(MockExecutor::new()).await;
    session.shutdown().await;
    let result = session.submit(KEY, OperationKind::Lock, json!({})).await;
    assert!(matches!(result, Err(SyncError::SessionClosed)));
}
