//! Test doubles shared by the integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use latchsync_core::{
    CacheError, Confirmation, EffectError, EffectExecutor, EffectRequest, Fields, KvCache,
    MemoryCache, RetryPolicy, Session, SyncConfig, Timestamp,
};
use tokio::sync::{Semaphore, watch};

// ── Scripted effect executor ────────────────────────────────────────

/// What the next effect invocation does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Acknowledge with the payload as fields and an auto-incremented timestamp.
    Confirm,
    /// Acknowledge at a fixed timestamp.
    ConfirmAt(u64),
    Fail(EffectError),
    /// Never complete; exercises the dispatcher's timeout.
    Hang,
}

/// Records every request and replays a script of outcomes. Once the
/// script runs out every call confirms.
pub struct MockExecutor {
    calls: Mutex<Vec<EffectRequest>>,
    call_count: watch::Sender<usize>,
    script: Mutex<VecDeque<Step>>,
    gate: Option<Semaphore>,
    next_ts: AtomicU64,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Every call blocks until [`release`](Self::release) grants a permit.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self::build(Some(Semaphore::new(0))))
    }

    fn build(gate: Option<Semaphore>) -> Self {
        let (call_count, _) = watch::channel(0);
        Self {
            calls: Mutex::new(Vec::new()),
            call_count,
            script: Mutex::new(VecDeque::new()),
            gate,
            next_ts: AtomicU64::new(100),
        }
    }

    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    pub fn release(&self, permits: usize) {
        self.gate.as_ref().unwrap().add_permits(permits);
    }

    pub fn calls(&self) -> Vec<EffectRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Wait until at least `n` invocations have started.
    pub async fn wait_calls(&self, n: usize) {
        let mut rx = self.call_count.subscribe();
        rx.wait_for(|count| *count >= n).await.unwrap();
    }
}

#[async_trait]
impl EffectExecutor for MockExecutor {
    async fn execute(&self, request: &EffectRequest) -> Result<Confirmation, EffectError> {
        self.calls.lock().unwrap().push(request.clone());
        self.call_count.send_modify(|n| *n += 1);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Confirm);
        let timestamp = match step {
            Step::Confirm => self.next_ts.fetch_add(1, Ordering::SeqCst),
            Step::ConfirmAt(ts) => ts,
            Step::Fail(err) => return Err(err),
            Step::Hang => std::future::pending().await,
        };
        Ok(confirmation_for(request, timestamp))
    }
}

fn confirmation_for(request: &EffectRequest, timestamp: u64) -> Confirmation {
    let fields: Fields = request
        .payload
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    Confirmation {
        entity_id: request.key.entity().unwrap(),
        fields,
        timestamp: Timestamp::from_millis(timestamp),
        summary: Some(format!("{} done", request.kind)),
    }
}

// ── Fault-injecting cache ───────────────────────────────────────────

/// In-memory cache whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyCache {
    inner: MemoryCache,
    failing: AtomicBool,
}

impl FlakyCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Backend {
                message: "disk full".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvCache for FlakyCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.inner.list_keys(prefix).await
    }
}

// ── Session helpers ─────────────────────────────────────────────────

pub fn test_config() -> SyncConfig {
    SyncConfig {
        effect_timeout: Duration::from_secs(1),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        persist_snapshots: true,
        event_channel_size: 64,
    }
}

/// A started session over `cache`, optionally already online.
pub async fn session_with(
    cache: Arc<dyn KvCache>,
    executor: Arc<MockExecutor>,
    online: bool,
) -> Session {
    let session = Session::new(test_config(), cache, executor);
    if online {
        session.connectivity().report(true);
    }
    session.start().await.unwrap();
    session
}

pub async fn online_session(executor: Arc<MockExecutor>) -> (Session, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::new());
    let session = session_with(cache.clone(), executor, true).await;
    (session, cache)
}

pub async fn offline_session(executor: Arc<MockExecutor>) -> (Session, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::new());
    let session = session_with(cache.clone(), executor, false).await;
    (session, cache)
}
