// ── Per-key worker ──
//
// One task per operation key with work to do. The loop claims the slot,
// runs the effect under the configured timeout, and settles the outcome.
// It exits when the slot is gone, owned by another worker, deferred by a
// connectivity drop, or the dispatcher is shutting down.

use std::mem;

use tracing::{debug, info, warn};

use super::{DispatchEvent, Dispatcher, SubmitOutcome};
use crate::effect::{Confirmation, EffectRequest};
use crate::error::{EffectError, SyncError};
use crate::model::{Operation, OperationKey, OperationStatus};

impl Dispatcher {
    pub(super) async fn run_key(self, key: OperationKey, worker_id: u64) {
        while let Some(op) = self.claim(&key, worker_id) {
            debug!(key = %key, id = %op.id, attempt = op.attempt, revision = op.revision, "effect started");
            self.emit(DispatchEvent::Started {
                key: key.clone(),
                attempt: op.attempt,
            });
            self.inner.progress.begin(&key);

            let request = EffectRequest {
                operation_id: op.id,
                key: op.key.clone(),
                kind: op.kind,
                payload: op.payload.clone(),
                attempt: op.attempt,
            };

            match self.execute(&request).await {
                Ok(confirmation) => self.on_success(&op, confirmation).await,
                Err(err) if err.is_transient() => self.on_transient(&op, err).await,
                Err(err) => {
                    let error = SyncError::from_effect(op.key.as_str(), err);
                    self.on_terminal(&op, &error).await;
                }
            }
        }
        debug!(key = %key, worker = worker_id, "worker exited");
    }

    /// Move the slot to `InFlight` if this worker still owns it and the
    /// dispatcher may start effects. Otherwise release ownership.
    fn claim(&self, key: &OperationKey, worker_id: u64) -> Option<Operation> {
        let mut slot = self.inner.slots.get_mut(key)?;
        if slot.worker != Some(worker_id) {
            return None;
        }

        if self.inner.cancel.is_cancelled() {
            slot.worker = None;
            // Dropping the senders resolves waiting submitters with `SessionClosed`.
            slot.waiters.clear();
            return None;
        }

        if !self.inner.connectivity.is_online() {
            slot.worker = None;
            slot.op.status = OperationStatus::Pending;
            let waiters = mem::take(&mut slot.waiters);
            drop(slot);

            self.inner.progress.queued(key);
            self.emit(DispatchEvent::Deferred { key: key.clone() });
            info!(key = %key, "connectivity lost; operation deferred");
            for waiter in waiters {
                let _ = waiter.send(SubmitOutcome::Deferred);
            }
            return None;
        }

        slot.op.status = OperationStatus::InFlight;
        Some(slot.op.clone())
    }

    async fn execute(&self, request: &EffectRequest) -> Result<Confirmation, EffectError> {
        let timeout = self.inner.config.effect_timeout;
        match tokio::time::timeout(timeout, self.inner.executor.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(EffectError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn on_success(&self, op: &Operation, confirmation: Confirmation) {
        self.inner.reconciler.observe_confirmation(&confirmation).await;

        let removed = self
            .inner
            .slots
            .remove_if(&op.key, |_, slot| slot.op.revision == op.revision);
        let Some((_, slot)) = removed else {
            self.requeue_superseded(&op.key).await;
            return;
        };

        if let Err(e) = self.sync_entry(&op.key).await {
            // The orphaned entry is replayed or pruned on the next resume.
            warn!(key = %op.key, error = %e, "could not remove completed operation from cache");
        }

        info!(key = %op.key, attempt = op.attempt, "operation succeeded");
        self.inner
            .progress
            .succeed(&op.key, confirmation.summary.clone());
        self.emit(DispatchEvent::Succeeded {
            key: op.key.clone(),
        });
        for waiter in slot.waiters {
            let _ = waiter.send(SubmitOutcome::Succeeded(confirmation.clone()));
        }
        self.publish_pending();
    }

    async fn on_transient(&self, op: &Operation, err: EffectError) {
        let attempts = op.attempt + 1;
        if !self.inner.config.retry.allows_retry(attempts) {
            let error = SyncError::RetriesExhausted {
                key: op.key.to_string(),
                attempts,
                last_error: err.to_string(),
            };
            self.on_terminal(op, &error).await;
            return;
        }

        let superseded = {
            let Some(mut slot) = self.inner.slots.get_mut(&op.key) else {
                return;
            };
            let superseded = slot.op.revision != op.revision;
            // A newer intent starts its own attempt count.
            slot.op.attempt = if superseded { 0 } else { attempts };
            slot.op.status = OperationStatus::Pending;
            slot.durable = false;
            superseded
        };

        if let Err(e) = self.sync_entry(&op.key).await {
            warn!(key = %op.key, error = %e, "could not persist retry state");
        }
        if superseded {
            debug!(key = %op.key, "transient failure on superseded intent; rerunning");
            return;
        }

        let delay = self.inner.config.retry.delay_for(attempts);
        warn!(key = %op.key, attempt = attempts, ?delay, error = %err, "transient effect failure; retrying");
        self.inner.progress.retrying(&op.key, attempts);
        self.emit(DispatchEvent::Retrying {
            key: op.key.clone(),
            attempt: attempts,
            delay,
        });

        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }

    async fn on_terminal(&self, op: &Operation, error: &SyncError) {
        let removed = self
            .inner
            .slots
            .remove_if(&op.key, |_, slot| slot.op.revision == op.revision);
        let Some((_, slot)) = removed else {
            warn!(key = %op.key, error = %error, "failure superseded by newer intent; rerunning");
            self.requeue_superseded(&op.key).await;
            return;
        };

        if let Err(e) = self.sync_entry(&op.key).await {
            warn!(key = %op.key, error = %e, "could not remove failed operation from cache");
        }

        let descriptor = error.descriptor();
        warn!(key = %op.key, error = %error, "operation failed");
        self.inner.progress.fail(&op.key, descriptor.clone());
        self.emit(DispatchEvent::Failed {
            key: op.key.clone(),
            error: descriptor.clone(),
        });
        for waiter in slot.waiters {
            let _ = waiter.send(SubmitOutcome::Failed(descriptor.clone()));
        }
        self.publish_pending();
    }

    /// A newer intent was coalesced while the effect ran: put the entry
    /// back to `Pending` with a fresh attempt count for the next claim.
    async fn requeue_superseded(&self, key: &OperationKey) {
        {
            let Some(mut slot) = self.inner.slots.get_mut(key) else {
                return;
            };
            slot.op.status = OperationStatus::Pending;
            slot.op.attempt = 0;
            slot.durable = false;
        }
        debug!(key = %key, "newer intent queued behind completed effect");
        if let Err(e) = self.sync_entry(key).await {
            warn!(key = %key, error = %e, "could not persist superseding intent");
        }
    }
}
