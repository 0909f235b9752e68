//! In-memory reference implementations of the job store and job queue.
//!
//! The store's claim primitive gives the same exclusivity guarantee a
//! database compare-and-swap would; the queue redelivers anything popped
//! but never acked.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};

use runbox_core::JobId;
use runbox_core::error::{Error, Result, StoreError, StoreResult};
use runbox_core::job::{JobDescriptor, JobRecord, JobResult, JobStatus};
use runbox_core::queue::{Delivery, JobQueue};
use runbox_core::store::JobStore;

/// Job store backed by a map. Suitable for tests and single-process
/// deployments; the trait is the seam for anything durable.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, descriptor: JobDescriptor) -> StoreResult<()> {
        let mut map = self.inner.write().await;
        let id = descriptor.id;
        if map.contains_key(&id) {
            return Err(StoreError::Duplicate(id.to_string()));
        }
        map.insert(id, JobRecord::new(descriptor));
        Ok(())
    }

    async fn get(&self, id: &JobId) -> StoreResult<JobRecord> {
        let map = self.inner.read().await;
        map.get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn try_claim(&self, id: &JobId, worker: &str) -> StoreResult<bool> {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.status != JobStatus::Pending || record.claimed_by.is_some() {
            return Ok(false);
        }
        record.claimed_by = Some(worker.to_string());
        record.claimed_at = Some(Utc::now());
        record.attempt_count += 1;
        Ok(true)
    }

    async fn transition(
        &self,
        id: &JobId,
        status: JobStatus,
        result: Option<JobResult>,
    ) -> StoreResult<()> {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        // Idempotent finalize: repeating the same terminal write is a no-op.
        if status.is_terminal() && record.status == status && record.result == result {
            return Ok(());
        }
        if !record.status.can_transition(status) {
            return Err(StoreError::InvalidTransition {
                from: record.status,
                to: status,
            });
        }

        record.status = status;
        if status == JobStatus::Checkout && record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            record.finished_at = Some(Utc::now());
            record.result = result;
        }
        Ok(())
    }

    async fn request_cancel(&self, id: &JobId) -> StoreResult<bool> {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.cancel_requested = true;
        Ok(true)
    }

    async fn cancel_requested(&self, id: &JobId) -> StoreResult<bool> {
        let map = self.inner.read().await;
        map.get(id)
            .map(|r| r.cancel_requested)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn set_container(&self, id: &JobId, container_id: &str) -> StoreResult<()> {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.container_id = Some(container_id.to_string());
        Ok(())
    }

    async fn clear_container(&self, id: &JobId) -> StoreResult<()> {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.container_id = None;
        Ok(())
    }

    async fn stale_claims(
        &self,
        now: DateTime<Utc>,
        margin: Duration,
    ) -> StoreResult<Vec<JobRecord>> {
        let map = self.inner.read().await;
        let stale = map
            .values()
            .filter(|record| {
                if record.status.is_terminal() {
                    return false;
                }
                let Some(claimed_at) = record.claimed_at else {
                    return false;
                };
                let Ok(span) =
                    chrono::Duration::from_std(record.descriptor.max_duration + margin)
                else {
                    return false;
                };
                claimed_at
                    .checked_add_signed(span)
                    .map(|deadline| deadline < now)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(stale)
    }

    async fn reset_for_retry(&self, id: &JobId) -> StoreResult<()> {
        let mut map = self.inner.write().await;
        let record = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        // Only crash-interrupted attempts and retry-eligible outcomes may be
        // reopened; completed outcomes stay immutable.
        if record.status.is_terminal() && record.status != JobStatus::Errored {
            return Err(StoreError::InvalidTransition {
                from: record.status,
                to: JobStatus::Pending,
            });
        }
        record.status = JobStatus::Pending;
        record.claimed_by = None;
        record.claimed_at = None;
        record.started_at = None;
        record.finished_at = None;
        record.container_id = None;
        record.result = None;
        Ok(())
    }
}

struct QueueState {
    ready: VecDeque<JobDescriptor>,
    in_flight: HashMap<u64, JobDescriptor>,
    next_tag: u64,
}

/// Job queue backed by a VecDeque. Deliveries stay in flight until acked.
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
                next_tag: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Number of descriptors waiting to be popped.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Number of popped-but-unacked deliveries.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, descriptor: JobDescriptor) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ready.push_back(descriptor);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self) -> Result<Delivery> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(descriptor) = state.ready.pop_front() {
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    state.in_flight.insert(tag, descriptor.clone());
                    return Ok(Delivery { descriptor, tag });
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or_else(|| Error::Internal(format!("unknown delivery tag {}", delivery.tag)))
    }
}
