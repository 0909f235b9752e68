//! Job queue trait.
//!
//! The broker's wire format is outside this design; the queue is specified
//! at its interface boundary only. Deliveries are redelivered until acked,
//! so a crash-interrupted job comes back and is safely reclaimed through
//! the store's claim primitive.

use async_trait::async_trait;

use crate::Result;
use crate::job::JobDescriptor;

/// One delivery of a descriptor. The tag identifies this delivery for ack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub descriptor: JobDescriptor,
    pub tag: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a descriptor.
    async fn push(&self, descriptor: JobDescriptor) -> Result<()>;

    /// Blocking pop of the next delivery, one item at a time per worker
    /// slot. Waits until work arrives.
    async fn pop(&self) -> Result<Delivery>;

    /// Acknowledge a delivery. Called only after the job has reached a
    /// durably recorded terminal state (or was dropped as a duplicate).
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}
