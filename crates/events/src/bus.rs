//! Publish/subscribe abstraction for job notifications.
//!
//! Delivery is best-effort fan-out: a notification may be dropped, duplicated
//! or coalesced. Subscribers treat each one as "something may have changed"
//! and fall back to polling for anything they missed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};

/// A subscription to a notification stream.
///
/// Each subscription receives its own copy of every message published after
/// it was created. `recv` returns `None` once the publishing side is gone.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message; `None` when the stream has closed.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Discard everything already queued, returning how many were dropped.
    ///
    /// A burst of notifications needs only one claim pass.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.receiver.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// Transport-agnostic notification bus.
///
/// Implemented in memory for tests and single-process setups, and over
/// Postgres LISTEN/NOTIFY in the infra crate.
#[async_trait]
pub trait NotificationBus<M>: Send + Sync
where
    M: Send + 'static,
{
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish(&self, message: M) -> Result<(), Self::Error>;

    async fn subscribe(&self) -> Result<Subscription<M>, Self::Error>;
}

#[async_trait]
impl<M, B> NotificationBus<M> for Arc<B>
where
    M: Send + 'static,
    B: NotificationBus<M> + ?Sized,
{
    type Error = B::Error;

    async fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message).await
    }

    async fn subscribe(&self) -> Result<Subscription<M>, Self::Error> {
        (**self).subscribe().await
    }
}
