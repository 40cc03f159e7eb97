//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the **distribution** layer for events after they have been
//! durably appended to the event store. It is intentionally lightweight:
//!
//! - **Transport-agnostic**: in-memory channels here, brokers elsewhere
//! - **At-least-once**: messages may be delivered more than once; consumers
//!   must be idempotent (projection handlers re-check their watermarks)
//! - **No persistence**: the event store is the source of truth; a consumer
//!   that misses a message catches up from the store by position
//!
//! Projection workers treat bus traffic as a *wakeup signal* and always pull
//! authoritative, ordered events from the store. That keeps ordering and
//! watermark ownership in one place even if the bus reorders or drops.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription receives a copy of every message published to the bus
/// (broadcast semantics). Designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// Publication happens strictly **after** the durable append; failures are
/// surfaced to the caller, which may republish safely (events are already
/// persisted, consumers are idempotent).
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
