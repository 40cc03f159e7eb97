//! Catch-up driver for projection handlers.
//!
//! The worker thread wakes on bus traffic for its instance (low latency) and
//! on a timer tick (safety net for missed publications), and runs the
//! handler's `catch_up` on every wakeup. The handler pulls ordered events
//! from the store itself, so the bus being lossy or reordering is harmless.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use keyforge_core::InstanceId;
use keyforge_events::{EventBus, InstanceScoped, Subscription};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Generic projection worker loop.
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn a worker thread driving `catch_up` for one instance.
    ///
    /// - Messages for other instances are ignored (instance pinning)
    /// - `catch_up` must be idempotent; it runs once on start, then on every
    ///   wakeup
    /// - A `catch_up` error stops the worker (stop-and-alert): a projection
    ///   that cannot fold its stream must not keep serving a stale table as
    ///   if it were healthy
    pub fn spawn<M, B, F, E>(
        name: &'static str,
        bus: B,
        instance_id: InstanceId,
        mut catch_up: F,
    ) -> WorkerHandle
    where
        M: InstanceScoped + Send + 'static,
        B: EventBus<M> + Send + Sync + 'static,
        F: FnMut() -> Result<u64, E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, instance_id, &mut catch_up))
            .expect("failed to spawn projection worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn worker_loop<M, F, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    instance_id: InstanceId,
    catch_up: &mut F,
) where
    M: InstanceScoped,
    F: FnMut() -> Result<u64, E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    // Start by catching up on whatever happened before the subscription.
    if let Err(err) = catch_up() {
        error!(worker = name, error = ?err, "projection catch-up failed, stopping worker");
        return;
    }

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let woke = match sub.recv_timeout(tick) {
            Ok(msg) => {
                if msg.instance_id() != instance_id {
                    // Instance-safe: ignore other instances.
                    continue;
                }
                // Drain any backlog; one catch-up covers all of it.
                while sub.try_recv().is_ok() {}
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => true,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!(worker = name, "event bus disconnected, stopping worker");
                break;
            }
        };

        if woke {
            if let Err(err) = catch_up() {
                error!(worker = name, error = ?err, "projection catch-up failed, stopping worker");
                break;
            }
        }
    }
}
