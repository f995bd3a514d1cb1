//! Debounced event queue.
//!
//! Host change notifications arrive in noisy bursts (an added item produces
//! an Add and then several Updates). [`EventQueue::enqueue`] appends to a
//! pending list and restarts a single quiet-period timer owned by a worker
//! task. When the timer runs out the whole list is swapped out and handed to
//! a [`BatchHandler`] as one batch, in arrival order. Batches never overlap.
//!
//! # Example
//!
//! ```rust,ignore
//! let dispatcher = Arc::new(Dispatcher::new(ctx.clone()));
//! let (queue, worker) = EventQueue::start(dispatcher, Duration::from_secs(10), ctx.cancel.clone());
//! queue.enqueue(LibraryEvent::add(entity.clone()));
//! queue.enqueue(LibraryEvent::update(entity));
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use danmu_core::LibraryEvent;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Consumer of debounced batches.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// Process one batch to completion and return follow-up events to
    /// enqueue (e.g. seasons fanned out from a series update).
    async fn handle_batch(&self, batch: Vec<LibraryEvent>) -> Vec<LibraryEvent>;
}

/// Handle to a debounced event queue. Cheap to clone.
#[derive(Clone)]
pub struct EventQueue {
    pending: Arc<Mutex<Vec<LibraryEvent>>>,
    wake: mpsc::UnboundedSender<()>,
}

impl EventQueue {
    /// Create a queue and spawn its worker.
    ///
    /// The worker exits when `cancel` fires or every [`EventQueue`] handle
    /// has been dropped.
    pub fn start<H: BatchHandler>(
        handler: Arc<H>,
        quiet_period: Duration,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let pending = Arc::new(Mutex::new(Vec::new()));
        let (wake, wake_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(
            Arc::clone(&pending),
            wake_rx,
            handler,
            quiet_period,
            cancel,
        ));

        (Self { pending, wake }, worker)
    }

    /// Append an event and restart the quiet period.
    pub fn enqueue(&self, event: LibraryEvent) {
        debug!(
            entity = %event.entity.id,
            kind = %event.entity.kind,
            event = %event.event_type,
            "Queueing library event"
        );
        self.pending.lock().push(event);
        // A closed channel means the worker is shutting down.
        let _ = self.wake.send(());
    }

    /// Number of events waiting for the next batch.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

async fn run_worker<H: BatchHandler>(
    pending: Arc<Mutex<Vec<LibraryEvent>>>,
    mut wake: mpsc::UnboundedReceiver<()>,
    handler: Arc<H>,
    quiet_period: Duration,
    cancel: CancellationToken,
) {
    info!(quiet_ms = quiet_period.as_millis() as u64, "Event queue worker started");
    let mut armed = false;

    'worker: loop {
        if !armed {
            // Timer disarmed: wait for the next enqueue.
            tokio::select! {
                _ = cancel.cancelled() => break 'worker,
                signal = wake.recv() => {
                    if signal.is_none() {
                        break 'worker;
                    }
                }
            }
        }

        // Timer armed: every further enqueue restarts the quiet period.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'worker,
                _ = sleep(quiet_period) => break,
                signal = wake.recv() => {
                    if signal.is_none() {
                        break 'worker;
                    }
                }
            }
        }

        let batch = std::mem::take(&mut *pending.lock());
        armed = false;
        if batch.is_empty() {
            debug!("Quiet period elapsed with nothing pending");
            continue;
        }

        info!(events = batch.len(), "Dispatching event batch");
        match AssertUnwindSafe(handler.handle_batch(batch))
            .catch_unwind()
            .await
        {
            Ok(follow_ups) if !follow_ups.is_empty() => {
                debug!(events = follow_ups.len(), "Queueing follow-up events");
                pending.lock().extend(follow_ups);
                armed = true;
            }
            Ok(_) => {}
            Err(_) => error!("Batch processing panicked; queue keeps running"),
        }
    }

    info!("Event queue worker stopped");
}
