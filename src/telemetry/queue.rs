use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{UsageEvent, UsageTelemetry};

/// Non-blocking handle used by the request path to enqueue usage events.
#[derive(Clone)]
pub struct UsageEmitter {
    tx: mpsc::Sender<UsageEvent>,
    dropped: Arc<AtomicU64>,
}

impl UsageEmitter {
    /// Bounded queue of `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<UsageEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue without waiting. A full or closed queue drops the event.
    pub fn emit(&self, event: UsageEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    key_id = %event.key_id,
                    dropped,
                    "Usage queue full; dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key_id = %event.key_id, "Usage queue closed; dropping event");
                false
            }
        }
    }

    /// Events dropped since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Start `workers` tasks draining the queue into `telemetry`.
///
/// Workers exit once every emitter is dropped and the queue is empty.
pub fn spawn_workers(
    telemetry: UsageTelemetry,
    rx: mpsc::Receiver<UsageEvent>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    let workers = workers.max(1);
    info!(workers, "Starting usage telemetry workers");

    (0..workers)
        .map(|worker| {
            let rx = Arc::clone(&rx);
            let telemetry = telemetry.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(event) = next else {
                        debug!(worker, "Usage queue closed, worker exiting");
                        break;
                    };
                    telemetry.process(event).await;
                }
            })
        })
        .collect()
}
