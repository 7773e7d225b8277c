//! Serial Task Queue
//!
//! All GATT exchanges go through a single worker so that no two of them are
//! ever in flight: the protocol has no correlation ids and a read-back could
//! otherwise be attributed to the wrong write.
//!
//! Every unit of work captures the queue generation when it is submitted.
//! [`SerialTaskQueue::clear_queue`] bumps the generation and cancels the
//! running unit, so anything submitted before the clear fails with
//! `Aborted` instead of running.

use crate::error::{ClientError, Result};
use crate::infrastructure::lock;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type Job = Box<dyn FnOnce(JobContext) -> BoxFuture + Send + 'static>;

struct JobContext {
    generation: u64,
    signal: CancelSignal,
}

/// Cancellation handed to each unit of work; units should watch it at I/O
/// boundaries.
#[derive(Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: &str) {
        {
            let mut slot = lock(&self.reason);
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn reason(&self) -> String {
        lock(&self.reason)
            .clone()
            .unwrap_or_else(|| "cancelled".to_string())
    }

    /// Sleep that ends early with `Aborted` when the signal fires
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ClientError::Aborted(self.reason())),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

struct Shared {
    generation: AtomicU64,
    /// Signal of the running unit. Also serializes generation reads by the
    /// worker against clears.
    current: Mutex<Option<CancelSignal>>,
}

pub struct SerialTaskQueue {
    tx: mpsc::UnboundedSender<Job>,
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl SerialTaskQueue {
    /// Create the queue and spawn its worker on the current runtime
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
        });
        let worker = tokio::spawn(run_worker(rx, shared.clone()));
        Self { tx, shared, worker }
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Run `work` after everything submitted before it
    pub async fn enqueue<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(work, None).await
    }

    /// Like [`enqueue`](Self::enqueue), but fail with `Timeout` and cancel
    /// the unit's signal if it runs longer than `limit`
    pub async fn enqueue_with_timeout<T, F, Fut>(&self, work: F, limit: Duration) -> Result<T>
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(work, Some(limit)).await
    }

    async fn submit<T, F, Fut>(&self, work: F, limit: Option<Duration>) -> Result<T>
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let captured = self.generation();
        let (reply_tx, reply_rx) = oneshot::channel();

        let job: Job = Box::new(move |ctx: JobContext| -> BoxFuture {
            Box::pin(async move {
                if ctx.generation != captured {
                    debug!(
                        "Skipping stale unit (generation {} < {})",
                        captured, ctx.generation
                    );
                    let _ = reply_tx.send(Err(ClientError::Aborted(
                        "queue cleared before the unit started".to_string(),
                    )));
                    return;
                }

                let signal = ctx.signal;
                let result = match limit {
                    Some(limit) => {
                        tokio::select! {
                            biased;
                            _ = signal.cancelled() => Err(ClientError::Aborted(signal.reason())),
                            r = work(signal.clone()) => r,
                            _ = tokio::time::sleep(limit) => {
                                signal.cancel("timed out");
                                Err(ClientError::Timeout(format!(
                                    "unit of work exceeded {} ms",
                                    limit.as_millis()
                                )))
                            }
                        }
                    }
                    None => {
                        tokio::select! {
                            biased;
                            _ = signal.cancelled() => Err(ClientError::Aborted(signal.reason())),
                            r = work(signal.clone()) => r,
                        }
                    }
                };
                let _ = reply_tx.send(result);
            })
        });

        self.tx
            .send(job)
            .map_err(|_| ClientError::Aborted("task queue is closed".to_string()))?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Aborted(
                "unit of work ended without a result".to_string(),
            )),
        }
    }

    /// Invalidate everything queued and cancel the running unit
    pub fn clear_queue(&self, reason: &str) {
        let current = lock(&self.shared.current);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Clearing task queue ({}), generation {}", reason, generation);
        if let Some(signal) = current.as_ref() {
            signal.cancel(reason);
        }
    }

    /// Cancel only the running unit; queued successors still run
    pub fn abort_current(&self, reason: &str) {
        if let Some(signal) = lock(&self.shared.current).as_ref() {
            debug!("Aborting current unit: {}", reason);
            signal.cancel(reason);
        }
    }
}

impl Drop for SerialTaskQueue {
    fn drop(&mut self) {
        self.abort_current("task queue dropped");
        self.worker.abort();
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Job>, shared: Arc<Shared>) {
    while let Some(job) = rx.recv().await {
        let signal = CancelSignal::new();
        let generation = {
            let mut current = lock(&shared.current);
            *current = Some(signal.clone());
            shared.generation.load(Ordering::SeqCst)
        };

        // Own task so a panicking unit cannot take the worker down
        let handle = tokio::spawn(job(JobContext { generation, signal }));
        if let Err(e) = handle.await {
            warn!("Unit of work failed to complete: {}", e);
        }

        *lock(&shared.current) = None;
    }
    debug!("Task queue worker finished");
}
