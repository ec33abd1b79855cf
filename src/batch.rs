//! Size/time-bounded batching queue.
//!
//! Producers call [`Batcher::queue`] from any task or thread. A single worker
//! task owns the queue and hands the *entire* accumulated batch to the
//! processor when either threshold trips:
//!
//! ```text
//! queue(item) ──▶ mpsc ──▶ worker ──┬──▶ len >= capacity ──▶ processor(batch)
//!                                   │
//!                                   └──▶ delay elapsed   ──▶ processor(batch)
//! ```
//!
//! # Design
//!
//! - The delay timer is fixed: it is armed by the first item of a batch and
//!   is not pushed back by later items, which bounds worst-case latency.
//! - Processing is serialized on the worker, so batches never overlap and
//!   items reach the processor in enqueue order.
//! - A failed processor call is logged and the batch is dropped; the owner of
//!   the processor records the error where it belongs.

use crate::error::Result;
use crate::metrics;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Boxed processor future.
pub type BatchFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

type Processor<T> = Arc<dyn Fn(Vec<T>) -> BatchFuture + Send + Sync>;

/// Configuration for a batcher.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Queue length that forces an immediate flush.
    pub capacity: usize,
    /// Maximum time the first item of a batch waits.
    pub delay: Duration,
}

impl BatchConfig {
    pub fn new(capacity: usize, delay: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            delay,
        }
    }

    /// Fast flush for testing.
    pub fn testing() -> Self {
        Self {
            capacity: 10,
            delay: Duration::from_millis(5),
        }
    }
}

enum Command<T> {
    Item(T),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Coalesces items and processes them in batches on one worker task.
pub struct Batcher<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<Command<T>>,
    queued: Arc<AtomicUsize>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Batcher<T> {
    /// Spawn the worker. Must be called inside a Tokio runtime.
    pub fn new<F, Fut>(name: &'static str, config: BatchConfig, processor: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let processor: Processor<T> =
            Arc::new(move |batch: Vec<T>| -> BatchFuture { Box::pin(processor(batch)) });
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(name, config, processor, rx, Arc::clone(&queued)));

        Self {
            name,
            tx,
            queued,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Append an item. Dropped with a warning if the batcher is closed.
    pub fn queue(&self, item: T) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Command::Item(item)).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            warn!(batcher = self.name, "Batcher closed, item dropped");
        }
    }

    pub fn queue_all(&self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.queue(item);
        }
    }

    /// Items waiting for the next flush.
    pub fn count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Process everything queued so far and wait until the processor is done.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Flush remaining items and stop the worker.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_worker<T: Send + 'static>(
    name: &'static str,
    config: BatchConfig,
    processor: Processor<T>,
    mut rx: mpsc::UnboundedReceiver<Command<T>>,
    queued: Arc<AtomicUsize>,
) {
    let mut batch: Vec<T> = Vec::new();
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => {
                tokio::select! {
                    command = rx.recv() => command,
                    _ = tokio::time::sleep_until(at) => {
                        deadline = None;
                        process(name, &processor, &mut batch, &queued).await;
                        continue;
                    }
                }
            }
            None => rx.recv().await,
        };

        match command {
            Some(Command::Item(item)) => {
                batch.push(item);
                if batch.len() >= config.capacity {
                    deadline = None;
                    process(name, &processor, &mut batch, &queued).await;
                } else if deadline.is_none() {
                    deadline = Some(tokio::time::Instant::now() + config.delay);
                }
            }
            Some(Command::Flush(ack)) => {
                deadline = None;
                process(name, &processor, &mut batch, &queued).await;
                let _ = ack.send(());
            }
            Some(Command::Close(ack)) => {
                process(name, &processor, &mut batch, &queued).await;
                let _ = ack.send(());
                break;
            }
            None => {
                process(name, &processor, &mut batch, &queued).await;
                break;
            }
        }
    }

    debug!(batcher = name, "Batcher worker stopped");
}

async fn process<T: Send + 'static>(
    name: &'static str,
    processor: &Processor<T>,
    batch: &mut Vec<T>,
    queued: &AtomicUsize,
) {
    if batch.is_empty() {
        return;
    }

    let items = std::mem::take(batch);
    let size = items.len();
    queued.fetch_sub(size, Ordering::SeqCst);

    debug!(batcher = name, batch_size = size, "Flushing batch");
    let start = Instant::now();
    let result = processor(items).await;
    metrics::record_batch_flush(name, size, start.elapsed(), result.is_ok());

    if let Err(e) = result {
        warn!(batcher = name, batch_size = size, error = %e, "Batch processor failed, batch dropped");
    }
}
