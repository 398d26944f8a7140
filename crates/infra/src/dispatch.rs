use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use pantau_domain::ports::dispatch::{DispatchError, WorkDispatcher, WorkItem};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DISPATCH_ITEMS_TOTAL: &str = "pantau_dispatch_items_total";
const DISPATCH_ITEM_DURATION_MS: &str = "pantau_dispatch_item_duration_ms";

#[derive(Debug, Clone, Default)]
pub struct DispatchConfig {
    /// 0 spawns every item immediately; otherwise at most this many run at once.
    pub max_concurrency: usize,
}

/// FIFO hand-off of deferred work. A single consumer pulls items in order and
/// spawns each one as its own task, so a slow or failing item never holds up
/// the next.
///
/// Cancelling the shutdown token stops intake and the consumer loop. Items
/// already spawned are left to finish on their own and are not awaited.
#[derive(Clone)]
pub struct DispatchQueue {
    sender: mpsc::UnboundedSender<WorkItem>,
    shutdown: CancellationToken,
}

impl DispatchQueue {
    pub fn start(config: DispatchConfig, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(run_consumer(receiver, config, shutdown.clone()));
        (Self { sender, shutdown }, consumer)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.sender.is_closed()
    }
}

impl WorkDispatcher for DispatchQueue {
    fn dispatch(&self, item: WorkItem) -> Result<(), DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        self.sender.send(item).map_err(|_| DispatchError::Closed)
    }
}

async fn run_consumer(
    mut receiver: mpsc::UnboundedReceiver<WorkItem>,
    config: DispatchConfig,
    shutdown: CancellationToken,
) {
    let semaphore = (config.max_concurrency > 0)
        .then(|| Arc::new(Semaphore::new(config.max_concurrency)));
    tracing::info!(
        max_concurrency = config.max_concurrency,
        "dispatch queue started"
    );

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = receiver.recv() => match next {
                Some(item) => item,
                None => break,
            },
        };

        let permit = match &semaphore {
            Some(semaphore) => {
                let acquired = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => permit,
                };
                match acquired {
                    Ok(permit) => Some(permit),
                    Err(err) => {
                        tracing::error!(error = %err, "dispatch semaphore closed");
                        break;
                    }
                }
            }
            None => None,
        };

        tokio::spawn(async move {
            run_item(item).await;
            drop(permit);
        });
    }

    receiver.close();
    let dropped = std::iter::from_fn(|| receiver.try_recv().ok()).count();
    if dropped > 0 {
        tracing::warn!(dropped, "dispatch queue stopped with pending items");
        counter!(DISPATCH_ITEMS_TOTAL, "result" => "dropped").increment(dropped as u64);
    }
    tracing::info!("dispatch queue stopped");
}

/// Runs one item on its own task so a panic is contained and reported here.
/// `start` runs inside that task too: a panicking collaborator factory is
/// reported like any other panic.
async fn run_item(item: WorkItem) {
    let label = item.label().to_string();
    let started = Instant::now();
    let result = match tokio::spawn(async move { item.start().await }).await {
        Ok(Ok(())) => "ok",
        Ok(Err(err)) => {
            tracing::error!(item = %label, error = %err, "work item failed");
            "error"
        }
        Err(err) => {
            tracing::error!(item = %label, error = %err, "work item panicked");
            "panic"
        }
    };

    counter!(
        DISPATCH_ITEMS_TOTAL,
        "item" => label.clone(),
        "result" => result
    )
    .increment(1);
    histogram!(DISPATCH_ITEM_DURATION_MS, "item" => label)
        .record(started.elapsed().as_secs_f64() * 1000.0);
}
