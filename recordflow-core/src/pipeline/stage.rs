use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::Result;
use crate::config::ErrorPolicy;
use crate::message::{StreamItem, TransformFailure};
use crate::pipeline::Transform;
use crate::pipeline::token_ring::TokenRing;

/// Stage is one link of an ordered pipeline: its own worker pool and token ring, reading the
/// previous link's ordered output.
pub(super) struct Stage {
    pub(super) id: usize,
    pub(super) workers: usize,
    pub(super) error_policy: ErrorPolicy,
    pub(super) channel_size: usize,
    /// cancelling this token stops this stage and everything upstream of it.
    pub(super) cln_token: CancellationToken,
    /// only the last stage reports an external cancellation to the consumer.
    pub(super) emit_cancellation: bool,
}

impl Stage {
    /// Spawns the workers and returns the ordered output together with the handle of the task
    /// supervising them. `forward_failed` moves an already failed input item across the stage
    /// without calling the transform.
    pub(super) fn spawn<T, U, F>(
        self,
        input: mpsc::Receiver<StreamItem<T>>,
        transform: F,
        forward_failed: fn(StreamItem<T>) -> StreamItem<U>,
    ) -> (mpsc::Receiver<StreamItem<U>>, JoinHandle<Result<()>>)
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Transform<T, U>,
    {
        let (output_tx, output_rx) = mpsc::channel(self.channel_size.max(1));
        let ring = Arc::new(TokenRing::new(self.workers));
        let aborted = Arc::new(AtomicBool::new(false));
        let next_index = Arc::new(AtomicU64::new(0));
        let input = Arc::new(Mutex::new(Pull {
            input,
            next_seq: 0,
        }));
        let transform = Arc::new(transform);

        let handle = tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for worker_id in 0..self.workers.max(1) {
                let worker = Worker {
                    stage_id: self.id,
                    worker_id,
                    error_policy: self.error_policy,
                    input: Arc::clone(&input),
                    output_tx: output_tx.clone(),
                    ring: Arc::clone(&ring),
                    transform: Arc::clone(&transform),
                    forward_failed,
                    aborted: Arc::clone(&aborted),
                    next_index: Arc::clone(&next_index),
                    cln_token: self.cln_token.clone(),
                };
                workers.spawn(worker.run());
            }

            // structured concurrency, every worker has returned before the stage is done
            let mut final_result = Ok(());
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(stage = self.id, ?e, "worker failed");
                    self.cln_token.cancel();
                    final_result = Err(Error::from(e));
                }
            }

            let aborted = aborted.load(Ordering::Acquire);
            if self.emit_cancellation && self.cln_token.is_cancelled() && !aborted {
                let index = next_index.load(Ordering::Acquire);
                warn!(stage = self.id, index, "pipeline cancelled");
                if output_tx.send(StreamItem::cancelled(index)).await.is_err() {
                    debug!(stage = self.id, "consumer gone before cancellation was reported");
                }
            }

            info!(
                stage = self.id,
                released = ring.next_index(),
                aborted,
                "ordered stage completed"
            );
            final_result
        });

        (output_rx, handle)
    }
}

/// The stage input together with the position of the next pull. Positions are local to the stage,
/// an upstream `Drop` leaves gaps in the record indexes but never in the sequence.
struct Pull<T> {
    input: mpsc::Receiver<StreamItem<T>>,
    next_seq: u64,
}

impl<T> Pull<T> {
    async fn next(&mut self) -> Option<(u64, StreamItem<T>)> {
        let item = self.input.recv().await?;
        let seq = self.next_seq;
        self.next_seq += 1;
        Some((seq, item))
    }
}

struct Worker<T, U, F> {
    stage_id: usize,
    worker_id: usize,
    error_policy: ErrorPolicy,
    input: Arc<Mutex<Pull<T>>>,
    output_tx: mpsc::Sender<StreamItem<U>>,
    ring: Arc<TokenRing>,
    transform: Arc<F>,
    forward_failed: fn(StreamItem<T>) -> StreamItem<U>,
    aborted: Arc<AtomicBool>,
    /// one past the highest record index released downstream.
    next_index: Arc<AtomicU64>,
    cln_token: CancellationToken,
}

impl<T, U, F> Worker<T, U, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Transform<T, U>,
{
    async fn run(self) {
        loop {
            // the lock keeps pulls in arrival order, a worker holds at most one item at a time
            let (seq, item) = tokio::select! {
                biased;
                _ = self.cln_token.cancelled() => return,
                pulled = async { self.input.lock().await.next().await } => match pulled {
                    Some(pulled) => pulled,
                    None => return,
                },
            };

            let index = item.index;
            let processed = if item.is_err() {
                (self.forward_failed)(item)
            } else {
                tokio::select! {
                    biased;
                    _ = self.cln_token.cancelled() => return,
                    processed = self.process(item) => processed,
                }
            };

            let failed = processed.is_err();
            let abort = failed && self.error_policy == ErrorPolicy::Abort;
            let drop = failed && self.error_policy == ErrorPolicy::Drop;

            tokio::select! {
                biased;
                _ = self.cln_token.cancelled() => return,
                acquired = self.ring.acquire(seq) => {
                    if let Err(e) = acquired {
                        error!(
                            stage = self.stage_id,
                            worker = self.worker_id,
                            ?e,
                            "lost ordering token"
                        );
                        self.cln_token.cancel();
                        return;
                    }
                }
            }

            if drop {
                debug!(
                    stage = self.stage_id,
                    index,
                    error = ?processed.error,
                    "dropping failed record"
                );
            } else {
                tokio::select! {
                    biased;
                    _ = self.cln_token.cancelled() => return,
                    sent = self.output_tx.send(processed) => {
                        if sent.is_err() {
                            warn!(
                                stage = self.stage_id,
                                index,
                                "output stream closed, stopping stage"
                            );
                            self.cln_token.cancel();
                            return;
                        }
                        self.next_index.store(index + 1, Ordering::Release);
                    }
                }
            }

            if abort {
                error!(stage = self.stage_id, index, "transform failed, aborting pipeline");
                self.aborted.store(true, Ordering::Release);
                self.cln_token.cancel();
                return;
            }

            self.ring.advance(seq);
        }
    }

    async fn process(&self, item: StreamItem<T>) -> StreamItem<U> {
        let StreamItem { index, value, .. } = item;
        let Some(value) = value else {
            return StreamItem {
                index,
                value: None,
                error: Some(Error::Transform(format!(
                    "record at index {index} reached stage {} without a value",
                    self.stage_id
                ))),
            };
        };

        match self
            .transform
            .transform(self.cln_token.clone(), value)
            .await
        {
            Ok(value) => StreamItem {
                index,
                value: Some(value),
                error: None,
            },
            Err(TransformFailure { value, error }) => StreamItem {
                index,
                value,
                error: Some(error),
            },
        }
    }
}
