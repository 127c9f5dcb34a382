//! Bounded memory sorting of out of order streams.
//!
//! [buffered] keeps a sliding window of `buffer_size` records and always emits the smallest one,
//! which fully sorts any stream whose records arrive at most `buffer_size` positions early.
//! [clustered] splits every partition into a capped ladder of such windows so a late record does
//! not break the order of the records already emitted from a window.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::sorter::SortConfig;
use crate::{Error, Result};

mod cluster;

pub use cluster::{ClusteredRecord, clustered};

const OUTPUT_CHANNEL_SIZE: usize = 16;

/// Lesser is a strict weak ordering. Two records are equal when neither is less than the other.
pub trait Lesser {
    fn less(&self, other: &Self) -> bool;
}

/// Heap entry that pops the smallest record first.
struct MinFirst<T>(T);

impl<T: Lesser> Ord for MinFirst<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0.less(&other.0) {
            Ordering::Greater
        } else if other.0.less(&self.0) {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    }
}

impl<T: Lesser> PartialOrd for MinFirst<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Lesser> PartialEq for MinFirst<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Lesser> Eq for MinFirst<T> {}

/// SortBuffer is a min-ordered container. Insert, delete-min and len are atomic with respect to
/// each other. Equal records are all kept.
pub(crate) struct SortBuffer<T> {
    heap: Mutex<BinaryHeap<MinFirst<T>>>,
}

impl<T: Lesser> SortBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub(crate) fn insert(&self, record: T) {
        self.heap.lock().push(MinFirst(record));
    }

    pub(crate) fn pop_min(&self) -> Option<T> {
        self.heap.lock().pop().map(|min| min.0)
    }

    /// Inserts `record` and hands back the new minimum in one critical section.
    pub(crate) fn push_pop(&self, record: T) -> Option<T> {
        let mut heap = self.heap.lock();
        heap.push(MinFirst(record));
        heap.pop().map(|min| min.0)
    }

    /// Whether inserting `record` keeps the buffer's output sorted, i.e. `record` is not less than
    /// the current minimum. An empty buffer accepts everything.
    pub(crate) fn accepts(&self, record: &T) -> bool {
        self.heap
            .lock()
            .peek()
            .is_none_or(|min| !record.less(&min.0))
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pulls `source` into a single sort window of `config.buffer_size` records and emits the smallest
/// record every time the window is full. At the end of `source` the window is drained in order.
///
/// An error from `source` stops the pulling; the window is drained and the error is emitted last.
/// Cancelling `cln_token` stops the pulling and emits [Error::Cancelled] without draining.
pub fn buffered<T, S>(
    config: &SortConfig,
    source: S,
    cln_token: CancellationToken,
) -> (ReceiverStream<Result<T>>, JoinHandle<Result<()>>)
where
    T: Lesser + Send + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    let buffer_size = config.buffer_size.max(1);
    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);

    let handle = tokio::spawn(async move {
        let mut source = std::pin::pin!(source);
        let buffer = SortBuffer::new();

        let latched = loop {
            let next = tokio::select! {
                biased;
                _ = cln_token.cancelled() => break Some(Error::Cancelled),
                next = source.next() => next,
            };
            match next {
                None => break None,
                Some(Err(e)) => break Some(e),
                Some(Ok(record)) => {
                    buffer.insert(record);
                    if buffer.len() < buffer_size {
                        continue;
                    }
                    let Some(min) = buffer.pop_min() else {
                        continue;
                    };
                    if !send(&tx, &cln_token, Ok(min)).await {
                        return Ok(());
                    }
                }
            }
        };

        if latched.as_ref().is_some_and(Error::is_cancelled) {
            warn!(discarded = buffer.len(), "sort buffer cancelled");
        } else {
            debug!(remaining = buffer.len(), "draining sort buffer");
            while let Some(min) = buffer.pop_min() {
                if !send(&tx, &cln_token, Ok(min)).await {
                    return Ok(());
                }
            }
        }

        if let Some(e) = latched {
            // the consumer may already be gone, nothing left to report to
            let _ = tx.send(Err(e)).await;
        }
        Ok(())
    });

    (ReceiverStream::new(rx), handle)
}

/// Sends unless the consumer is gone or `cln_token` fires. Returns whether the send happened.
pub(crate) async fn send<T>(
    tx: &mpsc::Sender<T>,
    cln_token: &CancellationToken,
    item: T,
) -> bool {
    tokio::select! {
        biased;
        _ = cln_token.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

struct Lane<T> {
    source: BoxStream<'static, Result<T>>,
    head: Option<T>,
}

struct Merge<T> {
    lanes: Vec<Lane<T>>,
    primed: bool,
    pending_error: Option<Error>,
    done: bool,
}

/// Combines already sorted streams into one sorted stream by always taking the smallest head. On
/// ties the earlier stream wins. An error from any stream is emitted after the record that was
/// taken before it, then the merge ends.
pub fn merge_sorted<T>(
    sources: Vec<BoxStream<'static, Result<T>>>,
) -> impl Stream<Item = Result<T>> + Send
where
    T: Lesser + Send + 'static,
{
    let merge = Merge {
        lanes: sources
            .into_iter()
            .map(|source| Lane { source, head: None })
            .collect(),
        primed: false,
        pending_error: None,
        done: false,
    };

    futures::stream::unfold(merge, |mut merge| async move {
        if merge.done {
            return None;
        }
        if let Some(e) = merge.pending_error.take() {
            merge.done = true;
            return Some((Err(e), merge));
        }

        if !merge.primed {
            merge.primed = true;
            let mut failed = None;
            for lane in merge.lanes.iter_mut() {
                match lane.source.next().await {
                    Some(Ok(record)) => lane.head = Some(record),
                    Some(Err(e)) => {
                        failed = Some(e);
                        break;
                    }
                    None => {}
                }
            }
            if let Some(e) = failed {
                merge.done = true;
                return Some((Err(e), merge));
            }
        }

        let mut best: Option<&mut Lane<T>> = None;
        for lane in merge.lanes.iter_mut() {
            let Some(candidate) = lane.head.as_ref() else {
                continue;
            };
            let better = match best.as_ref().and_then(|b| b.head.as_ref()) {
                Some(current) => candidate.less(current),
                None => true,
            };
            if better {
                best = Some(lane);
            }
        }

        let lane = best?;
        let record = lane.head.take()?;
        match lane.source.next().await {
            Some(Ok(next)) => lane.head = Some(next),
            Some(Err(e)) => merge.pending_error = Some(e),
            None => {}
        }
        Some((Ok(record), merge))
    })
}

struct Dedup<T> {
    source: BoxStream<'static, Result<T>>,
    pending: Option<T>,
    pending_error: Option<Error>,
    done: bool,
}

/// Drops records equal to the record emitted right before them, keeping the first one. Like `uniq`
/// this only removes duplicates from a sorted stream. A source error ends the stream after the
/// held back record.
pub fn dedup_sorted<T, S>(source: S) -> impl Stream<Item = Result<T>> + Send
where
    T: Lesser + Send + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    let dedup = Dedup {
        source: Box::pin(source),
        pending: None,
        pending_error: None,
        done: false,
    };

    futures::stream::unfold(dedup, |mut dedup| async move {
        loop {
            if dedup.done {
                if let Some(last) = dedup.pending.take() {
                    return Some((Ok(last), dedup));
                }
                let e = dedup.pending_error.take()?;
                return Some((Err(e), dedup));
            }

            match dedup.source.next().await {
                None => dedup.done = true,
                Some(Err(e)) => {
                    dedup.pending_error = Some(e);
                    dedup.done = true;
                }
                Some(Ok(record)) => match dedup.pending.take() {
                    Some(previous) if !previous.less(&record) && !record.less(&previous) => {
                        dedup.pending = Some(previous);
                    }
                    Some(previous) => {
                        dedup.pending = Some(record);
                        return Some((Ok(previous), dedup));
                    }
                    None => dedup.pending = Some(record),
                },
            }
        }
    })
}
