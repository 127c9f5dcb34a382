use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::sorter::SortConfig;
use crate::partition::Partitioned;
use crate::sorter::{Lesser, OUTPUT_CHANNEL_SIZE, SortBuffer, send};
use crate::{Error, Result};

/// A record emitted by [clustered]. Records sharing `partition` and `cluster_id` are emitted in
/// sorted order, nothing is promised across clusters or partitions.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteredRecord<T> {
    /// rendered partition path, empty for records without a partition key.
    pub partition: String,
    /// zero-based output cluster within the partition.
    pub cluster_id: usize,
    pub record: T,
}

/// Sort buckets of one partition in creation order, plus the last record emitted under every
/// cluster id. Only the last bucket may pop out of order, and only once the ladder is at its cap;
/// the tails keep every cluster id sorted regardless.
struct ClusterLadder<T> {
    buckets: Vec<SortBuffer<T>>,
    tails: Vec<T>,
}

impl<T> Default for ClusterLadder<T> {
    fn default() -> Self {
        Self {
            buckets: vec![],
            tails: vec![],
        }
    }
}

impl<T: Lesser + Clone> ClusterLadder<T> {
    /// Buckets `record`, returns the record the bucket let go of, if any.
    fn place(&mut self, record: T, buffer_size: usize, max_buckets: usize) -> Result<Option<T>> {
        for bucket in self.buckets.iter() {
            // still filling, nothing has been emitted from it yet
            if bucket.len() < buffer_size {
                bucket.insert(record);
                return Ok(None);
            }
            if bucket.accepts(&record) {
                return Ok(bucket.push_pop(record));
            }
        }

        if self.buckets.len() < max_buckets {
            let bucket = SortBuffer::new();
            bucket.insert(record);
            self.buckets.push(bucket);
            return Ok(None);
        }

        // at the cap the last bucket takes everything, the tails restore the order
        let Some(last) = self.buckets.last() else {
            return Err(Error::Partition("cluster ladder has no buckets".to_string()));
        };
        Ok(last.push_pop(record))
    }

    /// First cluster whose last emitted record is not greater than `record`, a new one otherwise.
    fn assign(&mut self, record: &T) -> usize {
        for (cluster_id, tail) in self.tails.iter_mut().enumerate() {
            if !record.less(tail) {
                *tail = record.clone();
                return cluster_id;
            }
        }
        self.tails.push(record.clone());
        self.tails.len() - 1
    }

    fn pop_min(&mut self) -> Option<T> {
        self.buckets.iter().find_map(SortBuffer::pop_min)
    }
}

/// Synchronous core of [clustered], one ladder per partition.
pub(crate) struct PartitionedClusters<T> {
    buffer_size: usize,
    max_buckets: usize,
    partitions: BTreeMap<String, ClusterLadder<T>>,
}

impl<T: Lesser + Partitioned + Clone> PartitionedClusters<T> {
    pub(crate) fn new(config: &SortConfig) -> Self {
        Self {
            buffer_size: config.buffer_size.max(1),
            max_buckets: config.max_clusters.max(1),
            partitions: BTreeMap::new(),
        }
    }

    /// Places `record` in its partition's ladder. Returns the record that has to be emitted now,
    /// if any.
    pub(crate) fn push(&mut self, record: T) -> Result<Option<ClusteredRecord<T>>> {
        let partition = record.partition_key()?.to_partition_path();
        let ladder = self.partitions.entry(partition.clone()).or_default();

        let buckets = ladder.buckets.len();
        let Some(record) = ladder.place(record, self.buffer_size, self.max_buckets)? else {
            if ladder.buckets.len() > buckets {
                debug!(
                    partition = %partition,
                    buckets = ladder.buckets.len(),
                    "opened new bucket"
                );
            }
            return Ok(None);
        };

        let clusters = ladder.tails.len();
        let cluster_id = ladder.assign(&record);
        if ladder.tails.len() > clusters {
            debug!(partition = %partition, cluster_id, "opened new cluster");
        }
        Ok(Some(ClusteredRecord {
            partition,
            cluster_id,
            record,
        }))
    }

    /// Removes and returns the next remaining record. Partitions are drained in key order, each
    /// one bucket after the other.
    pub(crate) fn flush_next(&mut self) -> Option<ClusteredRecord<T>> {
        for (partition, ladder) in self.partitions.iter_mut() {
            if let Some(record) = ladder.pop_min() {
                let cluster_id = ladder.assign(&record);
                return Some(ClusteredRecord {
                    partition: partition.clone(),
                    cluster_id,
                    record,
                });
            }
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.partitions
            .values()
            .flat_map(|ladder| ladder.buckets.iter())
            .map(SortBuffer::len)
            .sum()
    }
}

/// Sorts `source` into per partition sort buckets and emits each record tagged with its partition
/// and cluster. Within a cluster the emitted records never go backwards, whatever the input order.
///
/// For every record, the buckets of its partition are scanned in creation order:
/// 1. a bucket holding fewer than `buffer_size` records takes it and nothing is emitted,
/// 2. the first full bucket whose minimum is not greater than the record takes it and emits its
///    minimum,
/// 3. otherwise a new bucket is opened if the partition holds fewer than `config.max_clusters`
///    buckets,
/// 4. or the record is forced into the last bucket, which emits its minimum.
///
/// An emitted record joins the first cluster of its partition whose last record is not greater
/// than it, or opens a new cluster. `config.max_clusters` bounds the buffered records, not the
/// number of clusters.
///
/// At the end of `source` every remaining record is flushed. A source error or a record without a
/// usable partition key stops the pulling; the buckets are flushed and the error is emitted last.
/// Cancelling `cln_token` emits [Error::Cancelled] without flushing.
pub fn clustered<T, S>(
    config: &SortConfig,
    source: S,
    cln_token: CancellationToken,
) -> (ReceiverStream<Result<ClusteredRecord<T>>>, JoinHandle<Result<()>>)
where
    T: Lesser + Partitioned + Clone + Send + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    let mut clusters = PartitionedClusters::new(config);
    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);

    let handle = tokio::spawn(async move {
        let mut source = std::pin::pin!(source);

        let latched = loop {
            let next = tokio::select! {
                biased;
                _ = cln_token.cancelled() => break Some(Error::Cancelled),
                next = source.next() => next,
            };
            let record = match next {
                None => break None,
                Some(Err(e)) => break Some(e),
                Some(Ok(record)) => record,
            };
            match clusters.push(record) {
                Ok(Some(emitted)) => {
                    if !send(&tx, &cln_token, Ok(emitted)).await {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => break Some(e),
            }
        };

        if latched.as_ref().is_some_and(Error::is_cancelled) {
            warn!(discarded = clusters.len(), "cluster buffer cancelled");
        } else {
            info!(
                partitions = clusters.partitions.len(),
                remaining = clusters.len(),
                "flushing clusters"
            );
            while let Some(emitted) = clusters.flush_next() {
                if !send(&tx, &cln_token, Ok(emitted)).await {
                    return Ok(());
                }
            }
        }

        if let Some(e) = latched {
            let _ = tx.send(Err(e)).await;
        }
        Ok(())
    });

    (ReceiverStream::new(rx), handle)
}
