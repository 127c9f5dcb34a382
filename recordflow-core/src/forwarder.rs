//! Forwarder wires the three stages together:
//!
//! ```text
//! records -> ordered pipeline -> clustered sort buffer -> writer cache
//! ```
//!
//! Every record coming out of the clusters is encoded, routed to the path built from its partition
//! and cluster, and written through the cache. Sinks are left open when a run finishes so that the
//! next run can keep appending to them; [ClusteredForwarder::close] closes them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::pipeline::PipelineConfig;
use crate::config::sorter::SortConfig;
use crate::config::{ErrorPolicy, Settings};
use crate::partition::Partitioned;
use crate::pipeline::{BoxedTransform, OrderedPipeline};
use crate::sorter::{self, ClusteredRecord, Lesser};
use crate::writercache::{SinkFactory, WriterCache};
use crate::{Error, Result};

type Encoder<T> = Arc<dyn Fn(&T) -> Result<Bytes> + Send + Sync>;
type PathBuilder<T> = Arc<dyn Fn(&ClusteredRecord<T>) -> String + Send + Sync>;

/// Output path of a clustered record, `{partition}/sorted_records_p{cluster:04}_s{suffix}.json`.
/// The `{suffix}` placeholder is filled in by the writer cache.
pub fn default_path(partition: &str, cluster_id: usize) -> String {
    let file = format!("sorted_records_p{cluster_id:04}_s{{suffix}}.json");
    if partition.is_empty() {
        return file;
    }
    format!("{}/{file}", partition.trim_end_matches('/'))
}

/// Counters of one forwarder run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardStats {
    pub records_written: u64,
    pub bytes_written: u64,
    /// records whose transform failed and which were skipped under [ErrorPolicy::Ignore].
    pub records_skipped: u64,
}

pub struct ClusteredForwarder<T, F: SinkFactory> {
    pipeline_config: PipelineConfig,
    sort_config: SortConfig,
    cache: WriterCache<F>,
    encoder: Encoder<T>,
    path_builder: PathBuilder<T>,
    cln_token: CancellationToken,
}

impl<T, F> ClusteredForwarder<T, F>
where
    T: Lesser + Partitioned + Clone + Send + 'static,
    F: SinkFactory,
{
    pub fn new<E>(
        settings: &Settings,
        factory: F,
        encoder: E,
        cln_token: CancellationToken,
    ) -> Self
    where
        E: Fn(&T) -> Result<Bytes> + Send + Sync + 'static,
    {
        Self {
            pipeline_config: settings.pipeline.clone(),
            sort_config: settings.sort.clone(),
            cache: WriterCache::new(factory, settings.writer_cache.clone(), cln_token.clone()),
            encoder: Arc::new(encoder),
            path_builder: Arc::new(|record: &ClusteredRecord<T>| {
                default_path(&record.partition, record.cluster_id)
            }),
            cln_token,
        }
    }

    pub fn with_path_builder<P>(mut self, path_builder: P) -> Self
    where
        P: Fn(&ClusteredRecord<T>) -> String + Send + Sync + 'static,
    {
        self.path_builder = Arc::new(path_builder);
        self
    }

    pub fn cache(&self) -> &WriterCache<F> {
        &self.cache
    }

    /// Pushes `input` through `transforms`, sorts the results into clusters and writes them out.
    /// Returns once `input` is exhausted and everything has been written, or on the first error
    /// that the error policy does not absorb.
    pub async fn forward<S>(
        &self,
        input: S,
        transforms: Vec<BoxedTransform<T>>,
    ) -> Result<ForwardStats>
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let run_token = self.cln_token.child_token();
        let pipeline = OrderedPipeline::new(self.pipeline_config.clone(), run_token.clone());
        let (items, pipeline_handle) = pipeline.run_chain(input, transforms);

        let skipped = Arc::new(AtomicU64::new(0));
        let records = {
            let skipped = Arc::clone(&skipped);
            let error_policy = self.pipeline_config.error_policy;
            items.filter_map(move |item| {
                let index = item.index;
                match item.into_result() {
                    Err(e) if error_policy == ErrorPolicy::Ignore && !e.is_cancelled() => {
                        warn!(index, ?e, "skipping failed record");
                        skipped.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    result => Some(result),
                }
            })
        };

        let (clustered, sort_handle) =
            sorter::clustered(&self.sort_config, records, run_token.clone());

        let mut stats = ForwardStats::default();
        let written = self.write_all(clustered, &mut stats).await;
        if written.is_err() {
            run_token.cancel();
        }

        let joined = async {
            pipeline_handle.await??;
            sort_handle.await??;
            Ok::<_, Error>(())
        }
        .await;

        stats.records_skipped = skipped.load(Ordering::Relaxed);
        info!(?stats, "forwarder run completed");
        written?;
        joined?;
        Ok(stats)
    }

    async fn write_all<S>(&self, clustered: S, stats: &mut ForwardStats) -> Result<()>
    where
        S: Stream<Item = Result<ClusteredRecord<T>>>,
    {
        let mut clustered = std::pin::pin!(clustered);
        while let Some(record) = clustered.next().await {
            let record = record?;
            let bytes = (self.encoder)(&record.record)?;
            let path = (self.path_builder)(&record);
            let written = self.cache.write(&path, bytes).await?;
            stats.records_written += 1;
            stats.bytes_written += written as u64;
        }
        Ok(())
    }

    /// Closes every writer opened by the forwarder.
    pub async fn close(&self) -> Result<()> {
        self.cache.close_all().await
    }
}
