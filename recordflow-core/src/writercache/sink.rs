use std::future::Future;

use bytes::Bytes;

use crate::Result;

/// Output handle owned by the writer cache, an open file, a compressed stream, an upload.
#[trait_variant::make(Sink: Send)]
#[allow(dead_code)]
pub trait LocalSink {
    /// Writes the whole buffer and returns the number of bytes written.
    async fn write(&mut self, bytes: Bytes) -> Result<usize>;

    /// Flushes and releases the sink. Called at most once by the cache.
    async fn close(&mut self) -> Result<()>;
}

/// SinkFactory opens a new sink for a path. Paths are the cache keys with `{suffix}` already
/// substituted.
pub trait SinkFactory: Send + Sync + 'static {
    type Sink: Sink + Send + 'static;

    fn create(&self, path: &str) -> impl Future<Output = Result<Self::Sink>> + Send;
}
