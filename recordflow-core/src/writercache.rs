//! Writer cache keeps one live [Sink] per key, created lazily through a [SinkFactory] on the first
//! write. A sink that has not been written to for `ttl` is closed and dropped from the cache by its
//! idle monitor, and when more than `max_entries` sinks are alive the least recently written one is
//! closed to make room. A later write to a dropped key transparently opens a new sink.
//!
//! Keys may contain a `{suffix}` placeholder which is replaced with `{hostname}_{unix ts}_{n:04}`
//! before the sink is created, so that every sink opened for the same logical path gets its own
//! file name.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::writercache::WriterCacheConfig;
use crate::{Error, Result};

mod entry;
pub mod sink;
#[cfg(test)]
pub(crate) mod test_utils;

use entry::CacheEntry;
pub use sink::{Sink, SinkFactory};

const SUFFIX_PLACEHOLDER: &str = "{suffix}";

type Entries<S> = HashMap<String, Arc<CacheEntry<S>>>;

struct Inner<F: SinkFactory> {
    factory: F,
    config: WriterCacheConfig,
    entries: RwLock<Entries<F::Sink>>,
    writers_created: AtomicUsize,
    hostname: String,
    cln_token: CancellationToken,
}

/// WriterCache is cheap to clone, clones share the same sinks.
pub struct WriterCache<F: SinkFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: SinkFactory> Clone for WriterCache<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: SinkFactory> WriterCache<F> {
    /// Creates an empty cache. Cancelling `cln_token` closes every sink and makes further writes
    /// fail with [Error::Closed].
    pub fn new(factory: F, config: WriterCacheConfig, cln_token: CancellationToken) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        Self {
            inner: Arc::new(Inner {
                factory,
                config,
                entries: RwLock::new(HashMap::new()),
                writers_created: AtomicUsize::new(0),
                hostname,
                cln_token: cln_token.child_token(),
            }),
        }
    }

    /// Writes `bytes` to the sink of `key`, opening it first if needed. A write racing against the
    /// close of its sink is retried on a freshly opened one.
    pub async fn write(&self, key: &str, bytes: Bytes) -> Result<usize> {
        let attempts = self.inner.config.max_write_attempts.max(1);
        for attempt in 1..=attempts {
            if self.inner.cln_token.is_cancelled() {
                return Err(Error::Closed);
            }

            let entry = self.entry(key).await?;
            match entry.write(bytes.clone()).await {
                Err(Error::AlreadyClosed) => {
                    debug!(key, attempt, "writer closed during write, retrying");
                    self.inner.detach(key, &entry).await;
                }
                written => return written,
            }
        }
        Err(Error::Sink(format!(
            "writer for '{key}' was closed during each of {attempts} write attempts"
        )))
    }

    /// Closes the sink of `key` if there is one.
    pub async fn close_key(&self, key: &str) -> Result<()> {
        let Some(entry) = self.inner.entries.write().await.remove(key) else {
            return Ok(());
        };
        match entry.close().await {
            Err(Error::AlreadyClosed) => Ok(()),
            result => result,
        }
    }

    /// Closes every live sink. All close failures are collected into [Error::Aggregate].
    pub async fn close_all(&self) -> Result<()> {
        let entries: Vec<_> = self.inner.entries.write().await.drain().collect();
        info!(writers = entries.len(), "closing all writers");

        let results =
            futures::future::join_all(entries.iter().map(|(_, entry)| entry.close())).await;

        let errors: Vec<Error> = results
            .into_iter()
            .filter_map(|result| match result {
                Err(Error::AlreadyClosed) | Ok(()) => None,
                Err(e) => Some(e),
            })
            .collect();

        if errors.is_empty() {
            return Ok(());
        }
        error!(failed = errors.len(), "failed to close writers");
        Err(Error::Aggregate(errors))
    }

    /// Whether a write to `key` would have to open a new sink.
    pub async fn requires_new_writer(&self, key: &str) -> bool {
        !self.inner.entries.read().await.contains_key(key)
    }

    /// How many more sinks can be opened before the oldest one gets evicted. `None` when the cache
    /// is unbounded.
    pub async fn free_slots(&self) -> Option<usize> {
        let max_entries = self.inner.config.max_entries;
        if max_entries == 0 {
            return None;
        }
        Some(max_entries.saturating_sub(self.len().await))
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns the live entry of `key`, opening a sink for it when there is none.
    async fn entry(&self, key: &str) -> Result<Arc<CacheEntry<F::Sink>>> {
        if let Some(entry) = self.inner.entries.read().await.get(key) {
            return Ok(Arc::clone(entry));
        }

        let mut entries = self.inner.entries.write().await;
        // another writer may have opened it while we waited for the write lock
        if let Some(entry) = entries.get(key) {
            return Ok(Arc::clone(entry));
        }

        let created = self.inner.writers_created.load(Ordering::Acquire);
        let path = self.inner.substitute_suffix(key, created);
        let sink = self.inner.factory.create(&path).await?;
        self.inner.writers_created.fetch_add(1, Ordering::AcqRel);

        let entry = Arc::new(CacheEntry::new(
            key.to_string(),
            path,
            sink,
            self.inner.cln_token.child_token(),
        ));
        entries.insert(key.to_string(), Arc::clone(&entry));
        info!(key, path = %entry.path, live = entries.len(), "opened writer");

        let evicted = self.inner.evict_over_capacity(&mut entries, key);
        drop(entries);

        tokio::spawn(Inner::monitor_idle(
            Arc::clone(&self.inner),
            Arc::clone(&entry),
        ));

        for victim in evicted {
            warn!(
                key = %victim.key,
                path = %victim.path,
                "writer cache full, closing least recently used writer"
            );
            match victim.close().await {
                Ok(()) | Err(Error::AlreadyClosed) => {}
                Err(e) => error!(key = %victim.key, ?e, "failed to close evicted writer"),
            }
        }

        Ok(entry)
    }
}

impl<F: SinkFactory> Inner<F> {
    fn substitute_suffix(&self, key: &str, created: usize) -> String {
        if !key.contains(SUFFIX_PLACEHOLDER) {
            return key.to_string();
        }
        let suffix = format!(
            "{}_{}_{:04}",
            self.hostname,
            chrono::Utc::now().timestamp(),
            created
        );
        key.replace(SUFFIX_PLACEHOLDER, &suffix)
    }

    /// Takes the least recently written entries out of the map until it is back within
    /// `max_entries`. The entry of `keep` is never picked.
    fn evict_over_capacity(
        &self,
        entries: &mut Entries<F::Sink>,
        keep: &str,
    ) -> Vec<Arc<CacheEntry<F::Sink>>> {
        let max_entries = self.config.max_entries;
        let mut evicted = vec![];
        if max_entries == 0 {
            return evicted;
        }

        while entries.len() > max_entries {
            let oldest = entries
                .iter()
                .filter(|(key, _)| key.as_str() != keep)
                .min_by_key(|(_, entry)| entry.last_access())
                .map(|(key, _)| key.clone());
            let Some(entry) = oldest.and_then(|key| entries.remove(&key)) else {
                break;
            };
            evicted.push(entry);
        }
        evicted
    }

    /// Removes `entry` from the map unless `key` already points to a newer entry.
    async fn detach(&self, key: &str, entry: &Arc<CacheEntry<F::Sink>>) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Closes `entry` once it has been idle for `ttl`, or when the cache is cancelled. Returns as
    /// soon as the entry is closed by anybody else.
    async fn monitor_idle(inner: Arc<Self>, entry: Arc<CacheEntry<F::Sink>>) {
        let ttl = inner.config.ttl;
        loop {
            let wait = if ttl.is_zero() {
                None
            } else {
                let idle = entry.idle_for();
                if idle >= ttl {
                    break;
                }
                Some(ttl - idle)
            };

            tokio::select! {
                biased;
                _ = entry.cln_token.cancelled() => {
                    if !inner.cln_token.is_cancelled() {
                        // closed through the cache, nothing left to do
                        return;
                    }
                    debug!(key = %entry.key, "writer cache cancelled, closing writer");
                    break;
                }
                _ = async {
                    match wait {
                        Some(wait) => tokio::time::sleep(wait).await,
                        None => std::future::pending().await,
                    }
                } => {}
            }
        }

        if inner.detach(&entry.key, &entry).await {
            debug!(key = %entry.key, path = %entry.path, "closing writer");
        }
        match entry.close().await {
            Ok(()) | Err(Error::AlreadyClosed) => {}
            Err(e) => error!(key = %entry.key, ?e, "failed to close writer"),
        }
    }
}
