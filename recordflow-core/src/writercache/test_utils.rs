//! In-memory sinks for the writer cache tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::writercache::sink::{Sink, SinkFactory};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct MemoryFile {
    pub(crate) data: Vec<u8>,
    pub(crate) closed: bool,
}

/// Keeps every created sink's bytes in memory, keyed by path. Clones share the same files.
#[derive(Clone, Default)]
pub(crate) struct MemorySinkFactory {
    files: Arc<Mutex<HashMap<String, MemoryFile>>>,
    created: Arc<AtomicUsize>,
    fail_close: bool,
    create_delay: Option<Duration>,
}

impl MemorySinkFactory {
    /// Sinks that fail every close.
    pub(crate) fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Default::default()
        }
    }

    pub(crate) fn with_create_delay(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Default::default()
        }
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub(crate) fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).map(|f| f.data.clone())
    }

    pub(crate) fn is_closed(&self, path: &str) -> bool {
        self.files.lock().get(path).is_some_and(|f| f.closed)
    }
}

pub(crate) struct MemorySink {
    path: String,
    files: Arc<Mutex<HashMap<String, MemoryFile>>>,
    fail_close: bool,
}

impl Sink for MemorySink {
    async fn write(&mut self, bytes: Bytes) -> Result<usize> {
        let mut files = self.files.lock();
        let file = files.entry(self.path.clone()).or_default();
        if file.closed {
            return Err(Error::Sink(format!("{} is closed", self.path)));
        }
        file.data.extend_from_slice(&bytes);
        Ok(bytes.len())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(file) = self.files.lock().get_mut(&self.path) {
            file.closed = true;
        }
        if self.fail_close {
            return Err(Error::Sink(format!("failed to close {}", self.path)));
        }
        Ok(())
    }
}

impl SinkFactory for MemorySinkFactory {
    type Sink = MemorySink;

    async fn create(&self, path: &str) -> Result<MemorySink> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .insert(path.to_string(), MemoryFile::default());
        Ok(MemorySink {
            path: path.to_string(),
            files: Arc::clone(&self.files),
            fail_close: self.fail_close,
        })
    }
}

/// Installs a test subscriber so `RUST_LOG` controls what the tests print.
pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
