use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::writercache::sink::Sink;
use crate::{Error, Result};

enum EntryState<S> {
    Open(S),
    Closed,
}

/// CacheEntry is one live sink of the writer cache. Writes and the close are serialized by the
/// state lock, so a close waits for the write in progress and every later write sees `Closed`.
pub(super) struct CacheEntry<S> {
    pub(super) key: String,
    /// key with `{suffix}` substituted, what the sink was created for.
    pub(super) path: String,
    state: tokio::sync::Mutex<EntryState<S>>,
    last_access: Mutex<Instant>,
    /// stops the idle monitor, child of the cache token.
    pub(super) cln_token: CancellationToken,
}

impl<S: Sink> CacheEntry<S> {
    pub(super) fn new(key: String, path: String, sink: S, cln_token: CancellationToken) -> Self {
        Self {
            key,
            path,
            state: tokio::sync::Mutex::new(EntryState::Open(sink)),
            last_access: Mutex::new(Instant::now()),
            cln_token,
        }
    }

    /// Writes `bytes` to the sink, [Error::AlreadyClosed] if the entry was closed first.
    pub(super) async fn write(&self, bytes: Bytes) -> Result<usize> {
        // touched before and after, a long write must not look idle right after it returns
        self.touch();
        let mut state = self.state.lock().await;
        let written = match &mut *state {
            EntryState::Open(sink) => sink.write(bytes).await,
            EntryState::Closed => return Err(Error::AlreadyClosed),
        };
        self.touch();
        written
    }

    /// Closes the sink and stops the idle monitor. A second close returns [Error::AlreadyClosed].
    pub(super) async fn close(&self) -> Result<()> {
        self.cln_token.cancel();
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, EntryState::Closed) {
            EntryState::Open(mut sink) => sink.close().await,
            EntryState::Closed => Err(Error::AlreadyClosed),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub(super) fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    pub(super) fn idle_for(&self) -> Duration {
        self.last_access().elapsed()
    }
}
