use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;

use crate::Error;
use crate::Result;

/// TokenRing hands a single emission token around `size` slots. The token for `index` lives in slot
/// `index % size` and only shows up there once `index - 1` has been emitted (or dropped), so whoever
/// holds it is always the next record in arrival order. Exactly one permit exists in the ring at
/// any time.
pub(super) struct TokenRing {
    slots: Vec<Semaphore>,
    next_index: AtomicU64,
}

impl TokenRing {
    pub(super) fn new(size: usize) -> Self {
        let size = size.max(1);
        let slots = (0..size)
            .map(|slot| Semaphore::new(usize::from(slot == 0)))
            .collect();
        Self {
            slots,
            next_index: AtomicU64::new(0),
        }
    }

    fn slot(&self, index: u64) -> &Semaphore {
        let pos = (index % self.slots.len() as u64) as usize;
        // pos < len by construction, the ring is never empty
        #[allow(clippy::indexing_slicing)]
        &self.slots[pos]
    }

    /// Waits until the token for `index` reaches its slot and takes it.
    pub(super) async fn acquire(&self, index: u64) -> Result<()> {
        let permit = self
            .slot(index)
            .acquire()
            .await
            .map_err(|e| Error::Forwarder(format!("token ring closed at index {index}: {e}")))?;
        // the permit travels to the next slot through `advance`, not back to this one
        permit.forget();
        Ok(())
    }

    /// Passes the token on to `index + 1`. Must only be called by the holder of `index`.
    pub(super) fn advance(&self, index: u64) {
        self.next_index.store(index + 1, Ordering::Release);
        self.slot(index + 1).add_permits(1);
    }

    /// The lowest index that has not been released downstream yet.
    pub(super) fn next_index(&self) -> u64 {
        self.next_index.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_token_follows_arrival_order() {
        let ring = Arc::new(TokenRing::new(3));

        // index 1 cannot go before index 0
        let waiter = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move { ring.acquire(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        ring.acquire(0).await.unwrap();
        ring.advance(0);
        waiter.await.unwrap().unwrap();
        assert_eq!(ring.next_index(), 1);

        ring.advance(1);
        ring.acquire(2).await.unwrap();
        ring.advance(2);
        // wraps around to slot 0
        ring.acquire(3).await.unwrap();
        assert_eq!(ring.next_index(), 3);
    }

    #[tokio::test]
    async fn test_single_slot_ring() {
        let ring = TokenRing::new(1);
        for index in 0..10 {
            ring.acquire(index).await.unwrap();
            ring.advance(index);
        }
        assert_eq!(ring.next_index(), 10);
    }
}
