//! A bounded pool of lazily-constructed values.
//!
//! The pool starts with `capacity` unrealised slots. Acquiring pops a slot
//! off the free list (retrying on a fixed cadence until the deadline),
//! realises it through the factory if needed, and hands back a borrow
//! guard; dropping the guard returns the slot. A slot whose factory failed
//! goes back unrealised, so the slot count never changes over the pool's
//! lifetime.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error;

const ACQUIRE_RETRY: Duration = Duration::from_millis(100);

type BoxFactory<T> =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = crate::Result<T>> + Send>> + Send + Sync>;
pub(crate) type ShouldDrop<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
pub(crate) type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

pub(crate) struct Pool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Pool<T> {
        Pool {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T> {
    free: Mutex<Vec<Slot<T>>>,
    factory: BoxFactory<T>,
    should_drop: Option<ShouldDrop<T>>,
    reset: Option<Reset<T>>,
    shutdown: CancellationToken,
}

enum Slot<T> {
    Unrealised,
    Realised(T),
}

impl<T> Pool<T> {
    pub(crate) fn new<F, Fut>(
        capacity: usize,
        factory: F,
        should_drop: Option<ShouldDrop<T>>,
        reset: Option<Reset<T>>,
    ) -> Pool<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<T>> + Send + 'static,
    {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Slot::Unrealised);
        }
        Pool {
            shared: Arc::new(Shared {
                free: Mutex::new(free),
                factory: Box::new(move || Box::pin(factory())),
                should_drop,
                reset,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Borrow a value, waiting up to `timeout` for a free slot.
    ///
    /// The factory runs at most once per slot; a value flagged by
    /// `should_drop` is disposed and its slot realised afresh before the
    /// borrow is handed out.
    pub(crate) async fn acquire(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> crate::Result<Pooled<T>> {
        let started = Instant::now();
        let slot = loop {
            if self.shared.shutdown.is_cancelled() || cancel.is_cancelled() {
                return Err(error::canceled());
            }
            let popped = self.shared.free.lock().unwrap().pop();
            if let Some(slot) = popped {
                break slot;
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(error::pool_timeout());
                }
            }
            tokio::time::sleep(ACQUIRE_RETRY).await;
        };

        // Reinstalls the slot unrealised if realisation fails or the
        // acquire future is dropped mid-flight.
        let mut guard = SlotGuard {
            shared: &*self.shared,
            armed: true,
        };
        let mut value = match slot {
            Slot::Realised(value) => value,
            Slot::Unrealised => self.realise(cancel).await?,
        };
        if let Some(ref pred) = self.shared.should_drop {
            if pred(&value) {
                log::trace!("pool: replacing stale slot value");
                drop(value);
                value = self.realise(cancel).await?;
            }
        }
        guard.armed = false;
        Ok(Pooled {
            value: Some(value),
            shared: Arc::downgrade(&self.shared),
        })
    }

    async fn realise(&self, cancel: &CancellationToken) -> crate::Result<T> {
        let fut = (self.shared.factory)();
        tokio::select! {
            _ = self.shared.shutdown.cancelled() => Err(error::canceled()),
            _ = cancel.cancelled() => Err(error::canceled()),
            result = fut => result,
        }
    }

    /// Cancel in-flight realisations and dispose every pooled value.
    pub(crate) fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.free.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct SlotGuard<'a, T> {
    shared: &'a Shared<T>,
    armed: bool,
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.free.lock().unwrap().push(Slot::Unrealised);
        }
    }
}

/// An exclusive borrow of one pooled value; releases on drop.
#[derive(Debug)]
pub(crate) struct Pooled<T> {
    value: Option<T>,
    shared: Weak<Shared<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value released")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value released")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(mut value) = self.value.take() else {
            return;
        };
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if shared.shutdown.is_cancelled() {
            shared.free.lock().unwrap().push(Slot::Unrealised);
            return;
        }
        if let Some(ref reset) = shared.reset {
            reset(&mut value);
        }
        shared.free.lock().unwrap().push(Slot::Realised(value));
    }
}

/// Destination identity for the per-host pool map.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub(crate) struct PoolKey {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) is_tls: bool,
}
