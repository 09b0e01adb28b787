//! Per-key FIFO serialization of pipeline runs.
//!
//! At most one holder exists per key. Later callers queue behind it in arrival
//! order and are woken one at a time as the ticket is handed over. All ticket
//! bookkeeping sits behind one queue-wide mutex that is only held for O(1)
//! work and never across an await.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct Waiter {
    id: u64,
    notify: oneshot::Sender<()>,
}

/// Bookkeeping for one key. Presence in the table means the key is held.
#[derive(Default)]
struct Ticket {
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct Inner {
    tickets: HashMap<String, Ticket>,
    next_waiter_id: u64,
}

#[derive(Default)]
pub struct KeyedSerializationQueue {
    inner: Mutex<Inner>,
}

/// Result of [`KeyedSerializationQueue::acquire`].
pub struct Acquisition {
    pub acquired: bool,
    pub wait: WaitSignal,
}

/// Hand-off signal of a queued caller. Inert when the ticket was acquired
/// immediately.
pub struct WaitSignal {
    inner: Option<(u64, oneshot::Receiver<()>)>,
}

impl WaitSignal {
    fn inert() -> Self {
        Self { inner: None }
    }

    pub fn waiter_id(&self) -> Option<u64> {
        self.inner.as_ref().map(|(id, _)| *id)
    }

    /// Wait for the hand-off. Returns `false` if the signal can never fire.
    pub async fn wait(&mut self) -> bool {
        match self.inner.as_mut() {
            Some((_, rx)) => rx.await.is_ok(),
            None => true,
        }
    }
}

/// Returned by [`KeyedSerializationQueue::lock`] when the wait was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("cancelled while waiting for the queue")]
pub struct Cancelled;

impl KeyedSerializationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        // Bookkeeping never panics while locked; recover the data if it did.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Become the holder of `key`, or join the end of its waiter list.
    pub fn acquire(&self, key: &str) -> Acquisition {
        let mut st = self.state();
        if !st.tickets.contains_key(key) {
            st.tickets.insert(key.to_string(), Ticket::default());
            return Acquisition {
                acquired: true,
                wait: WaitSignal::inert(),
            };
        }

        st.next_waiter_id += 1;
        let id = st.next_waiter_id;
        let (tx, rx) = oneshot::channel();
        if let Some(ticket) = st.tickets.get_mut(key) {
            ticket.waiters.push_back(Waiter { id, notify: tx });
        }
        Acquisition {
            acquired: false,
            wait: WaitSignal {
                inner: Some((id, rx)),
            },
        }
    }

    /// Hand `key` to the next live waiter, or clear it when nobody waits.
    ///
    /// Releasing a key without a holder is a no-op.
    pub fn release(&self, key: &str) {
        let mut st = self.state();
        let Some(ticket) = st.tickets.get_mut(key) else {
            return;
        };

        while let Some(next) = ticket.waiters.pop_front() {
            // A failed send means the waiter went away; try the one behind it.
            if next.notify.send(()).is_ok() {
                return;
            }
        }
        st.tickets.remove(key);
    }

    /// Remove a queued waiter. Returns `false` when it is no longer queued,
    /// i.e. the ticket was already handed to it.
    pub fn withdraw(&self, key: &str, waiter_id: u64) -> bool {
        let mut st = self.state();
        let Some(ticket) = st.tickets.get_mut(key) else {
            return false;
        };
        let Some(pos) = ticket.waiters.iter().position(|w| w.id == waiter_id) else {
            return false;
        };
        ticket.waiters.remove(pos);
        true
    }

    /// Acquire `key`, waiting for the hand-off or for `cancel`.
    pub async fn lock(
        self: &Arc<Self>,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<TicketGuard, Cancelled> {
        let acq = self.acquire(key);
        self.wait_for(key, acq, cancel).await
    }

    /// Finish an [`Acquisition`] obtained from [`Self::acquire`].
    ///
    /// On cancellation the caller leaves the waiter list; if the ticket was
    /// handed over in the meantime it is released, so exactly one release
    /// happens either way.
    pub async fn wait_for(
        self: &Arc<Self>,
        key: &str,
        acq: Acquisition,
        cancel: &CancellationToken,
    ) -> Result<TicketGuard, Cancelled> {
        let Some((id, mut rx)) = acq.wait.inner else {
            return Ok(TicketGuard::new(self.clone(), key));
        };

        tokio::select! {
            biased;
            handed = &mut rx => match handed {
                Ok(()) => Ok(TicketGuard::new(self.clone(), key)),
                Err(_) => Err(Cancelled),
            },
            _ = cancel.cancelled() => {
                if !self.withdraw(key, id) {
                    self.release(key);
                }
                Err(Cancelled)
            }
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.state().tickets.contains_key(key)
    }

    pub fn waiting(&self, key: &str) -> usize {
        self.state()
            .tickets
            .get(key)
            .map(|t| t.waiters.len())
            .unwrap_or(0)
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.state().tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holder status for one key; released on drop.
pub struct TicketGuard {
    queue: Arc<KeyedSerializationQueue>,
    key: String,
}

impl TicketGuard {
    fn new(queue: Arc<KeyedSerializationQueue>, key: &str) -> Self {
        Self {
            queue,
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        self.queue.release(&self.key);
    }
}
