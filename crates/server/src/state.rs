//! Observable server state with throttled change notifications.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dropline_protocol::{ClientInfo, ServerStatus, TransferProgress};
use serde::Serialize;
use tokio::time::Instant;

/// Minimum spacing between two broadcasts.
pub const NOTIFY_INTERVAL: Duration = Duration::from_millis(250);

/// Snapshot of everything a UI needs to render the receiver.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub status: ServerStatus,
    pub error: Option<String>,
    pub address: Option<SocketAddr>,
    pub client: Option<ClientInfo>,
    pub transfer: Option<TransferProgress>,
}

/// Callback invoked with the latest state.
pub type StateCallback = Arc<dyn Fn(&ServerState) + Send + Sync>;

/// Shared, mutable [`ServerState`] plus its subscribers.
///
/// Every [`update`](Self::update) is broadcast, but at most once per
/// [`NOTIFY_INTERVAL`]. Updates inside the window collapse into a single
/// delayed broadcast of the newest snapshot.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    state: ServerState,
    subscribers: Vec<(u64, StateCallback)>,
    next_id: u64,
    interval: Duration,
    last_broadcast: Option<Instant>,
    flush_scheduled: bool,
}

enum Broadcast {
    Now(ServerState, Vec<StateCallback>),
    At(Instant),
    Skip,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(NOTIFY_INTERVAL)
    }
}

impl StateStore {
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ServerState::default(),
                subscribers: Vec::new(),
                next_id: 0,
                interval,
                last_broadcast: None,
                flush_scheduled: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a copy of the current state.
    pub fn snapshot(&self) -> ServerState {
        self.lock().state.clone()
    }

    pub fn status(&self) -> ServerStatus {
        self.lock().state.status
    }

    /// Mutates the state and schedules a broadcast.
    pub fn update(&self, f: impl FnOnce(&mut ServerState)) {
        let broadcast = {
            let mut inner = self.lock();
            f(&mut inner.state);

            let now = Instant::now();
            if inner.flush_scheduled {
                Broadcast::Skip
            } else {
                let last_broadcast = inner.last_broadcast;
                match last_broadcast {
                    Some(last) if now < last + inner.interval => {
                        inner.flush_scheduled = true;
                        Broadcast::At(last + inner.interval)
                    }
                    _ => {
                        inner.last_broadcast = Some(now);
                        Broadcast::Now(inner.state.clone(), callbacks(&inner))
                    }
                }
            }
        };

        match broadcast {
            Broadcast::Now(state, subscribers) => notify(&state, &subscribers),
            Broadcast::At(at) => self.schedule_flush(at),
            Broadcast::Skip => {}
        }
    }

    fn schedule_flush(&self, at: Instant) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::downgrade(&self.inner);
                handle.spawn(async move {
                    tokio::time::sleep_until(at).await;
                    if let Some(inner) = inner.upgrade() {
                        StateStore { inner }.flush();
                    }
                });
            }
            // No runtime to defer on: broadcast right away.
            Err(_) => self.flush(),
        }
    }

    fn flush(&self) {
        let (state, subscribers) = {
            let mut inner = self.lock();
            inner.flush_scheduled = false;
            inner.last_broadcast = Some(Instant::now());
            (inner.state.clone(), callbacks(&inner))
        };
        notify(&state, &subscribers);
    }

    /// Registers a callback. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(&self, callback: impl Fn(&ServerState) + Send + Sync + 'static) -> Subscription {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let callback: StateCallback = Arc::new(callback);
        inner.subscribers.push((id, callback));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

fn callbacks(inner: &Inner) -> Vec<StateCallback> {
    inner.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
}

// Called without the lock held so callbacks may read the store.
fn notify(state: &ServerState, subscribers: &[StateCallback]) {
    for cb in subscribers {
        cb(state);
    }
}

/// Handle returned by [`StateStore::subscribe`].
pub struct Subscription {
    id: u64,
    store: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            let mut inner = store.lock().unwrap_or_else(PoisonError::into_inner);
            inner.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
