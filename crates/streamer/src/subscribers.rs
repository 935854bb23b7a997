//! Generic subscriber fan-out: any number of in-process subscribers can
//! register before a streamer is `done`; after `close`, every existing and
//! future subscriber observes a closed channel.

use std::sync::Mutex;

use tokio::sync::mpsc;

struct Inner<T> {
    subs: Vec<mpsc::Sender<T>>,
    done: bool,
}

/// Subscriber registry and fan-out helper shared by every concrete
/// streamer. The mutex is held only to mutate the subscriber list or the
/// `done` flag: it is never held across a channel send.
pub struct Subscribers<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subs: Vec::new(),
                done: false,
            }),
        }
    }
}

impl<T> Subscribers<T>
where
    T: Clone + Send + 'static,
{
    /// Creates an empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber with the given channel capacity.
    ///
    /// If this registry is already `done`, the returned receiver is already
    /// closed (its sender half is dropped immediately) rather than
    /// panicking or blocking — any subscribe call after close must return an
    /// already-closed channel.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<T> {
        let mut inner = self.inner.lock().expect("subscribers mutex poisoned");
        let (tx, rx) = mpsc::channel(capacity.max(1));

        if inner.done {
            drop(tx);
        } else {
            inner.subs.push(tx);
        }

        rx
    }

    /// Whether [`close`](Self::close) has already been called.
    pub fn is_done(&self) -> bool {
        self.inner.lock().expect("subscribers mutex poisoned").done
    }

    /// Sends every event in `events`, in order, to every subscriber
    /// registered at the moment this call started.
    ///
    /// The subscriber list is snapshotted under the lock and the lock is
    /// released before any send, so a subscriber registering concurrently
    /// with `notify_all` never deadlocks against it (it simply may not
    /// observe this particular batch).
    pub async fn notify_all(&self, events: impl IntoIterator<Item = T>) {
        let snapshot = self.inner.lock().expect("subscribers mutex poisoned").subs.clone();
        let events: Vec<T> = events.into_iter().collect();

        for sub in &snapshot {
            for event in &events {
                if sub.send(event.clone()).await.is_err() {
                    tracing::debug!("subscriber channel closed; dropping remaining events for it");
                    break;
                }
            }
        }
    }

    /// Closes every subscriber channel and marks this registry `done` so
    /// that any later `subscribe` returns an already-closed channel.
    /// Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("subscribers mutex poisoned");
        inner.done = true;
        inner.subs.clear();
    }
}
