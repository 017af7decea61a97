use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::events::Frame;

type Callback = Arc<dyn Fn(Frame) + Send + Sync>;

struct Subscription {
    opcodes: Vec<u8>,
    events: Vec<String>,
    callback: Callback,
}

impl Subscription {
    fn matches(&self, frame: &Frame) -> bool {
        if self.opcodes.contains(&frame.opcode) {
            return true;
        }
        match frame.event {
            Some(ref name) => self.events.iter().any(|e| e == name),
            None => false,
        }
    }
}

/// Concurrency-safe table of frame subscriptions, keyed by random ids.
///
/// Dispatch snapshots the matching callbacks before invoking any of them,
/// so a callback may add or remove subscriptions (including its own)
/// without corrupting the table; a removal takes effect for all subsequent
/// frames but not for the dispatch pass already in flight.
pub struct SubscriptionRegistry {
    subs: DashMap<String, Subscription>,
    weak: Weak<SubscriptionRegistry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            subs: DashMap::new(),
            weak: weak.clone(),
        })
    }

    /// Subscribe to all frames carrying one of `opcodes`.
    pub fn add_opcodes<F>(&self, opcodes: Vec<u8>, callback: F) -> String
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.insert(opcodes, Vec::new(), Arc::new(callback))
    }

    /// Subscribe to all dispatch frames carrying one of `events`.
    pub fn add_events<F>(&self, events: Vec<String>, callback: F) -> String
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.insert(Vec::new(), events, Arc::new(callback))
    }

    fn insert(&self, opcodes: Vec<u8>, events: Vec<String>, callback: Callback) -> String {
        let id = subscription_id();
        self.subs.insert(
            id.clone(),
            Subscription {
                opcodes,
                events,
                callback,
            },
        );
        id
    }

    /// Remove a subscription. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) {
        self.subs.remove(id);
    }

    /// Invoke the callback of every subscription matching `frame`,
    /// synchronously, before returning.
    pub fn dispatch(&self, frame: &Frame) {
        let interested: Vec<Callback> = self
            .subs
            .iter()
            .filter(|entry| entry.value().matches(frame))
            .map(|entry| Arc::clone(&entry.value().callback))
            .collect();
        for callback in interested {
            callback(frame.clone());
        }
    }

    /// Single-shot wait for the next frame with the given opcode.
    pub fn await_opcode(&self, op: u8) -> PendingWait {
        self.single_shot(vec![op], Vec::new())
    }

    /// Single-shot wait for the next dispatch frame with the given event name.
    pub fn await_event(&self, event: &str) -> PendingWait {
        self.single_shot(Vec::new(), vec![event.to_string()])
    }

    fn single_shot(&self, opcodes: Vec<u8>, events: Vec<String>) -> PendingWait {
        let id = subscription_id();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let registry = self.weak.clone();
        let sub_id = id.clone();
        self.subs.insert(
            id.clone(),
            Subscription {
                opcodes,
                events,
                callback: Arc::new(move |frame| {
                    if let Some(tx) = tx.lock().ok().and_then(|mut slot| slot.take()) {
                        let _ = tx.send(frame);
                        if let Some(registry) = registry.upgrade() {
                            registry.remove(&sub_id);
                        }
                    }
                }),
            },
        );
        PendingWait {
            id,
            registry: self.weak.clone(),
            rx,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.subs.len()
    }
}

fn subscription_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// A single-shot wait coupled with its registry subscription. Resolves on
/// the first matching frame (removing the subscription), or never resolves
/// once aborted. Dropping the wait cancels it; aborting after resolution
/// is a no-op.
pub struct PendingWait {
    id: String,
    registry: Weak<SubscriptionRegistry>,
    rx: oneshot::Receiver<Frame>,
}

impl PendingWait {
    /// Wait for the matching frame. Returns `None` if the wait was torn
    /// down before a match arrived.
    pub async fn wait(&mut self) -> Option<Frame> {
        (&mut self.rx).await.ok()
    }

    /// Cancel the wait and remove its subscription.
    pub fn abort(self) {}
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}
