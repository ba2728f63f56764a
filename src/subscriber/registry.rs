// =============================================================================
// Subscriber Registry — id -> subscriber, with staged writes
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::subscriber::lifecycle::Subscriber;
use crate::types::SubscriberId;

enum Staged {
    Add(Arc<Subscriber>),
    Delete(SubscriberId),
}

/// Same discipline as the subscription registry: `stage_*` records intent,
/// `rebalance` commits it, reads see committed state.
#[derive(Default)]
pub struct SubscriberRegistry {
    committed: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    staged: Mutex<Vec<Staged>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage_add(&self, subscriber: Arc<Subscriber>) {
        self.staged.lock().push(Staged::Add(subscriber));
    }

    pub fn stage_delete(&self, id: SubscriberId) {
        self.staged.lock().push(Staged::Delete(id));
    }

    /// Commit staged adds and deletes in staging order; returns how many
    /// mutations were applied.
    pub fn rebalance(&self) -> usize {
        let mut staged = self.staged.lock();
        if staged.is_empty() {
            return 0;
        }
        let mut committed = self.committed.write();
        let applied = staged.len();
        for change in staged.drain(..) {
            match change {
                Staged::Add(subscriber) => {
                    committed.insert(subscriber.id(), subscriber);
                }
                Staged::Delete(id) => {
                    committed.remove(&id);
                }
            }
        }
        applied
    }

    pub fn get(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        self.committed.read().get(id).cloned()
    }

    /// Like `get`, but also sees a subscriber whose add is still staged and
    /// not yet cancelled by a later staged delete.
    pub fn find(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        let staged = self.staged.lock();
        let mut found = self.committed.read().get(id).cloned();
        for change in staged.iter() {
            match change {
                Staged::Add(subscriber) if subscriber.id() == *id => {
                    found = Some(Arc::clone(subscriber));
                }
                Staged::Delete(deleted) if deleted == id => found = None,
                _ => {}
            }
        }
        found
    }

    pub fn all(&self) -> Vec<Arc<Subscriber>> {
        self.committed.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.read().is_empty()
    }
}
