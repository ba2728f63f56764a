// =============================================================================
// Subscription Registry — GUID -> interested subscribers, with staged writes
// =============================================================================
//
// Adds and deletes are only recorded; `rebalance` folds them into the
// committed map at one point per dispatch iteration. Readers (`get`, `all`,
// `subscribers_of`) see committed state only, so membership is frozen for
// the duration of one dispatched event.
//
// Lock order: `staged` before `committed`.
// =============================================================================

use std::collections::{BTreeSet, HashMap};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::subscription::definition::Subscription;
use crate::types::{Guid, SubscriberId};

/// A subscription plus everyone currently interested in it.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionContainer {
    pub subscription: Subscription,
    pub subscribers: BTreeSet<SubscriberId>,
    /// Set once any event has arrived for this GUID.
    pub active: bool,
}

#[derive(Debug, Clone)]
enum Staged {
    Add {
        subscriber: SubscriberId,
        subscription: Subscription,
    },
    Delete {
        subscriber: SubscriberId,
        guid: Guid,
    },
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    committed: RwLock<HashMap<Guid, SubscriptionContainer>>,
    staged: Mutex<Vec<Staged>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Staging
    // -------------------------------------------------------------------------

    pub fn stage_add(&self, subscriber: SubscriberId, subscription: Subscription) {
        self.staged.lock().push(Staged::Add {
            subscriber,
            subscription,
        });
    }

    pub fn stage_delete(&self, subscriber: SubscriberId, guid: Guid) {
        self.staged.lock().push(Staged::Delete { subscriber, guid });
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.lock().is_empty()
    }

    /// Apply staged mutations in the order they were staged. Returns the
    /// GUIDs whose containers were destroyed.
    pub fn rebalance(&self) -> Vec<Guid> {
        let mut staged = self.staged.lock();
        if staged.is_empty() {
            return Vec::new();
        }

        let mut committed = self.committed.write();
        let mut removed = Vec::new();

        for change in staged.drain(..) {
            match change {
                Staged::Add {
                    subscriber,
                    subscription,
                } => {
                    let container = committed
                        .entry(subscription.guid().clone())
                        .or_insert_with(|| SubscriptionContainer {
                            subscription,
                            subscribers: BTreeSet::new(),
                            active: false,
                        });
                    container.subscribers.insert(subscriber);
                }
                Staged::Delete { subscriber, guid } => {
                    let emptied = match committed.get_mut(&guid) {
                        Some(container) => {
                            container.subscribers.remove(&subscriber);
                            container.subscribers.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        committed.remove(&guid);
                        debug!(guid = %guid, "subscription container dropped");
                        removed.push(guid);
                    }
                }
            }
        }

        removed
    }

    /// Subscriber count `guid` will have once everything staged so far is
    /// applied.
    pub fn projected_len(&self, guid: &Guid) -> usize {
        let staged = self.staged.lock();
        let committed = self.committed.read();

        let mut members: BTreeSet<SubscriberId> = committed
            .get(guid)
            .map(|c| c.subscribers.clone())
            .unwrap_or_default();

        for change in staged.iter() {
            match change {
                Staged::Add {
                    subscriber,
                    subscription,
                } if subscription.guid() == guid => {
                    members.insert(*subscriber);
                }
                Staged::Delete {
                    subscriber,
                    guid: deleted,
                } if deleted == guid => {
                    members.remove(subscriber);
                }
                _ => {}
            }
        }

        members.len()
    }

    // -------------------------------------------------------------------------
    // Committed reads
    // -------------------------------------------------------------------------

    pub fn get(&self, guid: &Guid) -> Option<SubscriptionContainer> {
        self.committed.read().get(guid).cloned()
    }

    /// Snapshot of the subscriber set for `guid`; empty when unknown.
    pub fn subscribers_of(&self, guid: &Guid) -> Vec<SubscriberId> {
        self.committed
            .read()
            .get(guid)
            .map(|c| c.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<SubscriptionContainer> {
        self.committed.read().values().cloned().collect()
    }

    /// Every committed subscription, for resubscribing after a reconnect.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.committed
            .read()
            .values()
            .map(|c| c.subscription.clone())
            .collect()
    }

    pub fn mark_active(&self, guid: &Guid) {
        if let Some(container) = self.committed.write().get_mut(guid) {
            container.active = true;
        }
    }

    pub fn len(&self) -> usize {
        self.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.committed.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, Instrument, ResponseFormat};

    fn book(code: &str) -> Subscription {
        Subscription::order_book(
            Instrument::new(Exchange::Moex, code, "TQBR"),
            ResponseFormat::Slim,
            0,
            10,
        )
    }

    #[test]
    fn staged_adds_invisible_until_rebalance() {
        let registry = SubscriptionRegistry::new();
        let sub = book("SBER");
        registry.stage_add(SubscriberId::new(), sub.clone());
        assert!(registry.get(sub.guid()).is_none());
        assert_eq!(registry.projected_len(sub.guid()), 1);

        registry.rebalance();
        assert_eq!(registry.get(sub.guid()).unwrap().subscribers.len(), 1);
        assert!(!registry.has_staged());
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let once = SubscriptionRegistry::new();
        let twice = SubscriptionRegistry::new();
        let id = SubscriberId::new();
        let sub = book("SBER");

        once.stage_add(id, sub.clone());
        twice.stage_add(id, sub.clone());
        twice.stage_add(id, sub.clone());
        once.rebalance();
        twice.rebalance();

        assert_eq!(
            once.get(sub.guid()).unwrap().subscribers,
            twice.get(sub.guid()).unwrap().subscribers
        );
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn shared_guid_unions_subscribers() {
        let registry = SubscriptionRegistry::new();
        let (a, b) = (SubscriberId::new(), SubscriberId::new());
        let sub = book("GAZP");
        registry.stage_add(a, sub.clone());
        registry.stage_add(b, sub.clone());
        registry.rebalance();

        let mut members = registry.subscribers_of(sub.guid());
        members.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[test]
    fn last_delete_destroys_container() {
        let registry = SubscriptionRegistry::new();
        let (a, b) = (SubscriberId::new(), SubscriberId::new());
        let sub = book("SBER");
        registry.stage_add(a, sub.clone());
        registry.stage_add(b, sub.clone());
        registry.rebalance();

        registry.stage_delete(a, sub.guid().clone());
        assert_eq!(registry.projected_len(sub.guid()), 1);
        assert!(registry.rebalance().is_empty());
        assert_eq!(registry.subscribers_of(sub.guid()), vec![b]);

        registry.stage_delete(b, sub.guid().clone());
        assert_eq!(registry.projected_len(sub.guid()), 0);
        assert_eq!(registry.rebalance(), vec![sub.guid().clone()]);
        assert!(registry.get(sub.guid()).is_none());
    }

    #[test]
    fn delete_of_unknown_guid_is_harmless() {
        let registry = SubscriptionRegistry::new();
        registry.stage_delete(SubscriberId::new(), Guid::new("nope"));
        assert!(registry.rebalance().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn mark_active_and_subscriptions_snapshot() {
        let registry = SubscriptionRegistry::new();
        let sub = book("SBER");
        registry.stage_add(SubscriberId::new(), sub.clone());
        registry.rebalance();
        assert!(!registry.get(sub.guid()).unwrap().active);
        registry.mark_active(sub.guid());
        assert!(registry.get(sub.guid()).unwrap().active);
        assert_eq!(registry.subscriptions(), vec![sub]);
    }
}
