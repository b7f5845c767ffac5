//! Order storage.
//!
//! A single in-process table keyed by order id. Expiry is enforced twice:
//! a periodic sweep reclaims expired records, and [`OrderStore::get`]
//! re-checks `expires_at` at read time so an expired-but-not-yet-swept
//! order is invisible to every caller outside the sweeper. The sweep is
//! deliberately at-least-once — missing a record for one interval due to
//! timer granularity is tolerated.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::order::Order;

/// Trait for order storage backends.
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait OrderStore: Send + Sync {
    /// Store a new order, replacing any record under the same id.
    fn insert(&self, order: Order);

    /// Fetch a snapshot of an order. Returns `None` for unknown ids and for
    /// records whose `expires_at` has passed, even before the sweep runs.
    fn get(&self, id: Uuid) -> Option<Order>;

    /// Mutate an order in place. Returns `false` if the id is unknown or
    /// the record is expired. Callers are expected to hold the per-order
    /// lock (see [`crate::service`]), this method does not serialize
    /// competing mutations on its own.
    fn update(&self, id: Uuid, mutate: &mut dyn FnMut(&mut Order)) -> bool;

    /// Remove an order outright.
    fn remove(&self, id: Uuid);

    /// Drop every record whose `expires_at` has passed, regardless of state.
    /// Returns the ids of the removed records.
    fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<Uuid>;

    /// Number of live (non-expired) records, for metrics and tests.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory order store backed by DashMap. Lost on restart, by design —
/// orders are short-lived capabilities, not durable records.
pub struct InMemoryOrderStore {
    orders: DashMap<Uuid, Order>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
        }
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, order: Order) {
        self.orders.insert(order.id, order);
    }

    fn get(&self, id: Uuid) -> Option<Order> {
        let entry = self.orders.get(&id)?;
        if entry.is_expired(Utc::now()) {
            return None;
        }
        Some(entry.clone())
    }

    fn update(&self, id: Uuid, mutate: &mut dyn FnMut(&mut Order)) -> bool {
        match self.orders.get_mut(&id) {
            Some(mut entry) => {
                if entry.is_expired(Utc::now()) {
                    return false;
                }
                mutate(entry.value_mut());
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: Uuid) {
        self.orders.remove(&id);
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        // Removals are counted inside the predicate; diffing map lengths
        // underflows when concurrent inserts outpace the retain.
        let mut removed = Vec::new();
        self.orders.retain(|id, order| {
            if order.is_expired(now) {
                removed.push(*id);
                false
            } else {
                true
            }
        });
        removed
    }

    fn len(&self) -> usize {
        let now = Utc::now();
        self.orders
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }
}
