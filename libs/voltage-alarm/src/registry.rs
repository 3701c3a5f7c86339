//! Registry of live entity states

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::ids::EntityId;
use crate::state::EntityState;

/// Concurrent map of entity id to its state
///
/// Lookups hand out `Arc` clones so no shard guard is held across an await.
#[derive(Debug, Default)]
pub struct EntityStateRegistry {
    states: DashMap<EntityId, Arc<EntityState>>,
}

impl EntityStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<Arc<EntityState>> {
        self.states.get(entity_id).map(|s| Arc::clone(s.value()))
    }

    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.states.contains_key(entity_id)
    }

    /// Insert `state` unless another one is already registered
    ///
    /// Returns the registered state and whether it is the one passed in.
    pub fn insert_if_absent(&self, state: Arc<EntityState>) -> (Arc<EntityState>, bool) {
        match self.states.entry(state.entity_id()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&state));
                (state, true)
            },
        }
    }

    /// Remove the entry only if it still holds `state`
    pub fn remove_state(&self, state: &Arc<EntityState>) -> bool {
        self.states
            .remove_if(&state.entity_id(), |_, current| Arc::ptr_eq(current, state))
            .is_some()
    }

    /// Point-in-time copy of every live state
    pub fn snapshot(&self) -> Vec<Arc<EntityState>> {
        self.states.iter().map(|s| Arc::clone(s.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
