//! Process-scoped engine state
//!
//! One `AlarmEngineContext` is built at service start and handed by `Arc`
//! to every component. Initialization order: collaborators, then the
//! partition ownership shared with the resolver, then the context. Teardown
//! is [`AlarmEngine::stop`](crate::engine::AlarmEngine::stop).

use std::sync::Arc;
use tracing::warn;

use crate::condition::ConditionEvaluator;
use crate::filter::EntityFilterMatcher;
use crate::index::RuleMembershipIndex;
use crate::partition::{PartitionOwnership, ServiceType};
use crate::registry::EntityStateRegistry;
use crate::state::{EntityState, EntityStateDeps, LockedEntityState};
use crate::time::TimeProvider;
use crate::traits::{AlarmSink, PartitionResolver, PersistedStateStore, ProfileCache, RuleSource};

/// External collaborators of the engine
#[derive(Clone)]
pub struct Collaborators {
    pub rule_source: Arc<dyn RuleSource>,
    pub device_profiles: Arc<dyn ProfileCache>,
    pub asset_profiles: Arc<dyn ProfileCache>,
    pub store: Arc<dyn PersistedStateStore>,
    pub resolver: Arc<dyn PartitionResolver>,
    pub sink: Arc<dyn AlarmSink>,
    pub evaluator: Arc<dyn ConditionEvaluator>,
    pub clock: Arc<dyn TimeProvider>,
}

pub struct AlarmEngineContext {
    pub rule_source: Arc<dyn RuleSource>,
    pub store: Arc<dyn PersistedStateStore>,
    pub resolver: Arc<dyn PartitionResolver>,
    pub clock: Arc<dyn TimeProvider>,
    pub ownership: Arc<PartitionOwnership>,
    pub matcher: EntityFilterMatcher,
    pub registry: EntityStateRegistry,
    pub index: RuleMembershipIndex,
    pub deps: EntityStateDeps,
}

impl AlarmEngineContext {
    pub fn new(collaborators: Collaborators, ownership: Arc<PartitionOwnership>) -> Self {
        let Collaborators {
            rule_source,
            device_profiles,
            asset_profiles,
            store,
            resolver,
            sink,
            evaluator,
            clock,
        } = collaborators;

        Self {
            rule_source,
            store: Arc::clone(&store),
            resolver,
            clock,
            ownership,
            matcher: EntityFilterMatcher::new(device_profiles, asset_profiles),
            registry: EntityStateRegistry::new(),
            index: RuleMembershipIndex::new(),
            deps: EntityStateDeps {
                evaluator,
                store,
                sink,
            },
        }
    }

    /// Whether the entity resolves into an owned partition
    pub fn is_local(&self, state: &EntityState) -> bool {
        self.resolver
            .resolve(
                ServiceType::AlarmRulesExecutor,
                state.tenant_id(),
                state.entity_id(),
            )
            .is_my_partition()
    }

    /// Evict a state whose lock the caller holds
    ///
    /// Retires the state, removes it from the registry and the reverse
    /// index, and with `remove_snapshot` also deletes its persisted snapshot.
    pub async fn evict(
        &self,
        state: &Arc<EntityState>,
        guard: &mut LockedEntityState<'_>,
        remove_snapshot: bool,
    ) {
        guard.retire();
        self.registry.remove_state(state);
        self.index
            .purge_entity(&state.tenant_id(), &state.entity_id(), &guard.rule_ids());

        if remove_snapshot {
            if let Err(e) = self.store.remove(state.tenant_id(), state.entity_id()).await {
                warn!(
                    "[{}] [{}] Failed to remove persisted alarm state: {}",
                    state.tenant_id(),
                    state.entity_id(),
                    e
                );
            }
        }
    }
}
