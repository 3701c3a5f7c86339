#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
//! Partition ownership tests
//!
//! Covers eviction on partition loss, restoring persisted progress on
//! partition gain and the clean-up of snapshots whose rules are gone.

mod common;

use common::*;
use std::collections::HashMap;
use voltage_alarm::{
    AlarmRuleEntityFilter, EntityId, PersistedEntityState, PersistedStateStore,
};

#[tokio::test]
async fn test_only_local_entities_stay_in_registry() {
    let h = Harness::new();
    h.own_all().await;
    let devices: Vec<EntityId> = (0..16).map(|_| device()).collect();
    h.add_rule(temperature_rule(
        h.tenant,
        vec![AlarmRuleEntityFilter::EntityList {
            entity_ids: devices.clone(),
        }],
    ));
    for d in &devices {
        h.telemetry(*d, warm()).await;
    }
    assert_eq!(h.ctx().registry.len(), devices.len());

    let kept = h.resolver.partition_for(&devices[0]);
    let summary = h.own([kept.clone()].into_iter().collect()).await;

    let local = devices
        .iter()
        .filter(|d| h.resolver.partition_for(d) == kept)
        .count();
    assert_eq!(summary.evicted, devices.len() - local);
    assert_eq!(h.ctx().registry.len(), local);
    for state in h.ctx().registry.snapshot() {
        assert_eq!(h.resolver.partition_for(&state.entity_id()), kept);
    }
    // In-memory eviction keeps every snapshot
    assert_eq!(h.store.len(), devices.len());
    assert_eq!(h.queue.subscribed(), [kept].into_iter().collect());
}

#[tokio::test]
async fn test_restore_twice_equals_restore_once() {
    let h = Harness::new();
    h.own_all().await;
    let e = device();
    let rule = h.add_rule(temperature_rule(h.tenant, single(e)));
    h.telemetry(e, hot()).await;

    h.own(h.all_but(&e)).await;
    h.own_all().await;
    let first = h.ctx().registry.get(&e).unwrap();
    let progress = first.lock().await.progress(&rule.id).unwrap();

    let persisted = h.store.get(h.tenant, e).unwrap();
    // Nothing left to attach
    assert!(!h.service().restore_state(persisted).await);

    let second = h.ctx().registry.get(&e).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    let guard = second.lock().await;
    assert_eq!(guard.rule_ids(), vec![rule.id]);
    assert_eq!(guard.progress(&rule.id).unwrap(), progress);
    drop(guard);
    assert_eq!(h.ctx().index.tenant_entities(&h.tenant), vec![e]);
    assert_eq!(h.ctx().index.entities_for_rule(&rule.id), vec![e]);
}

#[tokio::test]
async fn test_repeated_partition_event_is_idempotent() {
    let h = Harness::new();
    let first = h.own_all().await;
    assert_eq!(first.added, PARTITIONS as usize);
    let e = device();
    let rule = h.add_rule(temperature_rule(h.tenant, single(e)));
    h.telemetry(e, hot()).await;
    let state = h.ctx().registry.get(&e).unwrap();
    let progress = state.lock().await.progress(&rule.id).unwrap();
    let puts = h.store.puts();

    let again = h.own_all().await;

    assert_eq!(again.added, 0);
    assert_eq!(again.removed, 0);
    assert_eq!(again.evicted, 0);
    assert_eq!(again.restored, 0);
    let same = h.ctx().registry.get(&e).unwrap();
    assert!(std::sync::Arc::ptr_eq(&state, &same));
    assert_eq!(same.lock().await.progress(&rule.id).unwrap(), progress);
    assert_eq!(h.store.puts(), puts);
    assert_eq!(h.queue.subscribed(), h.resolver.all_partitions());
    h.assert_membership_consistent(&e, &[rule.id]).await;
}

#[tokio::test]
async fn test_restore_drops_rules_missing_from_catalog() {
    let h = Harness::new();
    h.own_all().await;
    let e = device();
    let kept = h.add_rule(temperature_rule(h.tenant, single(e)));
    let gone = h.add_rule(temperature_rule(h.tenant, single(e)));
    h.telemetry(e, hot()).await;
    assert_eq!(h.store.get(h.tenant, e).unwrap().alarm_states.len(), 2);

    h.own(h.all_but(&e)).await;
    // Rule deleted while another node owned the partition
    h.rules.remove(&gone.id);
    h.ctx().index.remove_rule(&h.tenant, &gone.id);
    h.own_all().await;

    assert_eq!(h.attached(&e).await, Some(vec![kept.id]));
    h.assert_membership_consistent(&e, &[kept.id, gone.id]).await;
}

#[tokio::test]
async fn test_snapshot_without_known_rules_is_removed() {
    let h = Harness::new();
    h.own_all().await;
    let e = device();
    let rule = h.add_rule(temperature_rule(h.tenant, single(e)));
    h.telemetry(e, hot()).await;

    h.own(h.all_but(&e)).await;
    h.rules.remove(&rule.id);
    h.ctx().index.remove_tenant(&h.tenant);
    let summary = h.own_all().await;

    assert_eq!(summary.restored, 0);
    assert!(!h.ctx().registry.contains(&e));
    assert!(h.store.get(h.tenant, e).is_none());
}

#[tokio::test]
async fn test_corrupt_progress_restores_as_fresh() {
    let h = Harness::new();
    let e = device();
    let rule = h.add_rule(temperature_rule(h.tenant, single(e)));
    let mut alarm_states = HashMap::new();
    alarm_states.insert(rule.id.to_string(), "{not json".to_string());
    h.store
        .put(&PersistedEntityState {
            tenant_id: h.tenant,
            entity_id: e,
            alarm_states,
        })
        .await
        .unwrap();

    let summary = h.own_all().await;

    assert_eq!(summary.restored, 1);
    let state = h.ctx().registry.get(&e).unwrap();
    let progress = state.lock().await.progress(&rule.id).unwrap();
    assert!(progress.current_alarm.is_none());
    assert_eq!(h.telemetry(e, hot()).await, voltage_alarm::AlarmRoutingResult::Created);
}

#[tokio::test]
async fn test_restore_ignores_foreign_snapshots() {
    let h = Harness::new();
    let e = device();
    let rule = h.add_rule(temperature_rule(h.tenant, single(e)));
    let mut alarm_states = HashMap::new();
    alarm_states.insert(rule.id.to_string(), "{}".to_string());
    let mut persisted = PersistedEntityState::new(h.tenant, e);
    persisted.alarm_states = alarm_states;

    h.own(h.all_but(&e)).await;

    assert!(!h.service().restore_state(persisted).await);
    assert!(!h.ctx().registry.contains(&e));
}
