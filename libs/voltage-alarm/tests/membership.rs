#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
//! Rule membership tests
//!
//! The reverse index (rule → entities, tenant → entities) must agree with
//! the rule sets held by the live entity states after every catalog change.

mod common;

use common::*;
use std::collections::HashSet;
use uuid::Uuid;
use voltage_alarm::{AlarmRuleEntityFilter, AlarmRuleId, EntityId, MsgType, EntityMsg};

#[tokio::test]
async fn test_membership_tracks_attach_and_detach() {
    let h = Harness::new();
    h.own_all().await;
    let (d1, d2) = (device(), device());
    let shared = h.add_rule(temperature_rule(
        h.tenant,
        vec![AlarmRuleEntityFilter::EntityList {
            entity_ids: vec![d1, d2],
        }],
    ));
    let only_d1 = h.add_rule(temperature_rule(h.tenant, single(d1)));
    h.telemetry(d1, warm()).await;
    h.telemetry(d2, warm()).await;

    let ids = [shared.id, only_d1.id];
    h.assert_membership_consistent(&d1, &ids).await;
    h.assert_membership_consistent(&d2, &ids).await;
    let mut attached: Vec<EntityId> = h.ctx().index.entities_for_rule(&shared.id);
    attached.sort();
    let mut expected = vec![d1, d2];
    expected.sort();
    assert_eq!(attached, expected);

    h.rules.remove(&only_d1.id);
    h.service().delete_alarm_rule(h.tenant, only_d1.id).await.unwrap();
    h.assert_membership_consistent(&d1, &ids).await;
    h.assert_membership_consistent(&d2, &ids).await;
    assert_eq!(h.attached(&d1).await, Some(vec![shared.id]));
}

#[tokio::test]
async fn test_every_live_state_holds_a_rule() {
    let h = Harness::new();
    h.own_all().await;
    let devices: Vec<EntityId> = (0..8).map(|_| device()).collect();
    let rules: Vec<AlarmRuleId> = devices
        .iter()
        .map(|d| h.add_rule(temperature_rule(h.tenant, single(*d))).id)
        .collect();
    for d in &devices {
        h.telemetry(*d, hot()).await;
    }
    assert_eq!(h.ctx().registry.len(), devices.len());

    for rule_id in rules.iter().step_by(2) {
        h.rules.remove(rule_id);
        assert_eq!(h.service().delete_alarm_rule(h.tenant, *rule_id).await.unwrap(), 1);
    }

    assert_eq!(h.ctx().registry.len(), devices.len() / 2);
    for state in h.ctx().registry.snapshot() {
        assert!(!state.is_empty());
        assert!(!state.lock().await.rule_ids().is_empty());
    }
    assert_eq!(h.ctx().index.tenant_entities(&h.tenant).len(), devices.len() / 2);
}

#[tokio::test]
async fn test_delete_counts_each_detached_entity() {
    let h = Harness::new();
    h.own_all().await;
    let devices: Vec<EntityId> = (0..5).map(|_| device()).collect();
    let rule = h.add_rule(temperature_rule(
        h.tenant,
        vec![AlarmRuleEntityFilter::EntityList {
            entity_ids: devices.clone(),
        }],
    ));
    for d in &devices[..3] {
        h.telemetry(*d, warm()).await;
    }

    h.rules.remove(&rule.id);
    assert_eq!(h.service().delete_alarm_rule(h.tenant, rule.id).await.unwrap(), 3);
    assert!(h.ctx().registry.is_empty());
    assert!(h.store.is_empty());
    // Deleting again finds nothing attached
    assert_eq!(h.service().delete_alarm_rule(h.tenant, rule.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_delete_tenant_clears_cache_and_states() {
    let h = Harness::new();
    h.own_all().await;
    let (d1, d2) = (device(), device());
    h.add_rule(temperature_rule(h.tenant, single(d1)));
    h.add_rule(temperature_rule(h.tenant, single(d2)));
    h.telemetry(d1, hot()).await;
    h.telemetry(d2, hot()).await;
    assert!(h.ctx().index.is_tenant_loaded(&h.tenant));

    assert_eq!(h.service().delete_tenant(h.tenant).await.unwrap(), 2);

    assert!(!h.ctx().index.is_tenant_loaded(&h.tenant));
    assert!(h.ctx().registry.is_empty());
    assert!(h.ctx().index.tenant_entities(&h.tenant).is_empty());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_create_fans_out_through_device_type_filter() {
    let h = Harness::new();
    h.own_all().await;
    let thermostats = EntityId::device_profile(Uuid::new_v4());
    let meters = EntityId::device_profile(Uuid::new_v4());
    let (t1, t2, m1) = (device(), device(), device());
    h.devices.set(h.tenant, t1, thermostats);
    h.devices.set(h.tenant, t2, thermostats);
    h.devices.set(h.tenant, m1, meters);
    h.add_rule(temperature_rule(
        h.tenant,
        vec![AlarmRuleEntityFilter::EntityList {
            entity_ids: vec![t1, t2, m1],
        }],
    ));
    for d in [t1, t2, m1] {
        h.telemetry(d, warm()).await;
    }

    let by_profile = h.add_rule(temperature_rule(
        h.tenant,
        vec![AlarmRuleEntityFilter::DeviceType {
            device_profile_id: thermostats,
        }],
    ));
    assert_eq!(h.service().create_alarm_rule(h.tenant, by_profile.id).await.unwrap(), 2);

    let attached: HashSet<EntityId> = h
        .ctx()
        .index
        .entities_for_rule(&by_profile.id)
        .into_iter()
        .collect();
    assert_eq!(attached, HashSet::from([t1, t2]));
    for d in [t1, t2, m1] {
        h.assert_membership_consistent(&d, &[by_profile.id]).await;
    }

    // The new rule evaluates on the next message
    assert_eq!(
        h.telemetry(t1, hot()).await,
        voltage_alarm::AlarmRoutingResult::Created
    );
    assert_eq!(h.sink.events().len(), 2);
}

#[tokio::test]
async fn test_create_of_disabled_rule_attaches_nothing() {
    let h = Harness::new();
    h.own_all().await;
    let d = device();
    h.add_rule(temperature_rule(h.tenant, single(d)));
    h.telemetry(d, warm()).await;

    let mut disabled = temperature_rule(h.tenant, single(d));
    disabled.enabled = false;
    let disabled = h.add_rule(disabled);

    assert_eq!(h.service().create_alarm_rule(h.tenant, disabled.id).await.unwrap(), 0);
    assert!(!h.ctx().index.contains_rule(&h.tenant, &disabled.id));
}

#[tokio::test]
async fn test_update_keeps_alarm_and_replaces_definition() {
    let h = Harness::new();
    h.own_all().await;
    let d = device();
    let mut rule = h.add_rule(temperature_rule(h.tenant, single(d)));
    h.telemetry(d, hot()).await;

    rule.name = "Boiler overheating".to_string();
    h.rules.put(rule.clone());
    assert_eq!(h.service().update_alarm_rule(h.tenant, rule.id).await.unwrap(), 1);

    let state = h.ctx().registry.get(&d).unwrap();
    let guard = state.lock().await;
    assert_eq!(guard.alarm_rules()[0].name, "Boiler overheating");
    assert!(guard.progress(&rule.id).unwrap().current_alarm.is_some());
}

#[tokio::test]
async fn test_update_of_uncached_rule_creates_it() {
    let h = Harness::new();
    h.own_all().await;
    let d = device();
    h.add_rule(temperature_rule(h.tenant, single(d)));
    h.telemetry(d, warm()).await;

    let late = h.add_rule(temperature_rule(h.tenant, single(d)));
    assert_eq!(h.service().update_alarm_rule(h.tenant, late.id).await.unwrap(), 1);
    assert!(h.ctx().index.is_attached(&late.id, &d));
}

#[tokio::test]
async fn test_activity_events_feed_the_snapshot() {
    let h = Harness::new();
    h.own_all().await;
    let d = device();
    let rule = h.add_rule(threshold_rule(
        h.tenant,
        single(d),
        voltage_alarm::AlarmCondition::simple(vec![voltage_alarm::KeyFilter::boolean(
            "active",
            voltage_alarm::BooleanOperation::Equal,
            false,
        )]),
    ));

    let inactive = EntityMsg::telemetry(d, h.clock.advance(1_000), serde_json::json!({}))
        .with_type(MsgType::InactivityEvent);
    let result = h.service().process(h.tenant, None, &inactive).await.unwrap();

    assert_eq!(result, voltage_alarm::AlarmRoutingResult::Created);
    assert!(h.ctx().index.is_attached(&rule.id, &d));
}
