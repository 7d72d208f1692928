//! Campaign coordinator tests against a simulated fleet

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    inventory, phase, report, standard_config, start_coordinator, start_with_dispatcher,
    wait_for_phase, wait_until, FakeFleet, HeldFleet,
};
use control_api::{CampaignConfig, CampaignSnapshot, CampaignStatus, RollbackTrigger};
use fleetup::campaign::selection::{select, stable_order};
use fleetup::errors::FleetError;
use fleetup::tracker::{Ingested, PhaseKey, ProgressTracker};
use node_api::{DirectiveKind, FailureClass, Outcome, OutcomeReport, UpgradeDirective};

/// A breached campaign is `failed` until its downgrades settle
fn rolled_back(snapshot: &CampaignSnapshot) -> bool {
    snapshot.status == CampaignStatus::RolledBack
}

async fn drain_deliveries() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

fn config(phases: Vec<control_api::PhaseConfig>, rollback_threshold: f64) -> CampaignConfig {
    CampaignConfig {
        campaign_id: Some("c-test".to_string()),
        name: Some("test".to_string()),
        target_version: "2.0.0".to_string(),
        previous_version: "1.9.3".to_string(),
        phases,
        rollback_threshold,
    }
}

#[tokio::test(start_paused = true)]
async fn canary_breach_rolls_back_before_pilot() {
    let (coordinator, fleet, _) = start_coordinator(1000, |tracker| {
        FakeFleet::new(
            tracker,
            Box::new(|n, _| {
                Some(if n == 0 {
                    Outcome::Failed
                } else {
                    Outcome::Success
                })
            }),
        )
    });

    let created = coordinator.create(standard_config()).await.unwrap();
    assert_eq!(created.status, CampaignStatus::Draft);
    assert_eq!(created.total_nodes, 1000);
    coordinator.start("rollout-2.0.0").await.unwrap();

    let done = wait_until(&coordinator, "rollout-2.0.0", rolled_back).await;

    assert_eq!(done.status, CampaignStatus::RolledBack);
    assert_eq!(done.current_phase, 0);
    assert_eq!(done.phase_results.len(), 1);

    let canary = &done.phase_results[0];
    assert_eq!(canary.phase_name, "canary");
    assert_eq!(canary.attempted, 10);
    assert_eq!(canary.succeeded, 9);
    assert_eq!(canary.failed, 1);
    assert!(!canary.gate_passed);
    assert!((canary.success_rate - 90.0).abs() < 1e-9);

    assert_eq!(done.rollback_events.len(), 1);
    let event = &done.rollback_events[0];
    assert_eq!(
        event.triggered_by,
        RollbackTrigger::PhaseBreach {
            phase: "canary".to_string()
        }
    );
    assert_eq!(event.affected_nodes.len(), 10);
    assert!(event.completed_at.is_some());
    assert!(done.manual_intervention_nodes.is_empty());

    // Only the canary was ever contacted; the nine successes were downgraded
    assert_eq!(fleet.delivered(DirectiveKind::Upgrade).len(), 10);
    let downgrades = fleet.delivered(DirectiveKind::Downgrade);
    assert_eq!(downgrades.len(), 9);
    assert!(downgrades.iter().all(|d| d.target_version == "1.9.3"));

    assert_eq!(done.success_count, 9);
    assert_eq!(done.failure_count, 1);
    assert!(done.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn passing_gates_advance_to_wave1() {
    // The first 100 upgrades succeed; wave1 nodes stay silent.
    let (coordinator, fleet, _) = start_coordinator(1000, |tracker| {
        FakeFleet::new(
            tracker,
            Box::new(|n, _| (n < 100).then_some(Outcome::Success)),
        )
    });

    coordinator.create(standard_config()).await.unwrap();
    coordinator.start("rollout-2.0.0").await.unwrap();

    let snapshot = wait_until(&coordinator, "rollout-2.0.0", |s| s.current_phase == 2).await;
    assert_eq!(snapshot.status, CampaignStatus::Running);
    assert_eq!(snapshot.phase_results.len(), 2);
    assert!(snapshot.phase_results.iter().all(|r| r.gate_passed));
    assert_eq!(snapshot.phase_results[0].attempted, 10);
    // Pilot covers 10% of the fleet, minus the canary
    assert_eq!(snapshot.phase_results[1].attempted, 90);
    assert_eq!(snapshot.success_count, 100);

    let mut progress = coordinator.progress("rollout-2.0.0", 2).await.unwrap();
    while progress.attempted < 200 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        progress = coordinator.progress("rollout-2.0.0", 2).await.unwrap();
    }
    assert_eq!(progress.attempted, 200);
    assert_eq!(progress.pending, 200);
    drain_deliveries().await;

    // No node is sent the upgrade twice
    let upgraded: Vec<String> = fleet
        .delivered(DirectiveKind::Upgrade)
        .into_iter()
        .map(|d| d.node_id)
        .collect();
    let unique: HashSet<&String> = upgraded.iter().collect();
    assert_eq!(upgraded.len(), 300);
    assert_eq!(unique.len(), 300);
}

#[tokio::test(start_paused = true)]
async fn cumulative_breach_rolls_back_whole_campaign() {
    let (coordinator, fleet, _) = start_coordinator(100, |tracker| {
        FakeFleet::new(
            tracker,
            Box::new(|n, _| {
                Some(if n < 5 {
                    Outcome::Failed
                } else {
                    Outcome::Success
                })
            }),
        )
    });

    coordinator
        .create(config(
            vec![phase("canary", 10.0, 0.0, 0), phase("all", 100.0, 0.0, 0)],
            90.0,
        ))
        .await
        .unwrap();
    coordinator.start("c-test").await.unwrap();

    let done = wait_until(&coordinator, "c-test", rolled_back).await;

    assert_eq!(done.status, CampaignStatus::RolledBack);
    assert!(done.phase_results[0].gate_passed);
    assert_eq!(
        done.rollback_events[0].triggered_by,
        RollbackTrigger::CampaignBreach
    );
    assert_eq!(fleet.delivered(DirectiveKind::Downgrade).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn silent_nodes_fail_closed_when_window_ends() {
    let (coordinator, fleet, tracker) = start_coordinator(10, |tracker| {
        FakeFleet::new(
            tracker,
            Box::new(|n, _| (n != 3).then_some(Outcome::Success)),
        )
    });

    coordinator
        .create(config(vec![phase("all", 100.0, 100.0, 0)], 0.0))
        .await
        .unwrap();
    coordinator.start("c-test").await.unwrap();

    let done = wait_until(&coordinator, "c-test", rolled_back).await;
    assert_eq!(done.status, CampaignStatus::RolledBack);
    assert_eq!(done.success_count, 9);
    assert_eq!(done.failure_count, 1);
    assert!(done.success_count + done.failure_count <= done.total_nodes);

    let silent = tracker
        .outcomes("c-test", PhaseKey::Rollout(0))
        .into_iter()
        .find(|o| o.outcome != Outcome::Success)
        .unwrap();
    assert_eq!(silent.failure_class, Some(FailureClass::Expired));

    // A report arriving after the window is kept but not counted
    let directive = fleet
        .delivered(DirectiveKind::Upgrade)
        .into_iter()
        .find(|d| d.node_id == silent.node_id)
        .unwrap();
    let late = tracker
        .ingest(&OutcomeReport {
            directive_id: directive.directive_id,
            node_id: directive.node_id,
            outcome: Outcome::Success,
            attempts: 1,
            last_error: None,
            completed_at: Utc::now(),
            failure_class: None,
        })
        .unwrap();
    assert_eq!(late, Ingested::Late);

    let after = coordinator.status("c-test").await.unwrap();
    assert_eq!(after.success_count, 9);
    assert_eq!(after.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn manual_intervention_nodes_are_not_dispatched_again() {
    let (coordinator, fleet, _) = start_coordinator(100, |tracker| {
        FakeFleet::new(
            tracker,
            Box::new(|n, _| {
                Some(if n == 0 {
                    Outcome::ManualInterventionRequired
                } else {
                    Outcome::Success
                })
            }),
        )
    });

    coordinator
        .create(config(
            vec![phase("canary", 10.0, 0.0, 0), phase("all", 100.0, 0.0, 0)],
            0.0,
        ))
        .await
        .unwrap();
    coordinator.start("c-test").await.unwrap();

    let done = wait_until(&coordinator, "c-test", |s| s.status.is_terminal()).await;
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.manual_intervention_nodes.len(), 1);

    let stuck = &done.manual_intervention_nodes[0];
    let sent_to_stuck = fleet
        .delivered(DirectiveKind::Upgrade)
        .iter()
        .filter(|d| &d.node_id == stuck)
        .count();
    assert_eq!(sent_to_stuck, 1);
    assert_eq!(done.success_count, 99);
    assert_eq!(done.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_downgrade_flags_manual_intervention() {
    let (coordinator, _, _) = start_coordinator(10, |tracker| {
        FakeFleet::new(tracker, Box::new(|_, _| Some(Outcome::Success)))
            .with_failing_downgrades(&["node-0003"])
    });

    coordinator
        .create(config(vec![phase("all", 100.0, 100.0, 60)], 0.0))
        .await
        .unwrap();
    coordinator.start("c-test").await.unwrap();
    // Completed campaigns can still be rolled back by an operator
    let done = wait_until(&coordinator, "c-test", |s| s.status.is_terminal()).await;
    assert_eq!(done.status, CampaignStatus::Completed);

    // The campaign reads as failed, with no completion time, while it compensates
    let rolling = coordinator.rollback("c-test").await.unwrap();
    assert_eq!(rolling.status, CampaignStatus::Failed);
    assert!(rolling.completed_at.is_none());

    let rolled = wait_until(&coordinator, "c-test", rolled_back).await;
    assert!(rolled.completed_at.unwrap() > done.completed_at.unwrap());
    assert_eq!(rolled.rollback_events[0].triggered_by, RollbackTrigger::Manual);
    assert_eq!(
        rolled.rollback_events[0].manual_intervention,
        vec!["node-0003".to_string()]
    );
    assert_eq!(rolled.manual_intervention_nodes, vec!["node-0003".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn control_operations_are_idempotent() {
    let (coordinator, fleet, _) = start_coordinator(100, |tracker| {
        FakeFleet::new(tracker, Box::new(|_, _| None))
    });

    assert!(matches!(
        coordinator.status("missing").await,
        Err(FleetError::NotFound(_))
    ));

    coordinator
        .create(config(vec![phase("all", 100.0, 90.0, 0)], 0.0))
        .await
        .unwrap();
    assert!(matches!(
        coordinator
            .create(config(vec![phase("all", 100.0, 90.0, 0)], 0.0))
            .await,
        Err(FleetError::Conflict(_))
    ));
    assert!(matches!(
        coordinator.rollback("c-test").await,
        Err(FleetError::Conflict(_))
    ));
    assert!(matches!(
        coordinator.pause("c-test").await,
        Err(FleetError::Conflict(_))
    ));

    // Pausing before the first tick leaves every directive undelivered
    let started = coordinator.start("c-test").await.unwrap();
    assert_eq!(started.status, CampaignStatus::Running);
    assert_eq!(
        coordinator.start("c-test").await.unwrap().status,
        CampaignStatus::Running
    );
    assert_eq!(
        coordinator.pause("c-test").await.unwrap().status,
        CampaignStatus::Paused
    );
    assert_eq!(
        coordinator.pause("c-test").await.unwrap().status,
        CampaignStatus::Paused
    );
    assert!(matches!(
        coordinator.start("c-test").await,
        Err(FleetError::Conflict(_))
    ));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(fleet.delivered(DirectiveKind::Upgrade).is_empty());

    assert_eq!(
        coordinator.resume("c-test").await.unwrap().status,
        CampaignStatus::Running
    );
    assert_eq!(
        coordinator.resume("c-test").await.unwrap().status,
        CampaignStatus::Running
    );

    let mut progress = coordinator.progress("c-test", 0).await.unwrap();
    while progress.attempted < 100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        progress = coordinator.progress("c-test", 0).await.unwrap();
    }
    drain_deliveries().await;
    assert_eq!(fleet.delivered(DirectiveKind::Upgrade).len(), 100);
    assert!(matches!(
        coordinator.progress("c-test", 1).await,
        Err(FleetError::NotFound(_))
    ));

    let overridden = coordinator.override_gate("c-test").await.unwrap();
    assert_eq!(overridden.status, CampaignStatus::Running);

    // Nothing reports, the window closes and the override carries the gate
    let done = wait_until(&coordinator, "c-test", |s| s.status.is_terminal()).await;
    assert_eq!(done.status, CampaignStatus::Completed);
    assert!(done.phase_results[0].gate_passed);
    assert!(done.phase_results[0].overridden);
    assert_eq!(done.failure_count, 100);

    assert_eq!(coordinator.list().await.unwrap().len(), 1);
}

/// The upgrade directive a node was sent
fn upgrade_sent_to(fleet: &FakeFleet, node_id: &str) -> UpgradeDirective {
    fleet
        .delivered(DirectiveKind::Upgrade)
        .into_iter()
        .find(|d| d.node_id == node_id)
        .unwrap()
}

fn expired_node(tracker: &ProgressTracker, phase: usize) -> String {
    tracker
        .outcomes("c-test", PhaseKey::Rollout(phase))
        .into_iter()
        .find(|o| o.failure_class == Some(FailureClass::Expired))
        .unwrap()
        .node_id
}

#[tokio::test(start_paused = true)]
async fn late_success_after_rollback_is_downgraded() {
    let (coordinator, fleet, tracker) = start_coordinator(10, |tracker| {
        FakeFleet::new(
            tracker,
            Box::new(|n, _| (n != 3).then_some(Outcome::Success)),
        )
    });

    coordinator
        .create(config(vec![phase("all", 100.0, 100.0, 0)], 0.0))
        .await
        .unwrap();
    coordinator.start("c-test").await.unwrap();

    let first = wait_until(&coordinator, "c-test", rolled_back).await;
    assert_eq!(fleet.delivered(DirectiveKind::Downgrade).len(), 9);
    let first_completed = first.completed_at.unwrap();

    // The silent node finally upgraded and says so
    let silent = expired_node(&tracker, 0);
    report(&tracker, &upgrade_sent_to(&fleet, &silent), Outcome::Success);

    let done = wait_until(&coordinator, "c-test", |s| {
        rolled_back(s) && s.completed_at.is_some_and(|at| at > first_completed)
    })
    .await;

    let downgrades = fleet.delivered(DirectiveKind::Downgrade);
    assert_eq!(downgrades.len(), 10);
    assert!(downgrades
        .iter()
        .any(|d| d.node_id == silent && d.target_version == "1.9.3"));
    assert_eq!(done.rollback_events.len(), 1);
    assert!(done.rollback_events[0].completed_at.is_some());
    assert!(done.manual_intervention_nodes.is_empty());
    // Still not counted towards the rollout
    assert_eq!((done.success_count, done.failure_count), (9, 1));
}

#[tokio::test(start_paused = true)]
async fn upgrade_in_flight_during_manual_rollback_is_downgraded() {
    let (coordinator, fleet, tracker) = start_coordinator(10, |tracker| {
        FakeFleet::new(
            tracker,
            Box::new(|n, _| (n != 3).then_some(Outcome::Success)),
        )
    });

    coordinator
        .create(config(vec![phase("all", 100.0, 90.0, 60)], 0.0))
        .await
        .unwrap();
    coordinator.start("c-test").await.unwrap();
    wait_for_phase(&tracker, "c-test", 0, |p| p.attempted == 10 && p.pending == 1).await;

    let rolling = coordinator.rollback("c-test").await.unwrap();
    assert_eq!(rolling.status, CampaignStatus::Failed);
    assert_eq!(rolling.rollback_events[0].affected_nodes.len(), 10);

    // The node was mid-upgrade when the operator pulled the plug
    let in_flight = expired_node(&tracker, 0);
    report(&tracker, &upgrade_sent_to(&fleet, &in_flight), Outcome::Success);

    let done = wait_until(&coordinator, "c-test", rolled_back).await;
    let downgraded: HashSet<String> = fleet
        .delivered(DirectiveKind::Downgrade)
        .into_iter()
        .map(|d| d.node_id)
        .collect();
    assert_eq!(downgraded.len(), 10);
    assert!(downgraded.contains(&in_flight));
    assert_eq!(done.rollback_events.len(), 1);
    assert_eq!(done.rollback_events[0].triggered_by, RollbackTrigger::Manual);
}

#[tokio::test(start_paused = true)]
async fn pause_with_deliveries_in_flight_resumes_without_overshoot() {
    let tracker = Arc::new(ProgressTracker::new());
    let fleet = Arc::new(FakeFleet::new(
        tracker.clone(),
        Box::new(|_, _| Some(Outcome::Success)),
    ));
    let held = Arc::new(HeldFleet::new(fleet.clone()));
    let coordinator = start_with_dispatcher(100, 8, held.clone(), tracker.clone());

    coordinator
        .create(config(vec![phase("half", 50.0, 90.0, 0)], 0.0))
        .await
        .unwrap();
    coordinator.start("c-test").await.unwrap();
    wait_for_phase(&tracker, "c-test", 0, |p| p.attempted == 8).await;

    let paused = coordinator.pause("c-test").await.unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);

    // Deliveries already in flight still land and report
    held.release(8);
    wait_for_phase(&tracker, "c-test", 0, |p| p.succeeded == 8).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    let progress = coordinator.progress("c-test", 0).await.unwrap();
    assert_eq!((progress.attempted, progress.pending), (8, 0));

    coordinator.resume("c-test").await.unwrap();
    held.release(1000);
    let done = wait_until(&coordinator, "c-test", |s| s.status.is_terminal()).await;

    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.phase_results[0].attempted, 50);
    assert_eq!(done.success_count, 50);

    let delivered: Vec<String> = fleet
        .delivered(DirectiveKind::Upgrade)
        .into_iter()
        .map(|d| d.node_id)
        .collect();
    let unique: HashSet<String> = delivered.iter().cloned().collect();
    assert_eq!(delivered.len(), 50);
    assert_eq!(unique.len(), 50);

    // Same nodes an uninterrupted run picks
    let ordered = stable_order(inventory(100).nodes());
    let expected: HashSet<String> = select(&ordered, &HashSet::new(), 50)
        .into_iter()
        .map(|node| node.node_id.clone())
        .collect();
    assert_eq!(unique, expected);
}

#[tokio::test(start_paused = true)]
async fn phase_breach_rolls_back_only_that_phase() {
    // Canary is clean; three of the remaining ninety fail
    let (coordinator, fleet, tracker) = start_coordinator(100, |tracker| {
        FakeFleet::new(
            tracker,
            Box::new(|n, _| {
                Some(if (10..13).contains(&n) {
                    Outcome::Failed
                } else {
                    Outcome::Success
                })
            }),
        )
    });

    coordinator
        .create(config(
            vec![phase("canary", 10.0, 90.0, 0), phase("all", 100.0, 99.0, 0)],
            50.0,
        ))
        .await
        .unwrap();
    coordinator.start("c-test").await.unwrap();

    let done = wait_until(&coordinator, "c-test", rolled_back).await;
    assert!(done.phase_results[0].gate_passed);
    assert!(!done.phase_results[1].gate_passed);
    assert_eq!((done.success_count, done.failure_count), (97, 3));

    let event = &done.rollback_events[0];
    assert_eq!(
        event.triggered_by,
        RollbackTrigger::PhaseBreach {
            phase: "all".to_string()
        }
    );

    let node_ids = |phase| -> HashSet<String> {
        tracker
            .outcomes("c-test", PhaseKey::Rollout(phase))
            .into_iter()
            .map(|o| o.node_id)
            .collect()
    };
    let canary = node_ids(0);
    let wave = node_ids(1);
    let affected: HashSet<String> = event.affected_nodes.iter().cloned().collect();
    assert_eq!(canary.len(), 10);
    assert_eq!(affected, wave);
    assert!(affected.is_disjoint(&canary));

    let downgrades = fleet.delivered(DirectiveKind::Downgrade);
    assert_eq!(downgrades.len(), 87);
    assert!(downgrades.iter().all(|d| !canary.contains(&d.node_id)));
}
