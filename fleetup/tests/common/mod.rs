//! Shared fakes for coordinator tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use control_api::{CampaignConfig, CampaignSnapshot, PhaseConfig};
use fleetup::campaign::artifacts::{ArtifactRef, ArtifactSource};
use fleetup::campaign::coordinator::{Coordinator, CoordinatorOptions};
use fleetup::campaign::dispatch::{DispatchError, DispatchOptions, DispatchPool, NodeDispatcher};
use fleetup::campaign::inventory::{FleetNode, Inventory};
use fleetup::errors::FleetError;
use fleetup::tracker::{PhaseKey, ProgressTracker};
use fleetup::utils::{sha256_hex, CooldownOptions};
use node_api::{DirectiveKind, Outcome, OutcomeReport, UpgradeDirective};

pub fn node(i: usize) -> FleetNode {
    FleetNode {
        node_id: format!("node-{:04}", i),
        platform: "linux-amd64".to_string(),
        endpoint: format!("http://10.0.{}.{}:7420", i / 256, i % 256),
        token_sha256: sha256_hex(format!("token-{}", i).as_bytes()),
    }
}

pub fn inventory(size: usize) -> Arc<Inventory> {
    Arc::new(Inventory::new((0..size).map(node).collect()).unwrap())
}

pub fn phase(name: &str, percentage: f64, success_threshold: f64, wait_minutes: u64) -> PhaseConfig {
    PhaseConfig {
        name: name.to_string(),
        percentage,
        success_threshold,
        wait_minutes,
    }
}

/// canary 1%/95/30, pilot 10%/98/60, wave1 30%/98/30, wave2 100%/99/0
pub fn standard_config() -> CampaignConfig {
    CampaignConfig {
        campaign_id: Some("rollout-2.0.0".to_string()),
        name: None,
        target_version: "2.0.0".to_string(),
        previous_version: "1.9.3".to_string(),
        phases: vec![
            phase("canary", 1.0, 95.0, 30),
            phase("pilot", 10.0, 98.0, 60),
            phase("wave1", 30.0, 98.0, 30),
            phase("wave2", 100.0, 99.0, 0),
        ],
        rollback_threshold: 90.0,
    }
}

pub struct StaticArtifacts;

#[async_trait]
impl ArtifactSource for StaticArtifacts {
    async fn resolve(&self, version: &str, platform: &str) -> Result<ArtifactRef, FleetError> {
        Ok(ArtifactRef {
            url: format!("http://artifacts.local/{}/{}", version, platform),
            checksum_hex: sha256_hex(version.as_bytes()),
            signature: None,
        })
    }
}

/// Decides how the n-th upgrade directive ends; `None` means the node never reports
pub type UpgradePolicy = Box<dyn Fn(usize, &UpgradeDirective) -> Option<Outcome> + Send + Sync>;

/// Simulated fleet: every delivered directive is answered straight into the tracker
pub struct FakeFleet {
    tracker: Arc<ProgressTracker>,
    policy: UpgradePolicy,
    failing_downgrades: HashSet<String>,
    upgrades: AtomicUsize,
    pub delivered: Mutex<Vec<UpgradeDirective>>,
}

impl FakeFleet {
    pub fn new(tracker: Arc<ProgressTracker>, policy: UpgradePolicy) -> Self {
        Self {
            tracker,
            policy,
            failing_downgrades: HashSet::new(),
            upgrades: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failing_downgrades(mut self, nodes: &[&str]) -> Self {
        self.failing_downgrades = nodes.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn delivered(&self, kind: DirectiveKind) -> Vec<UpgradeDirective> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NodeDispatcher for FakeFleet {
    async fn dispatch(
        &self,
        _node: &FleetNode,
        directive: &UpgradeDirective,
    ) -> Result<(), DispatchError> {
        self.delivered.lock().unwrap().push(directive.clone());

        let outcome = match directive.kind {
            DirectiveKind::Upgrade => {
                let n = self.upgrades.fetch_add(1, Ordering::SeqCst);
                (self.policy)(n, directive)
            }
            DirectiveKind::Downgrade if self.failing_downgrades.contains(&directive.node_id) => {
                Some(Outcome::ManualInterventionRequired)
            }
            DirectiveKind::Downgrade => Some(Outcome::Success),
        };

        if let Some(outcome) = outcome {
            self.tracker
                .ingest(&OutcomeReport {
                    directive_id: directive.directive_id.clone(),
                    node_id: directive.node_id.clone(),
                    outcome,
                    attempts: 1,
                    last_error: None,
                    completed_at: Utc::now(),
                    failure_class: None,
                })
                .unwrap();
        }
        Ok(())
    }
}

/// Holds every delivery until the test releases it
pub struct HeldFleet {
    inner: Arc<FakeFleet>,
    permits: tokio::sync::Semaphore,
}

impl HeldFleet {
    pub fn new(inner: Arc<FakeFleet>) -> Self {
        Self {
            inner,
            permits: tokio::sync::Semaphore::new(0),
        }
    }

    pub fn release(&self, deliveries: usize) {
        self.permits.add_permits(deliveries);
    }
}

#[async_trait]
impl NodeDispatcher for HeldFleet {
    async fn dispatch(
        &self,
        node: &FleetNode,
        directive: &UpgradeDirective,
    ) -> Result<(), DispatchError> {
        self.permits
            .acquire()
            .await
            .map_err(|e| DispatchError::Unreachable(e.to_string()))?
            .forget();
        self.inner.dispatch(node, directive).await
    }
}

pub fn options() -> CoordinatorOptions {
    CoordinatorOptions {
        tick_interval: Duration::from_millis(100),
        min_report_window: Duration::from_secs(60),
        rollback_window: Duration::from_secs(120),
        ..Default::default()
    }
}

/// Start a coordinator over `size` nodes; the control loop runs until the test ends
pub fn start_coordinator(
    size: usize,
    fleet: impl FnOnce(Arc<ProgressTracker>) -> FakeFleet,
) -> (Coordinator, Arc<FakeFleet>, Arc<ProgressTracker>) {
    let tracker = Arc::new(ProgressTracker::new());
    let fleet = Arc::new(fleet(tracker.clone()));
    let coordinator = start_with_dispatcher(size, 64, fleet.clone(), tracker.clone());
    (coordinator, fleet, tracker)
}

/// Start a coordinator delivering through `dispatcher` with `max_concurrent` slots
pub fn start_with_dispatcher(
    size: usize,
    max_concurrent: usize,
    dispatcher: Arc<dyn NodeDispatcher>,
    tracker: Arc<ProgressTracker>,
) -> Coordinator {
    let pool = DispatchPool::new(
        DispatchOptions {
            max_concurrent,
            attempts: 3,
            cooldown: CooldownOptions::immediate(),
        },
        dispatcher,
        Arc::new(StaticArtifacts),
        tracker.clone(),
    );

    let (coordinator, control_loop) = Coordinator::new(options(), inventory(size), tracker, pool);
    tokio::spawn(control_loop.run(Box::pin(std::future::pending::<()>())));
    coordinator
}

/// Poll the tracker until a rollout phase's counts satisfy `done`
pub async fn wait_for_phase(
    tracker: &ProgressTracker,
    id: &str,
    phase: usize,
    done: impl Fn(&control_api::PhaseProgress) -> bool,
) {
    for _ in 0..100_000 {
        if done(&tracker.progress(id, PhaseKey::Rollout(phase))) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("phase {} of {} never reached the expected counts", phase, id);
}

/// Report an outcome for a node, as its reporter worker would
pub fn report(tracker: &ProgressTracker, directive: &UpgradeDirective, outcome: Outcome) {
    tracker
        .ingest(&OutcomeReport {
            directive_id: directive.directive_id.clone(),
            node_id: directive.node_id.clone(),
            outcome,
            attempts: 1,
            last_error: None,
            completed_at: Utc::now(),
            failure_class: None,
        })
        .unwrap();
}

/// Poll the campaign until `done` holds
pub async fn wait_until(
    coordinator: &Coordinator,
    id: &str,
    done: impl Fn(&CampaignSnapshot) -> bool,
) -> CampaignSnapshot {
    for _ in 0..100_000 {
        let snapshot = coordinator.status(id).await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("campaign {} never reached the expected state", id);
}
