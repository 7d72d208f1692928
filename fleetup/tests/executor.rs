//! Node upgrade executor tests
//!
//! The fake service reports the installed "binary" contents as its version,
//! so replacing and restoring the file is observable through the service.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signer, SigningKey};
use fleetup::errors::FleetError;
use fleetup::filesys::file::File;
use fleetup::node::artifact::{ArtifactFetcher, FetchError};
use fleetup::node::executor::{ExecutorSettings, UpgradeExecutor};
use fleetup::node::fsm::UpgradeState;
use fleetup::node::intake::UpgradeIntake;
use fleetup::node::reporting::OutcomeReporter;
use fleetup::node::service::ServiceManager;
use fleetup::node::signature::SignatureVerifier;
use fleetup::node::state::{NodeUpgradeState, UpgradeStateStore};
use fleetup::server::serve::router;
use fleetup::server::state::ServerState;
use fleetup::storage::layout::UpgradeDir;
use fleetup::utils::{sha256_hex, CooldownOptions};
use node_api::{
    ArtifactSignature, DirectiveAck, DirectiveKind, FailureClass, Outcome, OutcomeReport,
    UpgradeDirective,
};
use tempfile::TempDir;

const NODE: &str = "node-1";

struct FakeFetcher {
    payload: Vec<u8>,
    failures: Mutex<VecDeque<FetchError>>,
    calls: AtomicU32,
}

impl FakeFetcher {
    fn new(payload: &str) -> Self {
        Self {
            payload: payload.as_bytes().to_vec(),
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    fn failing_first(self, failures: Vec<FetchError>) -> Self {
        *self.failures.lock().unwrap() = failures.into();
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactFetcher for FakeFetcher {
    async fn fetch(&self, _url: &str, dest: &File) -> Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        dest.write_bytes(&self.payload)
            .await
            .map_err(|e| FetchError::Local(e.to_string()))?;
        Ok(self.payload.len() as u64)
    }
}

struct FakeService {
    installed: File,
    active: Mutex<VecDeque<bool>>,
    fail_restart: bool,
    restarts: AtomicU32,
}

impl FakeService {
    fn new(installed: File) -> Self {
        Self {
            installed,
            active: Mutex::new(VecDeque::new()),
            fail_restart: false,
            restarts: AtomicU32::new(0),
        }
    }

    /// Answers for successive `is_active` calls; `true` once exhausted
    fn with_active(self, answers: Vec<bool>) -> Self {
        *self.active.lock().unwrap() = answers.into();
        self
    }

    fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceManager for FakeService {
    async fn restart(&self) -> Result<(), FleetError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail_restart {
            return Err(FleetError::ServiceError("unit failed to start".to_string()));
        }
        Ok(())
    }

    async fn is_active(&self) -> Result<bool, FleetError> {
        Ok(self.active.lock().unwrap().pop_front().unwrap_or(true))
    }

    async fn running_version(&self) -> Result<String, FleetError> {
        self.installed.read_string().await
    }
}

#[derive(Default)]
struct RecordingReporter {
    reports: Mutex<Vec<OutcomeReport>>,
    /// Deliveries that fail before reports start getting through
    outages: AtomicU32,
}

impl RecordingReporter {
    fn unreachable_for(deliveries: u32) -> Self {
        Self {
            outages: AtomicU32::new(deliveries),
            ..Default::default()
        }
    }
}

#[async_trait]
impl OutcomeReporter for RecordingReporter {
    async fn report(&self, report: &OutcomeReport) -> Result<(), FleetError> {
        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(FleetError::HttpStatus {
                status: 503,
                body: "coordinator unavailable".to_string(),
            });
        }
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    installed: File,
    work: UpgradeDir,
    store: Arc<UpgradeStateStore>,
    fetcher: Arc<FakeFetcher>,
    service: Arc<FakeService>,
    executor: Arc<UpgradeExecutor>,
}

async fn harness(
    payload: &str,
    configure: impl FnOnce(FakeFetcher, FakeService) -> (FakeFetcher, FakeService),
) -> Harness {
    let dir = TempDir::new().unwrap();
    let installed = File::new(dir.path().join("bin").join("fleetup"));
    tokio::fs::create_dir_all(dir.path().join("bin")).await.unwrap();
    installed.write_bytes(b"1.0.0").await.unwrap();

    let work = UpgradeDir::new(dir.path().join("upgrade"));
    work.dir().create().await.unwrap();
    let store = Arc::new(UpgradeStateStore::open(work.state_file()).await.unwrap());

    let (fetcher, service) = configure(FakeFetcher::new(payload), FakeService::new(installed.clone()));
    let fetcher = Arc::new(fetcher);
    let service = Arc::new(service);

    let settings = ExecutorSettings {
        download_attempts: 3,
        download_backoff: CooldownOptions::immediate(),
        settle_delay: Duration::ZERO,
    };
    let executor = Arc::new(UpgradeExecutor::new(
        settings,
        installed.clone(),
        work.clone(),
        fetcher.clone(),
        service.clone(),
        store.clone(),
    ));

    Harness {
        _dir: dir,
        installed,
        work,
        store,
        fetcher,
        service,
        executor,
    }
}

fn directive(target: &str, checksum_of: &str) -> UpgradeDirective {
    UpgradeDirective::issue(
        NODE,
        target,
        "http://artifacts.local/fleetup",
        &sha256_hex(checksum_of.as_bytes()),
        DirectiveKind::Upgrade,
    )
}

async fn begin(h: &Harness, directive: &UpgradeDirective) -> NodeUpgradeState {
    h.store
        .try_begin(directive, directive.artifact_url.clone())
        .await
        .unwrap()
}

#[tokio::test]
async fn upgrade_completes_and_cleans_up() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let record = begin(&h, &directive("2.0.0", "2.0.0")).await;

    let done = h.executor.execute(record).await;

    assert_eq!(done.phase, UpgradeState::Completed);
    assert_eq!(done.outcome, Outcome::Success);
    assert_eq!(done.attempts, 1);
    assert_eq!(done.previous_version.as_deref(), Some("1.0.0"));
    assert!(done.completed_at.is_some());
    assert_eq!(h.installed.read_string().await.unwrap(), "2.0.0");
    assert!(!h.work.staged_binary().exists().await);
    assert!(!h.work.backup_binary().exists().await);

    // Persisted for the reporter
    let stored = h.store.unreported().await.unwrap();
    assert_eq!(stored.outcome, Outcome::Success);
}

#[tokio::test]
async fn checksum_mismatch_fails_without_touching_the_install() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let record = begin(&h, &directive("2.0.0", "something else")).await;

    let done = h.executor.execute(record).await;

    assert_eq!(done.phase, UpgradeState::Failed);
    assert_eq!(done.outcome, Outcome::Failed);
    assert_eq!(done.failure_class, Some(FailureClass::Integrity));
    assert!(done.last_error.unwrap().contains("checksum mismatch"));
    assert_eq!(h.fetcher.calls(), 1);
    assert_eq!(h.service.restarts(), 0);
    assert_eq!(h.installed.read_string().await.unwrap(), "1.0.0");
    assert!(!h.work.backup_binary().exists().await);
}

fn publisher() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

/// Executor over the harness that only installs artifacts signed by `publisher`
fn enforcing_executor(h: &Harness) -> UpgradeExecutor {
    let public = STANDARD.encode(publisher().verifying_key().to_bytes());
    let verifier = SignatureVerifier::from_base64_keys(
        &[("release".to_string(), public)].into_iter().collect(),
    )
    .unwrap();

    UpgradeExecutor::new(
        ExecutorSettings {
            download_attempts: 3,
            download_backoff: CooldownOptions::immediate(),
            settle_delay: Duration::ZERO,
        },
        h.installed.clone(),
        h.work.clone(),
        h.fetcher.clone(),
        h.service.clone(),
        h.store.clone(),
    )
    .with_verifier(Arc::new(verifier))
}

#[tokio::test]
async fn unsigned_artifact_is_refused_when_keys_are_trusted() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let executor = enforcing_executor(&h);
    let record = begin(&h, &directive("2.0.0", "2.0.0")).await;

    let done = executor.execute(record).await;

    assert_eq!(done.outcome, Outcome::Failed);
    assert_eq!(done.failure_class, Some(FailureClass::Integrity));
    assert!(done.last_error.unwrap().contains("not signed"));
    assert_eq!(h.service.restarts(), 0);
    assert_eq!(h.installed.read_string().await.unwrap(), "1.0.0");
}

#[tokio::test]
async fn signed_artifact_installs_and_forged_one_does_not() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let executor = enforcing_executor(&h);

    let mut signed = directive("2.0.0", "2.0.0");
    signed.signature = Some(ArtifactSignature {
        key_id: "release".to_string(),
        signature: STANDARD.encode(publisher().sign(b"2.0.0").to_bytes()),
    });
    let done = executor.execute(begin(&h, &signed).await).await;
    assert_eq!(done.outcome, Outcome::Success);
    h.store.mark_reported(&done.directive_id).await.unwrap();

    // Correct digest, but the signature covers different bytes
    let mut forged = directive("2.0.0", "2.0.0");
    forged.signature = Some(ArtifactSignature {
        key_id: "release".to_string(),
        signature: STANDARD.encode(publisher().sign(b"2.0.1").to_bytes()),
    });
    let done = executor.execute(begin(&h, &forged).await).await;
    assert_eq!(done.outcome, Outcome::Failed);
    assert_eq!(done.failure_class, Some(FailureClass::Integrity));
}

#[tokio::test]
async fn transient_download_errors_are_retried() {
    let h = harness("2.0.0", |f, s| {
        (
            f.failing_first(vec![
                FetchError::Transient("connection reset".to_string()),
                FetchError::Transient("503".to_string()),
            ]),
            s,
        )
    })
    .await;
    let record = begin(&h, &directive("2.0.0", "2.0.0")).await;

    let done = h.executor.execute(record).await;

    assert_eq!(done.outcome, Outcome::Success);
    assert_eq!(done.attempts, 3);
    assert_eq!(h.fetcher.calls(), 3);
}

#[tokio::test]
async fn download_gives_up_after_attempt_budget() {
    let h = harness("2.0.0", |f, s| {
        (
            f.failing_first(vec![
                FetchError::Transient("timeout".to_string()),
                FetchError::Transient("timeout".to_string()),
                FetchError::Transient("timeout".to_string()),
            ]),
            s,
        )
    })
    .await;
    let record = begin(&h, &directive("2.0.0", "2.0.0")).await;

    let done = h.executor.execute(record).await;

    assert_eq!(done.outcome, Outcome::Failed);
    assert_eq!(done.failure_class, Some(FailureClass::Transient));
    assert_eq!(h.fetcher.calls(), 3);
    assert_eq!(h.installed.read_string().await.unwrap(), "1.0.0");
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let h = harness("2.0.0", |f, s| {
        (
            f.failing_first(vec![FetchError::Permanent("404 Not Found".to_string())]),
            s,
        )
    })
    .await;
    let record = begin(&h, &directive("2.0.0", "2.0.0")).await;

    let done = h.executor.execute(record).await;

    assert_eq!(done.outcome, Outcome::Failed);
    assert_eq!(done.failure_class, Some(FailureClass::Permanent));
    assert_eq!(h.fetcher.calls(), 1);
}

#[tokio::test]
async fn wrong_running_version_rolls_back() {
    // The artifact matches its checksum but identifies as another version.
    let h = harness("2.0.0-rc1", |f, s| (f, s)).await;
    let record = begin(&h, &directive("2.0.0", "2.0.0-rc1")).await;

    let done = h.executor.execute(record).await;

    assert_eq!(done.phase, UpgradeState::RolledBack);
    assert_eq!(done.outcome, Outcome::RolledBack);
    assert_eq!(done.failure_class, Some(FailureClass::Operational));
    assert_eq!(h.installed.read_string().await.unwrap(), "1.0.0");
    assert_eq!(h.service.restarts(), 2);
    assert!(!h.work.backup_binary().exists().await);
}

#[tokio::test]
async fn failed_rollback_requires_manual_intervention() {
    let h = harness("2.0.0", |f, s| (f, s.with_active(vec![false, false]))).await;
    let record = begin(&h, &directive("2.0.0", "2.0.0")).await;

    let done = h.executor.execute(record).await;

    assert_eq!(done.phase, UpgradeState::ManualInterventionRequired);
    assert_eq!(done.outcome, Outcome::ManualInterventionRequired);
    assert_eq!(done.failure_class, Some(FailureClass::RollbackFailed));
    // The backup is left for the operator
    assert!(h.work.backup_binary().exists().await);
}

#[tokio::test]
async fn restart_failure_rolls_back() {
    let h = harness("2.0.0", |f, mut s| {
        s.fail_restart = true;
        (f, s)
    })
    .await;
    let record = begin(&h, &directive("2.0.0", "2.0.0")).await;

    let done = h.executor.execute(record).await;

    // Restoring also needs a restart, which keeps failing
    assert_eq!(done.outcome, Outcome::ManualInterventionRequired);
    assert_eq!(h.installed.read_string().await.unwrap(), "1.0.0");
}

#[tokio::test]
async fn recovery_after_restart_verifies_the_new_binary() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let mut record = begin(&h, &directive("2.0.0", "2.0.0")).await;

    // The process went down while the service restarted onto the new binary.
    h.installed.write_bytes(b"2.0.0").await.unwrap();
    record.phase = UpgradeState::Restarting;
    record.attempts = 1;
    h.store.update(&record).await.unwrap();

    let done = h.executor.recover(record).await;

    assert_eq!(done.outcome, Outcome::Success);
    assert_eq!(h.fetcher.calls(), 0);
}

#[tokio::test]
async fn recovery_before_replace_fails_safely() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let mut record = begin(&h, &directive("2.0.0", "2.0.0")).await;
    record.phase = UpgradeState::Downloading;
    record.attempts = 1;
    h.store.update(&record).await.unwrap();

    let done = h.executor.recover(record).await;

    assert_eq!(done.outcome, Outcome::Failed);
    assert_eq!(h.installed.read_string().await.unwrap(), "1.0.0");
    assert_eq!(h.service.restarts(), 0);
}

fn intake(h: &Harness, reporter: Arc<RecordingReporter>) -> UpgradeIntake {
    UpgradeIntake::new(
        NODE.to_string(),
        "linux-amd64".to_string(),
        "http://artifacts.local".to_string(),
        h.store.clone(),
        h.executor.clone(),
        reporter,
    )
}

#[tokio::test]
async fn intake_runs_directive_and_reports_once() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let reporter = Arc::new(RecordingReporter::default());
    let intake = intake(&h, reporter.clone());
    let directive = directive("2.0.0", "2.0.0");

    let accepted = intake.accept(directive.clone()).await.unwrap();
    assert_eq!(accepted.phase, UpgradeState::Idle);
    intake.wait_idle().await;

    let reports = reporter.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].directive_id, directive.directive_id);
    assert_eq!(reports[0].node_id, NODE);
    assert_eq!(reports[0].outcome, Outcome::Success);
    assert!(h.store.unreported().await.is_none());

    // Re-delivery of the same directive does not start another run
    let again = intake.accept(directive).await.unwrap();
    assert_eq!(again.outcome, Outcome::Success);
    intake.wait_idle().await;
    assert_eq!(h.fetcher.calls(), 1);
}

#[tokio::test]
async fn undelivered_outcome_is_reported_before_the_next_one() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let reporter = Arc::new(RecordingReporter::unreachable_for(1));
    let intake = intake(&h, reporter.clone());

    let first = directive("2.0.0", "2.0.0");
    intake.accept(first.clone()).await.unwrap();
    intake.wait_idle().await;
    assert!(reporter.reports.lock().unwrap().is_empty());
    assert_eq!(
        h.store.unreported().await.unwrap().directive_id,
        first.directive_id
    );

    // A new directive arrives before the reporter worker caught up.
    let second = directive("2.0.0", "2.0.0");
    intake.accept(second.clone()).await.unwrap();
    intake.wait_idle().await;

    let reported: Vec<String> = reporter
        .reports
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.directive_id.clone())
        .collect();
    assert_eq!(reported, vec![first.directive_id, second.directive_id]);
    assert!(h.store.unreported().await.is_none());
}

#[tokio::test]
async fn intake_rejects_directive_for_another_node() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let intake = intake(&h, Arc::new(RecordingReporter::default()));

    let mut directive = directive("2.0.0", "2.0.0");
    directive.node_id = "node-2".to_string();

    assert!(matches!(
        intake.accept(directive).await,
        Err(FleetError::InvalidDirective(_))
    ));
}

#[tokio::test]
async fn intake_rejects_bad_checksum_format() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let intake = intake(&h, Arc::new(RecordingReporter::default()));

    let mut directive = directive("2.0.0", "2.0.0");
    directive.expected_checksum_hex = "not-hex".to_string();

    assert!(matches!(
        intake.accept(directive).await,
        Err(FleetError::InvalidDirective(_))
    ));
}

async fn post_directive(
    app: axum::Router,
    directive: &UpgradeDirective,
) -> (axum::http::StatusCode, DirectiveAck) {
    use tower::ServiceExt;

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/directives")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(directive).unwrap()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn node_server_acknowledges_directives() {
    let h = harness("2.0.0", |f, s| (f, s)).await;
    let reporter = Arc::new(RecordingReporter::default());
    let intake = Arc::new(intake(&h, reporter.clone()));
    let app = router(Arc::new(ServerState::new(intake.clone())));

    let directive = directive("2.0.0", "2.0.0");
    let (status, ack) = post_directive(app.clone(), &directive).await;
    assert_eq!(status, axum::http::StatusCode::ACCEPTED);
    assert!(ack.accepted);
    assert_eq!(ack.directive_id, directive.directive_id);

    intake.wait_idle().await;
    assert_eq!(reporter.reports.lock().unwrap().len(), 1);

    let mut foreign = directive.clone();
    foreign.directive_id = "other".to_string();
    foreign.node_id = "node-2".to_string();
    let (status, ack) = post_directive(app, &foreign).await;
    assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
    assert!(!ack.accepted);
    assert!(ack.reason.is_some());
}
