//! Campaign coordinator
//!
//! A single control loop owns every campaign. API handlers talk to it through
//! [`Coordinator`], a cheap handle that sends commands and awaits replies. The
//! loop never waits on I/O: deliveries run in the dispatch pool and outcomes
//! arrive through the tracker, which the loop reads on every tick. Settled
//! campaigns drop out of the tick until a late report or an operator
//! rollback needs them again.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use control_api::{
    CampaignConfig, CampaignSnapshot, CampaignStatus, PhaseProgress, PhaseResult, RollbackTrigger,
};
use node_api::{DirectiveKind, Outcome};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::campaign::dispatch::{DispatchJob, DispatchPool};
use crate::campaign::inventory::{FleetNode, Inventory};
use crate::campaign::model::Campaign;
use crate::campaign::rollback::RollbackController;
use crate::campaign::selection::{phase_target_count, select, stable_order};
use crate::errors::FleetError;
use crate::tracker::{Followups, PhaseKey, ProgressTracker};

/// Coordinator options
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// How often phase windows and dispatch queues are checked
    pub tick_interval: Duration,

    /// Lower bound on a phase's report window
    pub min_report_window: Duration,

    /// How long downgrade directives may take to report
    pub rollback_window: Duration,

    /// Command channel capacity
    pub command_buffer: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            min_report_window: Duration::from_secs(600),
            rollback_window: Duration::from_secs(1800),
            command_buffer: 64,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, FleetError>>;

enum Command {
    Create {
        config: CampaignConfig,
        reply: Reply<CampaignSnapshot>,
    },
    Start {
        id: String,
        reply: Reply<CampaignSnapshot>,
    },
    Pause {
        id: String,
        reply: Reply<CampaignSnapshot>,
    },
    Resume {
        id: String,
        reply: Reply<CampaignSnapshot>,
    },
    Rollback {
        id: String,
        reply: Reply<CampaignSnapshot>,
    },
    OverrideGate {
        id: String,
        reply: Reply<CampaignSnapshot>,
    },
    Status {
        id: String,
        reply: Reply<CampaignSnapshot>,
    },
    List {
        reply: Reply<Vec<CampaignSnapshot>>,
    },
    Progress {
        id: String,
        phase: usize,
        reply: Reply<PhaseProgress>,
    },
}

/// Handle to the coordinator's control loop
#[derive(Clone)]
pub struct Coordinator {
    commands: mpsc::Sender<Command>,
}

impl Coordinator {
    /// Create the control loop and a handle to it
    pub fn new(
        options: CoordinatorOptions,
        inventory: Arc<Inventory>,
        tracker: Arc<ProgressTracker>,
        pool: DispatchPool,
    ) -> (Self, ControlLoop) {
        let (tx, rx) = mpsc::channel(options.command_buffer.max(1));
        let control = ControlLoop {
            rollback: RollbackController::new(tracker.clone()),
            options,
            inventory,
            tracker,
            pool,
            campaigns: HashMap::new(),
            order: Vec::new(),
            active: BTreeSet::new(),
            commands: rx,
        };
        (Self { commands: tx }, control)
    }

    pub async fn create(&self, config: CampaignConfig) -> Result<CampaignSnapshot, FleetError> {
        self.request(|reply| Command::Create { config, reply }).await
    }

    pub async fn start(&self, id: &str) -> Result<CampaignSnapshot, FleetError> {
        let id = id.to_string();
        self.request(|reply| Command::Start { id, reply }).await
    }

    pub async fn pause(&self, id: &str) -> Result<CampaignSnapshot, FleetError> {
        let id = id.to_string();
        self.request(|reply| Command::Pause { id, reply }).await
    }

    pub async fn resume(&self, id: &str) -> Result<CampaignSnapshot, FleetError> {
        let id = id.to_string();
        self.request(|reply| Command::Resume { id, reply }).await
    }

    /// Manually roll back every phase of the campaign
    pub async fn rollback(&self, id: &str) -> Result<CampaignSnapshot, FleetError> {
        let id = id.to_string();
        self.request(|reply| Command::Rollback { id, reply }).await
    }

    /// Let the current phase advance even if its success rate misses the gate
    pub async fn override_gate(&self, id: &str) -> Result<CampaignSnapshot, FleetError> {
        let id = id.to_string();
        self.request(|reply| Command::OverrideGate { id, reply }).await
    }

    pub async fn status(&self, id: &str) -> Result<CampaignSnapshot, FleetError> {
        let id = id.to_string();
        self.request(|reply| Command::Status { id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<CampaignSnapshot>, FleetError> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn progress(&self, id: &str, phase: usize) -> Result<PhaseProgress, FleetError> {
        let id = id.to_string();
        self.request(|reply| Command::Progress { id, phase, reply })
            .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, FleetError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| FleetError::ShutdownError("coordinator is not running".to_string()))?;
        rx.await
            .map_err(|_| FleetError::ShutdownError("coordinator dropped the request".to_string()))?
    }
}

struct PhaseRun {
    index: usize,
    /// Directives this phase issues: cumulative target minus prior successes
    quota: u64,
    queue: VecDeque<DispatchJob>,
    deadline: Option<Instant>,
    overridden: bool,
}

struct RollbackRun {
    event: usize,
    queue: VecDeque<DispatchJob>,
    deadline: Option<Instant>,
}

struct CampaignRun {
    campaign: Campaign,
    /// Inventory snapshot in consistent-hash order
    nodes: Vec<FleetNode>,
    by_id: HashMap<String, FleetNode>,
    /// Nodes that were sent an upgrade directive
    dispatched: HashSet<String>,
    /// Phases covered by a rollback event
    rolled_back: BTreeSet<usize>,
    /// Nodes that were sent a downgrade directive
    downgraded: HashSet<String>,
    phase: Option<PhaseRun>,
    rollback: Option<RollbackRun>,
}

struct Deps<'a> {
    pool: &'a mut DispatchPool,
    tracker: &'a ProgressTracker,
    rollback: &'a RollbackController,
    options: &'a CoordinatorOptions,
}

/// The coordinator's single control loop
pub struct ControlLoop {
    options: CoordinatorOptions,
    inventory: Arc<Inventory>,
    tracker: Arc<ProgressTracker>,
    pool: DispatchPool,
    rollback: RollbackController,
    campaigns: HashMap<String, CampaignRun>,
    order: Vec<String>,
    /// Campaigns the tick still has work for
    active: BTreeSet<String>,
    commands: mpsc::Receiver<Command>,
}

impl ControlLoop {
    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self, mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>) {
        info!("Coordinator control loop starting...");

        let mut ticker = tokio::time::interval(self.options.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Coordinator control loop shutting down...");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        info!("All coordinator handles dropped");
                        break;
                    }
                },
                _ = ticker.tick() => self.tick(),
            }
        }

        self.pool.shutdown();
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Create { config, reply } => {
                let _ = reply.send(self.create(config));
            }
            Command::Start { id, reply } => {
                let _ = reply.send(self.with_run(&id, CampaignRun::start));
            }
            Command::Pause { id, reply } => {
                let _ = reply.send(self.with_run(&id, CampaignRun::pause));
            }
            Command::Resume { id, reply } => {
                let _ = reply.send(self.with_run(&id, CampaignRun::resume));
            }
            Command::Rollback { id, reply } => {
                let result = self.with_run(&id, CampaignRun::roll_back);
                if result.is_ok() {
                    self.active.insert(id);
                }
                let _ = reply.send(result);
            }
            Command::OverrideGate { id, reply } => {
                let _ = reply.send(self.with_run(&id, CampaignRun::override_gate));
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.with_run(&id, |run, deps| Ok(run.snapshot(deps.tracker))));
            }
            Command::List { reply } => {
                let snapshots = self
                    .order
                    .iter()
                    .filter_map(|id| self.campaigns.get(id))
                    .map(|run| run.snapshot(&self.tracker))
                    .collect();
                let _ = reply.send(Ok(snapshots));
            }
            Command::Progress { id, phase, reply } => {
                let _ = reply.send(self.with_run(&id, |run, deps| {
                    if phase >= run.campaign.phases.len() {
                        return Err(FleetError::NotFound(format!(
                            "campaign {} has no phase {}",
                            run.campaign.id, phase
                        )));
                    }
                    Ok(deps.tracker.progress(&run.campaign.id, PhaseKey::Rollout(phase)))
                }));
            }
        }
    }

    fn create(&mut self, config: CampaignConfig) -> Result<CampaignSnapshot, FleetError> {
        if let Some(id) = config.campaign_id.as_deref() {
            if self.campaigns.contains_key(id) {
                return Err(FleetError::Conflict(format!("campaign {} already exists", id)));
            }
        }

        let campaign = Campaign::from_config(config, self.inventory.len() as u64)?;
        let nodes = stable_order(self.inventory.nodes());
        let by_id = nodes
            .iter()
            .map(|node| (node.node_id.clone(), node.clone()))
            .collect();

        info!(
            campaign = %campaign.id,
            target = %campaign.target_version,
            nodes = campaign.total_nodes,
            phases = campaign.phases.len(),
            "Campaign created"
        );

        let run = CampaignRun {
            campaign,
            nodes,
            by_id,
            dispatched: HashSet::new(),
            rolled_back: BTreeSet::new(),
            downgraded: HashSet::new(),
            phase: None,
            rollback: None,
        };
        let snapshot = run.snapshot(&self.tracker);
        self.order.push(snapshot.campaign_id.clone());
        self.active.insert(snapshot.campaign_id.clone());
        self.campaigns.insert(snapshot.campaign_id.clone(), run);
        Ok(snapshot)
    }

    fn with_run<T>(
        &mut self,
        id: &str,
        op: impl FnOnce(&mut CampaignRun, &mut Deps<'_>) -> Result<T, FleetError>,
    ) -> Result<T, FleetError> {
        let Self {
            campaigns,
            pool,
            tracker,
            rollback,
            options,
            ..
        } = self;

        let run = campaigns
            .get_mut(id)
            .ok_or_else(|| FleetError::NotFound(format!("campaign {} not found", id)))?;
        let mut deps = Deps {
            pool,
            tracker,
            rollback,
            options,
        };
        op(run, &mut deps)
    }

    fn tick(&mut self) {
        let Self {
            campaigns,
            active,
            pool,
            tracker,
            rollback,
            options,
            ..
        } = self;

        pool.reap();
        let mut deps = Deps {
            pool,
            tracker,
            rollback,
            options,
        };

        for (id, followups) in deps.tracker.take_followups() {
            if let Some(run) = campaigns.get_mut(&id) {
                run.apply_followups(followups, &mut deps);
                if run.is_live() {
                    active.insert(id);
                }
            }
        }

        active.retain(|id| match campaigns.get_mut(id) {
            Some(run) => {
                run.tick(&mut deps);
                run.is_live()
            }
            None => false,
        });
    }
}

impl CampaignRun {
    fn id(&self) -> &str {
        &self.campaign.id
    }

    /// Whether ticks can still change this campaign
    fn is_live(&self) -> bool {
        self.rollback.is_some() || !self.campaign.is_terminal()
    }

    fn snapshot(&self, tracker: &ProgressTracker) -> CampaignSnapshot {
        let (succeeded, failed) = tracker.campaign_totals(self.id());
        self.campaign.snapshot(succeeded, failed)
    }

    fn start(&mut self, deps: &mut Deps<'_>) -> Result<CampaignSnapshot, FleetError> {
        match self.campaign.status {
            CampaignStatus::Draft => {}
            CampaignStatus::Running => return Ok(self.snapshot(deps.tracker)),
            CampaignStatus::Paused => {
                return Err(FleetError::Conflict(format!(
                    "campaign {} is paused; resume it instead",
                    self.id()
                )))
            }
            status => {
                return Err(FleetError::Conflict(format!(
                    "campaign {} is {:?}",
                    self.id(),
                    status
                )))
            }
        }

        self.campaign.status = CampaignStatus::Running;
        self.campaign.started_at = Some(Utc::now());
        info!(campaign = %self.id(), "Campaign started");

        self.enter_phase(0, deps);
        Ok(self.snapshot(deps.tracker))
    }

    fn pause(&mut self, deps: &mut Deps<'_>) -> Result<CampaignSnapshot, FleetError> {
        match self.campaign.status {
            CampaignStatus::Paused => return Ok(self.snapshot(deps.tracker)),
            CampaignStatus::Running if self.rollback.is_none() => {}
            status => {
                return Err(FleetError::Conflict(format!(
                    "campaign {} cannot be paused while {:?}",
                    self.id(),
                    status
                )))
            }
        }

        self.campaign.status = CampaignStatus::Paused;
        let dropped = match self.phase.as_mut() {
            Some(phase) => {
                let dropped = phase.queue.len();
                phase.queue.clear();
                dropped
            }
            None => 0,
        };
        info!(
            campaign = %self.id(),
            "Campaign paused; {} queued directives cancelled",
            dropped
        );
        Ok(self.snapshot(deps.tracker))
    }

    fn resume(&mut self, deps: &mut Deps<'_>) -> Result<CampaignSnapshot, FleetError> {
        match self.campaign.status {
            CampaignStatus::Running => return Ok(self.snapshot(deps.tracker)),
            CampaignStatus::Paused => {}
            status => {
                return Err(FleetError::Conflict(format!(
                    "campaign {} cannot be resumed while {:?}",
                    self.id(),
                    status
                )))
            }
        }

        self.campaign.status = CampaignStatus::Running;
        info!(campaign = %self.id(), phase = self.campaign.current_phase, "Campaign resumed");
        self.refill(deps);
        Ok(self.snapshot(deps.tracker))
    }

    fn roll_back(&mut self, deps: &mut Deps<'_>) -> Result<CampaignSnapshot, FleetError> {
        if self.rollback.is_some()
            || matches!(
                self.campaign.status,
                CampaignStatus::Failed | CampaignStatus::RolledBack
            )
        {
            return Ok(self.snapshot(deps.tracker));
        }

        if self.campaign.status == CampaignStatus::Draft {
            return Err(FleetError::Conflict(format!(
                "campaign {} has not started",
                self.id()
            )));
        }

        let phases: Vec<usize> = (0..self.campaign.phases.len()).collect();
        self.start_rollback(RollbackTrigger::Manual, &phases, deps);
        Ok(self.snapshot(deps.tracker))
    }

    fn override_gate(&mut self, deps: &mut Deps<'_>) -> Result<CampaignSnapshot, FleetError> {
        let active = matches!(
            self.campaign.status,
            CampaignStatus::Running | CampaignStatus::Paused
        ) && self.rollback.is_none();

        let Some(phase) = self.phase.as_mut().filter(|_| active) else {
            return Err(FleetError::Conflict(format!(
                "campaign {} has no phase in progress",
                self.campaign.id
            )));
        };

        phase.overridden = true;
        info!(
            campaign = %self.campaign.id,
            phase = %self.campaign.phases[phase.index].name,
            "Phase gate overridden by operator"
        );
        Ok(self.snapshot(deps.tracker))
    }

    /// Start phase `index`, passing through phases with nothing left to do
    fn enter_phase(&mut self, mut index: usize, deps: &mut Deps<'_>) {
        loop {
            if index >= self.campaign.phases.len() {
                self.phase = None;
                self.campaign.finish(CampaignStatus::Completed);
                info!(campaign = %self.id(), "Campaign completed");
                return;
            }

            self.campaign.current_phase = index;
            let config = &self.campaign.phases[index];
            let (succeeded, _) = deps.tracker.campaign_totals(&self.campaign.id);
            let quota = phase_target_count(config.percentage, self.campaign.total_nodes)
                .saturating_sub(succeeded);

            if quota == 0 {
                info!(
                    campaign = %self.campaign.id,
                    phase = %config.name,
                    "Phase target already met"
                );
                self.campaign.phase_results.push(PhaseResult {
                    phase_name: config.name.clone(),
                    attempted: 0,
                    succeeded: 0,
                    failed: 0,
                    success_rate: 100.0,
                    gate_passed: true,
                    overridden: false,
                });
                index += 1;
                continue;
            }

            info!(
                campaign = %self.campaign.id,
                phase = %config.name,
                quota,
                "Entering phase"
            );
            self.phase = Some(PhaseRun {
                index,
                quota,
                queue: VecDeque::new(),
                deadline: None,
                overridden: false,
            });
            self.refill(deps);
            return;
        }
    }

    /// Queue directives for the rest of the current phase's quota
    fn refill(&mut self, deps: &mut Deps<'_>) {
        let Some(phase) = self.phase.as_ref() else {
            return;
        };

        let key = PhaseKey::Rollout(phase.index);
        let issued = deps.tracker.progress(&self.campaign.id, key).attempted + phase.queue.len() as u64;
        let remaining = phase.quota.saturating_sub(issued);
        if remaining == 0 {
            return;
        }

        let mut excluded = self.dispatched.clone();
        excluded.extend(self.campaign.manual_intervention.iter().cloned());
        excluded.extend(phase.queue.iter().map(|job| job.node.node_id.clone()));

        let jobs: Vec<DispatchJob> = select(&self.nodes, &excluded, remaining)
            .into_iter()
            .map(|node| {
                DispatchJob::new(
                    &self.campaign.id,
                    key,
                    node.clone(),
                    &self.campaign.target_version,
                    DirectiveKind::Upgrade,
                )
            })
            .collect();

        if (jobs.len() as u64) < remaining {
            warn!(
                campaign = %self.campaign.id,
                "Only {} of {} nodes left to select",
                jobs.len(),
                remaining
            );
        }

        if let Some(phase) = self.phase.as_mut() {
            phase.queue.extend(jobs);
        }
    }

    fn tick(&mut self, deps: &mut Deps<'_>) {
        if self.rollback.is_some() {
            self.tick_rollback(deps);
            return;
        }

        if self.campaign.status != CampaignStatus::Running {
            return;
        }

        let Some(phase) = self.phase.as_mut() else {
            return;
        };

        pump(&mut phase.queue, Some(&mut self.dispatched), deps.pool);
        if !phase.queue.is_empty() {
            return;
        }

        let wait = Duration::from_secs(self.campaign.phases[phase.index].wait_minutes * 60);
        let window = wait.max(deps.options.min_report_window);
        let deadline = *phase.deadline.get_or_insert_with(|| Instant::now() + window);

        let progress = deps
            .tracker
            .progress(&self.campaign.id, PhaseKey::Rollout(phase.index));
        if progress.pending > 0 && Instant::now() < deadline {
            return;
        }

        self.evaluate(deps);
    }

    fn tick_rollback(&mut self, deps: &mut Deps<'_>) {
        let Some(rollback) = self.rollback.as_mut() else {
            return;
        };

        pump(&mut rollback.queue, None, deps.pool);
        if !rollback.queue.is_empty() {
            return;
        }

        let window = deps.options.rollback_window;
        let deadline = *rollback.deadline.get_or_insert_with(|| Instant::now() + window);
        if !deps.rollback.is_settled(&self.campaign.id, rollback.event) && Instant::now() < deadline
        {
            return;
        }

        let event = rollback.event;
        self.rollback = None;
        deps.rollback.settle(&mut self.campaign, event);
        self.campaign.finish(CampaignStatus::RolledBack);
        info!(campaign = %self.campaign.id, "Campaign rolled back");
    }

    /// Close the current phase and apply its gate
    fn evaluate(&mut self, deps: &mut Deps<'_>) {
        let Some(phase) = self.phase.take() else {
            return;
        };
        let key = PhaseKey::Rollout(phase.index);
        let config = self.campaign.phases[phase.index].clone();

        let expired = deps.tracker.expire_pending(&self.campaign.id, key);
        if !expired.is_empty() {
            warn!(
                campaign = %self.campaign.id,
                phase = %config.name,
                "{} nodes did not report before the window closed",
                expired.len()
            );
        }
        let progress = deps.tracker.progress(&self.campaign.id, key);
        let success_rate = rate(progress.succeeded, progress.attempted);
        let met = success_rate >= config.success_threshold;
        let gate_passed = met || phase.overridden;

        for failure in deps
            .tracker
            .outcomes(&self.campaign.id, key)
            .into_iter()
            .filter(|o| o.outcome != Outcome::Success)
        {
            debug!(
                campaign = %self.campaign.id,
                node = %failure.node_id,
                outcome = ?failure.outcome,
                class = ?failure.failure_class,
                "{}",
                failure.last_error.as_deref().unwrap_or("no error reported")
            );
        }

        info!(
            campaign = %self.campaign.id,
            phase = %config.name,
            attempted = progress.attempted,
            succeeded = progress.succeeded,
            success_rate,
            threshold = config.success_threshold,
            "Phase gate {}",
            if gate_passed { "passed" } else { "failed" }
        );

        self.campaign.phase_results.push(PhaseResult {
            phase_name: config.name.clone(),
            attempted: progress.attempted,
            succeeded: progress.succeeded,
            failed: progress.failed,
            success_rate,
            gate_passed,
            overridden: gate_passed && !met,
        });

        let (succeeded, failed) = deps.tracker.campaign_totals(&self.campaign.id);
        let cumulative = rate(succeeded, succeeded + failed);

        if cumulative < self.campaign.rollback_threshold {
            warn!(
                campaign = %self.campaign.id,
                cumulative,
                threshold = self.campaign.rollback_threshold,
                "Cumulative success rate below rollback threshold"
            );
            let phases: Vec<usize> = (0..=phase.index).collect();
            self.start_rollback(RollbackTrigger::CampaignBreach, &phases, deps);
        } else if !gate_passed {
            self.start_rollback(
                RollbackTrigger::PhaseBreach { phase: config.name },
                &[phase.index],
                deps,
            );
        } else {
            self.enter_phase(phase.index + 1, deps);
        }
    }

    fn start_rollback(&mut self, trigger: RollbackTrigger, phases: &[usize], deps: &mut Deps<'_>) {
        // Queued upgrades never go out once a rollback starts. Upgrades
        // already delivered stop counting; their successes arrive late.
        if let Some(phase) = self.phase.take() {
            let in_flight = deps
                .tracker
                .expire_pending(&self.campaign.id, PhaseKey::Rollout(phase.index));
            if !in_flight.is_empty() {
                info!(
                    campaign = %self.campaign.id,
                    "{} upgrades were still in flight when the rollback started",
                    in_flight.len()
                );
            }
        }

        self.campaign.status = CampaignStatus::Failed;
        self.campaign.completed_at = None;

        let (event, jobs) =
            deps.rollback
                .initiate(&mut self.campaign, &self.by_id, trigger, phases);
        self.rolled_back.extend(phases.iter().copied());
        self.downgraded.extend(jobs.iter().map(|job| job.node.node_id.clone()));
        self.rollback = Some(RollbackRun {
            event,
            queue: jobs.into(),
            deadline: None,
        });
        self.tick_rollback(deps);
    }

    /// Act on reports the counters alone do not cover
    fn apply_followups(&mut self, followups: Followups, deps: &mut Deps<'_>) {
        for node_id in followups.manual_intervention {
            warn!(
                campaign = %self.campaign.id,
                node = %node_id,
                "Node requires manual intervention"
            );
            self.campaign.manual_intervention.insert(node_id);
        }

        for late in followups.late_successes {
            if !self.rolled_back.contains(&late.phase) {
                debug!(
                    campaign = %self.campaign.id,
                    node = %late.node_id,
                    "Late upgrade success kept; its phase was not rolled back"
                );
                continue;
            }
            if self.downgraded.contains(&late.node_id) {
                continue;
            }
            let Some(node) = self.by_id.get(&late.node_id) else {
                continue;
            };

            let event = match self.rollback.as_ref() {
                Some(run) => run.event,
                None => self.campaign.rollback_events.len().saturating_sub(1),
            };
            let job = deps.rollback.follow_up(&mut self.campaign, node, event);
            self.downgraded.insert(late.node_id);

            match self.rollback.as_mut() {
                Some(run) => {
                    run.queue.push_back(job);
                    run.deadline = None;
                }
                None => {
                    info!(campaign = %self.campaign.id, event, "Reopening settled rollback");
                    self.campaign.status = CampaignStatus::Failed;
                    self.campaign.completed_at = None;
                    self.rollback = Some(RollbackRun {
                        event,
                        queue: VecDeque::from([job]),
                        deadline: None,
                    });
                }
            }
        }
    }
}

/// Submit queued jobs while the pool has free slots
fn pump(
    queue: &mut VecDeque<DispatchJob>,
    mut dispatched: Option<&mut HashSet<String>>,
    pool: &mut DispatchPool,
) {
    while pool.capacity() > 0 {
        let Some(job) = queue.pop_front() else {
            break;
        };
        if let Some(dispatched) = dispatched.as_mut() {
            dispatched.insert(job.node.node_id.clone());
        }
        pool.submit(job);
    }
}

/// Success rate in percent; an empty denominator counts as 100%
fn rate(succeeded: u64, attempted: u64) -> f64 {
    if attempted == 0 {
        100.0
    } else {
        succeeded as f64 / attempted as f64 * 100.0
    }
}
