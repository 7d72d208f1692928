//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::{AgentOptions, CoordinatorAppOptions};
use crate::campaign::coordinator::{ControlLoop, Coordinator};
use crate::campaign::dispatch::DispatchPool;
use crate::campaign::inventory::Inventory;
use crate::errors::FleetError;
use crate::filesys::file::File;
use crate::http::artifacts::HttpArtifactSource;
use crate::http::client::HttpClient;
use crate::http::directives::HttpDispatcher;
use crate::http::reports::HttpOutcomeReporter;
use crate::node::artifact::HttpArtifactFetcher;
use crate::node::executor::UpgradeExecutor;
use crate::node::intake::UpgradeIntake;
use crate::node::reporting::OutcomeReporter;
use crate::node::service::SystemdServiceManager;
use crate::node::signature::SignatureVerifier;
use crate::node::state::UpgradeStateStore;
use crate::storage::identity::NodeIdentity;
use crate::tracker::ProgressTracker;

/// Node agent state
pub struct AgentState {
    pub node_id: String,
    pub store: Arc<UpgradeStateStore>,
    pub intake: Arc<UpgradeIntake>,
    pub reporter: Arc<dyn OutcomeReporter>,
}

impl AgentState {
    /// Wire the upgrade engine for a registered node
    pub async fn init(options: &AgentOptions, identity: NodeIdentity) -> Result<Self, FleetError> {
        info!("Initializing agent state for node {}...", identity.node_id);

        options.layout.setup().await?;
        let work = options.layout.upgrade_dir();
        let store = Arc::new(UpgradeStateStore::open(work.state_file()).await?);

        let fetcher = Arc::new(HttpArtifactFetcher::new(options.download_timeout)?);
        let service = Arc::new(SystemdServiceManager::new(
            options.service_name.clone(),
            HttpClient::new(&options.status_url, options.http_timeout)?,
        ));

        let verifier = SignatureVerifier::from_base64_keys(&options.trusted_keys)?;
        if !verifier.is_enforced() {
            warn!("No trusted signing keys configured; artifacts are checked by digest only");
        }

        let executor = Arc::new(
            UpgradeExecutor::new(
                options.executor.clone(),
                File::new(options.installed_binary.clone()),
                work,
                fetcher,
                service,
                store.clone(),
            )
            .with_verifier(Arc::new(verifier)),
        );

        let client = HttpClient::new(&options.coordinator_url, options.http_timeout)?;
        let reporter: Arc<dyn OutcomeReporter> =
            Arc::new(HttpOutcomeReporter::new(client, identity.token));

        let intake = Arc::new(UpgradeIntake::new(
            identity.node_id.clone(),
            identity.platform,
            options.download_base_url.clone(),
            store.clone(),
            executor,
            reporter.clone(),
        ));

        Ok(Self {
            node_id: identity.node_id,
            store,
            intake,
            reporter,
        })
    }
}

/// Coordinator state
pub struct CoordinatorState {
    pub inventory: Arc<Inventory>,
    pub tracker: Arc<ProgressTracker>,
    pub coordinator: Coordinator,
}

impl CoordinatorState {
    /// Load the inventory and build the control loop
    pub async fn init(options: &CoordinatorAppOptions) -> Result<(Self, ControlLoop), FleetError> {
        info!("Initializing coordinator state...");

        let inventory = Arc::new(Inventory::load(&File::new(options.inventory_file.clone())).await?);
        if inventory.is_empty() {
            info!("Fleet inventory {:?} is empty", options.inventory_file);
        } else {
            info!("Loaded {} nodes from {:?}", inventory.len(), options.inventory_file);
        }

        let tracker = Arc::new(ProgressTracker::new());
        let pool = DispatchPool::new(
            options.dispatch.clone(),
            Arc::new(HttpDispatcher::new(options.http_timeout)?),
            Arc::new(HttpArtifactSource::new(
                &options.artifact_base_url,
                options.signing_key_id.clone(),
                options.http_timeout,
            )?),
            tracker.clone(),
        );

        let (coordinator, control_loop) = Coordinator::new(
            options.coordinator.clone(),
            inventory.clone(),
            tracker.clone(),
            pool,
        );

        Ok((
            Self {
                inventory,
                tracker,
                coordinator,
            },
            control_loop,
        ))
    }
}

