//! Process run loops for the node agent and the coordinator

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api;
use crate::api::state::ApiState;
use crate::app::options::{AgentOptions, CoordinatorAppOptions, LifecycleOptions};
use crate::app::state::{AgentState, CoordinatorState};
use crate::errors::FleetError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::storage::identity::assert_registered;
use crate::workers::reporter;

/// Run the node agent until `shutdown_signal` resolves
pub async fn run_agent(
    options: AgentOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), FleetError> {
    info!("Initializing fleetup agent...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init_agent(&options, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start agent: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Run the campaign coordinator until `shutdown_signal` resolves
pub async fn run_coordinator(
    options: CoordinatorAppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), FleetError> {
    info!("Initializing fleetup coordinator...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init_coordinator(&options, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start coordinator: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init_agent(
    options: &AgentOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), FleetError> {
    let identity = assert_registered(&options.layout.identity_file()).await?;
    let state = Arc::new(AgentState::init(options, identity).await?);

    if let Some(record) = state.intake.recover().await {
        info!(
            directive = %record.directive_id,
            phase = ?record.phase,
            "Resuming interrupted upgrade"
        );
    }

    init_reporter_worker(
        options.reporter.clone(),
        state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    info!("Initializing node HTTP server...");
    let mut shutdown_rx = shutdown_tx.subscribe();
    let server_handle = serve(
        &options.server,
        Arc::new(ServerState::new(state.intake.clone())),
        async move {
            let _ = shutdown_rx.recv().await;
        },
    )
    .await?;
    shutdown_manager.with_server_handle(server_handle)?;

    Ok(())
}

fn init_reporter_worker(
    options: reporter::Options,
    state: Arc<AgentState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), FleetError> {
    info!("Initializing reporter worker...");

    let handle = tokio::spawn(async move {
        reporter::run(
            &options,
            state.store.as_ref(),
            state.reporter.as_ref(),
            &state.node_id,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("reporter", handle)
}

async fn init_coordinator(
    options: &CoordinatorAppOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), FleetError> {
    let (state, control_loop) = CoordinatorState::init(options).await?;

    info!("Initializing control loop...");
    let mut loop_rx = shutdown_tx.subscribe();
    let handle = tokio::spawn(control_loop.run(Box::pin(async move {
        let _ = loop_rx.recv().await;
    })));
    shutdown_manager.with_worker_handle("control loop", handle)?;

    info!("Initializing control API server...");
    let api_state = ApiState::new(state.coordinator, state.inventory, state.tracker);
    let mut server_rx = shutdown_tx.subscribe();
    let server_handle = api::serve::serve(&options.server, Arc::new(api_state), async move {
        let _ = server_rx.recv().await;
    })
    .await?;
    shutdown_manager.with_server_handle(server_handle)?;

    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    server_handle: Option<JoinHandle<Result<(), FleetError>>>,
    worker_handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            server_handle: None,
            worker_handles: Vec::new(),
        }
    }

    pub fn with_worker_handle(
        &mut self,
        name: &'static str,
        handle: JoinHandle<()>,
    ) -> Result<(), FleetError> {
        if self.worker_handles.iter().any(|(n, _)| *n == name) {
            return Err(FleetError::ShutdownError(format!("{} handle already set", name)));
        }
        self.worker_handles.push((name, handle));
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), FleetError>>,
    ) -> Result<(), FleetError> {
        if self.server_handle.is_some() {
            return Err(FleetError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FleetError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), FleetError> {
        info!("Shutting down fleetup...");

        // 1. Workers, in start order
        for (name, handle) in self.worker_handles.drain(..) {
            handle
                .await
                .map_err(|e| FleetError::ShutdownError(format!("{}: {}", name, e)))?;
        }

        // 2. Server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| FleetError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
