//! Outcome outbox worker
//!
//! Re-sends terminal outcomes until the coordinator acknowledges them.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::node::reporting::{flush_outcome, OutcomeReporter};
use crate::node::state::UpgradeStateStore;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Reporter worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Delay between outbox checks while nothing is failing
    pub interval: Duration,

    /// Initial delay before the first check
    pub initial_delay: Duration,

    /// Backoff after a failed delivery
    pub cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(5),
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Run the reporter worker
pub async fn run<S, F>(
    options: &Options,
    store: &UpgradeStateStore,
    reporter: &dyn OutcomeReporter,
    node_id: &str,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Reporter worker starting...");

    let mut delay = options.initial_delay;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reporter worker shutting down...");
                return;
            }
            _ = sleep_fn(delay) => {}
        }

        match flush_outcome(store, reporter, node_id).await {
            Ok(sent) => {
                if sent {
                    debug!("Outbox drained");
                }
                failures = 0;
                delay = options.interval;
            }
            Err(e) => {
                delay = calc_exp_backoff(&options.cooldown, failures);
                failures = failures.saturating_add(1);
                warn!(
                    "Outcome delivery failed ({} in a row): {}. Retrying in {:?}",
                    failures, e, delay
                );
            }
        }
    }
}
