//! Periodic housekeeping for a running coordinator.

use std::time::Duration;

use metrics::gauge;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use super::coordinator::InteractionCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub expiry_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Run expiry and sweeps until `shutdown` flips to `true`.
pub fn spawn(
    coordinator: InteractionCoordinator,
    config: MaintenanceConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut expiry = interval(config.expiry_interval);
        let mut sweep = interval(config.sweep_interval);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate ticks
        expiry.tick().await;
        sweep.tick().await;

        loop {
            tokio::select! {
                _ = expiry.tick() => {
                    let expired = coordinator.expire_due();
                    if expired > 0 {
                        info!(target = "courier::maintenance", expired, "Expired actions past soft deadline");
                    }
                }
                _ = sweep.tick() => run_sweeps(&coordinator),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(target = "courier::maintenance", "Maintenance stopped");
                        return;
                    }
                }
            }
        }
    })
}

fn run_sweeps(coordinator: &InteractionCoordinator) {
    let records = coordinator.sweep_idempotency();
    let buckets = coordinator.sweep_buckets();
    let health = coordinator.health();

    gauge!("courier_token_store_len").set(health.tokens as f64);
    gauge!("courier_idempotency_len").set(health.idempotency_records as f64);
    gauge!("courier_bucket_len").set(health.buckets as f64);

    debug!(
        target = "courier::maintenance",
        records,
        buckets,
        tokens = health.tokens,
        "Sweep finished"
    );
}
