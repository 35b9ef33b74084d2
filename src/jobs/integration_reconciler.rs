//! Periodic reconciliation of loaded integrations against `StateStore`'s
//! enabled-integration table (spec §4.I, "≈ every 10 s").

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::info;

use crate::integrations::IntegrationManager;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run_integration_reconciler_worker(integrations: Arc<IntegrationManager>) {
    let mut ticker = interval(RECONCILE_INTERVAL);
    info!("starting integration reconciliation loop (runs every 10s)");

    loop {
        ticker.tick().await;
        integrations.reconcile().await;
    }
}
