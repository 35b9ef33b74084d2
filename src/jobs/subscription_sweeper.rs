//! Deadline sweeper for parked long-poll subscriptions. Every subscription
//! has a hard deadline (default 5 minutes, spec §5); this worker is what
//! actually closes a subscription nobody ever notified.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, info};

use crate::subscription::SubscriptionManager;

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run_subscription_sweeper_worker(subscriptions: Arc<SubscriptionManager>) {
    let mut ticker = interval(SWEEP_INTERVAL);
    info!("starting subscription sweeper (runs every 10s)");

    loop {
        ticker.tick().await;
        let reaped = subscriptions.sweep_expired().await;
        if reaped > 0 {
            info!(reaped, "swept expired subscriptions");
        } else {
            debug!("subscription sweep found nothing expired");
        }
    }
}
