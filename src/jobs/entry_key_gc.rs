//! Hourly entry-key garbage collection (spec §3 "garbage-collected hourly").

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{error, info};

use crate::store::StateStore;

const GC_INTERVAL: Duration = Duration::from_secs(3600);

pub async fn run_entry_key_gc_worker(store: Arc<dyn StateStore>) {
    let mut ticker = interval(GC_INTERVAL);
    info!("starting entry-key gc worker (runs hourly)");

    loop {
        ticker.tick().await;
        let now_ms = chrono::Utc::now().timestamp_millis();

        match store.delete_expired_entry_keys(now_ms).await {
            Ok(count) if count > 0 => info!(count, "garbage-collected expired entry keys"),
            Ok(_) => info!("no expired entry keys to collect"),
            Err(err) => error!(error = %err, "entry-key gc pass failed"),
        }
    }
}
