//! Shared application state handed to every handler. Grounded on the
//! reference server's composite `AppState` (`main.rs`) but built as one
//! `Arc`-wrapped struct rather than axum 0.8's multi-field `FromRef`
//! derive, since every handler here needs the whole service graph rather
//! than one field of it.

use std::sync::Arc;

use crate::blob_store::BlobStore;
use crate::config::GatewayConfig;
use crate::integrations::IntegrationManager;
use crate::state::DeviceStateService;
use crate::store::StateStore;
use crate::subscription::SubscriptionManager;
use crate::weather::WeatherCache;

pub struct AppServices {
    pub state: Arc<DeviceStateService>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub store: Arc<dyn StateStore>,
    pub weather: WeatherCache,
    pub integrations: Arc<IntegrationManager>,
    pub blobs: BlobStore,
    pub config: GatewayConfig,
}

#[derive(Clone)]
pub struct AppState(pub Arc<AppServices>);

impl std::ops::Deref for AppState {
    type Target = AppServices;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl axum::extract::FromRef<AppState> for AppState {
    fn from_ref(state: &AppState) -> Self {
        state.clone()
    }
}
