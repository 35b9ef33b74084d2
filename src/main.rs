use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use thermo_gateway::app_state::{AppServices, AppState};
use thermo_gateway::config::{GatewayConfig, StoreBackend};
use thermo_gateway::integrations::{CommandSink, IntegrationManager};
use thermo_gateway::jobs::{
    run_entry_key_gc_worker, run_integration_reconciler_worker, run_subscription_sweeper_worker,
};
use thermo_gateway::metrics::{track_request_metrics, MetricsRecorder};
use thermo_gateway::middleware::logging::log_headers_middleware;
use thermo_gateway::middleware::rate_limit::device_rate_limit_middleware;
use thermo_gateway::state::DeviceStateService;
use thermo_gateway::store::{PostgresStore, SqliteStore, StateStore};
use thermo_gateway::subscription::SubscriptionManager;
use thermo_gateway::weather::WeatherCache;
use thermo_gateway::{control, health, transport};

async fn build_store(config: &GatewayConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let store = PostgresStore::connect(&config.database_url, config.store_max_connections)
                .await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Sqlite => {
            let url = format!("sqlite://{}?mode=rwc", config.sqlite_path);
            let store = SqliteStore::connect(&url, config.store_max_connections).await?;
            Ok(Arc::new(store))
        }
    }
}

fn device_router() -> Router<AppState> {
    Router::new()
        .route("/nest/entry", get(transport::entry))
        .route("/nest/ping", get(transport::ping))
        .route("/nest/passphrase", get(transport::passphrase))
        .route("/nest/pro_info", get(transport::pro_info))
        .route("/nest/weather/v1", get(transport::weather))
        .route(
            "/nest/transport/device/{serial}",
            get(transport::list_device_objects),
        )
        .route("/nest/transport", post(transport::subscribe))
        .route("/nest/transport/put", post(transport::put))
        .route("/nest/upload", post(transport::upload))
        .route_layer(axum::middleware::from_fn(device_rate_limit_middleware))
        .route_layer(axum::middleware::from_fn(log_headers_middleware))
}

fn control_router() -> Router<AppState> {
    Router::new()
        .route("/command", post(control::command))
        .route("/api/claim", post(control::claim))
        .route("/api/devices", get(control::devices))
        .route("/status", get(control::status))
        .route("/notify-device", post(control::notify_device))
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = GatewayConfig::from_env();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if config.debug_logging {
            "debug".to_string()
        } else {
            "warn".to_string()
        }
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        store_backend = ?config.store_backend,
        transport_port = config.transport_port,
        control_port = config.control_port,
        tls_enabled = config.cert_dir.is_some(),
        "starting thermostat gateway"
    );

    let prometheus_handle = if config.enable_metrics {
        let recorder = MetricsRecorder::new();
        tracing::info!("metrics recorder installed");
        Some(recorder.handle().clone())
    } else {
        None
    };

    let store = build_store(&config).await?;
    tracing::info!("state store initialized");

    let integrations = Arc::new(IntegrationManager::new(store.clone()));
    let device_state = Arc::new(DeviceStateService::new(store.clone(), integrations.clone()));
    integrations.set_command_sink(device_state.clone() as Arc<dyn CommandSink>);

    let subscriptions = Arc::new(SubscriptionManager::new(
        config.max_subscriptions_per_device,
        config.subscription_timeout(),
    ));
    let weather = WeatherCache::new(
        config.weather_cache_ttl(),
        "https://api.weather-upstream.example.com".to_string(),
    );
    let blobs = thermo_gateway::blob_store::BlobStore::new(
        thermo_gateway::blob_store::BlobStoreConfig {
            base_dir: std::path::PathBuf::from(&config.upload_dir),
        },
    )
    .await?;
    tracing::info!("blob store initialized");

    let services = AppServices {
        state: device_state,
        subscriptions: subscriptions.clone(),
        store: store.clone(),
        weather,
        integrations: integrations.clone(),
        blobs,
        config: config.clone(),
    };
    let state = AppState(Arc::new(services));

    tokio::spawn(run_entry_key_gc_worker(store.clone()));
    tokio::spawn(run_subscription_sweeper_worker(subscriptions.clone()));
    tokio::spawn(run_integration_reconciler_worker(integrations.clone()));
    tracing::info!("background workers started");

    let mut device_app = device_router().with_state(state.clone());
    device_app = device_app.layer(TraceLayer::new_for_http());
    device_app = device_app.layer(axum::middleware::from_fn(track_request_metrics));

    let mut control_app = control_router().with_state(state.clone());
    if let Some(handle) = prometheus_handle {
        let metrics_app = Router::new()
            .route("/metrics", get(thermo_gateway::metrics::metrics_handler))
            .with_state(handle);
        control_app = control_app.merge(metrics_app);
    }
    let control_app = control_app
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let transport_addr = SocketAddr::from(([0, 0, 0, 0], config.transport_port));
    let control_addr = SocketAddr::from(([0, 0, 0, 0], config.control_port));

    let control_handle = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(control_addr).await?;
        tracing::info!(addr = %control_addr, "control plane listening");
        axum::serve(listener, control_app.into_make_service()).await
    });

    let device_handle = tokio::spawn(async move {
        match &config.cert_dir {
            Some(cert_dir) => {
                let cert_path = format!("{cert_dir}/cert.pem");
                let key_path = format!("{cert_dir}/key.pem");
                let tls_config =
                    axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path)
                        .await?;
                tracing::info!(addr = %transport_addr, cert_dir = %cert_dir, "device transport listening (tls)");
                axum_server::bind_rustls(transport_addr, tls_config)
                    .serve(device_app.into_make_service())
                    .await?;
            }
            None => {
                tracing::warn!(
                    addr = %transport_addr,
                    "CERT_DIR not set, device transport listening over plain http"
                );
                let listener = tokio::net::TcpListener::bind(transport_addr).await?;
                axum::serve(listener, device_app.into_make_service()).await?;
            }
        }
        Ok::<(), std::io::Error>(())
    });

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining parked subscriptions");
        subscriptions.shutdown().await;
    };

    tokio::select! {
        result = control_handle => { result??; }
        result = device_handle => { result??; }
        _ = shutdown => {}
    }

    Ok(())
}
