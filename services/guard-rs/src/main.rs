use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use dotenvy::dotenv;
use reqwest::Client;
use serde_json::json;
use tower::{limit::ConcurrencyLimitLayer, ServiceBuilder};
use tracing::{info, warn};

use trapd_guard::{
    firewall::Firewall,
    protect, reaper,
    report::Reporter,
    store::{BanStore, MemoryStore, SupabaseStore},
    Config, Defense,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::load()?;

    let http_client = Client::builder()
        .timeout(Duration::from_millis(config.report_timeout_ms))
        .build()?;

    let store: Arc<dyn BanStore> = match (&config.supabase_url, &config.supabase_key) {
        (Some(url), Some(key)) => {
            info!(url = %url, "persisting bans to Supabase");
            Arc::new(SupabaseStore::new(http_client.clone(), url.as_str(), key.as_str()))
        }
        _ => {
            warn!("TRAP_SUPABASE_URL/TRAP_SUPABASE_KEY not set, bans will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let defense = Arc::new(Defense::from_config(
        &config,
        store,
        Reporter::new(http_client.clone(), config.abuseipdb_key.clone()),
        Firewall::new(config.firewall_cmd.clone()),
    )?);

    defense.restore().await;
    reaper::sweep(&defense, config.ban_retention()).await;
    reaper::spawn(Arc::clone(&defense), config.reaper_interval(), config.ban_retention());

    let storefront = Router::new()
        .route("/health", get(health))
        .fallback(not_found);

    let app = protect(storefront, defense)
        .layer(ServiceBuilder::new().layer(ConcurrencyLimitLayer::new(1024)));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    info!("trap layer listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}
