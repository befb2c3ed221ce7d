use std::{net::SocketAddr, sync::Arc};

use hooklog::{
    api,
    auth::BasicAuthenticator,
    config::AppConfig,
    db::{self, pg::PgStore},
    replay::ReplayEngine,
    ssrf::{DnsResolver, SsrfValidator},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hooklog=info,tower_http=info".into()),
        )
        .init();

    let config = AppConfig::from_env()
        .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    db::run_migrations(store.pool()).await?;

    let replay = ReplayEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(SsrfValidator::new(DnsResolver)),
        config.replay_policy(),
    );

    let app = api::router(api::AppState {
        events: store.clone(),
        streams: store.clone(),
        attempts: store,
        auth: Arc::new(BasicAuthenticator::new(
            config.admin_basic_user.clone(),
            config.admin_basic_pass.clone(),
        )),
        replay: Arc::new(replay),
        capture: config.capture_limits(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        max_request_bytes = config.max_request_size_bytes,
        trust_proxy = config.trust_proxy,
        "server listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
