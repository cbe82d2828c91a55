use std::net::SocketAddr;
use std::sync::Arc;

use vegetable_service_rs::{logging, router, AppState, Config, InferenceClient, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();
    let config = Config::from_env()?;

    let store = Store::open(&config.database_path)?;
    store.initialize()?;
    tracing::info!(path = %config.database_path.display(), "Database ready");

    let predictor = InferenceClient::new(&config.inference_url, config.inference_timeout)?;
    let state = AppState::with_session_ttl(store, Arc::new(predictor), config.session_ttl);
    let app = router(state, config.body_limit_bytes);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
