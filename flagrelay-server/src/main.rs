use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use flagrelay_core::{Event, HandlerConfig};
use flagrelay_runner::RequestHandler;
use tower_http::trace::TraceLayer;
use tracing::info;

mod response;

use response::Relayed;

const BIND_VAR: &str = "FLAGRELAY_BIND";
const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[derive(Clone)]
struct AppState {
    handler: RequestHandler,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HandlerConfig::load()?;
    info!(
        executable = %config.executable.display(),
        flag_order = ?config.flag_order,
        timeout_secs = config.timeout_secs,
        "Loaded handler configuration"
    );

    let state = AppState {
        handler: RequestHandler::new(config),
    };

    let bind = std::env::var(BIND_VAR).unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Server listening on http://{}", bind);
    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/invoke", post(invoke_form))
        .route("/api/v1/events", post(invoke_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

/// Raw `application/x-www-form-urlencoded` body, wrapped into an event the
/// same way the gateway does before invoking the function.
async fn invoke_form(State(state): State<AppState>, body: String) -> Relayed {
    info!("Received form invocation");
    let event = Event::new(body);
    Relayed(state.handler.handle(&event).await)
}

async fn invoke_event(State(state): State<AppState>, Json(event): Json<Event>) -> Relayed {
    info!("Received event invocation");
    Relayed(state.handler.handle(&event).await)
}
