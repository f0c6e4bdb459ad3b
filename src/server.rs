//! The directory's HTTP surface.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{Error, Result};
use crate::protocol::{DrainResponse, ErrorBody, PeerListing, SignalAck, SignalRequest, StatusReport};
use crate::state::AppState;

pub const DEFAULT_ALLOWED_ORIGINS: [&str; 3] = [
    "http://localhost:8080",
    "http://localhost:5173",
    "http://localhost:3000",
];

pub fn router(state: AppState, allowed_origins: &[String]) -> Result<Router> {
    Ok(Router::new()
        .route("/peers", get(list_peers))
        .route("/signal", post(post_signal))
        .route("/signal/:peer_id", get(drain_signals))
        .route("/status", get(status))
        .route("/test", get(status))
        .with_state(state)
        .layer(cors_layer(allowed_origins)?)
        .layer(TraceLayer::new_for_http()))
}

/// Browsers on the listed origins may call us with credentials.
pub fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let origins = allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| Error::Config(format!("invalid CORS origin: {}", origin)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]))
}

/// Serves until `shutdown` resolves, then lets in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!("Directory listening on http://{}", addr);
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    tracing::info!("Directory stopped");
    Ok(())
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message })).into_response()
}

async fn list_peers(State(state): State<AppState>) -> Json<PeerListing> {
    Json(state.listing())
}

async fn post_signal(
    State(state): State<AppState>,
    body: std::result::Result<Json<SignalRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!("Rejecting signal body: {}", rejection.body_text());
            return bad_request(rejection.body_text());
        }
    };

    let message = match request.into_message() {
        Ok(message) => message,
        Err(rejection) => {
            tracing::debug!("Rejecting signal: {}", rejection);
            return bad_request(rejection.to_string());
        }
    };

    let message_id = message.id.clone();
    let to = message.to.clone();
    tracing::debug!("Queued {} from {} for {}", message.kind, message.from, to);
    state.mailbox.append(&to, message);

    Json(SignalAck {
        success: true,
        message_id,
    })
    .into_response()
}

async fn drain_signals(State(state): State<AppState>, Path(peer_id): Path<String>) -> Json<DrainResponse> {
    let messages = state.mailbox.drain_all(&peer_id);
    if !messages.is_empty() {
        tracing::debug!("Drained {} signal(s) for {}", messages.len(), peer_id);
    }
    Json(DrainResponse { messages })
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.status_report())
}
