//! Management HTTP API
//!
//! Small axum surface for operators: session status, the extension set,
//! refresh/restart of listener pairs, and targeted hangup. Unauthenticated
//! within the current scope; it is expected to sit on an internal network.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use porteiro_audiosocket::CallId;

use crate::error::EngineError;
use crate::extensions::ExtensionManager;
use crate::registry::{SessionRegistry, CLEANUP_GRACE};
use crate::resources::ResourceManager;
use crate::session::CallRole;

pub struct ApiState {
    pub registry: Arc<SessionRegistry>,
    pub resources: Arc<ResourceManager>,
    pub manager: Arc<ExtensionManager>,
}

/// API-level error with its HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::NotFound(message) => ApiError::NotFound(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    sessions: Vec<crate::registry::SessionSnapshot>,
    connections: Vec<crate::resources::ConnectionInfo>,
    metrics: crate::resources::ResourceMetrics,
    throttled: bool,
}

/// Build the management router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/extensions", get(extensions))
        .route("/api/refresh", post(refresh))
        .route("/api/restart", post(restart))
        .route("/api/hangup", post(hangup))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on the configured address until the process exits.
pub async fn serve(state: Arc<ApiState>, listen_addr: &str) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "management API listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
    Ok(())
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        sessions: state.registry.list(),
        connections: state.resources.connections(),
        metrics: state.resources.metrics(),
        throttled: state.resources.is_throttled(),
    })
}

async fn extensions(State(state): State<Arc<ApiState>>) -> Json<Value> {
    Json(json!({ "extensions": state.manager.list() }))
}

async fn refresh(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    let report = state.manager.refresh().await?;
    Ok(Json(json!({
        "added": report.added,
        "updated": report.updated,
        "removed": report.removed,
    })))
}

async fn restart(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let extension_id = body.get("extensionId").and_then(Value::as_i64);
    let ramal = body.get("ramal").and_then(Value::as_str);
    if extension_id.is_none() && ramal.is_none() {
        return Err(ApiError::BadRequest(
            "expected extensionId or ramal".to_string(),
        ));
    }
    state.manager.restart(extension_id, ramal).await?;
    Ok(Json(json!({ "restarted": true })))
}

async fn hangup(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let call_id: CallId = body
        .get("callId")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::BadRequest("missing callId".to_string()))?
        .parse()
        .map_err(|_| ApiError::BadRequest("malformed callId".to_string()))?;
    let role = match body.get("role").and_then(Value::as_str) {
        Some("visitor") => CallRole::Visitor,
        Some("resident") => CallRole::Resident,
        Some(other) => {
            return Err(ApiError::BadRequest(format!("unknown role {other:?}")));
        }
        None => return Err(ApiError::BadRequest("missing role".to_string())),
    };

    let session = state
        .registry
        .get(&call_id)
        .ok_or_else(|| ApiError::NotFound("unknown call".to_string()))?;

    let had_connection = state.resources.hangup_connection(call_id, role).await;
    if !had_connection {
        warn!(%call_id, %role, "hangup requested for a leg with no live connection");
    }

    // Both close paths latch the same signals; whichever runs first wins
    // and the other becomes a no-op.
    state.registry.end(&call_id);
    let registry = Arc::clone(&state.registry);
    tokio::spawn(async move {
        tokio::time::sleep(CLEANUP_GRACE).await;
        if session.ref_count() == 0 {
            registry.complete(&call_id);
        }
    });

    Ok(Json(json!({ "terminated": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::stubs::{
        ScriptedExtractor, ScriptedTranscriber, StaticDirectory, TextLengthSynthesizer,
        RecordingPublisher,
    };
    use crate::config::AppConfig;
    use crate::dialog::DialogEngine;
    use crate::leg::LegDeps;
    use porteiro_intercom_media::PhraseCache;
    use std::time::Duration;

    fn test_state() -> Arc<ApiState> {
        let config = Arc::new(AppConfig::default());
        let registry = Arc::new(SessionRegistry::new());
        let resources = ResourceManager::new(Duration::from_millis(10), 1, 1);
        let dialog = DialogEngine::new(
            Arc::clone(&registry),
            Arc::new(ScriptedExtractor::default()),
            Arc::new(StaticDirectory::default()),
            RecordingPublisher::new(),
            Arc::clone(&config),
        );
        let deps = LegDeps {
            config,
            registry: Arc::clone(&registry),
            resources: Arc::clone(&resources),
            dialog,
            transcriber: Arc::new(ScriptedTranscriber::default()),
            synthesizer: Arc::new(TextLengthSynthesizer::default()),
            cache: PhraseCache::new("target/test-cache"),
        };
        let manager = ExtensionManager::new(deps, Arc::new(StaticDirectory::default()));
        Arc::new(ApiState {
            registry,
            resources,
            manager,
        })
    }

    #[tokio::test]
    async fn hangup_rejects_malformed_bodies() {
        let state = test_state();
        let result = hangup(State(Arc::clone(&state)), Json(json!({}))).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let result = hangup(
            State(Arc::clone(&state)),
            Json(json!({ "callId": "not-a-uuid", "role": "visitor" })),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn hangup_unknown_call_is_404() {
        let state = test_state();
        let result = hangup(
            State(state),
            Json(json!({
                "callId": "aaaaaaaa-aaaa-4aaa-aaaa-aaaaaaaaaaaa",
                "role": "visitor"
            })),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn hangup_latches_the_session() {
        let state = test_state();
        let call_id: CallId = "aaaaaaaa-aaaa-4aaa-aaaa-aaaaaaaaaaaa".parse().unwrap();
        let (session, _) = state.registry.get_or_create(call_id);

        let result = hangup(
            State(Arc::clone(&state)),
            Json(json!({ "callId": call_id.to_string(), "role": "visitor" })),
        )
        .await;
        assert!(result.is_ok());
        assert!(session.latches.is_set(CallRole::Visitor));
        assert!(session.latches.is_set(CallRole::Resident));

        // With no live references, the session is gone after the grace.
        tokio::time::sleep(CLEANUP_GRACE + Duration::from_millis(200)).await;
        assert!(state.registry.get(&call_id).is_none());
    }

    #[tokio::test]
    async fn restart_requires_a_target() {
        let state = test_state();
        let result = restart(State(state), Json(json!({}))).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn restart_unknown_extension_is_404() {
        let state = test_state();
        let result = restart(State(state), Json(json!({ "extensionId": 99 }))).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn status_reports_sessions() {
        let state = test_state();
        let call_id = CallId::generate();
        state.registry.get_or_create(call_id);

        let response = status(State(state)).await;
        assert_eq!(response.0.sessions.len(), 1);
        assert_eq!(response.0.sessions[0].call_id, call_id);
    }
}
