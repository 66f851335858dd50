//! HTTP transport for the session manager.

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use wa_gateway_core::{ConnectionFactory, SessionStore};
use wa_gateway_session::{ManagerError, PairingOutcome, SessionManager};

use crate::protocol::{ApiResponse, PairingResponse, SendMessageRequest, SignRequest, status_code};

/// A manager error rendered as an enveloped response.
#[derive(Debug)]
pub struct ApiError(pub ManagerError);

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(status_code(self.0.kind()))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }
        let body = ApiResponse::<()>::error(status.as_u16(), self.0.to_string());
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ManagerError::Validation(rejection.body_text()))
    }
}

type ApiResult = Result<Response, ApiError>;

fn respond<T: Serialize>(status: StatusCode, message: &str, data: T) -> Response {
    (status, Json(ApiResponse::ok(status.as_u16(), message, data))).into_response()
}

/// Create the gateway router.
///
/// # Example
/// ```ignore
/// let app = create_router(manager);
/// axum::serve(listener, app).await?;
/// ```
pub fn create_router<S, F>(manager: SessionManager<S, F>) -> Router
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/whatsapp/session/{name}", get(get_session::<S, F>))
        .route("/whatsapp/sessions", get(list_sessions::<S, F>))
        .route("/whatsapp/qr/{name}", get(pairing_artifact::<S, F>))
        .route("/whatsapp/qr-sign-in", post(begin_pairing::<S, F>))
        .route("/whatsapp/sign-out", put(sign_out::<S, F>))
        .route("/whatsapp/send", post(send::<S, F>))
        .route("/whatsapp/send-mass", post(send_mass::<S, F>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(manager)
}

async fn get_session<S, F>(
    State(manager): State<SessionManager<S, F>>,
    Path(name): Path<String>,
) -> ApiResult
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    let record = manager.get_session(&name).await?;
    Ok(respond(StatusCode::OK, "ok", record))
}

async fn list_sessions<S, F>(State(manager): State<SessionManager<S, F>>) -> ApiResult
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    let records = manager.list_sessions().await?;
    Ok(respond(StatusCode::OK, "ok", records))
}

async fn pairing_artifact<S, F>(
    State(manager): State<SessionManager<S, F>>,
    Path(name): Path<String>,
) -> ApiResult
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    let artifact = manager.pairing_artifact(&name).await?;
    Ok(respond(StatusCode::OK, "scan to pair", PairingResponse::from(artifact)))
}

async fn begin_pairing<S, F>(
    State(manager): State<SessionManager<S, F>>,
    body: Result<Json<SignRequest>, JsonRejection>,
) -> ApiResult
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    let Json(request) = body?;
    let outcome = manager.begin_pairing(request.session_name()?).await?;
    let message = match outcome {
        PairingOutcome::Pairing(_) => "scan to pair",
        PairingOutcome::AlreadyConnected => "already connected",
    };
    Ok(respond(StatusCode::OK, message, PairingResponse::from(outcome)))
}

async fn sign_out<S, F>(
    State(manager): State<SessionManager<S, F>>,
    body: Result<Json<SignRequest>, JsonRejection>,
) -> ApiResult
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    let Json(request) = body?;
    let record = manager.sign_out(request.session_name()?).await?;
    Ok(respond(StatusCode::OK, "signed out", record))
}

async fn send<S, F>(
    State(manager): State<SessionManager<S, F>>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    let Json(request) = body?;
    let sent = manager.send(request.into_send_request()?).await?;
    Ok(respond(StatusCode::OK, "sent", sent))
}

async fn send_mass<S, F>(
    State(manager): State<SessionManager<S, F>>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ApiResult
where
    S: SessionStore + 'static,
    F: ConnectionFactory + 'static,
{
    let Json(request) = body?;
    let ticket = manager.broadcast(request.into_broadcast_request()?)?;
    Ok(respond(StatusCode::ACCEPTED, "accepted", ticket))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use wa_gateway_core::mock::{Script, ScriptedConnector};
    use wa_gateway_session::{ManagerConfig, storage::MemoryStorage};

    use super::*;

    fn app(script: Script) -> (Router, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new(script));
        let manager = SessionManager::new(
            Arc::new(MemoryStorage::new()),
            Arc::clone(&connector),
            ManagerConfig::default(),
        );
        (create_router(manager), connector)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_unknown_session_is_404_envelope() {
        let (app, _) = app(Script::ready());
        let (status, body) = call(&app, "GET", "/whatsapp/session/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"]["code"], 404);
        assert_eq!(body["status"]["message"], "session ghost not found");
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn test_sign_in_returns_qr_then_lists_session() {
        let (app, _) = app(Script::pairing("2@abc"));

        let (status, body) = call(
            &app,
            "POST",
            "/whatsapp/qr-sign-in",
            Some(json!({"sessionName": "shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["result"], "qr");
        assert_eq!(body["data"]["code"], "2@abc");
        assert!(
            body["data"]["image"]
                .as_str()
                .unwrap()
                .starts_with("data:image/svg+xml;base64,")
        );

        let (status, body) = call(&app, "GET", "/whatsapp/qr/shop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["code"], "2@abc");

        let (_, body) = call(&app, "GET", "/whatsapp/sessions", None).await;
        assert_eq!(body["data"][0]["sessionName"], "shop");
        assert_eq!(body["data"][0]["status"], "qr");
    }

    #[tokio::test]
    async fn test_sign_in_when_connected() {
        let (app, connector) = app(Script::ready());
        for _ in 0..2 {
            let (status, body) = call(
                &app,
                "POST",
                "/whatsapp/qr-sign-in",
                Some(json!({"sessionName": "shop"})),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["result"], "already_connected");
        }
        assert_eq!(connector.created_count(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_twice_conflicts() {
        let (app, _) = app(Script::ready());
        call(&app, "POST", "/whatsapp/qr-sign-in", Some(json!({"sessionName": "shop"}))).await;

        let (status, body) =
            call(&app, "PUT", "/whatsapp/sign-out", Some(json!({"sessionName": "shop"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "signed_out");

        let (status, _) =
            call(&app, "PUT", "/whatsapp/sign-out", Some(json!({"sessionName": "shop"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_send_without_connection_is_409() {
        let (app, _) = app(Script::ready());
        let (status, body) = call(
            &app,
            "POST",
            "/whatsapp/send",
            Some(json!({"sessionName": "shop", "to": "6281111", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"]["code"], 409);
    }

    #[tokio::test]
    async fn test_send_and_validation() {
        let (app, connector) = app(Script::ready());
        call(&app, "POST", "/whatsapp/qr-sign-in", Some(json!({"sessionName": "shop"}))).await;

        let (status, body) = call(
            &app,
            "POST",
            "/whatsapp/send",
            Some(json!({"sessionName": "shop", "to": "6281111", "message": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["to"], "6281111@c.us");
        assert_eq!(connector.latest("shop").unwrap().sent().len(), 1);

        let (status, _) = call(
            &app,
            "POST",
            "/whatsapp/send",
            Some(json!({"sessionName": "shop", "to": "6281111"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "POST", "/whatsapp/send", Some(json!("not an object"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"]["code"], 400);
    }

    #[tokio::test]
    async fn test_send_mass_is_accepted() {
        let (app, _) = app(Script::ready());
        call(&app, "POST", "/whatsapp/qr-sign-in", Some(json!({"sessionName": "shop"}))).await;

        let (status, body) = call(
            &app,
            "POST",
            "/whatsapp/send-mass",
            Some(json!({
                "sessionName": "shop",
                "to": "6281111|Alice,6281112|Bob",
                "message": "Hi {{name}}",
                "enableTimeNotes": true,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["recipients"], 2);
        assert!(body["data"]["broadcastId"].is_string());
    }
}
