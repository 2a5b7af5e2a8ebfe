use axum::{
    body::Bytes,
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{DefaultBodyLimit, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chatdesk_core::bus::MessageBus;
use chatdesk_core::config::{ServerConfig, WebhookConfig};
use chatdesk_core::metrics::{MetricsSnapshot, MetricsStore};
use chatdesk_ingest::{IngestionCoordinator, Intake};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

const MAX_WEBHOOK_BODY: usize = 1024 * 1024;

#[derive(Clone)]
struct AppState {
    coordinator: Arc<IngestionCoordinator>,
    bus: Arc<MessageBus>,
    metrics: Arc<MetricsStore>,
    auth_token: Option<String>,
    verify_token: Option<String>,
    app_secret: Option<String>,
    ws_heartbeat_secs: u64,
}

pub struct Gateway {
    port: u16,
    state: AppState,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

impl Gateway {
    /// Binds to 0.0.0.0 when `server.auth_token` is set, loopback otherwise.
    pub fn new(
        server: &ServerConfig,
        webhook: &WebhookConfig,
        coordinator: Arc<IngestionCoordinator>,
        bus: Arc<MessageBus>,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            port: server.port,
            state: AppState {
                coordinator,
                bus,
                metrics,
                auth_token: non_empty(server.auth_token.clone()),
                verify_token: non_empty(webhook.verify_token.clone()),
                app_secret: non_empty(webhook.app_secret.clone()),
                ws_heartbeat_secs: server.ws_heartbeat_secs,
            },
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/webhook", get(webhook_verify).post(webhook_intake))
            .route("/api/monitor/metrics", get(get_metrics))
            .route("/ws/events", get(ws_events))
            .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves, then let in-flight requests finish.
    pub async fn start<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.state.app_secret.is_none() {
            warn!("No webhook app secret configured — signature verification disabled");
        }

        // Security: bind to localhost-only if no auth token configured
        let addr = if self.state.auth_token.is_some() {
            SocketAddr::from(([0, 0, 0, 0], self.port))
        } else {
            warn!("No gateway auth token configured — binding to 127.0.0.1 only");
            SocketAddr::from(([127, 0, 0, 1], self.port))
        };

        info!("Gateway listening on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Gateway stopped accepting requests");

        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Verify the Authorization header against the configured token.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected_token) = &state.auth_token else {
        // No auth configured = local-only, all requests allowed
        return Ok(());
    };

    let provided_token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if provided_token == expected_token {
        Ok(())
    } else {
        warn!("Unauthorized gateway access attempt");
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MetricsSnapshot>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(state.metrics.snapshot()))
}

#[derive(Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn webhook_verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<String, StatusCode> {
    let expected = state.verify_token.as_deref().unwrap_or_default();
    let provided = query.verify_token.as_deref().unwrap_or_default();

    if query.mode.as_deref() != Some("subscribe") || expected.is_empty() || provided != expected {
        warn!(mode = ?query.mode, "webhook verification rejected");
        return Err(StatusCode::FORBIDDEN);
    }

    info!("webhook verified");
    Ok(query.challenge.unwrap_or_default())
}

fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(provided) = hex::decode(sig_hex) else {
        return false;
    };

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Acknowledge first, process later: every accepted body is answered 200 as
/// soon as its events are queued, malformed or unsupported ones included.
async fn webhook_intake(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(secret) = state.app_secret.as_deref() {
        if !verify_signature(&headers, &body, secret) {
            warn!("webhook signature invalid, request rejected");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "webhook body is not JSON, dropped");
            return StatusCode::OK;
        }
    };

    match state.coordinator.ingest(payload) {
        Ok(intakes) => {
            let duplicates = intakes.iter().filter(|i| i.is_duplicate()).count();
            let statuses = intakes
                .iter()
                .filter(|i| matches!(i, Intake::StatusQueued { .. }))
                .count();
            debug!(
                events = intakes.len(),
                duplicates, statuses, "webhook envelope accepted"
            );
        }
        Err(e) => warn!(error = %e, "webhook envelope dropped"),
    }

    StatusCode::OK
}

async fn ws_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    check_auth(&state, &headers)?;

    let bus = state.bus.clone();
    let metrics = state.metrics.clone();
    let ws_heartbeat_secs = heartbeat_interval_secs(state.ws_heartbeat_secs);
    Ok(ws.on_upgrade(move |socket| handle_ws_events(socket, bus, metrics, ws_heartbeat_secs)))
}

fn heartbeat_interval_secs(configured: u64) -> u64 {
    configured.clamp(3, 120)
}

async fn handle_ws_events(
    mut socket: WebSocket,
    bus: Arc<MessageBus>,
    metrics: Arc<MetricsStore>,
    ws_heartbeat_secs: u64,
) {
    let mut rx = bus.subscribe();
    let mut ticker = interval(Duration::from_secs(ws_heartbeat_secs));

    let connected = json!({
        "type": "connected",
        "message": "event stream ready",
        "metrics": metrics.snapshot(),
    });

    if socket
        .send(WsMessage::Text(connected.to_string()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        let frame = tokio::select! {
            _ = ticker.tick() => json!({
                "type": "heartbeat",
                "metrics": metrics.snapshot(),
            }),
            event = rx.recv() => match event {
                Ok(event) => json!({
                    "type": "event",
                    "topic": event.topic(),
                    "data": event.payload(),
                }),
                Err(RecvError::Lagged(skipped)) => json!({
                    "type": "lagged",
                    "skipped": skipped,
                }),
                Err(RecvError::Closed) => break,
            },
        };
        if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chatdesk_core::config::IngestConfig;
    use chatdesk_ingest::Pipeline;
    use chatdesk_persistence::{ConversationStore, SqliteStore};
    use tower::ServiceExt;

    struct TestGateway {
        gateway: Gateway,
        store: Arc<SqliteStore>,
    }

    async fn gateway(auth_token: Option<&str>, app_secret: Option<&str>) -> TestGateway {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let bus = Arc::new(MessageBus::new(64));
        let metrics = MetricsStore::new();
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            bus.clone(),
            None,
            Duration::from_secs(5),
            metrics.clone(),
        ));
        let coordinator = Arc::new(IngestionCoordinator::from_config(
            &IngestConfig::default(),
            pipeline,
            metrics.clone(),
        ));
        let server = ServerConfig {
            auth_token: auth_token.map(str::to_string),
            ..ServerConfig::default()
        };
        let webhook = WebhookConfig {
            verify_token: Some("hub-secret".into()),
            app_secret: app_secret.map(str::to_string),
        };
        TestGateway {
            gateway: Gateway::new(&server, &webhook, coordinator, bus, metrics),
            store,
        }
    }

    fn envelope() -> Vec<u8> {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{ "changes": [{ "value": {
                "contacts": [{ "wa_id": "5551234", "profile": { "name": "Ana" } }],
                "messages": [{
                    "from": "5551234",
                    "id": "wamid.1",
                    "type": "text",
                    "text": { "body": "Hola" }
                }]
            } }] }]
        })
        .to_string()
        .into_bytes()
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn post(body: Vec<u8>, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::post("/webhook").header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("x-hub-signature-256", signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn wait_for_message(store: &SqliteStore, id: &str) -> bool {
        for _ in 0..100 {
            if store.get_message(id).await.unwrap().is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn verify_echoes_challenge_for_matching_token() {
        let t = gateway(None, None).await;
        let response = t
            .gateway
            .router()
            .oneshot(
                Request::get(
                    "/webhook?hub.mode=subscribe&hub.verify_token=hub-secret&hub.challenge=12345",
                )
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "12345");
    }

    #[tokio::test]
    async fn verify_rejects_wrong_token_or_mode_with_empty_403() {
        let t = gateway(None, None).await;
        for uri in [
            "/webhook?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1",
            "/webhook?hub.mode=unsubscribe&hub.verify_token=hub-secret&hub.challenge=1",
            "/webhook",
        ] {
            let response = t
                .gateway
                .router()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
            assert!(body_text(response).await.is_empty());
        }
    }

    #[tokio::test]
    async fn accepted_post_is_persisted_in_background() {
        let t = gateway(None, None).await;
        let response = t
            .gateway
            .router()
            .oneshot(post(envelope(), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(wait_for_message(&t.store, "wamid.1").await);
    }

    #[tokio::test]
    async fn malformed_body_is_still_acknowledged() {
        let t = gateway(None, None).await;
        let response = t
            .gateway
            .router()
            .oneshot(post(b"{not json".to_vec(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = t
            .gateway
            .router()
            .oneshot(post(json!({ "object": "page" }).to_string().into_bytes(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_when_secret_configured() {
        let t = gateway(None, Some("app-secret")).await;

        let missing = t
            .gateway
            .router()
            .oneshot(post(envelope(), None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = t
            .gateway
            .router()
            .oneshot(post(envelope(), Some(sign("other-secret", &envelope()))))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let good = t
            .gateway
            .router()
            .oneshot(post(envelope(), Some(sign("app-secret", &envelope()))))
            .await
            .unwrap();
        assert_eq!(good.status(), StatusCode::OK);
        assert!(wait_for_message(&t.store, "wamid.1").await);
    }

    #[tokio::test]
    async fn metrics_require_bearer_token_when_configured() {
        let t = gateway(Some("ops-token"), None).await;

        let denied = t
            .gateway
            .router()
            .oneshot(Request::get("/api/monitor/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = t
            .gateway
            .router()
            .oneshot(
                Request::get("/api/monitor/metrics")
                    .header("authorization", "Bearer ops-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        let snapshot: Value = serde_json::from_str(&body_text(allowed).await).unwrap();
        assert_eq!(snapshot["messages_in"], 0);
    }

    #[test]
    fn heartbeat_interval_is_kept_in_range() {
        assert_eq!(heartbeat_interval_secs(0), 3);
        assert_eq!(heartbeat_interval_secs(15), 15);
        assert_eq!(heartbeat_interval_secs(3600), 120);
    }

    #[tokio::test]
    async fn start_returns_once_shutdown_fires() {
        let t = gateway(None, None).await;
        let mut gateway = t.gateway;
        gateway.port = 0;

        let result = tokio::time::timeout(Duration::from_secs(5), gateway.start(async {}))
            .await
            .expect("gateway must stop after the shutdown future resolves");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn health_is_open() {
        let t = gateway(Some("ops-token"), None).await;
        let response = t
            .gateway
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("\"ok\""));
    }
}
