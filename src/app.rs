use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Duration;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::assistant::{Assistant, AssistantConfig, OpenAiApi};
use crate::funnel::{Funnel, FunnelConfig, IntentLexicon};
use crate::gateway::{GatewayConfig, OutboundGateway, UazapiGateway};
use crate::normalize::{normalize, Normalized};
use crate::pipeline::{is_duplicate_inbound, Job, ParticipantLocks, PipelineQueue};
use crate::store::{PgStore, Store};
use crate::types::{env_i64, env_or, Direction};

pub struct AppState {
    store: Arc<dyn Store>,
    queue: PipelineQueue,
    verify_token: String,
    inbound_dup_window: Duration,
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "luna".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

// ---------------------------------------------------------------------------
// Webhook auth
// ---------------------------------------------------------------------------

/// Shared secret accepted as `X-Webhook-Token` header, `?token=` or the
/// Meta-style `?hub.verify_token=` query parameter.
fn provided_token(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = headers.get("x-webhook-token").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    params
        .get("token")
        .or_else(|| params.get("hub.verify_token"))
        .cloned()
}

fn authorised(expected: &str, headers: &HeaderMap, params: &HashMap<String, String>) -> bool {
    if expected.is_empty() {
        return true;
    }
    provided_token(headers, params).as_deref() == Some(expected)
}

fn payload_sample(payload: &Value) -> String {
    payload.to_string().chars().take(400).collect()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorised(&state.verify_token, &headers, &params) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid webhook token" })),
        )
            .into_response();
    }
    if let Some(challenge) = params.get("hub.challenge") {
        return (StatusCode::OK, challenge.clone()).into_response();
    }
    Json(json!({ "ok": true })).into_response()
}

/// Inbound event intake. Everything past auth acks with 200: payload-shape
/// problems are the gateway's normal operating mode, not errors, and a non-2xx
/// here only provokes redelivery storms. The slow pipeline runs detached.
async fn webhook_event(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !authorised(&state.verify_token, &headers, &params) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid webhook token" })),
        )
            .into_response();
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return Json(json!({ "received": false, "reason": "invalid JSON" })).into_response();
    };

    let message = match normalize(&payload) {
        Normalized::Message(message) => message,
        Normalized::Unrecognized => {
            warn!(
                "webhook: no participant extracted; sample={}",
                payload_sample(&payload)
            );
            return Json(json!({ "received": true, "note": "no phone" })).into_response();
        }
    };

    let participant = match state
        .store
        .find_or_create_participant(&message.phone, message.push_name.as_deref())
        .await
    {
        Ok(participant) => participant,
        Err(err) => {
            warn!("participant upsert failed: {err}");
            return Json(json!({ "received": true, "note": "store error" })).into_response();
        }
    };

    if is_duplicate_inbound(
        state.store.as_ref(),
        &participant.id,
        &message,
        state.inbound_dup_window,
    )
    .await
    {
        debug!(phone = %participant.phone, "duplicate inbound dropped");
        return Json(json!({ "received": true, "note": "duplicate" })).into_response();
    }

    if let Err(err) = state
        .store
        .append_event(
            &participant.id,
            Direction::Inbound,
            message.kind,
            message.text.as_deref(),
            None,
        )
        .await
    {
        warn!("inbound persist failed: {err}");
        return Json(json!({ "received": true, "note": "store error" })).into_response();
    }

    state.queue.enqueue(Job {
        participant,
        message,
    });
    Json(json!({ "received": true })).into_response()
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let verify_token = env_or("WEBHOOK_VERIFY_TOKEN", "");
    if verify_token.is_empty() {
        warn!("WEBHOOK_VERIFY_TOKEN is not set; webhook will accept any request");
    }

    let http = reqwest::Client::new();
    let store: Arc<dyn Store> = Arc::new(PgStore::new(db));
    let gateway: Arc<dyn OutboundGateway> =
        Arc::new(UazapiGateway::new(http.clone(), GatewayConfig::from_env()));

    let funnel_cfg = FunnelConfig::from_env();
    let api = Arc::new(OpenAiApi::from_env(http.clone()));
    let assistant = Arc::new(Assistant::new(
        api,
        store.clone(),
        gateway.clone(),
        http,
        AssistantConfig::from_env(),
        funnel_cfg.clone(),
    ));
    let funnel = Arc::new(Funnel::new(
        store.clone(),
        gateway,
        assistant,
        funnel_cfg,
        IntentLexicon::default(),
    ));

    let locks = Arc::new(ParticipantLocks::new());
    let queue = PipelineQueue::start(
        funnel,
        locks,
        env_i64("PIPELINE_QUEUE_CAPACITY", 256).max(1) as usize,
        env_i64("PIPELINE_WORKERS", 4).max(1) as usize,
    );

    let state = Arc::new(AppState {
        store,
        queue,
        verify_token,
        inbound_dup_window: Duration::seconds(env_i64("INBOUND_DUP_WINDOW_SECS", 10)),
    });

    // Register the path with and without a trailing slash so the gateway
    // never gets a 307 it won't follow.
    let webhook_path = format!("/{}", env_or("WEBHOOK_PATH", "/webhook/whatsapp").trim_matches('/'));
    let app = Router::new()
        .route("/health", get(health))
        .route(&webhook_path, get(webhook_verify).post(webhook_event))
        .route(
            &format!("{webhook_path}/"),
            get(webhook_verify).post(webhook_event),
        )
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("luna server listening on http://localhost:{port} (webhook at {webhook_path})");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
