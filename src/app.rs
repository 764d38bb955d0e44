use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::chatbase::ChatbaseClient;
use crate::config::{
    keys, optional, CachedConfig, ConfigSource, EnvConfig, LayeredConfig, Settings, StoreBackend,
};
use crate::events::{EventSink, MemoryEventLog};
use crate::pg::{self, PgConfigStore, PgEventLog, PgJobStore, PgMappingStore};
use crate::queue::{Collaborators, JobQueue, QueueOptions};
use crate::store::{JobStore, MappingStore, MemoryJobStore, MemoryMappingStore};
use crate::types::{JobFilter, MappingPatch};
use crate::whatsapp::{inbound_messages, verify_whatsapp_signature, WhatsAppClient};

pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub config: Arc<dyn ConfigSource>,
    pub settings: Settings,
}

type ApiError = (StatusCode, Json<Value>);

impl AppState {
    pub fn new(deps: Collaborators, settings: Settings) -> Self {
        let config = deps.config.clone();
        let queue = JobQueue::new(deps, QueueOptions::from(&settings));
        Self {
            queue: Arc::new(queue),
            config,
            settings,
        }
    }
}

/// Wires stores, adapters and the queue for the configured backend.
pub async fn build_state(settings: Settings) -> anyhow::Result<Arc<AppState>> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build http client")?;

    let (jobs, mappings, events, base_config): (
        Arc<dyn JobStore>,
        Arc<dyn MappingStore>,
        Arc<dyn EventSink>,
        Arc<dyn ConfigSource>,
    ) = match settings.store_backend {
        StoreBackend::Postgres => {
            let pool = pg::connect(&settings.database_url)
                .await
                .context("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)")?;
            let layers: Vec<Arc<dyn ConfigSource>> = vec![
                Arc::new(PgConfigStore::new(pool.clone())) as Arc<dyn ConfigSource>,
                Arc::new(EnvConfig) as Arc<dyn ConfigSource>,
            ];
            let config = LayeredConfig::new(layers);
            (
                Arc::new(PgJobStore::new(pool.clone())),
                Arc::new(PgMappingStore::new(pool.clone())),
                Arc::new(PgEventLog::new(pool)),
                Arc::new(config),
            )
        }
        StoreBackend::Memory => {
            warn!("using in-memory stores; jobs are lost on restart");
            (
                Arc::new(MemoryJobStore::new()),
                Arc::new(MemoryMappingStore::new()),
                Arc::new(MemoryEventLog::new()),
                Arc::new(EnvConfig),
            )
        }
    };

    let config: Arc<dyn ConfigSource> =
        Arc::new(CachedConfig::new(base_config, settings.config_cache_ttl));
    let deps = Collaborators {
        jobs,
        mappings,
        ai: Arc::new(ChatbaseClient::new(
            http.clone(),
            config.clone(),
            &settings.chatbase_api_base,
        )),
        outbound: Arc::new(WhatsAppClient::new(
            http,
            config.clone(),
            &settings.whatsapp_graph_base,
        )),
        events,
        config,
    };
    Ok(Arc::new(AppState::new(deps, settings)))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/process", post(process_jobs))
        .route("/api/jobs/{job_id}", get(get_job))
        .route(
            "/api/mappings/{user_id}",
            get(get_mapping).patch(patch_mapping),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Reaps stale jobs, then drains due ones, once per tick.
pub fn spawn_poller(queue: Arc<JobQueue>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = queue.reap_stale().await;
            if reaped > 0 {
                warn!(reaped, "requeued stale processing jobs");
            }
            queue.process_ready_jobs().await;
        }
    })
}

pub async fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env();
    let port = settings.port;
    let poll_interval = settings.poll_interval;
    let state = build_state(settings).await?;
    let poller = spawn_poller(state.queue.clone(), poll_interval);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(port, "wa-relay listening on http://localhost:{port}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server runtime failure")?;

    poller.abort();
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

/// Admin routes are open unless `ADMIN_TOKEN` is set.
fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.settings.admin_token.as_deref() else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid token" })),
        )),
        None => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing bearer token" })),
        )),
    }
}

fn internal_error(err: impl std::fmt::Display) -> ApiError {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}

async fn config_text(state: &AppState, key: &str) -> String {
    match optional(state.config.as_ref(), key).await {
        Ok(value) => value.unwrap_or_default(),
        Err(err) => {
            warn!(key, error = %err, "config lookup failed");
            String::new()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now().to_rfc3339() }))
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    let expected_verify_token = config_text(&state, keys::WHATSAPP_VERIFY_TOKEN).await;

    if mode == "subscribe"
        && !challenge.is_empty()
        && !expected_verify_token.is_empty()
        && verify_token == expected_verify_token
    {
        return (StatusCode::OK, challenge).into_response();
    }

    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let app_secret = config_text(&state, keys::WHATSAPP_APP_SECRET).await;
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_whatsapp_signature(&app_secret, signature_header, &body) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid webhook signature" })),
        )
            .into_response();
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    let expected_phone_number_id = config_text(&state, keys::WHATSAPP_PHONE_NUMBER_ID).await;

    let messages = inbound_messages(&payload, &expected_phone_number_id);
    let mut enqueued = 0usize;
    for message in &messages {
        if let Some(name) = &message.display_name {
            if let Err(err) = state
                .queue
                .mappings()
                .upsert(&message.user_id, &MappingPatch::display_name(name.clone()))
                .await
            {
                warn!(user_id = %message.user_id, error = %err, "failed to store display name");
            }
        }
        if state
            .queue
            .enqueue_or_debounce(&message.user_id, &message.text)
            .await
        {
            enqueued += 1;
        }
    }

    (
        StatusCode::OK,
        Json(json!({ "ok": true, "received": messages.len(), "enqueued": enqueued })),
    )
        .into_response()
}

async fn process_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = authorize_admin(&state, &headers) {
        return err.into_response();
    }
    Json(state.queue.process_ready_jobs().await).into_response()
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(filter): Query<JobFilter>,
) -> impl IntoResponse {
    if let Err(err) = authorize_admin(&state, &headers) {
        return err.into_response();
    }
    match state.queue.jobs().list(&filter).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(err) => internal_error(err).into_response(),
    }
}

async fn get_job(
    Path(job_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = authorize_admin(&state, &headers) {
        return err.into_response();
    }
    match state.queue.jobs().get(&job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "job not found" })),
        )
            .into_response(),
        Err(err) => internal_error(err).into_response(),
    }
}

async fn get_mapping(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = authorize_admin(&state, &headers) {
        return err.into_response();
    }
    match state.queue.mappings().get(&user_id).await {
        Ok(Some(mapping)) => Json(mapping).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "mapping not found" })),
        )
            .into_response(),
        Err(err) => internal_error(err).into_response(),
    }
}

async fn patch_mapping(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<MappingPatch>,
) -> impl IntoResponse {
    if let Err(err) = authorize_admin(&state, &headers) {
        return err.into_response();
    }
    match state.queue.mappings().upsert(&user_id, &patch).await {
        Ok(mapping) => Json(mapping).into_response(),
        Err(err) => internal_error(err).into_response(),
    }
}
