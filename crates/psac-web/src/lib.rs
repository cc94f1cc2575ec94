//! Axum JSON surface for operators: worker status, the scheduler switch and
//! review of changed messages.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use psac_core::{Actor, ChannelId, MessageId, MessageStatus};
use psac_storage::{MemoryNotificationSink, PipelineStore, StoreError};
use psac_sync::{ChangeDetector, EntryEdits, ReconciliationEngine, WorkerState};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const CRATE_NAME: &str = "psac-web";

const DEFAULT_LIST_LIMIT: usize = 100;
const RECENT_NOTIFICATIONS: usize = 20;

pub struct AppState {
    pub store: Arc<dyn PipelineStore>,
    pub worker: Arc<WorkerState>,
    pub engine: Arc<ReconciliationEngine>,
    pub notifications: Arc<MemoryNotificationSink>,
    detector: ChangeDetector,
}

impl AppState {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        worker: Arc<WorkerState>,
        engine: Arc<ReconciliationEngine>,
        notifications: Arc<MemoryNotificationSink>,
    ) -> Self {
        Self {
            detector: ChangeDetector::new(store.clone()),
            store,
            worker,
            engine,
            notifications,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ActorQuery {
    actor: Option<String>,
}

impl ActorQuery {
    /// Requests act as an admin; the scraper's name is reserved.
    fn actor(&self) -> Result<Actor, Response> {
        match self.actor.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(name) if name.eq_ignore_ascii_case(Actor::Scraper.label()) => Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("actor name `{name}` is reserved") })),
            )
                .into_response()),
            Some(name) => Ok(Actor::Admin(name.to_string())),
            None => Ok(Actor::Admin("admin".to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    channel_id: Option<ChannelId>,
    limit: Option<usize>,
    actor: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/scheduler/enable", post(enable_handler))
        .route("/scheduler/disable", post(disable_handler))
        .route("/messages/pending-changes", get(pending_changes_handler))
        .route("/messages/process-pending", post(process_pending_handler))
        .route("/messages/{id}/approve", post(approve_handler))
        .route("/messages/{id}/reject", post(reject_handler))
        .route("/messages/{id}/process", post(process_handler))
        .route("/channels/{id}/counts", get(channel_counts_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: AppState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "worker": state.worker.snapshot(),
        "notifications": state.notifications.recent(RECENT_NOTIFICATIONS).await,
    }))
    .into_response()
}

async fn enable_handler(State(state): State<Arc<AppState>>) -> Response {
    toggle(&state, true)
}

async fn disable_handler(State(state): State<Arc<AppState>>) -> Response {
    toggle(&state, false)
}

fn toggle(state: &AppState, enabled: bool) -> Response {
    let previous = state.worker.set_enabled(enabled);
    if previous != enabled {
        info!(enabled, "scheduler switch flipped");
    }
    Json(json!({ "enabled": enabled, "previous": previous })).into_response()
}

async fn pending_changes_handler(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
    match state
        .store
        .list_messages_by_status(query.channel_id, MessageStatus::PendingChange, limit)
        .await
    {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => error_response(err.into()),
    }
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
    Query(query): Query<ActorQuery>,
) -> Response {
    let actor = match query.actor() {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    match state.detector.approve_change(id, actor).await {
        Ok(message) => Json(message).into_response(),
        Err(err) => error_response(err.into()),
    }
}

async fn reject_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
    Query(query): Query<ActorQuery>,
) -> Response {
    let actor = match query.actor() {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    match state.detector.reject_change(id, actor).await {
        Ok(message) => Json(message).into_response(),
        Err(err) => error_response(err.into()),
    }
}

/// Rich processing path. The body is an optional JSON object of operator
/// edits; an empty body processes the parsed text as-is.
async fn process_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
    Query(query): Query<ActorQuery>,
    body: Bytes,
) -> Response {
    let actor = match query.actor() {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    let edits = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<EntryEdits>(&body) {
            Ok(edits) => Some(edits),
            Err(err) => {
                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({ "error": format!("invalid edits: {err}") })),
                )
                    .into_response()
            }
        }
    };
    match state.engine.process_and_save(id, edits, actor).await {
        Ok(outcome) => Json(json!({
            "entry_id": outcome.entry_id,
            "created": outcome.created,
            "history": outcome.history,
            "created_games": outcome.created_games,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn process_pending_handler(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Response {
    let actor = match (ActorQuery { actor: query.actor }).actor() {
        Ok(actor) => actor,
        Err(resp) => return resp,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).max(1);
    match state.engine.process_pending(query.channel_id, limit, actor).await {
        Ok(run) => Json(run).into_response(),
        Err(err) => error_response(err),
    }
}

async fn channel_counts_handler(State(state): State<Arc<AppState>>, Path(id): Path<ChannelId>) -> Response {
    match state.store.get_channel(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(StoreError::NotFound { entity: "channel", id }.into()),
        Err(err) => return error_response(err.into()),
    }
    match state.store.count_messages_by_status(id).await {
        Ok(counts) => {
            let counts = counts
                .into_iter()
                .map(|(status, count)| (status.as_str(), count))
                .collect::<BTreeMap<_, _>>();
            Json(json!({ "channel_id": id, "counts": counts })).into_response()
        }
        Err(err) => error_response(err.into()),
    }
}

fn error_response(err: anyhow::Error) -> Response {
    let status = match err.chain().find_map(|e| e.downcast_ref::<StoreError>()) {
        Some(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Some(StoreError::IllegalTransition { .. }) | Some(StoreError::DuplicateKey { .. }) => StatusCode::CONFLICT,
        Some(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %format!("{err:#}"), "admin request failed");
    }
    (status, Json(json!({ "error": format!("{err:#}") }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use psac_core::{NewRawMessage, SourceChannel};
    use psac_parser::ProfileRegistry;
    use psac_storage::{ChannelStore, InMemoryStore, RawMessageStore};
    use serde_json::Value;
    use tower::ServiceExt;

    const LISTING: &str = "Игры:\n- Elden Ring\nЦена PS4: 1500\nРегион: Турция";

    struct Fixture {
        store: Arc<InMemoryStore>,
        worker: Arc<WorkerState>,
        router: Router,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let worker = Arc::new(WorkerState::default());
        let engine = Arc::new(ReconciliationEngine::new(store.clone(), Arc::new(ProfileRegistry::default())));
        let router = app(AppState::new(
            store.clone(),
            worker.clone(),
            engine,
            Arc::new(MemoryNotificationSink::new()),
        ));
        Fixture { store, worker, router }
    }

    async fn seed_message(store: &InMemoryStore, status: MessageStatus) -> (ChannelId, MessageId) {
        let channel = store
            .register_channel(SourceChannel {
                id: 0,
                external_id: "market".into(),
                name: "market".into(),
                is_active: true,
                profile: "default".into(),
                delay_secs: 0,
                bulk_limit: None,
                window_hours: None,
                last_scraped_at: None,
                last_scraped_external_id: None,
                last_swept_at: None,
            })
            .await
            .unwrap();
        let inserted = store
            .insert_messages(vec![NewRawMessage {
                channel_id: channel.id,
                external_id: 42,
                text: LISTING.into(),
                received_at: Utc::now(),
                content_hash: None,
                status,
                diff: None,
                previous_version_id: None,
            }])
            .await
            .unwrap();
        (channel.id, inserted[0].id)
    }

    fn request(method: &str, uri: &str, body: Body) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn status_reports_the_worker_snapshot() {
        let f = fixture();
        let resp = f
            .router
            .oneshot(request("GET", "/status", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["worker"]["phase"], "initializing");
        assert_eq!(body["worker"]["enabled"], true);
        assert_eq!(body["notifications"], Value::Array(vec![]));
    }

    #[tokio::test]
    async fn scheduler_switch_updates_shared_state() {
        let f = fixture();
        let resp = f
            .router
            .clone()
            .oneshot(request("POST", "/scheduler/disable", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["enabled"], false);
        assert_eq!(body["previous"], true);
        assert!(!f.worker.is_enabled());

        f.router
            .oneshot(request("POST", "/scheduler/enable", Body::empty()))
            .await
            .unwrap();
        assert!(f.worker.is_enabled());
    }

    #[tokio::test]
    async fn approving_twice_conflicts() {
        let f = fixture();
        let (_, id) = seed_message(&f.store, MessageStatus::PendingChange).await;

        let listed = f
            .router
            .clone()
            .oneshot(request("GET", "/messages/pending-changes", Body::empty()))
            .await
            .unwrap();
        assert_eq!(json_body(listed).await.as_array().map(Vec::len), Some(1));

        let uri = format!("/messages/{id}/approve?actor=alice");
        let first = f
            .router
            .clone()
            .oneshot(request("POST", &uri, Body::empty()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body = json_body(first).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["updated_by"], "alice");

        let second = f
            .router
            .oneshot(request("POST", &uri, Body::empty()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn operators_cannot_act_as_the_scraper() {
        let f = fixture();
        let (_, id) = seed_message(&f.store, MessageStatus::PendingChange).await;

        let resp = f
            .router
            .clone()
            .oneshot(request("POST", &format!("/messages/{id}/approve?actor=Scraper"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let message = f.store.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::PendingChange);

        let resp = f
            .router
            .oneshot(request("POST", &format!("/messages/{id}/reject"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let message = f.store.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.updated_by, Some(Actor::Admin("admin".into())));
    }

    #[tokio::test]
    async fn unknown_message_is_not_found() {
        let f = fixture();
        let resp = f
            .router
            .oneshot(request("POST", "/messages/999/reject", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn process_applies_operator_edits() {
        let f = fixture();
        let (channel_id, id) = seed_message(&f.store, MessageStatus::Pending).await;

        let resp = f
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/messages/{id}/process?actor=alice"),
                Body::from(r#"{"price_ps4": 999}"#),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["created"], true);

        let entries = f.store.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].price_ps4, Some(999.0));
        assert_eq!(entries[0].region.as_deref(), Some("Турция"));

        let counts = f
            .router
            .oneshot(request("GET", &format!("/channels/{channel_id}/counts"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(json_body(counts).await["counts"]["processed"], 1);
    }

    #[tokio::test]
    async fn malformed_edits_are_rejected() {
        let f = fixture();
        let (_, id) = seed_message(&f.store, MessageStatus::Pending).await;
        let resp = f
            .router
            .oneshot(request(
                "POST",
                &format!("/messages/{id}/process"),
                Body::from(r#"{"price_ps4": "lots"}"#),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(f.store.entries().await.is_empty());
    }

    #[tokio::test]
    async fn counts_for_unknown_channel_is_not_found() {
        let f = fixture();
        let resp = f
            .router
            .oneshot(request("GET", "/channels/7/counts", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
