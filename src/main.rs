mod collaborators;
mod config;
mod host_api;
mod http;
mod media;
mod metrics;
mod models;
mod orchestrator;
mod parser;
mod reply;
mod signature;
mod state_store;
mod templates;
mod webhook;
mod workflow;

use axum::{
    Json, Router,
    extract::{FromRef, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use collaborators::SettingsSource;
use config::AppConfig;
use eyre::{WrapErr, eyre};
use host_api::HostApiClient;
use media::{ChatMediaClient, MediaIngest};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::ApiError;
use orchestrator::{Collaborators, UploadOrchestrator, UploadSettings};
use parser::ParserOptions;
use reply::ReplyDispatcher;
use serde_json::json;
use signature::{SignatureState, SignatureVerifier, UnsignedPolicy, require_signature};
use state_store::{ConversationStateStore, InMemoryStateStore, RedisStateStore};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use workflow::{InMemoryWorkflowTracker, WorkflowRun, WorkflowTracker};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "intake.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = AppConfig::from_env();
    let host = Arc::new(
        HostApiClient::from_config(&config)
            .ok_or_else(|| eyre!("HOST_API_URL must point at the host platform API"))?,
    );
    let settings: Arc<dyn SettingsSource> = host.clone();
    let messenger = Arc::new(ReplyDispatcher::new(
        &config.api_base,
        &config.access_token,
        settings,
        config.reply_timeout,
        config.connect_timeout,
    ));
    let media = Arc::new(MediaIngest::new(
        ChatMediaClient::new(
            &config.data_api_base,
            &config.access_token,
            config.scratch_dir.clone(),
            config.media_timeout,
            config.connect_timeout,
        ),
        host.clone(),
    ));
    let store: Arc<dyn ConversationStateStore> = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).wrap_err("invalid REDIS_URL")?;
            info!(target = "intake.store", "pending uploads kept in redis");
            Arc::new(RedisStateStore::new(client))
        }
        None => {
            let store = InMemoryStateStore::new();
            store.spawn_sweeper(SWEEP_INTERVAL);
            info!(target = "intake.store", "pending uploads kept in memory");
            Arc::new(store)
        }
    };
    // A pending upload cannot resume once its TTL lapses, so neither can its run.
    let runs = InMemoryWorkflowTracker::with_retention(config.workflow_retention, config.pending_ttl);
    runs.spawn_sweeper(SWEEP_INTERVAL);
    let tracker: Arc<dyn WorkflowTracker> = Arc::new(runs);

    let orchestrator = UploadOrchestrator::new(
        Collaborators {
            store,
            tracker,
            media,
            messenger,
            commerce: host.clone(),
            feed: host.clone(),
            identity: host,
        },
        UploadSettings {
            pending_ttl: config.pending_ttl,
            parser: ParserOptions {
                default_currency: config.default_currency,
                reject_unknown_lines: config.reject_unknown_lines,
            },
            labels: config.field_labels.clone(),
            broadcast_listings: config.broadcast_listings,
        },
    );

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    let unsigned = if config.allow_unsigned {
        UnsignedPolicy::Accept
    } else {
        UnsignedPolicy::Reject
    };
    let signature = SignatureState {
        verifier: SignatureVerifier::new(config.channel_secret.as_deref(), unsigned),
        body_limit: config.body_limit,
    };
    let state = AppState {
        orchestrator,
        prometheus_handle,
        metrics_key: config.metrics_key.clone(),
        admin_key: config.admin_key.clone(),
    };
    let app = build_router(state, signature, config.body_limit);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "intake.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    orchestrator: UploadOrchestrator,
    prometheus_handle: PrometheusHandle,
    metrics_key: Option<String>,
    admin_key: Option<String>,
}

impl FromRef<AppState> for UploadOrchestrator {
    fn from_ref(state: &AppState) -> Self {
        state.orchestrator.clone()
    }
}

fn build_router(state: AppState, signature: SignatureState, body_limit: usize) -> Router {
    let webhook = Router::new()
        .route("/webhook", post(webhook::receive))
        .route_layer(middleware::from_fn_with_state(signature, require_signature));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/workflows/{id}", get(get_workflow))
        .merge(webhook)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "groupbuy-intake",
    }))
}

fn presented_key<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key
        && presented_key(&headers, "X-Metrics-Key") != secret
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Workflow run lookup for operators.
///
/// - Method: `GET`
/// - Path: `/workflows/{id}`
/// - Auth: `X-Admin-Key: <key>` when `ADMIN_KEY` is set
async fn get_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<WorkflowRun>, AppError> {
    crate::metrics::inc_requests("/workflows/{id}");
    if let Some(secret) = &state.admin_key
        && presented_key(&headers, "X-Admin-Key") != secret
    {
        return Err(AppError::Unauthorized);
    }
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::InvalidId);
    };
    state
        .orchestrator
        .workflows()
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound)
}

#[derive(Debug)]
enum AppError {
    Unauthorized,
    InvalidId,
    NotFound,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::InvalidId => (StatusCode::BAD_REQUEST, "invalid_workflow_id"),
            AppError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        };
        let payload = ApiError {
            error: code.to_string(),
            detail: None,
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeCommerce, FakeFeed, FakeIdentity};
    use crate::media::{MediaError, MediaSource};
    use crate::reply::recording::RecordingMessenger;
    use crate::signature::{SIGNATURE_HEADER, sign};
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    const SECRET: &str = "channel-secret";

    struct StubMedia;

    #[async_trait]
    impl MediaSource for StubMedia {
        async fn ingest(&self, media_id: &str) -> Result<String, MediaError> {
            Ok(format!("media/{media_id}"))
        }
    }

    struct TestApp {
        router: Router,
        commerce: Arc<FakeCommerce>,
        messenger: Arc<RecordingMessenger>,
        orchestrator: UploadOrchestrator,
    }

    fn app(admin_key: Option<&str>) -> TestApp {
        let commerce = Arc::new(FakeCommerce::default());
        let messenger = Arc::new(RecordingMessenger::default());
        let orchestrator = UploadOrchestrator::new(
            Collaborators {
                store: Arc::new(InMemoryStateStore::new()),
                tracker: Arc::new(InMemoryWorkflowTracker::new()),
                media: Arc::new(StubMedia),
                messenger: messenger.clone(),
                commerce: commerce.clone(),
                feed: Arc::new(FakeFeed::default()),
                identity: Arc::new(FakeIdentity::seller("u1", "acct-1")),
            },
            UploadSettings::default(),
        );
        let state = AppState {
            orchestrator: orchestrator.clone(),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
            metrics_key: None,
            admin_key: admin_key.map(str::to_string),
        };
        let signature = SignatureState {
            verifier: SignatureVerifier::new(Some(SECRET), UnsignedPolicy::Reject),
            body_limit: 64 * 1024,
        };
        TestApp {
            router: build_router(state, signature, 64 * 1024),
            commerce,
            messenger,
            orchestrator,
        }
    }

    fn webhook_request(body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("Content-Type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn events(events: serde_json::Value) -> String {
        json!({ "destination": "bot", "events": events }).to_string()
    }

    #[tokio::test]
    async fn signed_delivery_runs_the_upload() {
        let test = app(None);
        let body = events(json!([
            {
                "type": "message",
                "replyToken": "r1",
                "source": {"type": "user", "userId": "u1"},
                "message": {"type": "image", "id": "m1"}
            },
            {
                "type": "message",
                "replyToken": "r2",
                "source": {"type": "user", "userId": "u1"},
                "message": {"type": "text", "id": "t1", "text": "Keychain\n台幣：350\n數量：20"}
            }
        ]));
        let response = test
            .router
            .oneshot(webhook_request(&body, Some(sign(SECRET, body.as_bytes()))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({"success": true, "processed": 2})
        );

        let created = test.commerce.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0.media_ref.as_deref(), Some("media/m1"));
        assert_eq!(created[0].0.price_minor_units, 35_000);
    }

    #[tokio::test]
    async fn bad_or_missing_signature_is_rejected_without_side_effects() {
        let test = app(None);
        let body = events(json!([{
            "type": "message",
            "replyToken": "r1",
            "source": {"userId": "u1"},
            "message": {"type": "text", "text": "Keychain\n台幣：350\n數量：20"}
        }]));
        let forged = sign("other-secret", body.as_bytes());
        let response = test
            .router
            .clone()
            .oneshot(webhook_request(&body, Some(forged)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "invalid_signature");

        let response = test
            .router
            .oneshot(webhook_request(&body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(test.commerce.created.lock().unwrap().is_empty());
        assert!(test.messenger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let test = app(None);
        let body = "{not json";
        let response = test
            .router
            .oneshot(webhook_request(body, Some(sign(SECRET, body.as_bytes()))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unsupported_events_are_not_counted() {
        let test = app(None);
        let body = events(json!([
            {"type": "postback", "source": {"userId": "u1"}},
            {"type": "message", "source": {}, "message": {"type": "text", "text": "hi"}},
            {"type": "message", "replyToken": "r1", "source": {"userId": "u1"}, "message": {"type": "sticker", "id": "s1"}}
        ]));
        let response = test
            .router
            .oneshot(webhook_request(&body, Some(sign(SECRET, body.as_bytes()))))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["processed"], 1);
        assert!(test.messenger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn workflow_lookup_requires_admin_key() {
        let test = app(Some("admin"));
        let Ok(orchestrator::Handled::AwaitingText {
            workflow_id: Some(run),
            ..
        }) = test.orchestrator.handle_image("u1", "m1", Some("r1")).await
        else {
            panic!("expected pending upload");
        };

        let request = |key: Option<&str>, id: String| {
            let mut builder = Request::builder().uri(format!("/workflows/{id}"));
            if let Some(key) = key {
                builder = builder.header("X-Admin-Key", key);
            }
            builder.body(Body::empty()).unwrap()
        };

        let response = test
            .router
            .clone()
            .oneshot(request(None, run.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = test
            .router
            .clone()
            .oneshot(request(Some("admin"), run.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["type"], "product_upload");
        assert_eq!(body["outcome"], "in_progress");
        assert_eq!(body["steps"][2]["name"], "prompt-for-text");

        let response = test
            .router
            .oneshot(request(Some("admin"), "not-a-uuid".into()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_is_open() {
        let response = app(None)
            .router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }
}
