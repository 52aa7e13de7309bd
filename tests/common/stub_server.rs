//! Local HTTP server playing both the upstream API and the webhook receivers.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// Webhook bodies received so far, keyed by hook name.
#[derive(Clone, Default)]
pub struct WebhookInbox(Arc<Mutex<Vec<(String, Value)>>>);

impl WebhookInbox {
    pub fn received(&self) -> Vec<(String, Value)> {
        self.0.lock().unwrap().clone()
    }

    pub fn received_by(&self, hook: &str) -> Vec<Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == hook)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[derive(Clone)]
struct StubState {
    episodes: Arc<Mutex<HashMap<String, i64>>>,
    inbox: WebhookInbox,
}

/// Routes:
/// - `GET /anime/{id}` answers `{"nextAiringEpisode": {"episode": n}}` or 404
/// - `GET /busy` answers 429 with `Retry-After: 7`
/// - `GET /flaky` answers 503
/// - `GET /garbled` answers 200 with a non-JSON body
/// - `POST /hooks/{name}` stores the body; `forbidden` answers 403,
///   `overloaded` answers 503, anything else 204
pub struct StubServer {
    pub base_url: String,
    pub port: u16,
    pub inbox: WebhookInbox,
    episodes: Arc<Mutex<HashMap<String, i64>>>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl StubServer {
    pub async fn spawn() -> Self {
        let state = StubState {
            episodes: Arc::new(Mutex::new(HashMap::new())),
            inbox: WebhookInbox::default(),
        };

        let app = Router::new()
            .route("/anime/{id}", get(get_anime))
            .route("/busy", get(busy))
            .route("/flaky", get(flaky))
            .route("/garbled", get(garbled))
            .route("/hooks/{name}", post(receive_hook))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Stub server failed");
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            port,
            inbox: state.inbox,
            episodes: state.episodes,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn set_episode(&self, id: &str, episode: i64) {
        self.episodes
            .lock()
            .unwrap()
            .insert(id.to_string(), episode);
    }

    pub fn remove(&self, id: &str) {
        self.episodes.lock().unwrap().remove(id);
    }

    pub fn hook_url(&self, name: &str) -> String {
        format!("{}/hooks/{}", self.base_url, name)
    }
}

async fn get_anime(State(state): State<StubState>, Path(id): Path<String>) -> Response {
    match state.episodes.lock().unwrap().get(&id) {
        Some(episode) => Json(json!({
            "id": id,
            "nextAiringEpisode": { "episode": episode },
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn busy() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "7")]).into_response()
}

async fn flaky() -> Response {
    StatusCode::SERVICE_UNAVAILABLE.into_response()
}

async fn garbled() -> Response {
    (StatusCode::OK, "<html>maintenance</html>").into_response()
}

async fn receive_hook(
    State(state): State<StubState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.inbox.0.lock().unwrap().push((name.clone(), body));
    match name.as_str() {
        "forbidden" => StatusCode::FORBIDDEN,
        "overloaded" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::NO_CONTENT,
    }
}
