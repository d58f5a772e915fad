pub mod login;
pub mod scene;
pub mod store;
pub mod templates;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Form, Json, Router};
use cablebeach_config::Config;
use cablebeach_contracts::{ChatEvent, ChatSource, ChatType, ErrorBody, ErrorResponse, Vector3};
use cablebeach_kernel::{
    ChatConfig, ChatEngine, ChatListener, ChatRegion, Clock, LoginState, SystemClock,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::login::{LoginFlow, LoginRequest, LoginSettings};
use crate::scene::{JoinRequest, Region, SceneRegistry};
use crate::store::StoreBackend;
use crate::templates::{
    login_success_vars, login_vars, render_or_fallback, FileTemplates, TemplateRenderer,
};
use crate::transport::{CapabilityTransport, HttpDiscovery, HttpTransport, ServiceDiscovery};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let (discovery, transport) = http_transports(&cfg)?;
    let state = AppState::new(cfg, discovery, transport.clone(), Arc::new(SystemClock))?;
    let login = Arc::clone(&state.login);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = login.purge_expired() + transport.purge_expired();
            if purged > 0 {
                debug!(purged, "swept expired login state");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

fn http_transports(cfg: &Config) -> Result<(Arc<HttpDiscovery>, Arc<HttpTransport>), String> {
    let seed_timeout = Duration::from_millis(cfg.login.seed_cap_timeout_ms);
    let transport = HttpTransport::new(
        &cfg.login.oauth_consumer_key,
        &cfg.login.oauth_consumer_secret,
        seed_timeout,
        Duration::from_millis(cfg.login.oauth_timeout_ms),
        Arc::new(SystemClock),
    )?;
    let discovery = HttpDiscovery::new(seed_timeout)?;
    Ok((Arc::new(discovery), Arc::new(transport)))
}

/// Router over caller-supplied discovery and capability transports.
pub async fn build_app_with(
    cfg: Config,
    discovery: Arc<dyn ServiceDiscovery>,
    transport: Arc<dyn CapabilityTransport>,
) -> Result<Router, String> {
    let state = AppState::new(cfg, discovery, transport, Arc::new(SystemClock))?;
    Ok(router(state))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/login", get(login_page).post(login_submit))
        .route("/login/oauth_callback", get(oauth_callback))
        .route("/login/{session_id}", get(claim_login))
        .route("/v1/regions/{region}/presences", post(join_region))
        .route(
            "/v1/regions/{region}/presences/{agent_id}",
            delete(leave_region),
        )
        .route("/v1/chat", post(chat))
        .route("/v1/chat/broadcast", post(chat_broadcast))
        .route("/v1/presences/{agent_id}/messages", get(messages))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    login: Arc<LoginFlow>,
    scene: Arc<SceneRegistry>,
    chat: ChatEngine,
    templates: Arc<dyn TemplateRenderer>,
}

impl AppState {
    fn new(
        cfg: Config,
        discovery: Arc<dyn ServiceDiscovery>,
        transport: Arc<dyn CapabilityTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, String> {
        let store = StoreBackend::open(&cfg.store)?;
        let login = LoginFlow::new(
            LoginSettings::from_config(&cfg),
            Arc::new(Mutex::new(store)),
            discovery,
            transport,
            clock,
        );
        let chat = ChatEngine::new(ChatConfig {
            whisper_distance: cfg.chat.whisper_distance,
            say_distance: cfg.chat.say_distance,
            shout_distance: cfg.chat.shout_distance,
        });
        Ok(Self {
            login: Arc::new(login),
            scene: Arc::new(SceneRegistry::from_config(&cfg.scene)),
            chat,
            templates: Arc::new(FileTemplates),
            cfg: Arc::new(cfg),
        })
    }

    async fn render_login(&self, message: Option<&str>, error: Option<&str>) -> Html<String> {
        Html(
            render_or_fallback(
                self.templates.as_ref(),
                &self.cfg.templates.login_path,
                &login_vars(message, error),
            )
            .await,
        )
    }

    async fn render_state(&self, state: LoginState) -> Response {
        match state {
            LoginState::AwaitingOAuthCallback { redirect, .. } => {
                Redirect::to(&redirect).into_response()
            }
            LoginState::Completed {
                identity,
                session_id,
            } => {
                let login_uri = self.login.settings().login_uri(session_id);
                Html(
                    render_or_fallback(
                        self.templates.as_ref(),
                        &self.cfg.templates.login_success_path,
                        &login_success_vars(&identity, &login_uri),
                    )
                    .await,
                )
                .into_response()
            }
            LoginState::Failed { reason } => self
                .render_login(None, Some(&reason))
                .await
                .into_response(),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
                details: None,
            },
        }),
    )
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn login_page(State(state): State<AppState>) -> Html<String> {
    state.render_login(None, None).await
}

async fn login_submit(
    State(state): State<AppState>,
    Form(request): Form<LoginRequest>,
) -> Response {
    let outcome = state.login.start(request).await;
    state.render_state(outcome).await
}

#[derive(Debug, Deserialize)]
struct OAuthCallback {
    #[serde(default)]
    oauth_token: Option<String>,
    #[serde(default)]
    oauth_verifier: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(callback): Query<OAuthCallback>,
) -> Response {
    let Some(token) = callback.oauth_token.filter(|t| !t.is_empty()) else {
        return state
            .render_login(None, Some("Missing oauth_token in callback"))
            .await
            .into_response();
    };
    let outcome = state
        .login
        .resume(&token, callback.oauth_verifier.as_deref())
        .await;
    state.render_state(outcome).await
}

/// What the viewer receives when it picks up a completed login.
#[derive(Debug, Serialize)]
struct LoginClaim {
    agent_id: Uuid,
    first_name: String,
    last_name: String,
    session_id: Uuid,
    secure_session_id: Uuid,
    home_region_x: u32,
    home_region_y: u32,
}

async fn claim_login(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<LoginClaim>, ApiError> {
    let not_found = || api_error(StatusCode::NOT_FOUND, "not_found", "no pending login");
    let session_id = Uuid::parse_str(&session_id).map_err(|_| not_found())?;
    let profile = state.login.claim(session_id).ok_or_else(not_found)?;
    let agent = profile.current_agent.ok_or_else(not_found)?;
    Ok(Json(LoginClaim {
        agent_id: profile.id,
        first_name: profile.first_name,
        last_name: profile.last_name,
        session_id: agent.session_id,
        secure_session_id: agent.secure_session_id,
        home_region_x: profile.home_region_x,
        home_region_y: profile.home_region_y,
    }))
}

fn find_region<'a>(
    scene: &'a SceneRegistry,
    name: &str,
) -> Result<&'a Region, ApiError> {
    scene.region(name).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("unknown region {name}"),
        )
    })
}

async fn join_region(
    State(state): State<AppState>,
    Path(region): Path<String>,
    Json(request): Json<JoinRequest>,
) -> Result<StatusCode, ApiError> {
    let target = find_region(&state.scene, &region)?;
    debug!(region = %region, agent_id = %request.agent_id, "presence joined");
    target.join(request);
    Ok(StatusCode::NO_CONTENT)
}

async fn leave_region(
    State(state): State<AppState>,
    Path((region, agent_id)): Path<(String, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let target = find_region(&state.scene, &region)?;
    if target.leave(agent_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{agent_id} is not present in {region}"),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    region: String,
    #[serde(default)]
    channel: i32,
    message: String,
    chat_type: ChatType,
    source: ChatSource,
    #[serde(default)]
    sender_id: Option<Uuid>,
    #[serde(default)]
    sender_name: String,
    #[serde(default)]
    position: Vector3,
    #[serde(default)]
    owner_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct ChatOutcome {
    delivered: usize,
}

/// Resolves the speaker. Agent chat takes name and position from the
/// sender's presence; `None` means the sender is not in the region.
fn chat_event(region: &Region, request: ChatRequest) -> Option<ChatEvent> {
    let (sender_name, position) = match request.source {
        ChatSource::Agent => {
            let presence = request.sender_id.and_then(|id| region.presence(id));
            let Some(presence) = presence else {
                error!(
                    region = %region.name(),
                    sender_id = ?request.sender_id,
                    "chat from agent that is not present, dropping"
                );
                return None;
            };
            (presence.name().to_string(), presence.position())
        }
        ChatSource::Object => (request.sender_name, request.position),
    };
    Some(ChatEvent {
        channel: request.channel,
        message: request.message,
        chat_type: request.chat_type,
        source: request.source,
        sender_id: request.sender_id,
        sender_name,
        position,
        origin: region.location(),
        owner_id: request.owner_id,
    })
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatOutcome>, ApiError> {
    let region = find_region(&state.scene, &request.region)?;
    let delivered = chat_event(region, request)
        .map(|event| state.chat.deliver(&event, state.scene.regions()))
        .unwrap_or(0);
    Ok(Json(ChatOutcome { delivered }))
}

async fn chat_broadcast(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatOutcome>, ApiError> {
    let region = find_region(&state.scene, &request.region)?;
    let delivered = chat_event(region, request)
        .map(|event| state.chat.broadcast(&event, std::slice::from_ref(region)))
        .unwrap_or(0);
    Ok(Json(ChatOutcome { delivered }))
}

async fn messages(
    State(state): State<AppState>,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let drained = state.scene.drain_messages(agent_id).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{agent_id} is not present in any region"),
        )
    })?;
    Ok(Json(json!({ "messages": drained })))
}
