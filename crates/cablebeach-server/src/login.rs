//! Login coordination: account lookup, service discovery and capability
//! negotiation across trusted seed capabilities and OAuth round trips.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cablebeach_config::Config;
use cablebeach_contracts::{services, AgentSession, Service, UserProfile};
use cablebeach_kernel::{
    apply_grant, build_auth_service_name, default_requirements, identity_to_uuid,
    is_identity_authorized, local_name_from_identity, negotiation, next_step, sha256_hex,
    trusted_requests, Clock, ExpiringCache, LoginState, NegotiationFailure, NextStep,
    PendingAuthorization, ServiceRequestsData,
};
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::store::StoreBackend;
use crate::transport::{CapabilityTransport, ServiceDiscovery};

const FORCED_LOGOUT_REASON: &str = "Logged in from another location";

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Invalid identity {0}")]
    InvalidIdentity(String),
    #[error("Identity {0} is not allowed to log in")]
    NotAuthorized(String),
    #[error("Failed to retrieve or create account information for {0}")]
    AccountUnavailable(String),
    #[error("Failed to contact required services for {0}")]
    ServicesUnavailable(String),
    #[error("Failed to fetch required capabilities: {0}")]
    Negotiation(NegotiationFailure),
    #[error("Failed to fetch required capabilities: {0}")]
    OAuthPreparation(String),
    #[error("Login request is unknown or has expired")]
    UnknownRequestToken,
    #[error("Failed to complete authorization with {service}: {reason}")]
    AccessToken { service: String, reason: String },
    #[error("user store error: {0}")]
    Store(String),
}

/// Form fields posted by the login page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    pub identity: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub auth_method: String,
    /// Filesystem service the user wants to bring along instead of ours.
    #[serde(default)]
    pub filesystem_service: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub hostname: String,
    pub public_url: String,
    pub asset_service_url: String,
    pub filesystem_service_url: String,
    pub default_home_x: u32,
    pub default_home_y: u32,
    pub denied_identity_prefixes: Vec<String>,
    pub service_cache_ttl: Duration,
    pub oauth_ttl: Duration,
    pub pending_login_ttl: Duration,
}

impl LoginSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            hostname: cfg.server.hostname.clone(),
            public_url: cfg.server.public_url.trim_end_matches('/').to_string(),
            asset_service_url: cfg.login.asset_service_url.clone(),
            filesystem_service_url: cfg.login.filesystem_service_url.clone(),
            default_home_x: cfg.login.default_home_x,
            default_home_y: cfg.login.default_home_y,
            denied_identity_prefixes: cfg.login.denied_identity_prefixes.clone(),
            service_cache_ttl: Duration::from_millis(cfg.login.service_cache_timeout_ms),
            oauth_ttl: Duration::from_millis(cfg.login.oauth_timeout_ms),
            pending_login_ttl: Duration::from_millis(cfg.login.pending_login_timeout_ms),
        }
    }

    pub fn login_uri(&self, session_id: Uuid) -> String {
        format!("{}/login/{session_id}", self.public_url)
    }

    pub fn callback_uri(&self) -> String {
        format!("{}/login/oauth_callback", self.public_url)
    }
}

/// A discovered service depends on how it was looked up, not only where.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DiscoveryKey {
    location: String,
    service_type: String,
    trusted: bool,
    can_override: bool,
}

impl DiscoveryKey {
    fn new(location: &str, service_type: &str, trusted: bool, can_override: bool) -> Self {
        Self {
            location: location.to_string(),
            service_type: service_type.to_string(),
            trusted,
            can_override,
        }
    }
}

pub struct LoginFlow {
    settings: LoginSettings,
    store: Arc<Mutex<StoreBackend>>,
    discovery: Arc<dyn ServiceDiscovery>,
    transport: Arc<dyn CapabilityTransport>,
    service_cache: ExpiringCache<DiscoveryKey, Service>,
    pending_authorizations: ExpiringCache<String, PendingAuthorization>,
    pending_logins: ExpiringCache<Uuid, UserProfile>,
}

impl LoginFlow {
    pub fn new(
        settings: LoginSettings,
        store: Arc<Mutex<StoreBackend>>,
        discovery: Arc<dyn ServiceDiscovery>,
        transport: Arc<dyn CapabilityTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            store,
            discovery,
            transport,
            service_cache: ExpiringCache::new(Arc::clone(&clock)),
            pending_authorizations: ExpiringCache::new(Arc::clone(&clock)),
            pending_logins: ExpiringCache::new(clock),
        }
    }

    pub fn settings(&self) -> &LoginSettings {
        &self.settings
    }

    /// Handles a login form submission. Never fails outright: failures come
    /// back as `LoginState::Failed`.
    pub async fn start(&self, request: LoginRequest) -> LoginState {
        let identity = request.identity.clone();
        let state = self.try_start(request).await.unwrap_or_else(fail);
        log_outcome(&identity, &state);
        state
    }

    /// Handles the OAuth callback for a previously issued request token.
    pub async fn resume(&self, token: &str, verifier: Option<&str>) -> LoginState {
        let state = self.try_resume(token, verifier).await.unwrap_or_else(fail);
        log_outcome(token, &state);
        state
    }

    /// Hands out the profile for a completed login exactly once.
    pub fn claim(&self, session_id: Uuid) -> Option<UserProfile> {
        self.pending_logins.take(&session_id)
    }

    pub fn purge_expired(&self) -> usize {
        self.service_cache.purge_expired()
            + self.pending_authorizations.purge_expired()
            + self.pending_logins.purge_expired()
    }

    async fn try_start(&self, request: LoginRequest) -> Result<LoginState, LoginError> {
        let identity = Url::parse(request.identity.trim())
            .map_err(|_| LoginError::InvalidIdentity(request.identity.clone()))?;
        if !is_identity_authorized(identity.as_str(), &self.settings.denied_identity_prefixes) {
            return Err(LoginError::NotAuthorized(identity.to_string()));
        }

        let profile = self.get_or_create_user(&identity, &request).await?;
        let services = self
            .discover_services(request.filesystem_service.as_deref())
            .await
            .ok_or_else(|| LoginError::ServicesUnavailable(identity.to_string()))?;

        let mut data = ServiceRequestsData::new(
            identity.as_str(),
            profile,
            default_requirements(),
            services,
            request.auth_method,
        );
        debug!(
            identity = %data.user_identity,
            state = "resolving_trusted",
            "login state"
        );
        self.resolve_trusted(&mut data).await;

        let step = next_step(&data);
        self.advance(data, step).await
    }

    async fn try_resume(
        &self,
        token: &str,
        verifier: Option<&str>,
    ) -> Result<LoginState, LoginError> {
        let pending = self
            .pending_authorizations
            .take(&token.to_string())
            .ok_or(LoginError::UnknownRequestToken)?;

        let granted = self
            .transport
            .exchange_access_token(&pending.descriptor, token, verifier)
            .await
            .map_err(|reason| {
                error!(service = %pending.service, error = %reason, "access token exchange failed");
                LoginError::AccessToken {
                    service: pending.service.clone(),
                    reason,
                }
            })?;

        let (data, step) = negotiation::resume(pending, &granted);
        self.advance(data, step).await
    }

    async fn advance(
        &self,
        data: ServiceRequestsData,
        step: NextStep,
    ) -> Result<LoginState, LoginError> {
        match step {
            NextStep::Complete => self.complete(data).await,
            NextStep::Authorize(plan) => {
                debug!(
                    identity = %data.user_identity,
                    state = "resolving_untrusted",
                    service = %plan.service,
                    "login state"
                );
                info!(
                    count = plan.capabilities.len(),
                    service = %plan.descriptor,
                    "requesting capabilities through oauth"
                );
                let redirect = self
                    .transport
                    .prepare_authorization(
                        &plan.descriptor,
                        &self.settings.callback_uri(),
                        &plan.extra,
                    )
                    .await
                    .map_err(|e| {
                        error!(
                            service = %plan.service,
                            error = %e,
                            "failed to prepare oauth request"
                        );
                        LoginError::OAuthPreparation(e)
                    })?;
                let token = redirect.request_token.clone();
                self.pending_authorizations.insert(
                    token.clone(),
                    plan.into_pending(data),
                    self.settings.oauth_ttl,
                );
                Ok(LoginState::AwaitingOAuthCallback {
                    token,
                    redirect: redirect.location,
                })
            }
            NextStep::Fail(failure) => {
                if let NegotiationFailure::IncompleteService {
                    service,
                    xrd_document,
                } = &failure
                {
                    self.forget_service(xrd_document, service);
                }
                error!(
                    identity = %data.user_identity,
                    error = %failure,
                    "capability negotiation failed"
                );
                Err(LoginError::Negotiation(failure))
            }
        }
    }

    async fn resolve_trusted(&self, data: &mut ServiceRequestsData) {
        for request in trusted_requests(data) {
            info!(
                count = request.capabilities.len(),
                seed = %request.seed_capability,
                "requesting capabilities from trusted service"
            );
            match self
                .transport
                .request_capabilities(
                    &request.seed_capability,
                    &data.user_identity,
                    &request.capabilities,
                )
                .await
            {
                Ok(granted) => {
                    let filled = apply_grant(data, &request.service, &granted);
                    info!(service = %request.service, filled, "fetched capabilities from seed");
                }
                Err(e) => error!(
                    seed = %request.seed_capability,
                    error = %e,
                    "failed to fetch capabilities from seed"
                ),
            }
        }
    }

    async fn discover_services(
        &self,
        requested_filesystem: Option<&str>,
    ) -> Option<BTreeMap<String, Service>> {
        let mut filesystem = None;
        if let Some(location) = requested_filesystem.map(str::trim).filter(|s| !s.is_empty()) {
            filesystem = self
                .discover(location, services::FILESYSTEM, false, false)
                .await;
            if filesystem.is_none() {
                warn!(location, "falling back to the default filesystem service");
            }
        }
        if filesystem.is_none() {
            filesystem = self
                .discover(
                    &self.settings.filesystem_service_url,
                    services::FILESYSTEM,
                    true,
                    true,
                )
                .await;
        }
        let filesystem = filesystem?;
        let assets = self
            .discover(&self.settings.asset_service_url, services::ASSETS, true, false)
            .await?;

        let mut found = BTreeMap::new();
        found.insert(services::ASSETS.to_string(), assets);
        found.insert(services::FILESYSTEM.to_string(), filesystem);
        Some(found)
    }

    async fn discover(
        &self,
        location: &str,
        service_type: &str,
        trusted: bool,
        can_override: bool,
    ) -> Option<Service> {
        let key = DiscoveryKey::new(location, service_type, trusted, can_override);
        if let Some(service) = self.service_cache.get(&key) {
            return Some(service);
        }
        match self
            .discovery
            .discover(location, service_type, trusted, can_override)
            .await
        {
            Ok(service) => {
                info!(service_type, %service, "discovered service");
                self.service_cache
                    .insert(key, service.clone(), self.settings.service_cache_ttl);
                Some(service)
            }
            Err(e) => {
                error!(location, service_type, error = %e, "service discovery failed");
                None
            }
        }
    }

    fn forget_service(&self, location: &str, service_type: &str) {
        for trusted in [true, false] {
            for can_override in [true, false] {
                self.service_cache.remove(&DiscoveryKey::new(
                    location,
                    service_type,
                    trusted,
                    can_override,
                ));
            }
        }
    }

    async fn get_or_create_user(
        &self,
        identity: &Url,
        request: &LoginRequest,
    ) -> Result<UserProfile, LoginError> {
        let unavailable = |e: String| {
            error!(identity = %identity, error = %e, "user store failure");
            LoginError::AccountUnavailable(identity.to_string())
        };
        let mut store = self.store.lock().await;

        let mut first_name = non_empty(request.first_name.as_deref());
        let mut last_name = non_empty(request.last_name.as_deref());

        if let Some((first, last)) = local_name_from_identity(identity, &self.settings.hostname) {
            if let Some(profile) = store.get_profile_by_name(&first, &last).map_err(unavailable)? {
                return Ok(profile);
            }
            first_name = first;
            last_name = last;
        }

        let agent_id = identity_to_uuid(identity.as_str());
        if let Some(profile) = store.get_profile(agent_id).map_err(unavailable)? {
            return Ok(profile);
        }

        let (service_first, service_last) =
            build_auth_service_name(identity.as_str(), &request.auth_method);
        if first_name.is_empty() || last_name.is_empty() {
            first_name = service_first.clone();
            last_name = service_last.clone();
        }

        let mut profile = UserProfile {
            id: agent_id,
            first_name,
            last_name,
            email: non_empty(request.email.as_deref()),
            password_hash: sha256_hex(Uuid::new_v4().simple().to_string().as_bytes()),
            home_region_x: self.settings.default_home_x,
            home_region_y: self.settings.default_home_y,
            created_at: Utc::now().to_rfc3339(),
            current_agent: None,
        };

        if !store.add_user(&profile).map_err(unavailable)? {
            warn!(
                name = %profile.name(),
                "account name taken, retrying with service-derived name"
            );
            profile.first_name = service_first;
            profile.last_name = service_last;
            if !store.add_user(&profile).map_err(unavailable)? {
                error!(identity = %identity, "failed to create user account");
                return Err(LoginError::AccountUnavailable(identity.to_string()));
            }
        }
        info!(identity = %identity, name = %profile.name(), "created user account");

        store
            .get_profile(agent_id)
            .map_err(unavailable)?
            .ok_or_else(|| LoginError::AccountUnavailable(identity.to_string()))
    }

    async fn complete(&self, data: ServiceRequestsData) -> Result<LoginState, LoginError> {
        let mut store = self.store.lock().await;
        let mut profile = store
            .get_profile(data.profile.id)
            .map_err(LoginError::Store)?
            .unwrap_or(data.profile);

        if let Some(previous) = profile.current_agent.as_ref().filter(|a| a.online) {
            warn!(
                name = %profile.name(),
                session_id = %previous.session_id,
                "logging out previous session"
            );
            self.pending_logins.remove(&previous.session_id);
            store
                .log_off(profile.id, FORCED_LOGOUT_REASON)
                .map_err(LoginError::Store)?;
        }

        let session = AgentSession {
            session_id: Uuid::new_v4(),
            secure_session_id: Uuid::new_v4(),
            online: true,
            login_at: Utc::now().to_rfc3339(),
            logout_reason: None,
        };
        store
            .save_agent(profile.id, &session)
            .map_err(LoginError::Store)?;
        drop(store);

        let session_id = session.session_id;
        profile.current_agent = Some(session);
        info!(name = %profile.name(), %session_id, "agent session created");
        self.pending_logins
            .insert(session_id, profile, self.settings.pending_login_ttl);

        Ok(LoginState::Completed {
            identity: data.user_identity,
            session_id,
        })
    }
}

fn fail(e: LoginError) -> LoginState {
    LoginState::Failed {
        reason: e.to_string(),
    }
}

fn log_outcome(subject: &str, state: &LoginState) {
    match state {
        LoginState::Failed { reason } => warn!(subject, reason = %reason, "login failed"),
        other => debug!(subject, state = other.name(), "login state"),
    }
}

fn non_empty(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}
