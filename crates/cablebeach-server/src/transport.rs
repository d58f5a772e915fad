//! Outbound calls to remote services: discovery documents, seed capability
//! requests and the OAuth 1.0 handshake.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cablebeach_contracts::{
    DiscoveryDocument, RequestCapabilitiesMessage, RequestCapabilitiesReplyMessage, Service,
};
use cablebeach_kernel::{Clock, ExpiringCache};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// Where to send the user to authorize a request token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRedirect {
    pub location: String,
    pub request_token: String,
}

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Fetches the discovery document at `location` and extracts the entry
    /// for `service_type`. Seed capabilities are only kept for trusted
    /// services.
    async fn discover(
        &self,
        location: &str,
        service_type: &str,
        trusted: bool,
        can_override: bool,
    ) -> Result<Service, String>;
}

#[async_trait]
pub trait CapabilityTransport: Send + Sync {
    async fn request_capabilities(
        &self,
        seed_capability: &str,
        identity: &str,
        capabilities: &[String],
    ) -> Result<BTreeMap<String, String>, String>;

    async fn prepare_authorization(
        &self,
        service: &Service,
        callback: &str,
        extra: &BTreeMap<String, String>,
    ) -> Result<AuthorizationRedirect, String>;

    /// Trades an authorized request token for the capabilities the remote
    /// service granted alongside the access token.
    async fn exchange_access_token(
        &self,
        service: &Service,
        request_token: &str,
        verifier: Option<&str>,
    ) -> Result<BTreeMap<String, String>, String>;
}

pub struct HttpDiscovery {
    client: Client,
}

impl HttpDiscovery {
    pub fn new(timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ServiceDiscovery for HttpDiscovery {
    async fn discover(
        &self,
        location: &str,
        service_type: &str,
        trusted: bool,
        can_override: bool,
    ) -> Result<Service, String> {
        let doc: DiscoveryDocument = self
            .client
            .get(location)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| format!("discovery request to {location} failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("discovery request to {location} failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("invalid discovery document at {location}: {e}"))?;
        service_from_document(&doc, location, service_type, trusted, can_override)
    }
}

pub fn service_from_document(
    doc: &DiscoveryDocument,
    location: &str,
    service_type: &str,
    trusted: bool,
    can_override: bool,
) -> Result<Service, String> {
    let entry = doc
        .services
        .iter()
        .find(|s| s.service_type == service_type)
        .ok_or_else(|| format!("{location} does not describe a {service_type} service"))?;
    Ok(Service {
        xrd_document: location.to_string(),
        seed_capability: if trusted {
            entry.seed_capability.clone()
        } else {
            None
        },
        oauth_request_token: entry.oauth_request_token.clone(),
        oauth_authorize_token: entry.oauth_authorize_token.clone(),
        oauth_get_access_token: entry.oauth_get_access_token.clone(),
        can_override,
    })
}

/// Seed capability and OAuth 1.0 client using the PLAINTEXT signature method.
pub struct HttpTransport {
    client: Client,
    consumer_key: String,
    consumer_secret: String,
    seed_timeout: Duration,
    oauth_timeout: Duration,
    token_secrets: ExpiringCache<String, String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    oauth_token: String,
    #[serde(default)]
    oauth_token_secret: String,
    #[serde(default)]
    cb_capabilities: Option<String>,
}

impl HttpTransport {
    pub fn new(
        consumer_key: &str,
        consumer_secret: &str,
        seed_timeout: Duration,
        oauth_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, String> {
        let client = Client::builder().build().map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            consumer_key: consumer_key.to_string(),
            consumer_secret: consumer_secret.to_string(),
            seed_timeout,
            oauth_timeout,
            token_secrets: ExpiringCache::new(clock),
        })
    }

    pub fn purge_expired(&self) -> usize {
        self.token_secrets.purge_expired()
    }

    fn oauth_params(&self, token_secret: &str) -> Vec<(String, String)> {
        vec![
            ("oauth_consumer_key".to_string(), self.consumer_key.clone()),
            ("oauth_signature_method".to_string(), "PLAINTEXT".to_string()),
            (
                "oauth_signature".to_string(),
                plaintext_signature(&self.consumer_secret, token_secret),
            ),
            (
                "oauth_timestamp".to_string(),
                Utc::now().timestamp().to_string(),
            ),
            (
                "oauth_nonce".to_string(),
                Uuid::new_v4().simple().to_string(),
            ),
            ("oauth_version".to_string(), "1.0".to_string()),
        ]
    }

    async fn post_token_request(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<TokenResponse, String> {
        let body = self
            .client
            .post(endpoint)
            .timeout(self.oauth_timeout)
            .form(params)
            .send()
            .await
            .map_err(|e| format!("oauth request to {endpoint} failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("oauth request to {endpoint} failed: {e}"))?
            .text()
            .await
            .map_err(|e| format!("oauth response from {endpoint} unreadable: {e}"))?;
        serde_urlencoded::from_str(&body)
            .map_err(|e| format!("malformed oauth response from {endpoint}: {e}"))
    }
}

#[async_trait]
impl CapabilityTransport for HttpTransport {
    async fn request_capabilities(
        &self,
        seed_capability: &str,
        identity: &str,
        capabilities: &[String],
    ) -> Result<BTreeMap<String, String>, String> {
        let message = RequestCapabilitiesMessage {
            identity: identity.to_string(),
            capabilities: capabilities.to_vec(),
        };
        let reply: RequestCapabilitiesReplyMessage = self
            .client
            .post(seed_capability)
            .timeout(self.seed_timeout)
            .json(&message)
            .send()
            .await
            .map_err(|e| format!("seed capability request failed: {e}"))?
            .error_for_status()
            .map_err(|e| format!("seed capability request failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("invalid seed capability reply: {e}"))?;
        Ok(reply.capabilities)
    }

    async fn prepare_authorization(
        &self,
        service: &Service,
        callback: &str,
        extra: &BTreeMap<String, String>,
    ) -> Result<AuthorizationRedirect, String> {
        let (Some(request_endpoint), Some(authorize_endpoint)) = (
            service.oauth_request_token.as_deref(),
            service.oauth_authorize_token.as_deref(),
        ) else {
            return Err(format!("{} has no oauth endpoints", service.xrd_document));
        };

        let mut params = self.oauth_params("");
        params.push(("oauth_callback".to_string(), callback.to_string()));
        params.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        let response = self.post_token_request(request_endpoint, &params).await?;
        debug!(endpoint = request_endpoint, "obtained oauth request token");
        self.token_secrets.insert(
            response.oauth_token.clone(),
            response.oauth_token_secret,
            self.oauth_timeout,
        );

        let mut location = Url::parse(authorize_endpoint)
            .map_err(|e| format!("invalid authorize endpoint {authorize_endpoint}: {e}"))?;
        location
            .query_pairs_mut()
            .append_pair("oauth_token", &response.oauth_token);
        Ok(AuthorizationRedirect {
            location: location.to_string(),
            request_token: response.oauth_token,
        })
    }

    async fn exchange_access_token(
        &self,
        service: &Service,
        request_token: &str,
        verifier: Option<&str>,
    ) -> Result<BTreeMap<String, String>, String> {
        let endpoint = service
            .oauth_get_access_token
            .as_deref()
            .ok_or_else(|| format!("{} has no access token endpoint", service.xrd_document))?;
        let token_secret = self
            .token_secrets
            .take(&request_token.to_string())
            .ok_or_else(|| format!("request token {request_token} is unknown or expired"))?;

        let mut params = self.oauth_params(&token_secret);
        params.push(("oauth_token".to_string(), request_token.to_string()));
        if let Some(verifier) = verifier {
            params.push(("oauth_verifier".to_string(), verifier.to_string()));
        }

        let response = self.post_token_request(endpoint, &params).await?;
        match response.cb_capabilities.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
                .map_err(|e| format!("invalid cb_capabilities from {endpoint}: {e}")),
            _ => {
                warn!(endpoint, "access token response carried no capabilities");
                Ok(BTreeMap::new())
            }
        }
    }
}

fn plaintext_signature(consumer_secret: &str, token_secret: &str) -> String {
    format!(
        "{}&{}",
        urlencoding::encode(consumer_secret),
        urlencoding::encode(token_secret)
    )
}
