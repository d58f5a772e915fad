//! Capability negotiation for a single login attempt.
//!
//! Each required service must grant a fixed set of capabilities before the
//! login completes. Trusted services hand all of theirs out in one seed
//! capability request; untrusted services go through an OAuth authorization
//! round trip, one service per round. The functions here only decide what
//! happens next. The caller performs the network calls and feeds the results
//! back in.

use std::collections::BTreeMap;
use std::fmt;

use cablebeach_contracts::{services, Service, UserProfile};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Required capability identifier -> granted capability URI, `None` until granted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityRequirements {
    caps: BTreeMap<String, Option<String>>,
}

impl CapabilityRequirements {
    pub fn new<I, S>(caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            caps: caps.into_iter().map(|c| (c.into(), None)).collect(),
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.caps.values().all(Option::is_some)
    }

    pub fn unresolved(&self) -> Vec<String> {
        self.caps
            .iter()
            .filter(|(_, uri)| uri.is_none())
            .map(|(cap, _)| cap.clone())
            .collect()
    }

    pub fn resolved(&self, cap: &str) -> Option<&str> {
        self.caps.get(cap).and_then(|uri| uri.as_deref())
    }

    /// Fills in granted capabilities. Grants for capabilities that were never
    /// required are ignored. Returns how many requirements were filled.
    pub fn merge(&mut self, granted: &BTreeMap<String, String>) -> usize {
        let mut filled = 0;
        for (cap, uri) in granted {
            if let Some(slot) = self.caps.get_mut(cap) {
                *slot = Some(uri.clone());
                filled += 1;
            }
        }
        filled
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<String>)> {
        self.caps.iter()
    }
}

/// Per-service capability requirements, kept in insertion order. The order
/// decides which service is negotiated first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceRequirements {
    entries: Vec<(String, CapabilityRequirements)>,
}

impl ServiceRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: impl Into<String>, requirements: CapabilityRequirements) {
        let service = service.into();
        match self.entries.iter_mut().find(|(id, _)| *id == service) {
            Some((_, existing)) => *existing = requirements,
            None => self.entries.push((service, requirements)),
        }
    }

    pub fn get(&self, service: &str) -> Option<&CapabilityRequirements> {
        self.entries
            .iter()
            .find(|(id, _)| id == service)
            .map(|(_, reqs)| reqs)
    }

    pub fn get_mut(&mut self, service: &str) -> Option<&mut CapabilityRequirements> {
        self.entries
            .iter_mut()
            .find(|(id, _)| id == service)
            .map(|(_, reqs)| reqs)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CapabilityRequirements)> {
        self.entries.iter().map(|(id, reqs)| (id.as_str(), reqs))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First service, in insertion order, still missing a capability.
    pub fn current_service(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, reqs)| !reqs.is_satisfied())
            .map(|(id, _)| id.as_str())
    }

    pub fn is_satisfied(&self) -> bool {
        self.current_service().is_none()
    }
}

/// Assets first, then filesystem.
pub fn default_requirements() -> ServiceRequirements {
    let mut requirements = ServiceRequirements::new();
    requirements.insert(
        services::ASSETS,
        CapabilityRequirements::new(services::ASSET_REQUIRED_CAPS.iter().copied()),
    );
    requirements.insert(
        services::FILESYSTEM,
        CapabilityRequirements::new(services::FILESYSTEM_REQUIRED_CAPS.iter().copied()),
    );
    requirements
}

/// Everything one in-flight login carries between requests.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequestsData {
    pub user_identity: String,
    pub profile: UserProfile,
    pub requirements: ServiceRequirements,
    pub services: BTreeMap<String, Service>,
    pub auth_method: String,
}

impl ServiceRequestsData {
    pub fn new(
        user_identity: impl Into<String>,
        profile: UserProfile,
        requirements: ServiceRequirements,
        services: BTreeMap<String, Service>,
        auth_method: impl Into<String>,
    ) -> Self {
        Self {
            user_identity: user_identity.into(),
            profile,
            requirements,
            services,
            auth_method: auth_method.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedRequest {
    pub service: String,
    pub seed_capability: String,
    pub capabilities: Vec<String>,
}

/// One seed request per unsatisfied requirement whose service is trusted.
pub fn trusted_requests(data: &ServiceRequestsData) -> Vec<SeedRequest> {
    debug!(
        requirements = data.requirements.len(),
        services = data.services.len(),
        "looking for trusted services"
    );

    let mut out = Vec::new();
    for (service_id, reqs) in data.requirements.iter() {
        if reqs.is_satisfied() {
            continue;
        }
        match data.services.get(service_id) {
            Some(service) => match &service.seed_capability {
                Some(seed) => out.push(SeedRequest {
                    service: service_id.to_string(),
                    seed_capability: seed.clone(),
                    capabilities: reqs.unresolved(),
                }),
                None => debug!(service = service_id, "skipping untrusted service"),
            },
            None => warn!(
                service = service_id,
                "no service discovered for service requirement"
            ),
        }
    }
    out
}

/// Records a seed capability reply against `service`.
pub fn apply_grant(
    data: &mut ServiceRequestsData,
    service: &str,
    granted: &BTreeMap<String, String>,
) -> usize {
    data.requirements
        .get_mut(service)
        .map(|reqs| reqs.merge(granted))
        .unwrap_or(0)
}

/// An OAuth round that should be started for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPlan {
    pub service: String,
    pub descriptor: Service,
    pub capabilities: Vec<String>,
    /// Extra parameters sent along with the request token request.
    pub extra: BTreeMap<String, String>,
}

impl AuthorizationPlan {
    pub fn into_pending(self, data: ServiceRequestsData) -> PendingAuthorization {
        PendingAuthorization {
            data,
            service: self.service,
            descriptor: self.descriptor,
        }
    }
}

/// Stored under the OAuth request token while the user is away authorizing.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAuthorization {
    pub data: ServiceRequestsData,
    pub service: String,
    pub descriptor: Service,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    MissingService { service: String },
    /// Untrusted service without a full set of OAuth endpoints. Its
    /// descriptor should not stay cached.
    IncompleteService {
        service: String,
        xrd_document: String,
    },
}

impl fmt::Display for NegotiationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationFailure::MissingService { service } => {
                write!(f, "no service discovered for service identifier {service}")
            }
            NegotiationFailure::IncompleteService { xrd_document, .. } => {
                write!(f, "incomplete service definition retrieved from {xrd_document}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    Complete,
    Authorize(AuthorizationPlan),
    Fail(NegotiationFailure),
}

pub fn next_step(data: &ServiceRequestsData) -> NextStep {
    let Some(service_id) = data.requirements.current_service() else {
        info!(
            identity = %data.user_identity,
            "all service requirements have been met"
        );
        return NextStep::Complete;
    };

    let Some(service) = data.services.get(service_id) else {
        return NextStep::Fail(NegotiationFailure::MissingService {
            service: service_id.to_string(),
        });
    };
    if !service.has_oauth_endpoints() {
        return NextStep::Fail(NegotiationFailure::IncompleteService {
            service: service_id.to_string(),
            xrd_document: service.xrd_document.clone(),
        });
    }

    let capabilities = data
        .requirements
        .get(service_id)
        .map(CapabilityRequirements::unresolved)
        .unwrap_or_default();

    let mut extra = BTreeMap::new();
    extra.insert("cb_identity".to_string(), data.user_identity.clone());
    extra.insert("cb_auth_method".to_string(), data.auth_method.clone());
    extra.insert("cb_capabilities".to_string(), capabilities.join(","));

    NextStep::Authorize(AuthorizationPlan {
        service: service_id.to_string(),
        descriptor: service.clone(),
        capabilities,
        extra,
    })
}

/// Folds the capabilities granted by an OAuth callback back in and decides
/// the following step.
pub fn resume(
    pending: PendingAuthorization,
    granted: &BTreeMap<String, String>,
) -> (ServiceRequestsData, NextStep) {
    let mut data = pending.data;
    let filled = apply_grant(&mut data, &pending.service, granted);
    info!(
        identity = %data.user_identity,
        service = %pending.service,
        filled,
        "capabilities granted through oauth"
    );
    let step = next_step(&data);
    (data, step)
}

/// Where a login attempt stands.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginState {
    AwaitingOAuthCallback { token: String, redirect: String },
    Completed {
        identity: String,
        session_id: Uuid,
    },
    Failed { reason: String },
}

impl LoginState {
    pub fn name(&self) -> &'static str {
        match self {
            LoginState::AwaitingOAuthCallback { .. } => "awaiting_oauth_callback",
            LoginState::Completed { .. } => "completed",
            LoginState::Failed { .. } => "failed",
        }
    }
}
