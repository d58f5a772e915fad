pub mod chat;
pub mod expiring;
pub mod identity;
pub mod negotiation;

pub use chat::{ChatConfig, ChatEngine, ChatListener, ChatRegion};
pub use expiring::{Clock, ExpiringCache, ManualClock, SystemClock};
pub use identity::{
    build_auth_service_name, identity_to_uuid, is_identity_authorized, local_name_from_identity,
};
pub use negotiation::{
    apply_grant, default_requirements, next_step, resume, trusted_requests, AuthorizationPlan,
    CapabilityRequirements, LoginState, NegotiationFailure, NextStep, PendingAuthorization,
    SeedRequest, ServiceRequestsData, ServiceRequirements,
};

use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_lowercase_and_full_length() {
        let hex = sha256_hex(b"cablebeach");
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}
