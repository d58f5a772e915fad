use cablebeach_contracts::auth_methods;
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

/// Agent id derived from an identity URI. Stable across logins so a returning
/// identity finds the account it created the first time.
pub fn identity_to_uuid(identity: &str) -> Uuid {
    let digest = Sha256::digest(identity.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_bytes(bytes).into_uuid()
}

/// `http://host/users/first.last` on our own host names a local account.
pub fn local_name_from_identity(
    identity: &Url,
    server_hostname: &str,
) -> Option<(String, String)> {
    let host = identity.host_str()?;
    if !host.eq_ignore_ascii_case(server_hostname) {
        return None;
    }
    let segment = identity.path_segments()?.last()?;
    let parts: Vec<&str> = segment.split(['_', '.']).collect();
    match parts.as_slice() {
        [first, last] if !first.is_empty() && !last.is_empty() => {
            Some((first.to_string(), last.to_string()))
        }
        _ => None,
    }
}

/// Fallback account name for identities that arrive without one.
pub fn build_auth_service_name(identity: &str, auth_method: &str) -> (String, String) {
    let chars: Vec<char> = identity.chars().collect();
    let first = if chars.len() > 32 {
        let head: String = chars[..15].iter().collect();
        let tail: String = chars[chars.len() - 14..].iter().collect();
        format!("{head}...{tail}")
    } else {
        identity.to_string()
    };
    let last = match auth_method {
        auth_methods::OPENID => "OpenID",
        auth_methods::FACEBOOK => "Facebook",
        _ => "CableBeach",
    };
    (first, last.to_string())
}

pub fn is_identity_authorized(identity: &str, denied_prefixes: &[String]) -> bool {
    !denied_prefixes
        .iter()
        .any(|prefix| identity.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_identity_splits_on_dot_or_underscore() {
        let dotted = Url::parse("http://example.org/users/jane.doe").unwrap();
        assert_eq!(
            local_name_from_identity(&dotted, "example.org"),
            Some(("jane".to_string(), "doe".to_string()))
        );

        let underscored = Url::parse("http://EXAMPLE.org/users/jane_doe").unwrap();
        assert_eq!(
            local_name_from_identity(&underscored, "Example.Org"),
            Some(("jane".to_string(), "doe".to_string()))
        );
    }

    #[test]
    fn foreign_or_malformed_identities_have_no_local_name() {
        let foreign = Url::parse("http://openid.example.net/users/jane.doe").unwrap();
        assert_eq!(local_name_from_identity(&foreign, "example.org"), None);

        let three = Url::parse("http://example.org/users/jane.q.doe").unwrap();
        assert_eq!(local_name_from_identity(&three, "example.org"), None);

        let bare = Url::parse("http://example.org/users/jane").unwrap();
        assert_eq!(local_name_from_identity(&bare, "example.org"), None);
    }

    #[test]
    fn identity_uuid_is_deterministic() {
        let a = identity_to_uuid("http://openid.example.net/jane");
        let b = identity_to_uuid("http://openid.example.net/jane");
        let c = identity_to_uuid("http://openid.example.net/john");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_nil());
    }

    #[test]
    fn long_identities_are_shortened_in_service_names() {
        let identity = "http://openid.example.net/users/a-very-long-account-name";
        let (first, last) = build_auth_service_name(identity, auth_methods::OPENID);
        assert_eq!(first, "http://openid.e...g-account-name");
        assert_eq!(first.chars().count(), 32);
        assert_eq!(last, "OpenID");

        let (first, last) = build_auth_service_name("http://fb.example/1", "twitter");
        assert_eq!(first, "http://fb.example/1");
        assert_eq!(last, "CableBeach");
    }

    #[test]
    fn denied_prefixes_block_identities() {
        let denied = vec!["http://spam.example/".to_string()];
        assert!(!is_identity_authorized("http://spam.example/bot", &denied));
        assert!(is_identity_authorized("http://openid.example.net/jane", &denied));
    }
}
