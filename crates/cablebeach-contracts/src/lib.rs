use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Public chat channel.
pub const PUBLIC_CHANNEL: i32 = 0;
/// Script debug channel; everything said here is forced to `ChatType::Debug`.
pub const DEBUG_CHANNEL: i32 = i32::MAX;

/// Width of one region on the grid, in meters.
pub const REGION_SIZE: u32 = 256;

/// Longest chat message the viewer protocol carries.
pub const MAX_MESSAGE_CHARS: usize = 1000;

/// Broadcast chat is only trimmed once it passes this length.
pub const BROADCAST_TRIM_THRESHOLD: usize = 1100;

pub mod services {
    pub const ASSETS: &str = "http://openmetaverse.org/services/assets";
    pub const FILESYSTEM: &str = "http://openmetaverse.org/services/filesystem";

    pub const ASSET_CREATE_ASSET: &str = "http://openmetaverse.org/services/assets/create_asset";
    pub const ASSET_GET_ASSET: &str = "http://openmetaverse.org/services/assets/get_asset";
    pub const ASSET_GET_ASSET_METADATA: &str =
        "http://openmetaverse.org/services/assets/get_asset_metadata";

    pub const FILESYSTEM_CREATE_FILESYSTEM: &str =
        "http://openmetaverse.org/services/filesystem/create_filesystem";
    pub const FILESYSTEM_CREATE_OBJECT: &str =
        "http://openmetaverse.org/services/filesystem/create_object";
    pub const FILESYSTEM_GET_ACTIVE_GESTURES: &str =
        "http://openmetaverse.org/services/filesystem/get_active_gestures";
    pub const FILESYSTEM_GET_FILESYSTEM: &str =
        "http://openmetaverse.org/services/filesystem/get_filesystem";
    pub const FILESYSTEM_GET_FILESYSTEM_SKELETON: &str =
        "http://openmetaverse.org/services/filesystem/get_filesystem_skeleton";
    pub const FILESYSTEM_GET_OBJECT: &str =
        "http://openmetaverse.org/services/filesystem/get_object";
    pub const FILESYSTEM_GET_ROOT_FOLDER: &str =
        "http://openmetaverse.org/services/filesystem/get_root_folder";
    pub const FILESYSTEM_PURGE_FOLDER: &str =
        "http://openmetaverse.org/services/filesystem/purge_folder";
    pub const FILESYSTEM_DELETE_OBJECT: &str =
        "http://openmetaverse.org/services/filesystem/delete_object";
    pub const FILESYSTEM_GET_FOLDER_FOR_TYPE: &str =
        "http://openmetaverse.org/services/filesystem/get_folder_for_type";
    pub const FILESYSTEM_GET_FOLDER_CONTENTS: &str =
        "http://openmetaverse.org/services/filesystem/get_folder_contents";

    /// Capabilities the asset service must grant before a login completes.
    pub const ASSET_REQUIRED_CAPS: &[&str] =
        &[ASSET_CREATE_ASSET, ASSET_GET_ASSET, ASSET_GET_ASSET_METADATA];

    /// Capabilities the filesystem service must grant before a login completes.
    pub const FILESYSTEM_REQUIRED_CAPS: &[&str] = &[
        FILESYSTEM_CREATE_FILESYSTEM,
        FILESYSTEM_CREATE_OBJECT,
        FILESYSTEM_GET_ACTIVE_GESTURES,
        FILESYSTEM_GET_FILESYSTEM,
        FILESYSTEM_GET_FILESYSTEM_SKELETON,
        FILESYSTEM_GET_OBJECT,
        FILESYSTEM_GET_ROOT_FOLDER,
        FILESYSTEM_PURGE_FOLDER,
        FILESYSTEM_DELETE_OBJECT,
        FILESYSTEM_GET_FOLDER_FOR_TYPE,
        FILESYSTEM_GET_FOLDER_CONTENTS,
    ];
}

pub mod auth_methods {
    pub const OPENID: &str = "openid";
    pub const FACEBOOK: &str = "facebook";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Vector3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Vector3) -> f64 {
        let dx = self.x as f64 - other.x as f64;
        let dy = self.y as f64 - other.y as f64;
        let dz = self.z as f64 - other.z as f64;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

impl std::ops::Add for Vector3 {
    type Output = Vector3;

    fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

/// Grid coordinates of a region, in region units.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RegionLocation {
    pub grid_x: u32,
    pub grid_y: u32,
}

impl RegionLocation {
    /// Offset that turns a region-local position into a grid-absolute one.
    pub fn origin(&self) -> Vector3 {
        Vector3::new(
            (self.grid_x as f64 * REGION_SIZE as f64) as f32,
            (self.grid_y as f64 * REGION_SIZE as f64) as f32,
            0.0,
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Whisper,
    Say,
    Shout,
    Broadcast,
    Owner,
    Debug,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatSource {
    Agent,
    Object,
}

/// One chat utterance as raised by the scene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub channel: i32,
    pub message: String,
    pub chat_type: ChatType,
    pub source: ChatSource,
    #[serde(default)]
    pub sender_id: Option<Uuid>,
    #[serde(default)]
    pub sender_name: String,
    /// Region-local position of the speaker.
    #[serde(default)]
    pub position: Vector3,
    /// Region the speaker is in.
    #[serde(default)]
    pub origin: RegionLocation,
    /// Owner of the speaking object, when `source` is `Object`.
    #[serde(default)]
    pub owner_id: Option<Uuid>,
}

/// What a listener actually receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatDelivery {
    pub message: String,
    pub chat_type: ChatType,
    pub position: Vector3,
    pub from_name: String,
    pub from_id: Uuid,
    pub source: ChatSource,
}

/// A discovered remote service.
///
/// A seed capability marks the service as trusted; the three OAuth endpoints
/// mark it as reachable through an OAuth authorization round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub xrd_document: String,
    #[serde(default)]
    pub seed_capability: Option<String>,
    #[serde(default)]
    pub oauth_request_token: Option<String>,
    #[serde(default)]
    pub oauth_authorize_token: Option<String>,
    #[serde(default)]
    pub oauth_get_access_token: Option<String>,
    #[serde(default)]
    pub can_override: bool,
}

impl Service {
    pub fn is_trusted(&self) -> bool {
        self.seed_capability.is_some()
    }

    pub fn has_oauth_endpoints(&self) -> bool {
        self.oauth_request_token.is_some()
            && self.oauth_authorize_token.is_some()
            && self.oauth_get_access_token.is_some()
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = self
            .seed_capability
            .as_deref()
            .or(self.oauth_get_access_token.as_deref())
            .unwrap_or("null");
        write!(
            f,
            "Location: {location}, {} {}",
            if self.is_trusted() { "Trusted" } else { "Untrusted" },
            if self.can_override {
                "CanOverride"
            } else {
                "NoOverride"
            }
        )
    }
}

/// Discovery document served at a service location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub services: Vec<DiscoveryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub seed_capability: Option<String>,
    #[serde(default)]
    pub oauth_request_token: Option<String>,
    #[serde(default)]
    pub oauth_authorize_token: Option<String>,
    #[serde(default)]
    pub oauth_get_access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCapabilitiesMessage {
    pub identity: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestCapabilitiesReplyMessage {
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSession {
    pub session_id: Uuid,
    pub secure_session_id: Uuid,
    pub online: bool,
    pub login_at: String,
    #[serde(default)]
    pub logout_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password_hash: String,
    pub home_region_x: u32,
    pub home_region_y: u32,
    pub created_at: String,
    #[serde(default)]
    pub current_agent: Option<AgentSession>,
}

impl UserProfile {
    pub fn name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn is_online(&self) -> bool {
        self.current_agent.as_ref().map(|a| a.online).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_display_prefers_seed_capability() {
        let service = Service {
            xrd_document: "http://grid.example/assets.json".to_string(),
            seed_capability: Some("http://grid.example/seed".to_string()),
            oauth_request_token: None,
            oauth_authorize_token: None,
            oauth_get_access_token: Some("http://grid.example/access".to_string()),
            can_override: false,
        };
        assert_eq!(
            service.to_string(),
            "Location: http://grid.example/seed, Trusted NoOverride"
        );
    }

    #[test]
    fn service_display_without_endpoints_reports_null() {
        let service = Service {
            xrd_document: "http://grid.example/fs.json".to_string(),
            seed_capability: None,
            oauth_request_token: None,
            oauth_authorize_token: None,
            oauth_get_access_token: None,
            can_override: true,
        };
        assert_eq!(service.to_string(), "Location: null, Untrusted CanOverride");
    }

    #[test]
    fn region_origin_scales_by_region_size() {
        let loc = RegionLocation {
            grid_x: 1000,
            grid_y: 1001,
        };
        assert_eq!(loc.origin(), Vector3::new(256_000.0, 256_256.0, 0.0));
    }

    #[test]
    fn chat_event_defaults_optional_fields() {
        let event: ChatEvent = serde_json::from_str(
            r#"{"channel":0,"message":"hi","chat_type":"say","source":"object"}"#,
        )
        .unwrap();
        assert!(event.sender_id.is_none());
        assert_eq!(event.origin, RegionLocation::default());
    }
}
