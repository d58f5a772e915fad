use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    #[serde(default)]
    pub chat: Chat,
    pub login: Login,
    pub templates: Templates,
    #[serde(default)]
    pub scene: Scene,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
    /// Base URL clients reach this server on; callback and login links hang off it.
    pub public_url: String,
    /// Identities hosted on this name are treated as local accounts.
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    #[serde(default = "default_whisper_distance")]
    pub whisper_distance: u32,
    #[serde(default = "default_say_distance")]
    pub say_distance: u32,
    #[serde(default = "default_shout_distance")]
    pub shout_distance: u32,
}

impl Default for Chat {
    fn default() -> Self {
        Self {
            whisper_distance: default_whisper_distance(),
            say_distance: default_say_distance(),
            shout_distance: default_shout_distance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Login {
    pub asset_service_url: String,
    pub filesystem_service_url: String,
    #[serde(default = "default_service_cache_timeout_ms")]
    pub service_cache_timeout_ms: u64,
    #[serde(default = "default_oauth_timeout_ms")]
    pub oauth_timeout_ms: u64,
    #[serde(default = "default_pending_login_timeout_ms")]
    pub pending_login_timeout_ms: u64,
    #[serde(default = "default_seed_cap_timeout_ms")]
    pub seed_cap_timeout_ms: u64,
    #[serde(default = "default_home_region")]
    pub default_home_x: u32,
    #[serde(default = "default_home_region")]
    pub default_home_y: u32,
    pub oauth_consumer_key: String,
    pub oauth_consumer_secret: String,
    #[serde(default)]
    pub denied_identity_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Templates {
    pub login_path: String,
    pub login_success_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Scene {
    #[serde(default)]
    pub regions: Vec<Region>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub grid_x: u32,
    pub grid_y: u32,
}

fn default_whisper_distance() -> u32 {
    10
}

fn default_say_distance() -> u32 {
    30
}

fn default_shout_distance() -> u32 {
    100
}

fn default_service_cache_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_oauth_timeout_ms() -> u64 {
    3 * 60 * 1000
}

fn default_pending_login_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_seed_cap_timeout_ms() -> u64 {
    30 * 1000
}

fn default_home_region() -> u32 {
    1000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if !(cfg.chat.whisper_distance <= cfg.chat.say_distance
        && cfg.chat.say_distance <= cfg.chat.shout_distance)
    {
        return Err(ConfigError::UnsupportedConfig(
            "chat distances must satisfy whisper <= say <= shout".to_string(),
        ));
    }
    for (name, value) in [
        ("login.service_cache_timeout_ms", cfg.login.service_cache_timeout_ms),
        ("login.oauth_timeout_ms", cfg.login.oauth_timeout_ms),
        ("login.pending_login_timeout_ms", cfg.login.pending_login_timeout_ms),
        ("login.seed_cap_timeout_ms", cfg.login.seed_cap_timeout_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::UnsupportedConfig(format!("{name} must be >= 1")));
        }
    }
    if cfg.server.hostname.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "server.hostname must not be empty".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for region in &cfg.scene.regions {
        if !seen.insert(region.name.as_str()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "scene.regions contains duplicate region name {}",
                region.name
            )));
        }
    }
    Ok(())
}
