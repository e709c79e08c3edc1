use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [auth]
//                    guest_allowed = true
//
//   env var:         CHAT_AUTH__GUEST_ALLOWED=true   (double underscore = nesting)
//
//   (single underscore stays within field names: CHAT_STREAM__MAX_BUFFER_CHARS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub stream: StreamFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub rest: RestFileConfig,
}

/// Backend location (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

/// Auth gating and token source (lives under `[auth]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// Whether the backend requires a bearer token on the real-time connection.
    #[serde(default = "default_true")]
    pub required: bool,
    /// Whether unauthenticated guests may still connect.
    #[serde(default)]
    pub guest_allowed: bool,
    /// A fixed bearer token, mostly useful for scripts and development.
    #[serde(default)]
    pub token: Option<String>,
    /// Endpoint returning `{"token": "..."}`.
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_token_fetch_timeout_secs")]
    pub token_fetch_timeout_secs: u64,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            required: true,
            guest_allowed: false,
            token: None,
            token_url: None,
            token_ttl_secs: default_token_ttl_secs(),
            token_fetch_timeout_secs: default_token_fetch_timeout_secs(),
        }
    }
}

/// Connection resilience knobs (lives under `[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,
    #[serde(default = "default_quick_reconnect_ms")]
    pub quick_reconnect_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_visibility_debounce_ms")]
    pub visibility_debounce_ms: u64,
    /// Try the WebSocket transport before falling back to long-polling.
    #[serde(default = "default_true")]
    pub prefer_websocket: bool,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_jitter: default_reconnect_jitter(),
            quick_reconnect_ms: default_quick_reconnect_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            visibility_debounce_ms: default_visibility_debounce_ms(),
            prefer_websocket: true,
        }
    }
}

/// Streaming reassembly (lives under `[stream]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFileConfig {
    #[serde(default = "default_max_buffer_chars")]
    pub max_buffer_chars: usize,
}

impl Default for StreamFileConfig {
    fn default() -> Self {
        Self {
            max_buffer_chars: default_max_buffer_chars(),
        }
    }
}

/// Conversation bookkeeping (lives under `[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_placeholder_timeout_ms")]
    pub placeholder_timeout_ms: u64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            placeholder_timeout_ms: default_placeholder_timeout_ms(),
        }
    }
}

/// REST collaborator retry policy (lives under `[rest]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RestFileConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RestFileConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_true() -> bool {
    true
}
fn default_token_ttl_secs() -> u64 {
    300
}
fn default_token_fetch_timeout_secs() -> u64 {
    10
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    3000
}
fn default_reconnect_jitter() -> f64 {
    0.5
}
fn default_quick_reconnect_ms() -> u64 {
    500
}
fn default_connect_timeout_secs() -> u64 {
    20
}
fn default_visibility_debounce_ms() -> u64 {
    500
}
fn default_max_buffer_chars() -> usize {
    32 * 1024
}
fn default_placeholder_timeout_ms() -> u64 {
    5000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    250
}
fn default_request_timeout_secs() -> u64 {
    15
}

/// Build a figment that layers: defaults → config.toml → CHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CHAT_AUTH__REQUIRED=false`  →  `auth.required = false`
///   `CHAT_STREAM__MAX_BUFFER_CHARS=4096`  →  `stream.max_buffer_chars = 4096`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Inputs to the "should we connect at all" predicate.
#[derive(Clone, Debug)]
pub struct GateConfig {
    pub auth_required: bool,
    pub guest_allowed: bool,
}

/// Connection manager configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub base_url: String,
    pub gate: GateConfig,
    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub reconnect_jitter: f64,
    /// Delay before the single reconnect after an unrequested client/server close.
    pub quick_reconnect: Duration,
    pub connect_timeout: Duration,
    pub visibility_debounce: Duration,
    pub prefer_websocket: bool,
}

impl ConnectionConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let c = &fc.connection;
        Self {
            base_url: fc.server.base_url.trim_end_matches('/').to_string(),
            gate: GateConfig {
                auth_required: fc.auth.required,
                guest_allowed: fc.auth.guest_allowed,
            },
            heartbeat_interval: Duration::from_secs(c.heartbeat_secs.max(1)),
            max_reconnect_attempts: c.max_reconnect_attempts,
            reconnect_base: Duration::from_millis(c.reconnect_base_ms),
            reconnect_max: Duration::from_millis(c.reconnect_max_ms),
            reconnect_jitter: c.reconnect_jitter.clamp(0.0, 1.0),
            quick_reconnect: Duration::from_millis(c.quick_reconnect_ms),
            connect_timeout: Duration::from_secs(c.connect_timeout_secs),
            visibility_debounce: Duration::from_millis(c.visibility_debounce_ms),
            prefer_websocket: c.prefer_websocket,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

/// Token cache configuration (runtime view).
#[derive(Clone, Debug)]
pub struct TokenConfig {
    pub ttl: Duration,
    pub fetch_timeout: Duration,
}

impl TokenConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            ttl: Duration::from_secs(fc.token_ttl_secs),
            fetch_timeout: Duration::from_secs(fc.token_fetch_timeout_secs),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self::from_file(&AuthFileConfig::default())
    }
}

/// Session store + reassembler configuration (runtime view).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub placeholder_timeout: Duration,
    /// Backpressure cap for one streaming message, in characters.
    pub max_buffer_chars: usize,
}

impl SessionConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            placeholder_timeout: Duration::from_millis(fc.session.placeholder_timeout_ms),
            max_buffer_chars: fc.stream.max_buffer_chars.max(1),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

/// REST collaborator configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RestConfig {
    pub base_url: String,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub request_timeout: Duration,
}

impl RestConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            base_url: fc.server.base_url.trim_end_matches('/').to_string(),
            max_retries: fc.rest.max_retries,
            retry_base: Duration::from_millis(fc.rest.retry_base_ms),
            request_timeout: Duration::from_secs(fc.rest.request_timeout_secs),
        }
    }
}

// =============================================================================
// Directory layout (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ClientPaths {
    pub data_dir: PathBuf,
}

impl ClientPaths {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".chat-session"),
        };

        let state_dir = data_dir.join("state");
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn session_state_path(&self) -> PathBuf {
        self.state_dir().join("session.json")
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_auth_file_config_defaults() {
        let d = AuthFileConfig::default();
        assert!(d.required);
        assert!(!d.guest_allowed);
        assert!(d.token.is_none());
        assert_eq!(d.token_ttl_secs, 300);
        assert_eq!(d.token_fetch_timeout_secs, 10);
    }

    #[test]
    fn test_connection_config_defaults() {
        let cc = ConnectionConfig::default();
        assert_eq!(cc.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cc.max_reconnect_attempts, 5);
        assert_eq!(cc.reconnect_base, Duration::from_secs(1));
        assert_eq!(cc.reconnect_max, Duration::from_secs(3));
        assert_eq!(cc.reconnect_jitter, 0.5);
        assert_eq!(cc.connect_timeout, Duration::from_secs(20));
        assert_eq!(cc.visibility_debounce, Duration::from_millis(500));
        assert!(cc.prefer_websocket);
    }

    #[test]
    fn test_session_config_defaults() {
        let sc = SessionConfig::default();
        assert_eq!(sc.placeholder_timeout, Duration::from_secs(5));
        assert_eq!(sc.max_buffer_chars, 32 * 1024);
    }

    // ── from_file ───────────────────────────────────────────────────────

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let fc = FileConfig {
            server: ServerFileConfig {
                base_url: "https://chat.example.com/".to_string(),
            },
            ..Default::default()
        };
        assert_eq!(
            ConnectionConfig::from_file(&fc).base_url,
            "https://chat.example.com"
        );
        assert_eq!(RestConfig::from_file(&fc).base_url, "https://chat.example.com");
    }

    #[test]
    fn test_jitter_is_clamped() {
        let mut fc = FileConfig::default();
        fc.connection.reconnect_jitter = 3.0;
        assert_eq!(ConnectionConfig::from_file(&fc).reconnect_jitter, 1.0);
    }

    // ── ClientPaths ─────────────────────────────────────────────────────

    #[test]
    fn test_client_paths_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ClientPaths::new(Some(tmp.path().to_path_buf())).unwrap();
        assert_eq!(paths.data_dir, tmp.path());
        assert!(tmp.path().join("state").exists());
        assert_eq!(
            paths.session_state_path(),
            tmp.path().join("state/session.json")
        );
        assert_eq!(paths.config_toml_path(), tmp.path().join("config.toml"));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert!(fc.auth.required);
        assert_eq!(fc.server.base_url, "http://127.0.0.1:8080");
        assert_eq!(fc.stream.max_buffer_chars, 32 * 1024);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[server]\nbase_url = \"https://chat.example.com\"\n\n[auth]\nguest_allowed = true\n\n[stream]\nmax_buffer_chars = 64\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.base_url, "https://chat.example.com");
        assert!(fc.auth.guest_allowed);
        assert!(fc.auth.required);
        assert_eq!(fc.stream.max_buffer_chars, 64);
        assert_eq!(fc.connection.heartbeat_secs, 30);
    }
}
