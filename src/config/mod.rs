//! Server configuration.
//!
//! Configuration is resolved from three sources, in priority order:
//! YAML file > environment variables > built-in defaults. A `.env` file, if
//! present, is loaded into the environment before resolution (see `main.rs`).
//!
//! # Example
//! ```rust,no_run
//! use voxtask_bridge::config::ServerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_env()?;
//! println!("listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::BridgeError;

/// Default negotiation acknowledgment deadline.
pub const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 10;

/// Default per-tool execution deadline.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 15;

/// Default grace period for in-flight tool calls during shutdown.
pub const DEFAULT_CLOSING_GRACE_SECS: u64 = 5;

/// Default cap on buffered, not-yet-sent audio frames before the oldest
/// frames are dropped.
pub const DEFAULT_MAX_BUFFERED_AUDIO_FRAMES: usize = 256;

/// Server configuration.
///
/// Covers the listening socket, the upstream realtime provider, the task
/// service collaborator, and the per-session timing knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    /// Long-lived upstream API key. Held server-side only; the client is
    /// handed ephemeral credentials minted from it.
    pub openai_api_key: String,

    /// Realtime model requested when minting sessions.
    pub realtime_model: String,

    /// Voice requested for audio output.
    pub voice: String,

    /// System instructions sent during session negotiation.
    pub instructions: Option<String>,

    /// Pre-obtained task service OAuth access token. The OAuth exchange
    /// itself happens out-of-band.
    pub ticktick_access_token: Option<String>,

    /// Task service REST base URL (overridable for tests).
    pub ticktick_base_url: String,

    // Session timing
    pub negotiation_timeout: Duration,
    pub tool_timeout: Duration,
    pub closing_grace: Duration,

    /// Backpressure cap for buffered audio frames awaiting upstream send.
    pub max_buffered_audio_frames: usize,

    /// Comma-separated CORS origins, or "*" for any. None = same-origin only.
    pub cors_allowed_origins: Option<String>,
}

/// Subset of the configuration representable in a YAML file.
///
/// Every field is optional; absent fields fall back to the environment and
/// then to defaults.
#[derive(Debug, Default, Deserialize)]
pub struct YamlConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub openai_api_key: Option<String>,
    pub realtime_model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub ticktick_access_token: Option<String>,
    pub ticktick_base_url: Option<String>,
    pub negotiation_timeout_secs: Option<u64>,
    pub tool_timeout_secs: Option<u64>,
    pub closing_grace_secs: Option<u64>,
    pub max_buffered_audio_frames: Option<usize>,
    pub cors_allowed_origins: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, BridgeError> {
        Self::resolve(YamlConfig::default())
    }

    /// Load configuration from a YAML file, with environment variables
    /// filling any fields the file leaves unset.
    pub fn from_file(path: &Path) -> Result<Self, BridgeError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("failed to read {}: {e}", path.display())))?;
        let yaml: YamlConfig = serde_yaml::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("invalid YAML in {}: {e}", path.display())))?;
        Self::resolve(yaml)
    }

    fn resolve(yaml: YamlConfig) -> Result<Self, BridgeError> {
        let openai_api_key = yaml
            .openai_api_key
            .or_else(|| env_var("OPENAI_API_KEY"))
            .ok_or_else(|| BridgeError::Config("OPENAI_API_KEY is not set".into()))?;

        let port = match yaml.port {
            Some(p) => p,
            None => match env_var("PORT") {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| BridgeError::Config(format!("invalid PORT: {raw}")))?,
                None => 8000,
            },
        };

        Ok(Self {
            host: yaml
                .host
                .or_else(|| env_var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            openai_api_key,
            realtime_model: yaml
                .realtime_model
                .or_else(|| env_var("REALTIME_MODEL"))
                .unwrap_or_else(|| "gpt-4o-realtime-preview".to_string()),
            voice: yaml
                .voice
                .or_else(|| env_var("REALTIME_VOICE"))
                .unwrap_or_else(|| "verse".to_string()),
            instructions: yaml.instructions.or_else(|| env_var("BRIDGE_INSTRUCTIONS")),
            ticktick_access_token: yaml
                .ticktick_access_token
                .or_else(|| env_var("TICKTICK_ACCESS_TOKEN")),
            ticktick_base_url: yaml
                .ticktick_base_url
                .or_else(|| env_var("TICKTICK_BASE_URL"))
                .unwrap_or_else(|| "https://api.ticktick.com/open/v1".to_string()),
            negotiation_timeout: duration_secs(
                yaml.negotiation_timeout_secs,
                "NEGOTIATION_TIMEOUT_SECS",
                DEFAULT_NEGOTIATION_TIMEOUT_SECS,
            )?,
            tool_timeout: duration_secs(
                yaml.tool_timeout_secs,
                "TOOL_TIMEOUT_SECS",
                DEFAULT_TOOL_TIMEOUT_SECS,
            )?,
            closing_grace: duration_secs(
                yaml.closing_grace_secs,
                "CLOSING_GRACE_SECS",
                DEFAULT_CLOSING_GRACE_SECS,
            )?,
            max_buffered_audio_frames: yaml
                .max_buffered_audio_frames
                .unwrap_or(DEFAULT_MAX_BUFFERED_AUDIO_FRAMES),
            cors_allowed_origins: yaml
                .cors_allowed_origins
                .or_else(|| env_var("CORS_ALLOWED_ORIGINS")),
        })
    }

    /// The socket address string the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn duration_secs(yaml: Option<u64>, env_name: &str, default: u64) -> Result<Duration, BridgeError> {
    let secs = match yaml {
        Some(s) => s,
        None => match env_var(env_name) {
            Some(raw) => raw
                .parse()
                .map_err(|_| BridgeError::Config(format!("invalid {env_name}: {raw}")))?,
            None => default,
        },
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn yaml(s: &str) -> YamlConfig {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_resolve_defaults() {
        let config = ServerConfig::resolve(yaml("openai_api_key: sk-test")).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.realtime_model, "gpt-4o-realtime-preview");
        assert_eq!(config.voice, "verse");
        assert_eq!(
            config.negotiation_timeout,
            Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS)
        );
        assert_eq!(
            config.tool_timeout,
            Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS)
        );
        assert_eq!(
            config.closing_grace,
            Duration::from_secs(DEFAULT_CLOSING_GRACE_SECS)
        );
        assert_eq!(
            config.max_buffered_audio_frames,
            DEFAULT_MAX_BUFFERED_AUDIO_FRAMES
        );
    }

    #[test]
    fn test_yaml_overrides() {
        let config = ServerConfig::resolve(yaml(
            r#"
openai_api_key: sk-test
host: 127.0.0.1
port: 9100
voice: alloy
tool_timeout_secs: 30
ticktick_base_url: http://localhost:4000/open/v1
"#,
        ))
        .unwrap();
        assert_eq!(config.address(), "127.0.0.1:9100");
        assert_eq!(config.voice, "alloy");
        assert_eq!(config.tool_timeout, Duration::from_secs(30));
        assert_eq!(config.ticktick_base_url, "http://localhost:4000/open/v1");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "openai_api_key: sk-file\nport: 9200").unwrap();
        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.openai_api_key, "sk-file");
        assert_eq!(config.port, 9200);
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port: [not, a, number").unwrap();
        let err = ServerConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
