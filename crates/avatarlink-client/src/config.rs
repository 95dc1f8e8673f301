use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use avatarlink_common::helpers::normalize_base_url;
use avatarlink_common::{Error, Result};

pub const DEFAULT_BACKEND_BASE: &str = "http://127.0.0.1:8000";
pub const DEFAULT_PROVIDER_API_BASE: &str = "https://api.heygen.com/v1/";
pub const DEFAULT_SESSION_PATH: &str = "/provider/token";
pub const PROXY_PATH: &str = "/provider/proxy";
pub const DEFAULT_AVATAR_ID: &str = "c5e81098eb3e46189740b6156b3ac85a";

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(12);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(12);
pub const DEFAULT_MEDIA_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Rendering quality requested from the provider when it creates the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AvatarQuality {
    Low,
    Medium,
    #[default]
    High,
}

impl AvatarQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for AvatarQuality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(Error::config(format!("unknown avatar quality `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarOptions {
    pub avatar_id: String,
    pub quality: AvatarQuality,
}

impl Default for AvatarOptions {
    fn default() -> Self {
        Self {
            avatar_id: DEFAULT_AVATAR_ID.to_string(),
            quality: AvatarQuality::High,
        }
    }
}

/// Everything the client needs to reach the backend and negotiate media.
#[derive(Clone)]
pub struct ClientConfig {
    /// Backend that creates sessions and proxies provider calls.
    pub backend_base: String,
    /// Provider API prefix whose requests get rerouted through the backend proxy.
    pub provider_api_base: String,
    /// Path of the session-creation endpoint on the backend.
    pub session_path: String,
    /// Optional backend admin key, sent as `X-Admin-Key`.
    pub admin_key: Option<String>,
    pub acquire_timeout: Duration,
    /// Upper bound for every other backend call (tasks, start/stop, ICE, knowledge).
    pub request_timeout: Duration,
    pub media_timeout: Duration,
    pub teardown_timeout: Duration,
    /// STUN/TURN URLs used when the offer does not carry its own ICE servers.
    pub ice_servers: Vec<String>,
    /// Attach a local microphone track to direct peer connections.
    pub attach_microphone: bool,
    pub avatar: AvatarOptions,
}

impl ClientConfig {
    pub fn from_backend(backend_base: &str) -> Self {
        Self {
            backend_base: normalize_base_url(backend_base)
                .unwrap_or_else(|| backend_base.to_string()),
            ..Self::default()
        }
    }

    /// Base URL every rewritten provider call lands under.
    pub fn proxy_base(&self) -> String {
        format!("{}{}", self.backend_base.trim_end_matches('/'), PROXY_PATH)
    }

    pub fn validate(&self) -> Result<()> {
        validate_http_url("backend base", &self.backend_base)?;
        validate_http_url("provider api base", &self.provider_api_base)?;

        if !self.session_path.starts_with('/') {
            return Err(Error::config(format!(
                "session path `{}` must start with `/`",
                self.session_path
            )));
        }

        for (name, value) in [
            ("acquire timeout", self.acquire_timeout),
            ("request timeout", self.request_timeout),
            ("media timeout", self.media_timeout),
            ("teardown timeout", self.teardown_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{name} must be non-zero")));
            }
        }

        for server in &self.ice_servers {
            let lower = server.to_ascii_lowercase();
            if !(lower.starts_with("stun:") || lower.starts_with("turn:") || lower.starts_with("turns:"))
            {
                return Err(Error::config(format!("invalid ICE server url `{server}`")));
            }
        }

        if self.avatar.avatar_id.trim().is_empty() {
            return Err(Error::config("avatar id is empty"));
        }

        Ok(())
    }
}

fn validate_http_url(name: &str, raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| Error::config(format!("{name} `{raw}`: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::config(format!(
            "{name} `{raw}` must be http(s), got `{other}`"
        ))),
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_base: DEFAULT_BACKEND_BASE.to_string(),
            provider_api_base: DEFAULT_PROVIDER_API_BASE.to_string(),
            session_path: DEFAULT_SESSION_PATH.to_string(),
            admin_key: None,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            media_timeout: DEFAULT_MEDIA_TIMEOUT,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            attach_microphone: false,
            avatar: AvatarOptions::default(),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("backend_base", &self.backend_base)
            .field("provider_api_base", &self.provider_api_base)
            .field("session_path", &self.session_path)
            .field("admin_key", &self.admin_key.as_ref().map(|_| "<redacted>"))
            .field("acquire_timeout", &self.acquire_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("media_timeout", &self.media_timeout)
            .field("teardown_timeout", &self.teardown_timeout)
            .field("ice_servers", &self.ice_servers)
            .field("attach_microphone", &self.attach_microphone)
            .field("avatar", &self.avatar)
            .finish()
    }
}
