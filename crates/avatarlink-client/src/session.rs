//! Session acquisition: one call to the backend's session endpoint and a total
//! classification of whatever comes back.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use avatarlink_common::IceServer;

use crate::config::ClientConfig;
use crate::proxy::{status_label, BackendClient, RequestFailure};

/// Field names accepted as a bare session token.
const TOKEN_FIELDS: [&str; 2] = ["token", "session_token"];

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("session request failed ({}): {body}", status_label(.status))]
    RequestFailed { status: Option<u16>, body: String },
    #[error("session response matches no known shape: {0}")]
    UnrecognizedShape(Value),
    #[error("session request timed out after {0:?}")]
    TimedOut(Duration),
}

impl From<RequestFailure> for AcquisitionError {
    fn from(f: RequestFailure) -> Self {
        Self::RequestFailed {
            status: f.status,
            body: f.body,
        }
    }
}

/// Legacy shape: the provider SDK takes it from here.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSession {
    pub token: String,
}

/// Raw offer/answer shape: the provider already created a peer and sent its offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferSession {
    pub session_id: String,
    pub remote_offer: String,
    pub ice_servers: Vec<IceServer>,
}

/// Media-room shape: join the room, then ask the provider to start streaming.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomSession {
    pub session_id: String,
    pub room_url: String,
    pub access_token: String,
}

impl fmt::Debug for TokenSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSession")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomSession")
            .field("session_id", &self.session_id)
            .field("room_url", &self.room_url)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    LegacySdk,
    RawWebRtc,
    MediaRoom,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LegacySdk => write!(f, "legacy-sdk"),
            Self::RawWebRtc => write!(f, "raw-webrtc"),
            Self::MediaRoom => write!(f, "media-room"),
        }
    }
}

/// The result of session acquisition. Exactly one shape per acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDescriptor {
    Token(TokenSession),
    Offer(OfferSession),
    Room(RoomSession),
}

impl SessionDescriptor {
    pub fn transport_kind(&self) -> TransportKind {
        match self {
            Self::Token(_) => TransportKind::LegacySdk,
            Self::Offer(_) => TransportKind::RawWebRtc,
            Self::Room(_) => TransportKind::MediaRoom,
        }
    }

    /// Known up front for offer and room sessions; token sessions learn theirs
    /// once the SDK creates the stream.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Token(_) => None,
            Self::Offer(s) => Some(&s.session_id),
            Self::Room(s) => Some(&s.session_id),
        }
    }
}

/// Classifies a session-creation payload.
///
/// Fields are looked up in the top-level object first, then in a nested `data`
/// object. Precedence is fixed: bare token, then session id + SDP offer, then
/// session id + room URL + access token. Anything else is `UnrecognizedShape`.
pub fn classify(payload: &Value) -> Result<SessionDescriptor, AcquisitionError> {
    let Some(root) = payload.as_object() else {
        return Err(AcquisitionError::UnrecognizedShape(payload.clone()));
    };
    let data = root.get("data").and_then(Value::as_object);
    let lookup = |name: &str| field(root, data, name);
    let text = |name: &str| text_field(root, data, name);

    if let Some(token) = TOKEN_FIELDS.iter().find_map(|&name| text(name)) {
        return Ok(SessionDescriptor::Token(TokenSession { token }));
    }

    let session_id = text("session_id");

    if let (Some(session_id), Some(remote_offer)) =
        (session_id.clone(), lookup("sdp").and_then(offer_sdp))
    {
        return Ok(SessionDescriptor::Offer(OfferSession {
            session_id,
            remote_offer,
            ice_servers: ice_servers(root, data),
        }));
    }

    if let (Some(session_id), Some(room_url), Some(access_token)) =
        (session_id, text("url"), text("access_token"))
    {
        return Ok(SessionDescriptor::Room(RoomSession {
            session_id,
            room_url,
            access_token,
        }));
    }

    Err(AcquisitionError::UnrecognizedShape(payload.clone()))
}

fn field<'a>(
    root: &'a Map<String, Value>,
    data: Option<&'a Map<String, Value>>,
    name: &str,
) -> Option<&'a Value> {
    root.get(name)
        .filter(|v| !v.is_null())
        .or_else(|| data.and_then(|d| d.get(name)).filter(|v| !v.is_null()))
}

fn text_field(
    root: &Map<String, Value>,
    data: Option<&Map<String, Value>>,
    name: &str,
) -> Option<String> {
    field(root, data, name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The offer may come as the raw SDP string or as `{type, sdp}`.
fn offer_sdp(value: &Value) -> Option<String> {
    let sdp = match value {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => {
            if let Some(kind) = obj.get("type").and_then(Value::as_str) {
                if !kind.eq_ignore_ascii_case("offer") {
                    return None;
                }
            }
            obj.get("sdp").and_then(Value::as_str)?
        }
        _ => return None,
    };
    (!sdp.trim().is_empty()).then(|| sdp.to_string())
}

fn ice_servers(root: &Map<String, Value>, data: Option<&Map<String, Value>>) -> Vec<IceServer> {
    for key in ["ice_servers2", "ice_servers"] {
        let Some(raw) = root.get(key).or_else(|| data.and_then(|d| d.get(key))) else {
            continue;
        };
        match serde_json::from_value::<Vec<IceServer>>(raw.clone()) {
            Ok(servers) if !servers.is_empty() => return servers,
            Ok(_) => {}
            Err(e) => warn!("ignoring unparseable `{key}` in session response: {e}"),
        }
    }
    Vec::new()
}

/// Anything that can produce a session descriptor.
#[async_trait]
pub trait SessionAcquirer: Send + Sync {
    async fn acquire_session(&self) -> Result<SessionDescriptor, AcquisitionError>;
}

/// Issues the session-creation call against the backend.
#[derive(Clone)]
pub struct SessionRequestClient {
    http: BackendClient,
    session_url: String,
}

impl SessionRequestClient {
    pub fn new(http: BackendClient, config: &ClientConfig) -> Self {
        let session_url = http.backend_url(&config.session_path);
        Self { http, session_url }
    }

    pub fn session_url(&self) -> &str {
        &self.session_url
    }

    /// Fetches the raw payload without classifying it.
    pub async fn fetch_raw(&self) -> Result<Value, AcquisitionError> {
        debug!(url = %self.session_url, "requesting session");
        let builder = self
            .http
            .request(Method::POST, &self.session_url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .json(&serde_json::json!({}));
        let (status, text) = self.http.execute(builder).await?;
        serde_json::from_str(&text).map_err(|e| {
            warn!("session endpoint returned a malformed body: {e}");
            AcquisitionError::RequestFailed {
                status: Some(status),
                body: text,
            }
        })
    }
}

#[async_trait]
impl SessionAcquirer for SessionRequestClient {
    async fn acquire_session(&self) -> Result<SessionDescriptor, AcquisitionError> {
        let payload = self.fetch_raw().await?;
        let descriptor = classify(&payload)?;
        info!(
            transport = %descriptor.transport_kind(),
            session_id = descriptor.session_id().unwrap_or("-"),
            "session acquired"
        );
        Ok(descriptor)
    }
}
