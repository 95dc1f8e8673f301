use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use avatarlink_common::protocol::{NewSessionData, NewSessionRequest, ProviderEnvelope};

use super::room::{MediaRoomTransport, RoomConnector};
use super::{EventSender, NegotiationError, TeardownError, Transport};
use crate::config::AvatarOptions;
use crate::media::{MediaSinks, RemoteTrack, TransportEvent};
use crate::proxy::BackendClient;
use crate::session::{RoomSession, TokenSession, TransportKind};

/// Signals raised by an avatar SDK client.
#[derive(Debug, Clone)]
pub enum SdkEvent {
    StreamReady(RemoteTrack),
    StreamDisconnected,
    Error(String),
}

/// The provider's streaming-avatar client object, driven by a session token.
#[async_trait]
pub trait AvatarSdk: Send {
    /// Creates and starts an avatar session, returning its id.
    async fn create_start_avatar(
        &mut self,
        token: &str,
        events: mpsc::UnboundedSender<SdkEvent>,
        sinks: MediaSinks,
    ) -> Result<String, NegotiationError>;

    async fn stop_avatar(&mut self) -> Result<(), TeardownError>;
}

/// Token session handed to an [`AvatarSdk`]; its signals are passed through
/// unchanged.
pub struct LegacySdkTransport {
    session: TokenSession,
    sdk: Box<dyn AvatarSdk>,
    session_id: Option<String>,
    forward: Option<JoinHandle<()>>,
    closed: bool,
}

impl LegacySdkTransport {
    pub fn new(session: TokenSession, sdk: Box<dyn AvatarSdk>) -> Self {
        Self {
            session,
            sdk,
            session_id: None,
            forward: None,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for LegacySdkTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LegacySdk
    }

    fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    async fn establish(
        &mut self,
        events: EventSender,
        sinks: MediaSinks,
    ) -> Result<(), NegotiationError> {
        if self.closed {
            return Err(NegotiationError::setup("sdk transport already torn down"));
        }

        let (sdk_tx, sdk_rx) = mpsc::unbounded_channel();
        self.forward = Some(tokio::spawn(forward_sdk_events(sdk_rx, events)));

        let session_id = self
            .sdk
            .create_start_avatar(&self.session.token, sdk_tx, sinks)
            .await?;
        info!(session_id = %session_id, "avatar sdk session started");
        self.session_id = Some(session_id);
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), TeardownError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = self.sdk.stop_avatar().await;
        if let Some(forward) = self.forward.take() {
            forward.abort();
        }
        self.session_id = None;
        result
    }
}

async fn forward_sdk_events(mut rx: mpsc::UnboundedReceiver<SdkEvent>, events: EventSender) {
    while let Some(event) = rx.recv().await {
        let forwarded = match event {
            SdkEvent::StreamReady(track) => TransportEvent::MediaReady(track),
            SdkEvent::Error(msg) => TransportEvent::MediaError(msg),
            SdkEvent::StreamDisconnected => {
                TransportEvent::Disconnected("stream disconnected".to_string())
            }
        };
        if events.send(forwarded).is_err() {
            break;
        }
    }
}

/// SDK client speaking the provider's HTTP API through the backend proxy:
/// `streaming.new` with the token, join the returned room, `streaming.start`.
pub struct HttpAvatarSdk {
    http: BackendClient,
    rooms: Arc<dyn RoomConnector>,
    avatar: AvatarOptions,
    room: Option<MediaRoomTransport>,
    relay: Option<JoinHandle<()>>,
}

impl HttpAvatarSdk {
    pub fn new(http: BackendClient, rooms: Arc<dyn RoomConnector>, avatar: AvatarOptions) -> Self {
        Self {
            http,
            rooms,
            avatar,
            room: None,
            relay: None,
        }
    }
}

/// `streaming.new` authorised by the session token.
async fn request_new_session(
    http: &BackendClient,
    avatar: &AvatarOptions,
    token: &str,
) -> Result<NewSessionData, NegotiationError> {
    let url = http.provider_url("streaming.new");
    let body = NewSessionRequest {
        quality: avatar.quality.as_str().to_string(),
        avatar_name: avatar.avatar_id.clone(),
        version: "v2".to_string(),
        video_encoding: "H264".to_string(),
    };
    let payload = http.post_json(&url, &body, Some(token), None).await?;
    parse_new_session(payload)
}

fn parse_new_session(payload: Value) -> Result<NewSessionData, NegotiationError> {
    if let Ok(ProviderEnvelope {
        data: Some(data), ..
    }) = serde_json::from_value::<ProviderEnvelope<NewSessionData>>(payload.clone())
    {
        return Ok(data);
    }
    serde_json::from_value::<NewSessionData>(payload)
        .map_err(|e| NegotiationError::setup(format!("streaming.new returned no session: {e}")))
}

#[async_trait]
impl AvatarSdk for HttpAvatarSdk {
    async fn create_start_avatar(
        &mut self,
        token: &str,
        events: mpsc::UnboundedSender<SdkEvent>,
        sinks: MediaSinks,
    ) -> Result<String, NegotiationError> {
        let data = request_new_session(&self.http, &self.avatar, token).await?;
        debug!(session_id = %data.session_id, url = %data.url, "provider session created");

        let session_id = data.session_id.clone();
        let mut room = MediaRoomTransport::new(
            RoomSession {
                session_id: data.session_id,
                room_url: data.url,
                access_token: data.access_token,
            },
            self.http.clone(),
            Arc::clone(&self.rooms),
        )
        .with_bearer(token);

        let (room_tx, room_rx) = mpsc::unbounded_channel();
        self.relay = Some(tokio::spawn(relay_room_events(room_rx, events)));
        let established = room.establish(room_tx, sinks).await;
        // Kept even on failure so stop_avatar can release what was joined.
        self.room = Some(room);
        established?;
        Ok(session_id)
    }

    async fn stop_avatar(&mut self) -> Result<(), TeardownError> {
        let result = match self.room.as_mut() {
            Some(room) => room.teardown().await,
            None => Ok(()),
        };
        self.room = None;
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
        result
    }
}

async fn relay_room_events(
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
    events: mpsc::UnboundedSender<SdkEvent>,
) {
    while let Some(event) = rx.recv().await {
        let signal = match event {
            TransportEvent::MediaReady(track) => SdkEvent::StreamReady(track),
            TransportEvent::MediaError(msg) => SdkEvent::Error(msg),
            TransportEvent::Disconnected(_) => SdkEvent::StreamDisconnected,
            TransportEvent::MediaEnded(track) => {
                debug!(track = %track.id, "sdk track ended");
                continue;
            }
        };
        if events.send(signal).is_err() {
            break;
        }
    }
}
