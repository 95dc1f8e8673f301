//! Media transports, one per session shape.
//!
//! Every transport reports through the same [`TransportEvent`] channel and
//! shares one teardown contract: close the connection, release bound sinks,
//! become inert. Tearing down twice is a no-op.

mod legacy;
#[cfg(feature = "livekit")]
mod livekit_room;
mod peer;
mod room;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{AvatarOptions, ClientConfig};
use crate::media::{MediaSinks, TransportEvent};
use crate::proxy::{status_label, BackendClient, RequestFailure};
use crate::session::{SessionDescriptor, TransportKind};

pub use legacy::{AvatarSdk, HttpAvatarSdk, LegacySdkTransport, SdkEvent};
#[cfg(feature = "livekit")]
pub use livekit_room::LiveKitConnector;
pub use peer::{PeerOptions, RawWebRtcTransport};
pub use room::{
    MediaRoomTransport, RoomConnection, RoomConnector, RoomEvent, UnavailableRoomConnector,
};

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("transport setup failed: {0}")]
    TransportSetupFailed(String),
    #[error("handshake rejected ({}): {body}", status_label(.status))]
    HandshakeRejected { status: Option<u16>, body: String },
}

impl NegotiationError {
    pub fn setup(msg: impl fmt::Display) -> Self {
        Self::TransportSetupFailed(msg.to_string())
    }
}

impl From<RequestFailure> for NegotiationError {
    fn from(failure: RequestFailure) -> Self {
        Self::HandshakeRejected {
            status: failure.status,
            body: failure.body,
        }
    }
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        Self::setup(err)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("teardown failed: {0}")]
pub struct TeardownError(pub String);

/// A live media connection for one session.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Provider session id, once known.
    fn session_id(&self) -> Option<&str>;

    /// Negotiates media. Returns once the handshake is accepted; tracks are
    /// reported afterwards (or during) as [`TransportEvent::MediaReady`].
    async fn establish(
        &mut self,
        events: EventSender,
        sinks: MediaSinks,
    ) -> Result<(), NegotiationError>;

    async fn teardown(&mut self) -> Result<(), TeardownError>;
}

/// Picks the transport for an acquired session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, descriptor: SessionDescriptor) -> Box<dyn Transport>;
}

/// Factory wiring the shipped transports to one backend.
#[derive(Clone)]
pub struct DefaultTransports {
    http: BackendClient,
    rooms: Arc<dyn RoomConnector>,
    peer: PeerOptions,
    avatar: AvatarOptions,
}

impl DefaultTransports {
    pub fn new(http: BackendClient, config: &ClientConfig) -> Self {
        Self {
            http,
            rooms: default_room_connector(),
            peer: PeerOptions::from_config(config),
            avatar: config.avatar.clone(),
        }
    }

    pub fn with_room_connector(mut self, rooms: Arc<dyn RoomConnector>) -> Self {
        self.rooms = rooms;
        self
    }
}

impl TransportFactory for DefaultTransports {
    fn create(&self, descriptor: SessionDescriptor) -> Box<dyn Transport> {
        match descriptor {
            SessionDescriptor::Token(session) => {
                let sdk = HttpAvatarSdk::new(
                    self.http.clone(),
                    Arc::clone(&self.rooms),
                    self.avatar.clone(),
                );
                Box::new(LegacySdkTransport::new(session, Box::new(sdk)))
            }
            SessionDescriptor::Offer(session) => Box::new(RawWebRtcTransport::new(
                session,
                self.http.clone(),
                self.peer.clone(),
            )),
            SessionDescriptor::Room(session) => Box::new(MediaRoomTransport::new(
                session,
                self.http.clone(),
                Arc::clone(&self.rooms),
            )),
        }
    }
}

/// LiveKit when compiled in, otherwise a connector that refuses every room.
pub fn default_room_connector() -> Arc<dyn RoomConnector> {
    #[cfg(feature = "livekit")]
    {
        Arc::new(LiveKitConnector)
    }
    #[cfg(not(feature = "livekit"))]
    {
        Arc::new(UnavailableRoomConnector)
    }
}
