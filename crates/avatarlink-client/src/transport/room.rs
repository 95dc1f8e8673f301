use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use avatarlink_common::protocol::{StartRequest, StopRequest};

use super::{EventSender, NegotiationError, TeardownError, Transport};
use crate::media::{lock_bindings, MediaSinks, RemoteTrack, SinkBindings, TransportEvent};
use crate::proxy::BackendClient;
use crate::session::{RoomSession, TransportKind};

/// What a joined room reports.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    TrackSubscribed(RemoteTrack),
    TrackUnsubscribed(RemoteTrack),
    Disconnected(String),
}

/// A joined room.
#[async_trait]
pub trait RoomConnection: Send {
    async fn disconnect(&mut self) -> Result<(), TeardownError>;
}

/// Joins real-time-media rooms.
#[async_trait]
pub trait RoomConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(Box<dyn RoomConnection>, mpsc::UnboundedReceiver<RoomEvent>), NegotiationError>;
}

/// Used when no room SDK is compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableRoomConnector;

#[async_trait]
impl RoomConnector for UnavailableRoomConnector {
    async fn connect(
        &self,
        url: &str,
        _token: &str,
    ) -> Result<(Box<dyn RoomConnection>, mpsc::UnboundedReceiver<RoomEvent>), NegotiationError>
    {
        Err(NegotiationError::setup(format!(
            "cannot join room {url}: built without the `livekit` feature"
        )))
    }
}

/// Joins the room, then asks the provider to start streaming into it.
pub struct MediaRoomTransport {
    session: RoomSession,
    http: BackendClient,
    rooms: Arc<dyn RoomConnector>,
    bearer: Option<String>,
    room: Option<Box<dyn RoomConnection>>,
    pump: Option<JoinHandle<()>>,
    bindings: Option<Arc<Mutex<SinkBindings>>>,
    started: bool,
    closed: bool,
}

impl MediaRoomTransport {
    pub fn new(session: RoomSession, http: BackendClient, rooms: Arc<dyn RoomConnector>) -> Self {
        Self {
            session,
            http,
            rooms,
            bearer: None,
            room: None,
            pump: None,
            bindings: None,
            started: false,
            closed: false,
        }
    }

    /// Authorises `streaming.start`/`streaming.stop` with a session token.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

/// Best-effort `streaming.stop`; failures are only logged.
pub(crate) async fn stop_remote(http: &BackendClient, session_id: &str, bearer: Option<&str>) {
    let url = http.provider_url("streaming.stop");
    let body = StopRequest {
        session_id: session_id.to_string(),
    };
    if let Err(e) = http.post_json(&url, &body, bearer, None).await {
        warn!(session_id, "streaming.stop failed: {e}");
    }
}

#[async_trait]
impl Transport for MediaRoomTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::MediaRoom
    }

    fn session_id(&self) -> Option<&str> {
        Some(&self.session.session_id)
    }

    async fn establish(
        &mut self,
        events: EventSender,
        sinks: MediaSinks,
    ) -> Result<(), NegotiationError> {
        if self.closed || self.room.is_some() {
            return Err(NegotiationError::setup("room transport already used"));
        }

        info!(session_id = %self.session.session_id, url = %self.session.room_url, "joining media room");
        let (room, room_events) = self
            .rooms
            .connect(&self.session.room_url, &self.session.access_token)
            .await?;
        self.room = Some(room);

        let bindings = SinkBindings::shared(sinks);
        self.bindings = Some(Arc::clone(&bindings));
        self.pump = Some(tokio::spawn(pump_room_events(room_events, bindings, events)));

        let url = self.http.provider_url("streaming.start");
        let body = StartRequest {
            session_id: self.session.session_id.clone(),
            sdp: None,
        };
        self.http
            .post_json(&url, &body, self.bearer.as_deref(), None)
            .await?;
        self.started = true;

        info!(session_id = %self.session.session_id, "room streaming started");
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), TeardownError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(bindings) = self.bindings.take() {
            lock_bindings(&bindings).release_all();
        }
        if self.started {
            self.started = false;
            stop_remote(&self.http, &self.session.session_id, self.bearer.as_deref()).await;
        }
        if let Some(mut room) = self.room.take() {
            room.disconnect().await?;
        }
        debug!(session_id = %self.session.session_id, "room transport closed");
        Ok(())
    }
}

async fn pump_room_events(
    mut rx: mpsc::UnboundedReceiver<RoomEvent>,
    bindings: Arc<Mutex<SinkBindings>>,
    events: EventSender,
) {
    while let Some(event) = rx.recv().await {
        let forwarded = match event {
            RoomEvent::TrackSubscribed(track) => {
                lock_bindings(&bindings).bind(&track);
                TransportEvent::MediaReady(track)
            }
            RoomEvent::TrackUnsubscribed(track) => {
                lock_bindings(&bindings).unbind(&track);
                TransportEvent::MediaEnded(track)
            }
            RoomEvent::Disconnected(reason) => {
                let _ = events.send(TransportEvent::Disconnected(reason));
                break;
            }
        };
        if events.send(forwarded).is_err() {
            break;
        }
    }
}
