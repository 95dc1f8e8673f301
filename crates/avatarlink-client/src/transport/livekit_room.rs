use async_trait::async_trait;
use livekit::{Room, RoomEvent as LkRoomEvent, RoomOptions};
use livekit::track::RemoteTrack as LkRemoteTrack;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::room::{RoomConnection, RoomConnector, RoomEvent};
use super::{NegotiationError, TeardownError};
use crate::media::{RemoteTrack, TrackKind};

/// Joins LiveKit rooms.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveKitConnector;

#[async_trait]
impl RoomConnector for LiveKitConnector {
    async fn connect(
        &self,
        url: &str,
        token: &str,
    ) -> Result<(Box<dyn RoomConnection>, mpsc::UnboundedReceiver<RoomEvent>), NegotiationError>
    {
        let (room, mut lk_events) = Room::connect(url, token, RoomOptions::default())
            .await
            .map_err(|e| NegotiationError::setup(format!("room connect failed: {e}")))?;
        info!(url, "connected to livekit room");

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            while let Some(event) = lk_events.recv().await {
                let mapped = match event {
                    LkRoomEvent::TrackSubscribed { track, .. } => {
                        RoomEvent::TrackSubscribed(convert_track(&track))
                    }
                    LkRoomEvent::TrackUnsubscribed { track, .. } => {
                        RoomEvent::TrackUnsubscribed(convert_track(&track))
                    }
                    LkRoomEvent::Disconnected { reason } => {
                        RoomEvent::Disconnected(format!("{reason:?}"))
                    }
                    other => {
                        debug!("ignoring room event: {other:?}");
                        continue;
                    }
                };
                if tx.send(mapped).is_err() {
                    break;
                }
            }
        });

        Ok((
            Box::new(LiveKitRoom {
                room: Some(room),
                pump,
            }),
            rx,
        ))
    }
}

fn convert_track(track: &LkRemoteTrack) -> RemoteTrack {
    match track {
        LkRemoteTrack::Audio(audio) => RemoteTrack::new(TrackKind::Audio, audio.sid().to_string()),
        LkRemoteTrack::Video(video) => RemoteTrack::new(TrackKind::Video, video.sid().to_string()),
    }
}

struct LiveKitRoom {
    room: Option<Room>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl RoomConnection for LiveKitRoom {
    async fn disconnect(&mut self) -> Result<(), TeardownError> {
        self.pump.abort();
        if let Some(room) = self.room.take() {
            room.close()
                .await
                .map_err(|e| TeardownError(format!("closing room: {e}")))?;
        }
        Ok(())
    }
}
