use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use avatarlink_common::protocol::{IceRequest, SessionDescriptionWire, StartRequest};

use super::room::stop_remote;
use super::{EventSender, NegotiationError, TeardownError, Transport};
use crate::config::ClientConfig;
use crate::media::{
    lock_bindings, MediaSinks, RemoteTrack, SinkBindings, TrackKind, TransportEvent,
};
use crate::proxy::BackendClient;
use crate::session::{OfferSession, TransportKind};

/// Local peer settings.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Used when the offer comes without ICE servers.
    pub ice_servers: Vec<String>,
    pub attach_microphone: bool,
}

impl PeerOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            attach_microphone: config.attach_microphone,
        }
    }
}

/// Local candidates held back until the provider has accepted the answer.
#[derive(Default)]
struct IceTrickle {
    accepted: bool,
    pending: Vec<Value>,
}

fn lock_trickle(trickle: &Mutex<IceTrickle>) -> MutexGuard<'_, IceTrickle> {
    trickle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Direct peer connection answering a provider-generated offer.
pub struct RawWebRtcTransport {
    session: OfferSession,
    http: BackendClient,
    options: PeerOptions,
    pc: Option<Arc<RTCPeerConnection>>,
    microphone: Option<Arc<TrackLocalStaticSample>>,
    bindings: Option<Arc<Mutex<SinkBindings>>>,
    trickle: Arc<Mutex<IceTrickle>>,
    local_answer: Option<String>,
    started: bool,
    closed: bool,
}

impl RawWebRtcTransport {
    pub fn new(session: OfferSession, http: BackendClient, options: PeerOptions) -> Self {
        Self {
            session,
            http,
            options,
            pc: None,
            microphone: None,
            bindings: None,
            trickle: Arc::new(Mutex::new(IceTrickle::default())),
            local_answer: None,
            started: false,
            closed: false,
        }
    }

    /// The answer SDP sent back to the provider.
    pub fn local_answer(&self) -> Option<&str> {
        self.local_answer.as_deref()
    }

    /// Outgoing microphone track; write Opus samples into it.
    pub fn microphone(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.microphone.clone()
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if !self.session.ice_servers.is_empty() {
            self.session
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect()
        } else if self.options.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.options.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    async fn new_peer_connection(&self) -> Result<RTCPeerConnection, NegotiationError> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut m)?;
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();
        Ok(api.new_peer_connection(self.rtc_configuration()).await?)
    }

    fn install_handlers(
        &self,
        pc: &RTCPeerConnection,
        events: &EventSender,
        bindings: &Arc<Mutex<SinkBindings>>,
    ) {
        let track_events = events.clone();
        let track_bindings = Arc::clone(bindings);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            let bindings = Arc::clone(&track_bindings);
            Box::pin(async move {
                let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
                    return;
                };
                let remote = RemoteTrack {
                    kind,
                    id: track.id(),
                    rtp: Some(track),
                };
                lock_bindings(&bindings).bind(&remote);
                let _ = events.send(TransportEvent::MediaReady(remote));
            })
        }));

        let state_events = events.clone();
        let session_id = self.session.session_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let session_id = session_id.clone();
            Box::pin(async move {
                debug!(session_id = %session_id, %state, "peer connection state changed");
                if let Some(event) = state_event(state) {
                    let _ = events.send(event);
                }
            })
        }));

        let http = self.http.clone();
        let trickle = Arc::clone(&self.trickle);
        let session_id = self.session.session_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let http = http.clone();
            let trickle = Arc::clone(&trickle);
            let session_id = session_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let json = match candidate.to_json().map(serde_json::to_value) {
                    Ok(Ok(json)) => json,
                    _ => {
                        warn!("dropping local ICE candidate that failed to serialize");
                        return;
                    }
                };
                {
                    let mut trickle = lock_trickle(&trickle);
                    if !trickle.accepted {
                        trickle.pending.push(json);
                        return;
                    }
                }
                send_candidate(&http, &session_id, json).await;
            })
        }));
    }

    async fn flush_candidates(&self) {
        let pending = {
            let mut trickle = lock_trickle(&self.trickle);
            trickle.accepted = true;
            std::mem::take(&mut trickle.pending)
        };
        for candidate in pending {
            send_candidate(&self.http, &self.session.session_id, candidate).await;
        }
    }
}

/// Terminal peer states only. `Disconnected` is often transient and either
/// recovers or escalates to `Failed` once ICE gives up.
fn state_event(state: RTCPeerConnectionState) -> Option<TransportEvent> {
    match state {
        RTCPeerConnectionState::Failed => Some(TransportEvent::MediaError(
            "peer connection failed".to_string(),
        )),
        RTCPeerConnectionState::Closed => Some(TransportEvent::Disconnected(
            "peer connection closed".to_string(),
        )),
        _ => None,
    }
}

async fn send_candidate(http: &BackendClient, session_id: &str, candidate: Value) {
    let url = http.provider_url("streaming.ice");
    let body = IceRequest {
        session_id: session_id.to_string(),
        candidate,
    };
    if let Err(e) = http.post_json(&url, &body, None, None).await {
        warn!(session_id, "streaming.ice failed: {e}");
    }
}

#[async_trait]
impl Transport for RawWebRtcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RawWebRtc
    }

    fn session_id(&self) -> Option<&str> {
        Some(&self.session.session_id)
    }

    async fn establish(
        &mut self,
        events: EventSender,
        sinks: MediaSinks,
    ) -> Result<(), NegotiationError> {
        if self.closed || self.pc.is_some() {
            return Err(NegotiationError::setup("peer transport already used"));
        }

        let pc = Arc::new(self.new_peer_connection().await?);
        // Stored before anything can fail so teardown always closes it.
        self.pc = Some(Arc::clone(&pc));

        let bindings = SinkBindings::shared(sinks);
        self.bindings = Some(Arc::clone(&bindings));
        self.install_handlers(&pc, &events, &bindings);

        pc.set_remote_description(RTCSessionDescription::offer(
            self.session.remote_offer.clone(),
        )?)
        .await?;

        if self.options.attach_microphone {
            let mic = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_string(),
                "avatarlink-mic".to_string(),
            ));
            pc.add_track(Arc::clone(&mic) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            self.microphone = Some(mic);
        }

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        self.local_answer = Some(answer.sdp.clone());

        let url = self.http.provider_url("streaming.start");
        let body = StartRequest {
            session_id: self.session.session_id.clone(),
            sdp: Some(SessionDescriptionWire::answer(answer.sdp)),
        };
        self.http.post_json(&url, &body, None, None).await?;
        self.started = true;
        info!(session_id = %self.session.session_id, "answer accepted by provider");

        self.flush_candidates().await;
        Ok(())
    }

    async fn teardown(&mut self) -> Result<(), TeardownError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(bindings) = self.bindings.take() {
            lock_bindings(&bindings).release_all();
        }
        self.microphone = None;

        if self.started {
            self.started = false;
            stop_remote(&self.http, &self.session.session_id, None).await;
        }

        if let Some(pc) = self.pc.take() {
            pc.close()
                .await
                .map_err(|e| TeardownError(format!("closing peer connection: {e}")))?;
        }
        debug!(session_id = %self.session.session_id, "peer transport closed");
        Ok(())
    }
}
