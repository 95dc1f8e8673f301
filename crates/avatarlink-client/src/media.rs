//! Remote tracks, the sinks they bind to, and the notifications transports emit.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// A remote media track delivered by a transport.
#[derive(Clone)]
pub struct RemoteTrack {
    pub kind: TrackKind,
    pub id: String,
    /// RTP source for direct peer connections; room tracks are read through
    /// the room SDK instead.
    pub rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            rtp: None,
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("rtp", &self.rtp.is_some())
            .finish()
    }
}

/// What every transport reports while it is alive.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    MediaReady(RemoteTrack),
    MediaEnded(RemoteTrack),
    MediaError(String),
    Disconnected(String),
}

/// Somewhere a remote track can be rendered.
pub trait MediaSink: Send + Sync {
    fn attach(&self, track: &RemoteTrack);
    fn detach(&self);
}

/// Audio output with a local mute switch.
pub trait AudioSink: MediaSink {
    fn set_muted(&self, muted: bool);
    fn is_muted(&self) -> bool;
}

/// The visual and audio sinks of one UI surface.
#[derive(Clone)]
pub struct MediaSinks {
    pub video: Arc<dyn MediaSink>,
    pub audio: Arc<dyn AudioSink>,
}

impl MediaSinks {
    pub fn new(video: Arc<dyn MediaSink>, audio: Arc<dyn AudioSink>) -> Self {
        Self { video, audio }
    }

    /// Sinks that only record what would have been rendered.
    pub fn headless() -> Self {
        Self::new(
            Arc::new(HeadlessSink::new("video")),
            Arc::new(HeadlessSink::new("audio")),
        )
    }
}

impl fmt::Debug for MediaSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSinks").finish_non_exhaustive()
    }
}

/// Which tracks a transport currently has bound to the sinks.
///
/// Release happens at most once per binding, however many times teardown runs.
pub struct SinkBindings {
    sinks: MediaSinks,
    video: Option<String>,
    audio: Option<String>,
}

impl SinkBindings {
    pub fn new(sinks: MediaSinks) -> Self {
        Self {
            sinks,
            video: None,
            audio: None,
        }
    }

    pub fn shared(sinks: MediaSinks) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(sinks)))
    }

    pub fn bind(&mut self, track: &RemoteTrack) {
        match track.kind {
            TrackKind::Video => {
                self.sinks.video.attach(track);
                self.video = Some(track.id.clone());
            }
            TrackKind::Audio => {
                self.sinks.audio.attach(track);
                self.audio = Some(track.id.clone());
            }
        }
        debug!(kind = %track.kind, id = %track.id, "track bound to sink");
    }

    /// Detaches the sink only if `track` is the one bound to it.
    pub fn unbind(&mut self, track: &RemoteTrack) -> bool {
        let slot = match track.kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        };
        if slot.as_deref() != Some(track.id.as_str()) {
            return false;
        }
        *slot = None;
        match track.kind {
            TrackKind::Video => self.sinks.video.detach(),
            TrackKind::Audio => self.sinks.audio.detach(),
        }
        true
    }

    pub fn release_all(&mut self) {
        if self.video.take().is_some() {
            self.sinks.video.detach();
        }
        if self.audio.take().is_some() {
            self.sinks.audio.detach();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// Locks a binding table, recovering it if a callback panicked while holding it.
pub(crate) fn lock_bindings(bindings: &Mutex<SinkBindings>) -> std::sync::MutexGuard<'_, SinkBindings> {
    bindings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sink without an output device. Logs what it is given and keeps counters,
/// which is all the terminal front end needs.
#[derive(Debug)]
pub struct HeadlessSink {
    label: &'static str,
    attached: AtomicUsize,
    detached: AtomicUsize,
    muted: AtomicBool,
}

impl HeadlessSink {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            attached: AtomicUsize::new(0),
            detached: AtomicUsize::new(0),
            muted: AtomicBool::new(false),
        }
    }

    pub fn attach_count(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn detach_count(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }
}

impl MediaSink for HeadlessSink {
    fn attach(&self, track: &RemoteTrack) {
        self.attached.fetch_add(1, Ordering::SeqCst);
        info!(sink = self.label, track = %track.id, "remote {} track attached", track.kind);
    }

    fn detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
        info!(sink = self.label, "sink released");
    }
}

impl AudioSink for HeadlessSink {
    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
        debug!(sink = self.label, muted, "mute state changed");
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }
}
