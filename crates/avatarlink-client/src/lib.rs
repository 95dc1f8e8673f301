pub mod capture;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod knowledge;
pub mod media;
pub mod proxy;
pub mod session;
pub mod transport;

pub use capture::{run_capture, CaptureBridge, RecognitionEvent};
pub use config::{AvatarOptions, AvatarQuality, ClientConfig};
pub use controller::{
    Affordances, ControllerStatus, EndOutcome, LifecycleState, SessionController, SessionError,
    StartOutcome, Timeouts,
};
pub use dispatch::{DispatchError, Dispatcher, InterruptOutcome, UtteranceTask};
pub use knowledge::{EnrollmentQuery, KnowledgeError, KnowledgeRouter, Route};
pub use media::{
    AudioSink, HeadlessSink, MediaSink, MediaSinks, RemoteTrack, TrackKind, TransportEvent,
};
pub use proxy::{BackendClient, ProviderRoute, RequestFailure};
pub use session::{
    classify, AcquisitionError, OfferSession, RoomSession, SessionAcquirer, SessionDescriptor,
    SessionRequestClient, TokenSession, TransportKind,
};
pub use transport::{
    DefaultTransports, NegotiationError, TeardownError, Transport, TransportFactory,
};

pub use avatarlink_common::protocol::TaskType;
