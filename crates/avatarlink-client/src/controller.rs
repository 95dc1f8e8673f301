//! Session lifecycle: `Idle → Starting → Active → Ending → Idle`.
//!
//! The controller owns the only live transport. State changes happen under one
//! lock and are published on a watch channel before the entry point that made
//! them returns or suspends, so a second `start` or `end` always sees the
//! first one.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use avatarlink_common::protocol::TaskType;

use crate::config::ClientConfig;
use crate::dispatch::{DispatchError, Dispatcher, InterruptOutcome, UtteranceTask};
use crate::media::{MediaSinks, RemoteTrack, TransportEvent};
use crate::proxy::BackendClient;
use crate::session::{AcquisitionError, SessionAcquirer, SessionRequestClient, TransportKind};
use crate::transport::{
    DefaultTransports, NegotiationError, RoomConnector, Transport, TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Active,
    Ending,
}

/// Which controls the UI should offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Affordances {
    pub start: bool,
    pub end: bool,
    pub speak: bool,
    /// Press-to-talk capture.
    pub talk: bool,
}

impl Affordances {
    pub fn for_state(state: LifecycleState) -> Self {
        match state {
            LifecycleState::Idle => Self {
                start: true,
                ..Self::default()
            },
            LifecycleState::Starting => Self {
                end: true,
                ..Self::default()
            },
            LifecycleState::Active => Self {
                start: false,
                end: true,
                speak: true,
                talk: true,
            },
            LifecycleState::Ending => Self::default(),
        }
    }
}

/// Snapshot published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub state: LifecycleState,
    pub affordances: Affordances,
    pub session_id: Option<String>,
    pub transport: Option<TransportKind>,
}

impl ControllerStatus {
    fn idle() -> Self {
        Self {
            state: LifecycleState::Idle,
            affordances: Affordances::for_state(LifecycleState::Idle),
            session_id: None,
            transport: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started {
        session_id: Option<String>,
        transport: TransportKind,
    },
    /// A session was already starting, running or ending.
    Ignored(LifecycleState),
    /// `end` was called before the session became active.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    Ended,
    AlreadyIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub acquire: Duration,
    pub media: Duration,
    pub teardown: Duration,
}

impl Timeouts {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            acquire: config.acquire_timeout,
            media: config.media_timeout,
            teardown: config.teardown_timeout,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

struct Inner {
    state: LifecycleState,
    /// Bumped by every accepted start; stale attempts never touch newer state.
    attempt: u64,
    session_id: Option<String>,
    transport_kind: Option<TransportKind>,
    active: Option<Box<dyn Transport>>,
    pump: Option<JoinHandle<()>>,
    cancel: Option<watch::Sender<bool>>,
}

struct Shared {
    inner: Mutex<Inner>,
    status: watch::Sender<ControllerStatus>,
    /// Last attempt that settled back to `Idle`.
    settled: watch::Sender<u64>,
    acquirer: Arc<dyn SessionAcquirer>,
    transports: Arc<dyn TransportFactory>,
    dispatcher: Dispatcher,
    sinks: MediaSinks,
    timeouts: Timeouts,
}

/// Drives one avatar session at a time.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        acquirer: Arc<dyn SessionAcquirer>,
        transports: Arc<dyn TransportFactory>,
        dispatcher: Dispatcher,
        sinks: MediaSinks,
        timeouts: Timeouts,
    ) -> Self {
        let (status, _) = watch::channel(ControllerStatus::idle());
        let (settled, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: LifecycleState::Idle,
                    attempt: 0,
                    session_id: None,
                    transport_kind: None,
                    active: None,
                    pump: None,
                    cancel: None,
                }),
                status,
                settled,
                acquirer,
                transports,
                dispatcher,
                sinks,
                timeouts,
            }),
        }
    }

    /// Wires the shipped session client, transports and dispatcher to one backend.
    pub fn from_config(
        config: &ClientConfig,
        sinks: MediaSinks,
        rooms: Option<Arc<dyn RoomConnector>>,
    ) -> avatarlink_common::Result<Self> {
        config.validate()?;
        let http = BackendClient::new(config)?;
        let mut transports = DefaultTransports::new(http.clone(), config);
        if let Some(rooms) = rooms {
            transports = transports.with_room_connector(rooms);
        }
        Ok(Self::new(
            Arc::new(SessionRequestClient::new(http.clone(), config)),
            Arc::new(transports),
            Dispatcher::new(http),
            sinks,
            Timeouts::from_config(config),
        ))
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lock().state
    }

    pub fn status(&self) -> ControllerStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.shared.status.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().session_id.clone()
    }

    pub fn sinks(&self) -> &MediaSinks {
        &self.shared.sinks
    }

    /// Acquires a session and negotiates its transport. Returns once the
    /// session is active, has failed, or was cancelled by `end`.
    pub async fn start(&self) -> Result<StartOutcome, SessionError> {
        let (attempt, cancel_rx) = {
            let mut inner = self.shared.lock();
            if inner.state != LifecycleState::Idle {
                debug!(state = ?inner.state, "start ignored");
                return Ok(StartOutcome::Ignored(inner.state));
            }
            inner.attempt += 1;
            let (cancel_tx, cancel_rx) = watch::channel(false);
            inner.cancel = Some(cancel_tx);
            self.shared.publish(&mut inner, LifecycleState::Starting);
            (inner.attempt, cancel_rx)
        };
        info!(attempt, "starting avatar session");

        let mut guard = StartGuard {
            shared: Arc::clone(&self.shared),
            attempt,
            armed: true,
        };
        let handle = tokio::spawn(run_attempt(Arc::clone(&self.shared), attempt, cancel_rx));
        let joined = handle.await;
        guard.armed = false;

        match joined {
            Ok(result) => result,
            Err(e) => {
                self.shared.settle_idle(attempt);
                Err(NegotiationError::setup(format!("start task aborted: {e}")).into())
            }
        }
    }

    /// Ends the current session, or abandons one that is still starting.
    /// Returns once the controller is idle again.
    pub async fn end(&self) -> EndOutcome {
        let mut settled_rx = self.shared.settled.subscribe();
        let teardown = {
            let mut inner = self.shared.lock();
            match inner.state {
                LifecycleState::Idle => return EndOutcome::AlreadyIdle,
                LifecycleState::Ending => Err(inner.attempt),
                LifecycleState::Starting => {
                    if let Some(cancel) = &inner.cancel {
                        let _ = cancel.send(true);
                    }
                    self.shared.publish(&mut inner, LifecycleState::Ending);
                    Err(inner.attempt)
                }
                LifecycleState::Active => {
                    let transport = inner.active.take();
                    if let Some(pump) = inner.pump.take() {
                        pump.abort();
                    }
                    self.shared.publish(&mut inner, LifecycleState::Ending);
                    Ok((transport, inner.attempt))
                }
            }
        };

        match teardown {
            Ok((transport, attempt)) => {
                info!(attempt, "ending avatar session");
                self.shared.finish(attempt, transport).await;
            }
            // Someone else is already winding this attempt down. A later
            // session may start as soon as it settles, so wait on the attempt
            // rather than on the next `Idle`.
            Err(attempt) => {
                let _ = settled_rx.wait_for(|settled| *settled >= attempt).await;
            }
        }
        EndOutcome::Ended
    }

    /// Sends an utterance to the active session. Unmutes the audio sink first
    /// so a previous interrupt does not swallow it.
    pub async fn speak(&self, text: &str, mode: TaskType) -> Result<(), DispatchError> {
        let session_id = self.active_session_id()?;
        let task = UtteranceTask::new(session_id, text, mode)?;
        self.shared.sinks.audio.set_muted(false);
        self.shared.dispatcher.send(&task).await
    }

    /// Silences the avatar locally and asks the provider to cut off.
    pub async fn interrupt(&self) -> Result<InterruptOutcome, DispatchError> {
        let session_id = self.active_session_id()?;
        Ok(self
            .shared
            .dispatcher
            .interrupt(&session_id, self.shared.sinks.audio.as_ref())
            .await)
    }

    fn active_session_id(&self) -> Result<String, DispatchError> {
        let inner = self.shared.lock();
        match (&inner.state, &inner.session_id) {
            (LifecycleState::Active, Some(session_id)) => Ok(session_id.clone()),
            _ => Err(DispatchError::NotActive),
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, inner: &mut Inner, state: LifecycleState) {
        inner.state = state;
        self.status.send_replace(ControllerStatus {
            state,
            affordances: Affordances::for_state(state),
            session_id: inner.session_id.clone(),
            transport: inner.transport_kind,
        });
        debug!(?state, "lifecycle transition");
    }

    fn settle_idle(&self, attempt: u64) {
        let mut inner = self.lock();
        if inner.attempt != attempt || inner.state == LifecycleState::Idle {
            return;
        }
        inner.session_id = None;
        inner.transport_kind = None;
        inner.active = None;
        inner.pump = None;
        inner.cancel = None;
        self.publish(&mut inner, LifecycleState::Idle);
        self.settled.send_replace(attempt);
    }

    /// Bounded teardown. Errors and timeouts are logged, never returned.
    async fn teardown(&self, mut transport: Box<dyn Transport>) {
        let kind = transport.kind();
        match time::timeout(self.timeouts.teardown, transport.teardown()).await {
            Ok(Ok(())) => debug!(%kind, "transport torn down"),
            Ok(Err(e)) => warn!(%kind, "{e}"),
            Err(_) => warn!(%kind, timeout = ?self.timeouts.teardown, "transport teardown timed out"),
        }
    }

    async fn finish(&self, attempt: u64, transport: Option<Box<dyn Transport>>) {
        if let Some(transport) = transport {
            self.teardown(transport).await;
        }
        self.settle_idle(attempt);
    }

    async fn fail(
        &self,
        attempt: u64,
        transport: Option<Box<dyn Transport>>,
        err: SessionError,
    ) -> SessionError {
        warn!(attempt, "session start failed: {err}");
        self.finish(attempt, transport).await;
        err
    }

    async fn abandon(&self, attempt: u64, transport: Option<Box<dyn Transport>>) -> StartOutcome {
        info!(attempt, "session start abandoned");
        self.finish(attempt, transport).await;
        StartOutcome::Cancelled
    }

    async fn commit(
        self: &Arc<Self>,
        attempt: u64,
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> StartOutcome {
        let kind = transport.kind();
        {
            let mut inner = self.lock();
            if inner.attempt == attempt && inner.state == LifecycleState::Starting {
                let session_id = transport.session_id().map(str::to_owned);
                inner.session_id = session_id.clone();
                inner.transport_kind = Some(kind);
                inner.cancel = None;
                inner.active = Some(transport);
                inner.pump = Some(tokio::spawn(pump_events(
                    Arc::downgrade(self),
                    attempt,
                    events,
                )));
                self.sinks.audio.set_muted(false);
                self.publish(&mut inner, LifecycleState::Active);
                info!(attempt, session_id = ?session_id, transport = %kind, "avatar session active");
                return StartOutcome::Started {
                    session_id,
                    transport: kind,
                };
            }
        }
        self.abandon(attempt, Some(transport)).await
    }

    async fn remote_ended(&self, attempt: u64, reason: &str) {
        let transport = {
            let mut inner = self.lock();
            if inner.attempt != attempt || inner.state != LifecycleState::Active {
                return;
            }
            let transport = inner.active.take();
            // This runs on the pump task itself.
            inner.pump = None;
            self.publish(&mut inner, LifecycleState::Ending);
            transport
        };
        info!(attempt, reason, "remote side ended the session");
        self.finish(attempt, transport).await;
    }
}

/// Cancels the attempt if the `start` future is dropped before it resolves.
struct StartGuard {
    shared: Arc<Shared>,
    attempt: u64,
    armed: bool,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.shared.lock();
        if inner.attempt == self.attempt && inner.state == LifecycleState::Starting {
            if let Some(cancel) = &inner.cancel {
                let _ = cancel.send(true);
            }
            self.shared.publish(&mut inner, LifecycleState::Ending);
        }
    }
}

/// Resolves once the attempt is cancelled; never, if the sender goes away.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_for_media(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
) -> Result<RemoteTrack, NegotiationError> {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::MediaReady(track) => return Ok(track),
            TransportEvent::MediaEnded(track) => {
                debug!(track = %track.id, "track ended before media was ready");
            }
            TransportEvent::MediaError(msg) => {
                return Err(NegotiationError::setup(format!("media error: {msg}")));
            }
            TransportEvent::Disconnected(reason) => {
                return Err(NegotiationError::setup(format!(
                    "disconnected before media: {reason}"
                )));
            }
        }
    }
    Err(NegotiationError::setup("transport closed before media"))
}

async fn run_attempt(
    shared: Arc<Shared>,
    attempt: u64,
    mut cancel: watch::Receiver<bool>,
) -> Result<StartOutcome, SessionError> {
    let acquire_timeout = shared.timeouts.acquire;
    let acquired = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => None,
        res = time::timeout(acquire_timeout, shared.acquirer.acquire_session()) => Some(res),
    };
    let descriptor = match acquired {
        None => return Ok(shared.abandon(attempt, None).await),
        Some(Err(_)) => {
            let err = AcquisitionError::TimedOut(acquire_timeout).into();
            return Err(shared.fail(attempt, None, err).await);
        }
        Some(Ok(Err(e))) => return Err(shared.fail(attempt, None, e.into()).await),
        Some(Ok(Ok(descriptor))) => descriptor,
    };
    info!(attempt, transport = %descriptor.transport_kind(), "session acquired");

    let mut transport = shared.transports.create(descriptor);
    let media_timeout = shared.timeouts.media;
    let deadline = Instant::now() + media_timeout;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let established = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => None,
        res = time::timeout_at(deadline, transport.establish(events_tx, shared.sinks.clone())) => Some(res),
    };
    match established {
        None => return Ok(shared.abandon(attempt, Some(transport)).await),
        Some(Err(_)) => {
            let err = NegotiationError::setup(format!(
                "negotiation timed out after {media_timeout:?}"
            ));
            return Err(shared.fail(attempt, Some(transport), err.into()).await);
        }
        Some(Ok(Err(e))) => return Err(shared.fail(attempt, Some(transport), e.into()).await),
        Some(Ok(Ok(()))) => {}
    }

    let ready = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => None,
        res = time::timeout_at(deadline, wait_for_media(&mut events_rx)) => Some(res),
    };
    match ready {
        None => Ok(shared.abandon(attempt, Some(transport)).await),
        Some(Err(_)) => {
            let err = NegotiationError::setup(format!("no media within {media_timeout:?}"));
            Err(shared.fail(attempt, Some(transport), err.into()).await)
        }
        Some(Ok(Err(e))) => Err(shared.fail(attempt, Some(transport), e.into()).await),
        Some(Ok(Ok(track))) => {
            debug!(kind = %track.kind, id = %track.id, "first remote track ready");
            Ok(shared.commit(attempt, transport, events_rx).await)
        }
    }
}

async fn pump_events(
    shared: Weak<Shared>,
    attempt: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let reason = match event {
            TransportEvent::MediaReady(track) => {
                debug!(kind = %track.kind, id = %track.id, "remote track ready");
                continue;
            }
            TransportEvent::MediaEnded(track) => {
                debug!(kind = %track.kind, id = %track.id, "remote track ended");
                continue;
            }
            TransportEvent::MediaError(msg) => format!("media error: {msg}"),
            TransportEvent::Disconnected(reason) => reason,
        };
        if let Some(shared) = shared.upgrade() {
            shared.remote_ended(attempt, &reason).await;
        }
        break;
    }
}
