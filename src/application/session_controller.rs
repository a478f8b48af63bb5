use crate::application::conflict::{self, ConflictResolution, PendingConflict, ResolutionOutcome};
use crate::domain::elapsed::{ElapsedClock, ElapsedReading, ElapsedTicker, NowProvider, DEFAULT_TICK};
use crate::domain::models::{
    merge_attributes, CloseSessionRequest, RoutineKind, RoutineSession, SessionAttributes,
    SessionKey, StartSessionRequest,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::session_store::SessionStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Open,
    Closing,
    Conflict,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Conflict => "conflict",
        }
    }

    fn has_request_in_flight(self) -> bool {
        matches!(self, Self::Starting | Self::Closing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the user should be told that is not an error.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionNotice {
    /// The open session disappeared from the store while this controller showed it.
    ClosedElsewhere,
    /// A close or finish request found nothing open.
    AlreadyFinished,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(RoutineSession),
    Conflict(PendingConflict),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// Closed by this request; carries the store's `duration_seconds`.
    Closed(RoutineSession),
    AlreadyFinished,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ControllerSnapshot {
    pub subject_id: String,
    pub kind: RoutineKind,
    pub state: SessionState,
    pub open_session: Option<RoutineSession>,
    pub conflict: Option<PendingConflict>,
    pub elapsed: Option<ElapsedReading>,
    pub pending_attributes: SessionAttributes,
    pub last_closed: Option<RoutineSession>,
    pub notice: Option<SessionNotice>,
}

impl ControllerSnapshot {
    pub fn elapsed_seconds(&self) -> Option<u64> {
        self.elapsed.as_ref().map(|reading| reading.elapsed_seconds)
    }
}

#[derive(Clone)]
pub struct ControllerOptions {
    /// Re-poll cadence while a session is believed open. `None` disables polling.
    pub poll_interval: Option<Duration>,
    pub tick_interval: Duration,
    pub now_provider: NowProvider,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Some(DEFAULT_POLL_INTERVAL),
            tick_interval: DEFAULT_TICK,
            now_provider: Arc::new(Utc::now),
        }
    }
}

impl ControllerOptions {
    pub fn with_poll_interval(mut self, poll_interval: Option<Duration>) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }
}

#[derive(Debug)]
struct ControllerInner {
    state: SessionState,
    open_session: Option<RoutineSession>,
    conflict: Option<PendingConflict>,
    pending_attributes: SessionAttributes,
    clock: ElapsedClock,
    last_closed: Option<RoutineSession>,
    notice: Option<SessionNotice>,
    ticker: Option<ElapsedTicker>,
    watcher: Option<JoinHandle<()>>,
    torn_down: bool,
    /// Bumped on every state write; store lookups started under an older value are stale.
    transitions: u64,
}

impl ControllerInner {
    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.transitions = self.transitions.wrapping_add(1);
    }
}

impl Default for ControllerInner {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            open_session: None,
            conflict: None,
            pending_attributes: SessionAttributes::new(),
            clock: ElapsedClock::default(),
            last_closed: None,
            notice: None,
            ticker: None,
            watcher: None,
            torn_down: false,
            transitions: 0,
        }
    }
}

struct Shared<S: ?Sized> {
    key: SessionKey,
    options: ControllerOptions,
    inner: Mutex<ControllerInner>,
    elapsed_tx: watch::Sender<Option<ElapsedReading>>,
    store: Arc<S>,
}

/// State machine for the one session per `(subject, kind)`.
///
/// `IDLE -> STARTING -> OPEN -> CLOSING -> IDLE`, with `CONFLICT` reachable from
/// `STARTING`. Clones share state, so every view of the same routine holds a handle
/// to one controller. Store requests run on spawned tasks: dropping the future that
/// awaits them, or tearing the controller down, never cancels a start or close.
pub struct RoutineSessionController<S: SessionStore + ?Sized + 'static> {
    shared: Arc<Shared<S>>,
}

impl<S: SessionStore + ?Sized + 'static> Clone for RoutineSessionController<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: SessionStore + ?Sized + 'static> RoutineSessionController<S> {
    pub fn new(subject_id: impl Into<String>, kind: RoutineKind, store: Arc<S>) -> Self {
        Self::with_options(subject_id, kind, store, ControllerOptions::default())
    }

    pub fn with_options(
        subject_id: impl Into<String>,
        kind: RoutineKind,
        store: Arc<S>,
        options: ControllerOptions,
    ) -> Self {
        let (elapsed_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                key: SessionKey::new(subject_id, kind),
                options,
                inner: Mutex::new(ControllerInner::default()),
                elapsed_tx,
                store,
            }),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.shared.key
    }

    pub fn state(&self) -> Result<SessionState, InfraError> {
        Ok(self.shared.lock()?.state)
    }

    pub fn snapshot(&self) -> Result<ControllerSnapshot, InfraError> {
        let inner = self.shared.lock()?;
        Ok(self.shared.snapshot_of(&inner))
    }

    /// Live readings from the 1-second ticker. `None` while nothing is armed.
    pub fn subscribe_elapsed(&self) -> watch::Receiver<Option<ElapsedReading>> {
        self.shared.elapsed_tx.subscribe()
    }

    /// Adopts a session that is already open in the store, skipping `STARTING`.
    pub async fn mount(&self) -> Result<ControllerSnapshot, InfraError> {
        let snapshot = self.refresh().await?;
        tracing::info!(
            key = %self.shared.key,
            state = %snapshot.state,
            "mounted routine session controller"
        );
        Ok(snapshot)
    }

    /// Reconciles local state with the store's open session.
    ///
    /// Skipped while a start or close is in flight or a conflict awaits resolution.
    pub async fn refresh(&self) -> Result<ControllerSnapshot, InfraError> {
        let observed = {
            let inner = self.shared.lock()?;
            if inner.state.has_request_in_flight() || inner.state == SessionState::Conflict {
                return Ok(self.shared.snapshot_of(&inner));
            }
            inner.transitions
        };

        let key = &self.shared.key;
        let found = self
            .shared
            .store
            .get_open_session(&key.subject_id, key.kind)
            .await?;

        let mut inner = self.shared.lock()?;
        if inner.transitions != observed {
            tracing::debug!(key = %key, "discarding open session lookup that raced a transition");
            return Ok(self.shared.snapshot_of(&inner));
        }
        match (inner.state, found) {
            (SessionState::Idle, Some(session)) => {
                tracing::info!(key = %key, session_id = %session.id, "found open session");
                self.shared.enter_open(&mut inner, session);
            }
            (SessionState::Open, None) => {
                tracing::info!(key = %key, "open session was closed elsewhere");
                self.shared.enter_idle(&mut inner);
                inner.notice = Some(SessionNotice::ClosedElsewhere);
            }
            (SessionState::Open, Some(session)) => {
                let replaced = inner
                    .open_session
                    .as_ref()
                    .is_none_or(|current| current.id != session.id);
                if replaced {
                    tracing::info!(key = %key, session_id = %session.id, "open session replaced elsewhere");
                    inner.pending_attributes.clear();
                    self.shared.enter_open(&mut inner, session);
                }
            }
            _ => {}
        }
        Ok(self.shared.snapshot_of(&inner))
    }

    /// Asks the store to open a new session.
    ///
    /// A clash with an existing open session is not an error: it yields
    /// [`StartOutcome::Conflict`] and leaves the controller in `CONFLICT`.
    pub async fn request_start(
        &self,
        attributes: SessionAttributes,
        started_at: Option<DateTime<Utc>>,
    ) -> Result<StartOutcome, InfraError> {
        {
            let mut inner = self.shared.lock()?;
            if inner.torn_down {
                return Err(InfraError::InvalidState("controller was torn down".to_string()));
            }
            if inner.state != SessionState::Idle {
                return Err(InfraError::InvalidState(format!(
                    "cannot start {} while {}",
                    self.shared.key.kind.label(),
                    inner.state
                )));
            }
            inner.set_state(SessionState::Starting);
            inner.notice = None;
        }
        tracing::info!(key = %self.shared.key, "starting session");

        let request = StartSessionRequest {
            attributes,
            started_at,
        };
        self.run_detached(move |shared| async move {
            let key = &shared.key;
            let result = shared
                .store
                .start_session(&key.subject_id, key.kind, request)
                .await;
            shared.apply_start_result(result)
        })
        .await
    }

    pub async fn resolve_conflict(
        &self,
        resolution: ConflictResolution,
    ) -> Result<ResolutionOutcome, InfraError> {
        let pending = {
            let mut inner = self.shared.lock()?;
            if inner.state != SessionState::Conflict {
                return Err(InfraError::InvalidState(format!(
                    "no conflict to resolve while {}",
                    inner.state
                )));
            }
            let pending = inner.conflict.clone().ok_or_else(|| {
                InfraError::InvalidState("conflict state without conflicting session".to_string())
            })?;
            if resolution == ConflictResolution::Resume {
                let existing = pending.existing.clone();
                tracing::info!(key = %self.shared.key, session_id = %existing.id, "resuming existing session");
                self.shared.enter_open(&mut inner, existing.clone());
                return Ok(ResolutionOutcome::Resumed(existing));
            }
            inner.set_state(SessionState::Closing);
            pending
        };
        tracing::info!(key = %self.shared.key, session_id = %pending.existing.id, "finishing existing session");

        self.run_detached(move |shared| async move {
            let result =
                conflict::resolve(shared.store.as_ref(), &pending, ConflictResolution::FinishNow).await;
            shared.apply_finish_result(result)
        })
        .await
    }

    /// Merges attributes into the open session locally; they travel with the close.
    pub fn update_attributes(
        &self,
        attributes: SessionAttributes,
    ) -> Result<ControllerSnapshot, InfraError> {
        let mut inner = self.shared.lock()?;
        if inner.state != SessionState::Open {
            return Err(InfraError::InvalidState(format!(
                "cannot update {} attributes while {}",
                self.shared.key.kind.label(),
                inner.state
            )));
        }
        inner.pending_attributes = merge_attributes(&inner.pending_attributes, &attributes);
        Ok(self.shared.snapshot_of(&inner))
    }

    /// Closes the open session. Closing when nothing is open is a no-op.
    pub async fn request_close(
        &self,
        attributes: SessionAttributes,
        note: Option<String>,
    ) -> Result<CloseOutcome, InfraError> {
        let request = {
            let mut inner = self.shared.lock()?;
            match inner.state {
                SessionState::Open => {}
                SessionState::Idle => return Ok(CloseOutcome::AlreadyFinished),
                other => {
                    return Err(InfraError::InvalidState(format!(
                        "cannot finish {} while {other}",
                        self.shared.key.kind.label()
                    )));
                }
            }
            inner.set_state(SessionState::Closing);
            CloseSessionRequest {
                attributes: merge_attributes(&inner.pending_attributes, &attributes),
                note,
            }
        };
        tracing::info!(key = %self.shared.key, "closing session");

        self.run_detached(move |shared| async move {
            let key = &shared.key;
            let result = shared
                .store
                .close_session(&key.subject_id, key.kind, request)
                .await;
            shared.apply_close_result(result)
        })
        .await
    }

    /// Freezes the display refresh. The session and its recorded duration are untouched.
    pub fn pause_timer(&self) -> Result<ControllerSnapshot, InfraError> {
        let mut inner = self.shared.lock()?;
        if !inner.clock.is_armed() {
            return Err(InfraError::InvalidState("no running timer to pause".to_string()));
        }
        inner.clock.pause();
        inner.ticker = None;
        self.shared.publish_reading(&inner);
        Ok(self.shared.snapshot_of(&inner))
    }

    pub fn resume_timer(&self) -> Result<ControllerSnapshot, InfraError> {
        let mut inner = self.shared.lock()?;
        if !inner.clock.is_armed() {
            return Err(InfraError::InvalidState("no paused timer to resume".to_string()));
        }
        inner.clock.resume();
        if !inner.torn_down {
            self.shared.restart_ticker(&mut inner);
        }
        self.shared.publish_reading(&inner);
        Ok(self.shared.snapshot_of(&inner))
    }

    /// Stops the ticker and the poller. In-flight requests still complete and apply.
    pub fn tear_down(&self) -> Result<(), InfraError> {
        let mut inner = self.shared.lock()?;
        inner.torn_down = true;
        inner.ticker = None;
        if let Some(watcher) = inner.watcher.take() {
            watcher.abort();
        }
        tracing::debug!(key = %self.shared.key, "controller torn down");
        Ok(())
    }

    async fn run_detached<T, F, Fut>(&self, work: F) -> Result<T, InfraError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Shared<S>>) -> Fut,
        Fut: Future<Output = Result<T, InfraError>> + Send + 'static,
    {
        let task = tokio::spawn(work(Arc::clone(&self.shared)));
        task.await
            .map_err(|error| InfraError::InvalidState(format!("session request task failed: {error}")))?
    }
}

impl<S: SessionStore + ?Sized + 'static> Shared<S> {
    fn lock(&self) -> Result<MutexGuard<'_, ControllerInner>, InfraError> {
        self.inner
            .lock()
            .map_err(|error| InfraError::InvalidState(format!("controller lock poisoned: {error}")))
    }

    fn now(&self) -> DateTime<Utc> {
        (self.options.now_provider)()
    }

    fn snapshot_of(&self, inner: &ControllerInner) -> ControllerSnapshot {
        ControllerSnapshot {
            subject_id: self.key.subject_id.clone(),
            kind: self.key.kind,
            state: inner.state,
            open_session: inner.open_session.clone(),
            conflict: inner.conflict.clone(),
            elapsed: inner.clock.reading(self.now()),
            pending_attributes: inner.pending_attributes.clone(),
            last_closed: inner.last_closed.clone(),
            notice: inner.notice,
        }
    }

    fn publish_reading(&self, inner: &ControllerInner) {
        self.elapsed_tx.send_replace(inner.clock.reading(self.now()));
    }

    fn note_if_torn_down(&self, inner: &ControllerInner, action: &str) {
        if inner.torn_down {
            tracing::warn!(key = %self.key, action, "request completed after controller teardown");
        }
    }

    fn apply_start_result(
        self: &Arc<Self>,
        result: Result<RoutineSession, InfraError>,
    ) -> Result<StartOutcome, InfraError> {
        let mut inner = self.lock()?;
        self.note_if_torn_down(&inner, "start");
        match result {
            Ok(session) => {
                tracing::info!(key = %self.key, session_id = %session.id, "session started");
                self.enter_open(&mut inner, session.clone());
                Ok(StartOutcome::Started(session))
            }
            Err(InfraError::AlreadyOpen(existing)) => {
                tracing::warn!(key = %self.key, session_id = %existing.id, "session already open");
                let pending = PendingConflict::new(*existing, self.now());
                inner.set_state(SessionState::Conflict);
                inner.conflict = Some(pending.clone());
                Ok(StartOutcome::Conflict(pending))
            }
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "start failed");
                inner.set_state(SessionState::Idle);
                Err(error)
            }
        }
    }

    fn apply_finish_result(
        self: &Arc<Self>,
        result: Result<ResolutionOutcome, InfraError>,
    ) -> Result<ResolutionOutcome, InfraError> {
        let mut inner = self.lock()?;
        self.note_if_torn_down(&inner, "finish");
        match result {
            Ok(ResolutionOutcome::Finished(closed)) => {
                tracing::info!(key = %self.key, session_id = %closed.id, "existing session finished");
                self.enter_idle(&mut inner);
                inner.last_closed = Some(closed.clone());
                Ok(ResolutionOutcome::Finished(closed))
            }
            Ok(outcome) => {
                tracing::info!(key = %self.key, "existing session was already finished");
                self.enter_idle(&mut inner);
                inner.notice = Some(SessionNotice::AlreadyFinished);
                Ok(outcome)
            }
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "finishing existing session failed");
                inner.set_state(SessionState::Conflict);
                Err(error)
            }
        }
    }

    fn apply_close_result(
        self: &Arc<Self>,
        result: Result<RoutineSession, InfraError>,
    ) -> Result<CloseOutcome, InfraError> {
        let mut inner = self.lock()?;
        self.note_if_torn_down(&inner, "close");
        match result {
            Ok(closed) => {
                tracing::info!(
                    key = %self.key,
                    session_id = %closed.id,
                    duration_seconds = closed.duration_seconds,
                    "session closed"
                );
                self.enter_idle(&mut inner);
                inner.last_closed = Some(closed.clone());
                Ok(CloseOutcome::Closed(closed))
            }
            Err(InfraError::NotOpen { .. }) => {
                tracing::warn!(key = %self.key, "session was already closed elsewhere");
                self.enter_idle(&mut inner);
                inner.notice = Some(SessionNotice::AlreadyFinished);
                Ok(CloseOutcome::AlreadyFinished)
            }
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "close failed");
                inner.set_state(SessionState::Open);
                Err(error)
            }
        }
    }

    fn enter_open(self: &Arc<Self>, inner: &mut ControllerInner, session: RoutineSession) {
        inner.set_state(SessionState::Open);
        inner.conflict = None;
        inner.notice = None;
        inner.clock.arm(session.started_at);
        inner.open_session = Some(session);
        if !inner.torn_down {
            self.restart_ticker(inner);
            self.ensure_watcher(inner);
        }
        self.publish_reading(inner);
    }

    fn enter_idle(&self, inner: &mut ControllerInner) {
        inner.set_state(SessionState::Idle);
        inner.open_session = None;
        inner.conflict = None;
        inner.pending_attributes.clear();
        inner.clock.disarm();
        inner.ticker = None;
        if let Some(watcher) = inner.watcher.take() {
            watcher.abort();
        }
        self.publish_reading(inner);
    }

    fn restart_ticker(self: &Arc<Self>, inner: &mut ControllerInner) {
        let weak = Arc::downgrade(self);
        inner.ticker = ElapsedTicker::spawn(
            inner.clock.clone(),
            Arc::clone(&self.options.now_provider),
            self.options.tick_interval,
            move |reading| match weak.upgrade() {
                Some(shared) => {
                    shared.elapsed_tx.send_replace(reading);
                    true
                }
                None => false,
            },
        );
    }

    fn ensure_watcher(self: &Arc<Self>, inner: &mut ControllerInner) {
        let Some(interval) = self.options.poll_interval else {
            return;
        };
        if inner
            .watcher
            .as_ref()
            .is_some_and(|watcher| !watcher.is_finished())
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        inner.watcher = Some(runtime.spawn(watch_open_session(Arc::downgrade(self), interval)));
    }
}

/// Re-polls the store while the controller believes a session is open, so a close
/// from another device shows up within one interval.
async fn watch_open_session<S>(shared: Weak<Shared<S>>, interval: Duration)
where
    S: SessionStore + ?Sized + 'static,
{
    loop {
        tokio::time::sleep(interval).await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let controller = RoutineSessionController { shared };
        match controller.state() {
            Ok(SessionState::Open) => {}
            Ok(SessionState::Closing) => continue,
            _ => break,
        }
        if let Err(error) = controller.refresh().await {
            tracing::warn!(key = %controller.shared.key, %error, "open session poll failed");
        }
    }
}
