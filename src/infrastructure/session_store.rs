use crate::domain::elapsed::NowProvider;
use crate::domain::models::{
    merge_attributes, whole_seconds_between, CloseSessionRequest, RoutineKind, RoutineSession,
    StartSessionRequest,
};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSessionsRequest {
    pub kind: Option<RoutineKind>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ListSessionsRequest {
    pub fn contains(&self, session: &RoutineSession) -> bool {
        self.kind.is_none_or(|kind| kind == session.routine_kind)
            && session.started_at >= self.from
            && session.started_at < self.to
    }
}

/// The authority over sessions. Creation enforces at most one open session per
/// `(subject_id, kind)` and reports a clash as [`InfraError::AlreadyOpen`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn start_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: StartSessionRequest,
    ) -> Result<RoutineSession, InfraError>;

    async fn get_open_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
    ) -> Result<Option<RoutineSession>, InfraError>;

    async fn close_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: CloseSessionRequest,
    ) -> Result<RoutineSession, InfraError>;

    /// Removes a completed session. Open sessions are refused.
    async fn delete_session(&self, session_id: &str) -> Result<(), InfraError>;

    async fn list_sessions(
        &self,
        subject_id: &str,
        request: ListSessionsRequest,
    ) -> Result<Vec<RoutineSession>, InfraError>;
}

pub(crate) fn ensure_subject(subject_id: &str) -> Result<&str, InfraError> {
    let subject_id = subject_id.trim();
    if subject_id.is_empty() {
        return Err(InfraError::InvalidInput("subject_id must not be empty".to_string()));
    }
    Ok(subject_id)
}

pub(crate) fn ensure_not_future(
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), InfraError> {
    if started_at > now {
        return Err(InfraError::InvalidInput(format!(
            "session cannot start in the future: {}",
            started_at.to_rfc3339()
        )));
    }
    Ok(())
}

/// Stamps `ended_at`, merges closing attributes over the stored ones and computes the
/// duration from the two instants.
pub(crate) fn finalize_session(
    mut session: RoutineSession,
    request: CloseSessionRequest,
    now: DateTime<Utc>,
) -> RoutineSession {
    let ended_at = now.max(session.started_at);
    session.attributes = merge_attributes(&session.attributes, &request.attributes);
    if let Some(note) = request
        .note
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        session.note = Some(note.to_string());
    }
    session.duration_seconds = Some(whole_seconds_between(session.started_at, ended_at));
    session.ended_at = Some(ended_at);
    session
}

/// Simulated store used in tests and offline demos.
pub struct InMemorySessionStore {
    sessions: Mutex<Vec<RoutineSession>>,
    next_id: AtomicU64,
    now_provider: NowProvider,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            now_provider: Arc::new(Utc::now),
        }
    }
}

impl InMemorySessionStore {
    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn open_count(&self, subject_id: &str, kind: RoutineKind) -> Result<usize, InfraError> {
        let sessions = self.lock()?;
        Ok(sessions
            .iter()
            .filter(|session| {
                session.is_open() && session.subject_id == subject_id && session.routine_kind == kind
            })
            .count())
    }

    pub fn all_sessions(&self) -> Result<Vec<RoutineSession>, InfraError> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<RoutineSession>>, InfraError> {
        self.sessions
            .lock()
            .map_err(|error| InfraError::InvalidState(format!("session store lock poisoned: {error}")))
    }

    fn find_open(
        sessions: &[RoutineSession],
        subject_id: &str,
        kind: RoutineKind,
    ) -> Option<usize> {
        sessions.iter().position(|session| {
            session.is_open() && session.subject_id == subject_id && session.routine_kind == kind
        })
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn start_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: StartSessionRequest,
    ) -> Result<RoutineSession, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        let now = (self.now_provider)();
        let started_at = request.started_at.unwrap_or(now);
        ensure_not_future(started_at, now)?;

        let mut sessions = self.lock()?;
        if let Some(index) = Self::find_open(&sessions, subject_id, kind) {
            return Err(InfraError::AlreadyOpen(Box::new(sessions[index].clone())));
        }

        let sequence = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = RoutineSession {
            id: format!("ses-{sequence}"),
            subject_id: subject_id.to_string(),
            routine_kind: kind,
            started_at,
            ended_at: None,
            attributes: request.attributes,
            note: None,
            duration_seconds: None,
        };
        sessions.push(session.clone());
        Ok(session)
    }

    async fn get_open_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
    ) -> Result<Option<RoutineSession>, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        let sessions = self.lock()?;
        Ok(Self::find_open(&sessions, subject_id, kind).map(|index| sessions[index].clone()))
    }

    async fn close_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: CloseSessionRequest,
    ) -> Result<RoutineSession, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        let now = (self.now_provider)();
        let mut sessions = self.lock()?;
        let Some(index) = Self::find_open(&sessions, subject_id, kind) else {
            return Err(InfraError::not_open(subject_id, kind));
        };
        let closed = finalize_session(sessions[index].clone(), request, now);
        sessions[index] = closed.clone();
        Ok(closed)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), InfraError> {
        let session_id = session_id.trim();
        let mut sessions = self.lock()?;
        let Some(index) = sessions.iter().position(|session| session.id == session_id) else {
            return Ok(());
        };
        if sessions[index].is_open() {
            return Err(InfraError::InvalidState(format!(
                "session {session_id} is still open; close it before deleting"
            )));
        }
        sessions.remove(index);
        Ok(())
    }

    async fn list_sessions(
        &self,
        subject_id: &str,
        request: ListSessionsRequest,
    ) -> Result<Vec<RoutineSession>, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        let sessions = self.lock()?;
        let mut matching = sessions
            .iter()
            .filter(|session| session.subject_id == subject_id && request.contains(session))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by_key(|session| session.started_at);
        Ok(matching)
    }
}
