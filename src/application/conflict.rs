//! Resolution of a start request that hit an already-open session.
//!
//! Only two ways out exist. There is deliberately no "start anyway": the store rejects
//! a second open session for the same subject and kind.

use crate::domain::models::{CloseSessionRequest, RoutineSession};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::session_store::SessionStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Adopt the existing session locally. Nothing is written to the store.
    Resume,
    /// Close the existing session right away with empty closing attributes.
    FinishNow,
}

impl ConflictResolution {
    pub const OPTIONS: [ConflictResolution; 2] =
        [ConflictResolution::Resume, ConflictResolution::FinishNow];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::FinishNow => "finish_now",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = InfraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "resume" => Ok(Self::Resume),
            "finish" | "finish_now" => Ok(Self::FinishNow),
            other => Err(InfraError::InvalidInput(format!(
                "conflict resolution must be resume or finish_now, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PendingConflict {
    pub existing: RoutineSession,
    pub detected_at: DateTime<Utc>,
}

impl PendingConflict {
    pub fn new(existing: RoutineSession, detected_at: DateTime<Utc>) -> Self {
        Self {
            existing,
            detected_at,
        }
    }

    pub fn options(&self) -> [ConflictResolution; 2] {
        ConflictResolution::OPTIONS
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// The controller should treat this session as open, armed from its real start.
    Resumed(RoutineSession),
    /// The existing session was closed by this request.
    Finished(RoutineSession),
    /// Someone else closed it first; there is nothing left to finish.
    AlreadyFinished,
}

pub async fn resolve<S>(
    store: &S,
    conflict: &PendingConflict,
    resolution: ConflictResolution,
) -> Result<ResolutionOutcome, InfraError>
where
    S: SessionStore + ?Sized,
{
    match resolution {
        ConflictResolution::Resume => Ok(ResolutionOutcome::Resumed(conflict.existing.clone())),
        ConflictResolution::FinishNow => {
            let key = conflict.existing.key();
            match store
                .close_session(&key.subject_id, key.kind, CloseSessionRequest::empty())
                .await
            {
                Ok(closed) => Ok(ResolutionOutcome::Finished(closed)),
                Err(InfraError::NotOpen { .. }) => Ok(ResolutionOutcome::AlreadyFinished),
                Err(error) => Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{RoutineKind, StartSessionRequest};
    use crate::infrastructure::session_store::InMemorySessionStore;

    async fn conflicted_store() -> (InMemorySessionStore, PendingConflict) {
        let store = InMemorySessionStore::default();
        store
            .start_session("7", RoutineKind::Feeding, StartSessionRequest::default())
            .await
            .expect("first start");
        let existing = match store
            .start_session("7", RoutineKind::Feeding, StartSessionRequest::default())
            .await
        {
            Err(InfraError::AlreadyOpen(existing)) => *existing,
            other => panic!("expected conflict, got {other:?}"),
        };
        (store, PendingConflict::new(existing, Utc::now()))
    }

    #[test]
    fn exactly_two_resolutions_are_offered() {
        assert_eq!(ConflictResolution::OPTIONS.len(), 2);
        assert_eq!("finish".parse::<ConflictResolution>().expect("parse"), ConflictResolution::FinishNow);
        assert!("start_anyway".parse::<ConflictResolution>().is_err());
    }

    #[tokio::test]
    async fn resume_does_not_touch_the_store() {
        let (store, conflict) = conflicted_store().await;
        let outcome = resolve(&store, &conflict, ConflictResolution::Resume)
            .await
            .expect("resume");
        assert_eq!(outcome, ResolutionOutcome::Resumed(conflict.existing.clone()));
        assert_eq!(store.open_count("7", RoutineKind::Feeding).expect("count"), 1);
    }

    #[tokio::test]
    async fn finish_now_closes_existing_session() {
        let (store, conflict) = conflicted_store().await;
        let outcome = resolve(&store, &conflict, ConflictResolution::FinishNow)
            .await
            .expect("finish");
        match outcome {
            ResolutionOutcome::Finished(closed) => {
                assert_eq!(closed.id, conflict.existing.id);
                assert!(closed.ended_at.is_some());
            }
            other => panic!("expected finished, got {other:?}"),
        }
        assert_eq!(store.open_count("7", RoutineKind::Feeding).expect("count"), 0);
    }

    #[tokio::test]
    async fn finish_now_after_remote_close_is_not_an_error() {
        let (store, conflict) = conflicted_store().await;
        store
            .close_session("7", RoutineKind::Feeding, CloseSessionRequest::empty())
            .await
            .expect("closed elsewhere");
        let outcome = resolve(&store, &conflict, ConflictResolution::FinishNow)
            .await
            .expect("finish");
        assert_eq!(outcome, ResolutionOutcome::AlreadyFinished);
    }
}
