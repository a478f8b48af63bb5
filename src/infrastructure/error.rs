use crate::domain::models::{RoutineKind, RoutineSession};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Unknown time zone: {0}")]
    InvalidZone(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("{} session already open for subject {}", .0.routine_kind, .0.subject_id)]
    AlreadyOpen(Box<RoutineSession>),
    #[error("no open {kind} session for subject {subject_id}")]
    NotOpen {
        subject_id: String,
        kind: RoutineKind,
    },
}

impl InfraError {
    /// Only transport failures are worth a user-initiated retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn not_open(subject_id: &str, kind: RoutineKind) -> Self {
        Self::NotOpen {
            subject_id: subject_id.to_string(),
            kind,
        }
    }
}
