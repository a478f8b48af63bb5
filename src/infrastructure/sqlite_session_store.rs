use crate::domain::elapsed::NowProvider;
use crate::domain::models::{
    CloseSessionRequest, RoutineKind, RoutineSession, SessionAttributes, StartSessionRequest,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::session_store::{
    ensure_not_future, ensure_subject, finalize_session, ListSessionsRequest, SessionStore,
};
use crate::infrastructure::storage::open_database;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SESSION_COLUMNS: &str =
    "id, subject_id, routine_kind, started_at, ended_at, attributes, note, duration_seconds";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("ses-{}-{sequence}", Utc::now().timestamp_micros())
}

/// Local store for offline use. The partial unique index on open sessions is what
/// arbitrates concurrent starts, so separate connections behave like separate devices.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
    now_provider: NowProvider,
}

impl SqliteSessionStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_database(&self.db_path)
    }

    /// Stored instants are millisecond precision so they sort lexically.
    fn now(&self) -> DateTime<Utc> {
        (self.now_provider)().trunc_subsecs(3)
    }

    fn start_blocking(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: StartSessionRequest,
    ) -> Result<RoutineSession, InfraError> {
        let now = self.now();
        let started_at = request.started_at.map(|value| value.trunc_subsecs(3)).unwrap_or(now);
        ensure_not_future(started_at, now)?;

        let session = RoutineSession {
            id: next_id(),
            subject_id: subject_id.to_string(),
            routine_kind: kind,
            started_at,
            ended_at: None,
            attributes: request.attributes,
            note: None,
            duration_seconds: None,
        };

        let connection = self.connect()?;
        let inserted = connection.execute(
            "INSERT INTO routine_sessions (id, subject_id, routine_kind, started_at, attributes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id,
                session.subject_id,
                kind.as_str(),
                format_instant(session.started_at),
                serde_json::to_string(&session.attributes)?,
            ],
        );

        match inserted {
            Ok(_) => Ok(session),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                match find_open(&connection, subject_id, kind)? {
                    Some(existing) => Err(InfraError::AlreadyOpen(Box::new(existing))),
                    None => Err(InfraError::InvalidState(format!(
                        "constraint violation starting {kind} for subject {subject_id}"
                    ))),
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    fn close_blocking(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: CloseSessionRequest,
    ) -> Result<RoutineSession, InfraError> {
        let now = self.now();
        let mut connection = self.connect()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(open) = find_open(&transaction, subject_id, kind)? else {
            return Err(InfraError::not_open(subject_id, kind));
        };

        let closed = finalize_session(open, request, now);
        let ended_at = closed.ended_at.map(format_instant);
        transaction.execute(
            "UPDATE routine_sessions
             SET ended_at = ?2, attributes = ?3, note = ?4, duration_seconds = ?5
             WHERE id = ?1 AND ended_at IS NULL",
            params![
                closed.id,
                ended_at,
                serde_json::to_string(&closed.attributes)?,
                closed.note,
                closed.duration_seconds,
            ],
        )?;
        transaction.commit()?;
        Ok(closed)
    }

    fn delete_blocking(&self, session_id: &str) -> Result<(), InfraError> {
        let connection = self.connect()?;
        let ended_at: Option<Option<String>> = connection
            .query_row(
                "SELECT ended_at FROM routine_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        match ended_at {
            None => Ok(()),
            Some(None) => Err(InfraError::InvalidState(format!(
                "session {session_id} is still open; close it before deleting"
            ))),
            Some(Some(_)) => {
                connection.execute(
                    "DELETE FROM routine_sessions WHERE id = ?1 AND ended_at IS NOT NULL",
                    params![session_id],
                )?;
                Ok(())
            }
        }
    }

    fn list_blocking(
        &self,
        subject_id: &str,
        request: &ListSessionsRequest,
    ) -> Result<Vec<RoutineSession>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM routine_sessions
             WHERE subject_id = ?1 AND started_at >= ?2 AND started_at < ?3
             ORDER BY started_at"
        ))?;
        let rows = statement.query_map(
            params![
                subject_id,
                format_instant(request.from),
                format_instant(request.to)
            ],
            read_row,
        )?;

        let mut sessions = Vec::new();
        for row in rows {
            let session = decode_row(row?)?;
            if request.contains(&session) {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn start_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: StartSessionRequest,
    ) -> Result<RoutineSession, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        self.start_blocking(subject_id, kind, request)
    }

    async fn get_open_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
    ) -> Result<Option<RoutineSession>, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        let connection = self.connect()?;
        find_open(&connection, subject_id, kind)
    }

    async fn close_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: CloseSessionRequest,
    ) -> Result<RoutineSession, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        self.close_blocking(subject_id, kind, request)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), InfraError> {
        self.delete_blocking(session_id.trim())
    }

    async fn list_sessions(
        &self,
        subject_id: &str,
        request: ListSessionsRequest,
    ) -> Result<Vec<RoutineSession>, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        self.list_blocking(subject_id, &request)
    }
}

type RawRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<i64>,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn find_open(
    connection: &Connection,
    subject_id: &str,
    kind: RoutineKind,
) -> Result<Option<RoutineSession>, InfraError> {
    let row = connection
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM routine_sessions
                 WHERE subject_id = ?1 AND routine_kind = ?2 AND ended_at IS NULL"
            ),
            params![subject_id, kind.as_str()],
            read_row,
        )
        .optional()?;
    row.map(decode_row).transpose()
}

fn decode_row(row: RawRow) -> Result<RoutineSession, InfraError> {
    let (id, subject_id, kind_raw, started_at, ended_at, attributes, note, duration_seconds) = row;
    let routine_kind = kind_raw
        .parse::<RoutineKind>()
        .map_err(|error| InfraError::InvalidState(format!("session {id}: {error}")))?;
    let attributes: SessionAttributes = serde_json::from_str(&attributes)?;
    Ok(RoutineSession {
        started_at: parse_instant(&started_at, "started_at")?,
        ended_at: ended_at
            .as_deref()
            .map(|value| parse_instant(value, "ended_at"))
            .transpose()?,
        id,
        subject_id,
        routine_kind,
        attributes,
        note,
        duration_seconds,
    })
}

fn format_instant(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_instant(value: &str, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| {
            InfraError::InvalidState(format!("invalid routine_sessions.{field_name} '{value}': {error}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use chrono::Duration;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    static NEXT_TEMP_DB: AtomicUsize = AtomicUsize::new(0);

    struct TempDatabase {
        dir: PathBuf,
        path: PathBuf,
    }

    impl TempDatabase {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DB.fetch_add(1, Ordering::Relaxed);
            let dir = std::env::temp_dir().join(format!(
                "routine-sessions-sqlite-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&dir).expect("create temp dir");
            let path = dir.join("routines.sqlite");
            initialize_database(&path).expect("initialize database");
            Self { dir, path }
        }
    }

    impl Drop for TempDatabase {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn unique_index_rejects_second_open_session_from_another_connection() {
        let database = TempDatabase::new();
        let phone = SqliteSessionStore::new(&database.path);
        let tablet = SqliteSessionStore::new(&database.path);

        let first = phone
            .start_session("7", RoutineKind::Feeding, StartSessionRequest::default())
            .await
            .expect("phone starts");
        match tablet
            .start_session("7", RoutineKind::Feeding, StartSessionRequest::default())
            .await
        {
            Err(InfraError::AlreadyOpen(existing)) => assert_eq!(*existing, first),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_persists_merged_attributes_and_duration() {
        let database = TempDatabase::new();
        let t0 = fixed_time("2024-06-01T12:00:00Z");
        let clock = Arc::new(Mutex::new(t0));
        let reader = Arc::clone(&clock);
        let store = SqliteSessionStore::new(&database.path)
            .with_now_provider(Arc::new(move || *reader.lock().expect("clock lock")));

        store
            .start_session(
                "7",
                RoutineKind::MilkExtraction,
                StartSessionRequest {
                    attributes: SessionAttributes::from([(
                        "method".to_string(),
                        serde_json::json!("pump"),
                    )]),
                    started_at: None,
                },
            )
            .await
            .expect("start");

        *clock.lock().expect("clock lock") = t0 + Duration::seconds(605);
        let closed = store
            .close_session(
                "7",
                RoutineKind::MilkExtraction,
                CloseSessionRequest {
                    attributes: SessionAttributes::from([("ml".to_string(), serde_json::json!(120))]),
                    note: None,
                },
            )
            .await
            .expect("close");
        assert_eq!(closed.duration_seconds, Some(605));

        let listed = store
            .list_sessions(
                "7",
                ListSessionsRequest {
                    kind: Some(RoutineKind::MilkExtraction),
                    from: t0,
                    to: t0 + Duration::days(1),
                },
            )
            .await
            .expect("list");
        assert_eq!(listed, vec![closed.clone()]);
        assert_eq!(listed[0].attributes.len(), 2);

        let again = store
            .close_session("7", RoutineKind::MilkExtraction, CloseSessionRequest::empty())
            .await;
        assert!(matches!(again, Err(InfraError::NotOpen { .. })));

        store.delete_session(&closed.id).await.expect("delete");
        assert!(store
            .get_open_session("7", RoutineKind::MilkExtraction)
            .await
            .expect("get open")
            .is_none());
    }

    #[tokio::test]
    async fn open_session_cannot_be_deleted() {
        let database = TempDatabase::new();
        let store = SqliteSessionStore::new(&database.path);
        let open = store
            .start_session("7", RoutineKind::Bath, StartSessionRequest::default())
            .await
            .expect("start");
        assert!(matches!(
            store.delete_session(&open.id).await,
            Err(InfraError::InvalidState(_))
        ));
    }
}
