//! Timed routine sessions (feeding, sleep, bath, milk extraction) shared across
//! devices, with at most one open session per subject and routine.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::commands::{
    close_routine_impl, delete_session_impl, get_routine_state_impl, list_sessions_for_day_impl,
    pause_routine_timer_impl, resolve_conflict_impl, resume_routine_timer_impl,
    select_subject_impl, set_timezone_impl, start_routine_impl, timezone_impl,
    update_routine_attributes_impl, workspace_info_impl, AppState, CloseRoutineResponse,
    RoutineStateResponse, SessionHistoryItem, WorkspaceInfo,
};
pub use application::conflict::{ConflictResolution, PendingConflict, ResolutionOutcome};
pub use application::session_controller::{
    CloseOutcome, ControllerOptions, ControllerSnapshot, RoutineSessionController, SessionNotice,
    SessionState, StartOutcome,
};
pub use domain::elapsed::{format_elapsed, ElapsedClock, ElapsedReading, ElapsedTicker};
pub use domain::models::{RoutineKind, RoutineSession, SessionAttributes, SessionKey};
pub use domain::timezone::{from_utc, to_utc, OffsetStrategy, TimeZoneConverter, ZoneId};
pub use infrastructure::error::InfraError;
pub use infrastructure::http_session_store::ReqwestSessionStore;
pub use infrastructure::session_store::{InMemorySessionStore, ListSessionsRequest, SessionStore};
pub use infrastructure::sqlite_session_store::SqliteSessionStore;
