use crate::application::bootstrap::{bootstrap_workspace, BootstrapResult};
use crate::application::conflict::{ConflictResolution, ResolutionOutcome};
use crate::application::session_controller::{
    CloseOutcome, ControllerOptions, ControllerSnapshot, RoutineSessionController, StartOutcome,
};
use crate::domain::models::{RoutineKind, RoutineSession, SessionAttributes, SessionKey};
use crate::domain::timezone::{detect_zone, TimeZoneConverter, ZoneId};
use crate::infrastructure::config::{save_timezone, AppConfig};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_session_store::ReqwestSessionStore;
use crate::infrastructure::logging::init_logging;
use crate::infrastructure::session_store::{ListSessionsRequest, SessionStore};
use crate::infrastructure::sqlite_session_store::SqliteSessionStore;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinSet;

pub type SharedSessionStore = Arc<dyn SessionStore>;
pub type SharedController = RoutineSessionController<dyn SessionStore>;

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    config: AppConfig,
    store: SharedSessionStore,
    zone: Mutex<ZoneId>,
    runtime: Mutex<RuntimeState>,
}

#[derive(Default)]
struct RuntimeState {
    subject_id: Option<String>,
    controllers: HashMap<SessionKey, SharedController>,
}

impl AppState {
    /// Opens the workspace and talks to the remote API when one is configured,
    /// otherwise to the local database under `state/`.
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let store: SharedSessionStore = match bootstrap.config.api_base_url.as_deref() {
            Some(base_url) => Arc::new(ReqwestSessionStore::new(
                base_url,
                bootstrap.config.api_token.clone(),
            )?),
            None => Arc::new(SqliteSessionStore::new(&bootstrap.database_path)),
        };
        Self::from_bootstrap(bootstrap, store)
    }

    pub fn with_store(workspace_root: PathBuf, store: SharedSessionStore) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        Self::from_bootstrap(bootstrap, store)
    }

    fn from_bootstrap(bootstrap: BootstrapResult, store: SharedSessionStore) -> Result<Self, InfraError> {
        if !init_logging(&bootstrap.logs_dir)? {
            tracing::debug!("tracing subscriber already installed");
        }
        let zone = detect_zone(bootstrap.config.timezone.as_deref());
        tracing::info!(
            workspace = %bootstrap.workspace_root.display(),
            remote = bootstrap.config.api_base_url.is_some(),
            zone = %zone,
            "workspace ready"
        );

        Ok(Self {
            config_dir: bootstrap.config_dir,
            database_path: bootstrap.database_path,
            config: bootstrap.config,
            store,
            zone: Mutex::new(zone),
            runtime: Mutex::new(RuntimeState::default()),
        })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Logs the raw error and returns a message phrased in terms of the activity.
    pub fn command_error(&self, command: &str, kind: Option<RoutineKind>, error: &InfraError) -> String {
        tracing::error!(command, kind = kind.map(RoutineKind::as_str), %error, "command failed");
        user_message(command, kind, error)
    }

    pub fn log_info(&self, command: &str, message: &str) {
        tracing::info!(command, "{message}");
    }

    fn controller_options(&self) -> ControllerOptions {
        ControllerOptions::default()
            .with_poll_interval(Some(self.config.poll_interval))
            .with_tick_interval(self.config.tick_interval)
    }

    fn converter(&self) -> Result<TimeZoneConverter, InfraError> {
        Ok(TimeZoneConverter::new(*lock_zone(self)?))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkspaceInfo {
    pub app_name: String,
    pub config_dir: String,
    pub database_path: String,
    pub remote: bool,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoutineStateResponse {
    #[serde(flatten)]
    pub snapshot: ControllerSnapshot,
    pub started_at_local: Option<String>,
    pub conflict_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CloseRoutineResponse {
    pub status: String,
    pub duration_seconds: Option<i64>,
    pub ended_at_local: Option<String>,
    pub routine: RoutineStateResponse,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionHistoryItem {
    #[serde(flatten)]
    pub session: RoutineSession,
    pub started_at_local: String,
    pub ended_at_local: Option<String>,
}

/// Switches the active subject and adopts whatever is already open for it.
pub async fn select_subject_impl(
    state: &AppState,
    subject_id: String,
) -> Result<Vec<RoutineStateResponse>, InfraError> {
    let subject_id = subject_id.trim().to_string();
    if subject_id.is_empty() {
        return Err(InfraError::InvalidInput("subject_id must not be empty".to_string()));
    }

    let controllers = {
        let mut runtime = lock_runtime(state)?;
        if runtime.subject_id.as_deref() != Some(subject_id.as_str()) {
            for controller in runtime.controllers.values() {
                controller.tear_down()?;
            }
            runtime.controllers.clear();
            for kind in RoutineKind::ALL {
                let controller = RoutineSessionController::with_options(
                    subject_id.clone(),
                    kind,
                    Arc::clone(&state.store),
                    state.controller_options(),
                );
                runtime.controllers.insert(controller.key().clone(), controller);
            }
            runtime.subject_id = Some(subject_id.clone());
        }
        RoutineKind::ALL
            .iter()
            .filter_map(|kind| {
                runtime
                    .controllers
                    .get(&SessionKey::new(subject_id.clone(), *kind))
                    .cloned()
            })
            .collect::<Vec<_>>()
    };

    let mut mounts = JoinSet::new();
    for controller in controllers.iter().cloned() {
        mounts.spawn(async move { controller.mount().await });
    }
    while let Some(joined) = mounts.join_next().await {
        joined.map_err(|error| InfraError::InvalidState(format!("mount task failed: {error}")))??;
    }

    state.log_info("select_subject", &format!("selected subject_id={subject_id}"));
    controllers
        .iter()
        .map(|controller| routine_response(state, controller.snapshot()?))
        .collect()
}

pub async fn start_routine_impl(
    state: &AppState,
    kind: String,
    attributes: Option<SessionAttributes>,
    started_at_local: Option<String>,
) -> Result<RoutineStateResponse, InfraError> {
    let kind = parse_kind(&kind)?;
    let controller = controller_for(state, kind)?;
    let started_at = started_at_local
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| state.converter()?.to_utc(value))
        .transpose()?;

    match controller
        .request_start(attributes.unwrap_or_default(), started_at)
        .await?
    {
        StartOutcome::Started(session) => state.log_info(
            "start_routine",
            &format!("started {} session_id={}", kind.as_str(), session.id),
        ),
        StartOutcome::Conflict(conflict) => state.log_info(
            "start_routine",
            &format!(
                "{} already open session_id={}",
                kind.as_str(),
                conflict.existing.id
            ),
        ),
    }
    routine_response(state, controller.snapshot()?)
}

pub async fn resolve_conflict_impl(
    state: &AppState,
    kind: String,
    resolution: String,
) -> Result<RoutineStateResponse, InfraError> {
    let kind = parse_kind(&kind)?;
    let resolution = resolution.parse::<ConflictResolution>()?;
    let controller = controller_for(state, kind)?;

    let outcome = controller.resolve_conflict(resolution).await?;
    let message = match &outcome {
        ResolutionOutcome::Resumed(session) => format!("resumed session_id={}", session.id),
        ResolutionOutcome::Finished(session) => format!("finished session_id={}", session.id),
        ResolutionOutcome::AlreadyFinished => "existing session was already finished".to_string(),
    };
    state.log_info("resolve_conflict", &message);
    routine_response(state, controller.snapshot()?)
}

pub async fn close_routine_impl(
    state: &AppState,
    kind: String,
    attributes: Option<SessionAttributes>,
    note: Option<String>,
) -> Result<CloseRoutineResponse, InfraError> {
    let kind = parse_kind(&kind)?;
    let controller = controller_for(state, kind)?;

    let outcome = controller
        .request_close(attributes.unwrap_or_default(), note)
        .await?;
    let converter = state.converter()?;
    let (status, duration_seconds, ended_at_local) = match &outcome {
        CloseOutcome::Closed(session) => (
            "closed",
            session.duration_seconds,
            session.ended_at.map(|ended_at| converter.from_utc(ended_at)),
        ),
        CloseOutcome::AlreadyFinished => ("already_finished", None, None),
    };
    state.log_info(
        "close_routine",
        &format!("{status} {} duration_seconds={duration_seconds:?}", kind.as_str()),
    );

    Ok(CloseRoutineResponse {
        status: status.to_string(),
        duration_seconds,
        ended_at_local,
        routine: routine_response(state, controller.snapshot()?)?,
    })
}

pub fn update_routine_attributes_impl(
    state: &AppState,
    kind: String,
    attributes: SessionAttributes,
) -> Result<RoutineStateResponse, InfraError> {
    let kind = parse_kind(&kind)?;
    let snapshot = controller_for(state, kind)?.update_attributes(attributes)?;
    routine_response(state, snapshot)
}

pub fn pause_routine_timer_impl(state: &AppState, kind: String) -> Result<RoutineStateResponse, InfraError> {
    let kind = parse_kind(&kind)?;
    let snapshot = controller_for(state, kind)?.pause_timer()?;
    state.log_info("pause_routine_timer", &format!("paused {} timer", kind.as_str()));
    routine_response(state, snapshot)
}

pub fn resume_routine_timer_impl(state: &AppState, kind: String) -> Result<RoutineStateResponse, InfraError> {
    let kind = parse_kind(&kind)?;
    let snapshot = controller_for(state, kind)?.resume_timer()?;
    state.log_info("resume_routine_timer", &format!("resumed {} timer", kind.as_str()));
    routine_response(state, snapshot)
}

pub fn get_routine_state_impl(state: &AppState, kind: String) -> Result<RoutineStateResponse, InfraError> {
    let kind = parse_kind(&kind)?;
    let snapshot = controller_for(state, kind)?.snapshot()?;
    routine_response(state, snapshot)
}

/// Sessions of the active subject that started on `date` (`YYYY-MM-DD`) in the
/// configured zone.
pub async fn list_sessions_for_day_impl(
    state: &AppState,
    date: String,
    kind: Option<String>,
) -> Result<Vec<SessionHistoryItem>, InfraError> {
    let subject_id = selected_subject(state)?;
    let kind = kind
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(parse_kind)
        .transpose()?;
    let converter = state.converter()?;
    let (from, to) = converter.day_bounds(&date)?;

    let sessions = state
        .store
        .list_sessions(&subject_id, ListSessionsRequest { kind, from, to })
        .await?;
    Ok(sessions
        .into_iter()
        .map(|session| SessionHistoryItem {
            started_at_local: converter.from_utc(session.started_at),
            ended_at_local: session.ended_at.map(|ended_at| converter.from_utc(ended_at)),
            session,
        })
        .collect())
}

pub async fn delete_session_impl(state: &AppState, session_id: String) -> Result<bool, InfraError> {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return Err(InfraError::InvalidInput("session_id must not be empty".to_string()));
    }
    state.store.delete_session(session_id).await?;
    state.log_info("delete_session", &format!("deleted session_id={session_id}"));
    Ok(true)
}

/// Validates and persists the zone preference before any conversion uses it.
pub fn set_timezone_impl(state: &AppState, zone: String) -> Result<String, InfraError> {
    let zone = save_timezone(&state.config_dir, &zone)?;
    *lock_zone(state)? = zone;
    state.log_info("set_timezone", &format!("zone={zone}"));
    Ok(zone.name().to_string())
}

pub fn timezone_impl(state: &AppState) -> Result<String, InfraError> {
    Ok(lock_zone(state)?.name().to_string())
}

pub fn workspace_info_impl(state: &AppState) -> Result<WorkspaceInfo, InfraError> {
    let config = state.config();
    Ok(WorkspaceInfo {
        app_name: config.app_name.clone(),
        config_dir: state.config_dir().display().to_string(),
        database_path: state.database_path().display().to_string(),
        remote: config.api_base_url.is_some(),
        timezone: timezone_impl(state)?,
    })
}

fn routine_response(state: &AppState, snapshot: ControllerSnapshot) -> Result<RoutineStateResponse, InfraError> {
    let converter = state.converter()?;
    let started_at_local = snapshot
        .open_session
        .as_ref()
        .map(|session| converter.from_utc(session.started_at));
    let conflict_options = snapshot
        .conflict
        .as_ref()
        .map(|conflict| {
            conflict
                .options()
                .iter()
                .map(|option| option.as_str().to_string())
                .collect()
        })
        .unwrap_or_default();
    Ok(RoutineStateResponse {
        snapshot,
        started_at_local,
        conflict_options,
    })
}

fn parse_kind(raw: &str) -> Result<RoutineKind, InfraError> {
    raw.parse::<RoutineKind>().map_err(InfraError::InvalidInput)
}

fn selected_subject(state: &AppState) -> Result<String, InfraError> {
    lock_runtime(state)?
        .subject_id
        .clone()
        .ok_or_else(|| InfraError::InvalidState("select a subject first".to_string()))
}

fn controller_for(state: &AppState, kind: RoutineKind) -> Result<SharedController, InfraError> {
    let runtime = lock_runtime(state)?;
    let subject_id = runtime
        .subject_id
        .clone()
        .ok_or_else(|| InfraError::InvalidState("select a subject first".to_string()))?;
    runtime
        .controllers
        .get(&SessionKey::new(subject_id, kind))
        .cloned()
        .ok_or_else(|| InfraError::InvalidState(format!("no controller for {}", kind.label())))
}

fn lock_runtime(state: &AppState) -> Result<MutexGuard<'_, RuntimeState>, InfraError> {
    state
        .runtime
        .lock()
        .map_err(|error| InfraError::InvalidState(format!("runtime lock poisoned: {error}")))
}

fn lock_zone(state: &AppState) -> Result<MutexGuard<'_, ZoneId>, InfraError> {
    state
        .zone
        .lock()
        .map_err(|error| InfraError::InvalidState(format!("zone lock poisoned: {error}")))
}

fn user_message(command: &str, kind: Option<RoutineKind>, error: &InfraError) -> String {
    let activity = kind.map(RoutineKind::label).unwrap_or("this activity");
    match error {
        InfraError::NotOpen { .. } => format!("The {activity} was already finished."),
        InfraError::AlreadyOpen(_) => format!("A {activity} is already in progress."),
        InfraError::InvalidZone(_) => "That time zone is not recognized.".to_string(),
        InfraError::InvalidInput(_) => {
            format!("Could not {}. Please check the details.", action_phrase(command, activity))
        }
        _ => format!("Could not {}. Please try again.", action_phrase(command, activity)),
    }
}

fn action_phrase(command: &str, activity: &str) -> String {
    match command {
        "start_routine" => format!("start {activity}"),
        "close_routine" => format!("finish {activity}"),
        "resolve_conflict" => format!("resolve the open {activity}"),
        "update_routine_attributes" => format!("update {activity}"),
        "pause_routine_timer" | "resume_routine_timer" => format!("change the {activity} timer"),
        "select_subject" => "load routines".to_string(),
        "list_sessions_for_day" => "load history".to_string(),
        "delete_session" => "delete the session".to_string(),
        "set_timezone" => "change the time zone".to_string(),
        _ => "complete the request".to_string(),
    }
}
