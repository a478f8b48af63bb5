use crate::domain::models::{CloseSessionRequest, RoutineKind, RoutineSession, StartSessionRequest};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::session_store::{ensure_subject, ListSessionsRequest, SessionStore};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ReqwestSessionStore {
    client: Client,
    base_url: Url,
    access_token: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: Option<String>,
    session: Option<RoutineSession>,
}

impl ReqwestSessionStore {
    pub fn new(base_url: &str, access_token: Option<String>) -> Result<Self, InfraError> {
        let mut base_url = Url::parse(base_url.trim())
            .map_err(|error| InfraError::InvalidConfig(format!("invalid api base url: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(InfraError::InvalidConfig(
                "api base url cannot be a base".to_string(),
            ));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| InfraError::Network(format!("failed building http client: {error}")))?;
        Ok(Self {
            client,
            base_url,
            access_token: access_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("api base url cannot be a base".to_string())
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn sessions_endpoint(&self, subject_id: &str, kind: RoutineKind) -> Result<Url, InfraError> {
        self.endpoint(&["subjects", subject_id, "routines", kind.path_segment(), "sessions"])
    }

    fn open_session_endpoint(&self, subject_id: &str, kind: RoutineKind) -> Result<Url, InfraError> {
        self.endpoint(&[
            "subjects",
            subject_id,
            "routines",
            kind.path_segment(),
            "sessions",
            "open",
        ])
    }

    fn close_endpoint(&self, subject_id: &str, kind: RoutineKind) -> Result<Url, InfraError> {
        self.endpoint(&[
            "subjects",
            subject_id,
            "routines",
            kind.path_segment(),
            "sessions",
            "open",
            "close",
        ])
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.access_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> Result<(StatusCode, String), InfraError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|error| InfraError::Network(format!("network error while {action}: {error}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Network(format!("failed reading response while {action}: {error}")))?;
        Ok((status, body))
    }
}

fn http_error(status: StatusCode, body: &str, action: &str) -> InfraError {
    let message = if body.trim().is_empty() {
        format!("session api error while {action}: http {}", status.as_u16())
    } else {
        format!("session api error while {action}: http {}; body={body}", status.as_u16())
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        InfraError::Network(message)
    } else {
        InfraError::InvalidState(message)
    }
}

fn parse_session(body: &str, action: &str) -> Result<RoutineSession, InfraError> {
    let session: RoutineSession = serde_json::from_str(body).map_err(|error| {
        InfraError::InvalidState(format!("invalid session payload while {action}: {error}; body={body}"))
    })?;
    session
        .validate()
        .map_err(|message| InfraError::InvalidState(format!("invalid session while {action}: {message}")))?;
    Ok(session)
}

pub(crate) fn interpret_start_response(status: StatusCode, body: &str) -> Result<RoutineSession, InfraError> {
    const ACTION: &str = "starting session";
    if status.is_success() {
        return parse_session(body, ACTION);
    }
    if status == StatusCode::CONFLICT {
        let parsed: ErrorBody = serde_json::from_str(body).map_err(|error| {
            InfraError::InvalidState(format!("invalid conflict payload: {error}; body={body}"))
        })?;
        return match parsed.session {
            Some(existing) => Err(InfraError::AlreadyOpen(Box::new(existing))),
            None => Err(InfraError::InvalidState(format!(
                "conflict without existing session: {}",
                parsed.error.unwrap_or_default()
            ))),
        };
    }
    Err(http_error(status, body, ACTION))
}

pub(crate) fn interpret_open_response(
    status: StatusCode,
    body: &str,
) -> Result<Option<RoutineSession>, InfraError> {
    const ACTION: &str = "fetching open session";
    if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if status.is_success() {
        if body.trim().is_empty() || body.trim() == "null" {
            return Ok(None);
        }
        let session = parse_session(body, ACTION)?;
        return Ok(session.is_open().then_some(session));
    }
    Err(http_error(status, body, ACTION))
}

pub(crate) fn interpret_close_response(
    status: StatusCode,
    body: &str,
    subject_id: &str,
    kind: RoutineKind,
) -> Result<RoutineSession, InfraError> {
    const ACTION: &str = "closing session";
    if status.is_success() {
        return parse_session(body, ACTION);
    }
    if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
        return Err(InfraError::not_open(subject_id, kind));
    }
    Err(http_error(status, body, ACTION))
}

/// Keeps the sessions inside the requested window. Rows that fail validation are
/// skipped with a warning rather than failing the whole listing.
pub(crate) fn interpret_list_response(
    status: StatusCode,
    body: &str,
    request: &ListSessionsRequest,
) -> Result<Vec<RoutineSession>, InfraError> {
    const ACTION: &str = "listing sessions";
    if !status.is_success() {
        return Err(http_error(status, body, ACTION));
    }
    let sessions: Vec<RoutineSession> = serde_json::from_str(body).map_err(|error| {
        InfraError::InvalidState(format!("invalid session list payload: {error}; body={body}"))
    })?;
    Ok(sessions
        .into_iter()
        .filter(|session| match session.validate() {
            Ok(()) => true,
            Err(message) => {
                tracing::warn!(session_id = %session.id, %message, "skipping invalid session in listing");
                false
            }
        })
        .filter(|session| request.contains(session))
        .collect())
}

#[async_trait]
impl SessionStore for ReqwestSessionStore {
    async fn start_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: StartSessionRequest,
    ) -> Result<RoutineSession, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        let endpoint = self.sessions_endpoint(subject_id, kind)?;
        let (status, body) = self
            .send(self.client.post(endpoint).json(&request), "starting session")
            .await?;
        interpret_start_response(status, &body)
    }

    async fn get_open_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
    ) -> Result<Option<RoutineSession>, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        let endpoint = self.open_session_endpoint(subject_id, kind)?;
        let (status, body) = self
            .send(self.client.get(endpoint), "fetching open session")
            .await?;
        interpret_open_response(status, &body)
    }

    async fn close_session(
        &self,
        subject_id: &str,
        kind: RoutineKind,
        request: CloseSessionRequest,
    ) -> Result<RoutineSession, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        let endpoint = self.close_endpoint(subject_id, kind)?;
        let (status, body) = self
            .send(self.client.post(endpoint).json(&request), "closing session")
            .await?;
        interpret_close_response(status, &body, subject_id, kind)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), InfraError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(InfraError::InvalidInput("session_id must not be empty".to_string()));
        }
        let endpoint = self.endpoint(&["sessions", session_id])?;
        let (status, body) = self
            .send(self.client.delete(endpoint), "deleting session")
            .await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if status == StatusCode::CONFLICT {
            return Err(InfraError::InvalidState(format!(
                "session {session_id} is still open; close it before deleting"
            )));
        }
        Err(http_error(status, &body, "deleting session"))
    }

    async fn list_sessions(
        &self,
        subject_id: &str,
        request: ListSessionsRequest,
    ) -> Result<Vec<RoutineSession>, InfraError> {
        let subject_id = ensure_subject(subject_id)?;
        let endpoint = self.endpoint(&["subjects", subject_id, "sessions"])?;
        let mut http_request = self.client.get(endpoint).query(&[
            ("from", request.from.to_rfc3339()),
            ("to", request.to.to_rfc3339()),
        ]);
        if let Some(kind) = request.kind {
            http_request = http_request.query(&[("kind", kind.as_str())]);
        }
        let (status, body) = self.send(http_request, "listing sessions").await?;
        interpret_list_response(status, &body, &request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_json(ended: bool) -> String {
        let mut value = serde_json::json!({
            "id": "ses-42",
            "subjectId": "7",
            "routineKind": "FEEDING",
            "startedAt": "2024-06-01T12:00:00Z",
            "attributes": { "side": "left" }
        });
        if ended {
            value["endedAt"] = serde_json::json!("2024-06-01T12:20:30Z");
            value["durationSeconds"] = serde_json::json!(1230);
        }
        value.to_string()
    }

    #[test]
    fn endpoints_are_built_from_base_with_or_without_trailing_slash() {
        for base in ["https://api.example.com/v1", "https://api.example.com/v1/"] {
            let store = ReqwestSessionStore::new(base, None).expect("store");
            let url = store
                .close_endpoint("7", RoutineKind::MilkExtraction)
                .expect("close endpoint");
            assert_eq!(
                url.as_str(),
                "https://api.example.com/v1/subjects/7/routines/milk-extraction/sessions/open/close"
            );
        }
    }

    #[test]
    fn subject_ids_are_percent_encoded() {
        let store = ReqwestSessionStore::new("https://api.example.com", None).expect("store");
        let url = store
            .sessions_endpoint("baby/7", RoutineKind::Sleep)
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://api.example.com/subjects/baby%2F7/routines/sleep/sessions"
        );
    }

    #[test]
    fn invalid_base_url_is_a_config_error() {
        assert!(matches!(
            ReqwestSessionStore::new("not a url", None),
            Err(InfraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn start_conflict_carries_existing_session() {
        let body = format!(r#"{{"error":"ALREADY_OPEN","session":{}}}"#, session_json(false));
        match interpret_start_response(StatusCode::CONFLICT, &body) {
            Err(InfraError::AlreadyOpen(existing)) => {
                assert_eq!(existing.id, "ses-42");
                assert!(existing.is_open());
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn start_success_parses_session() {
        let session = interpret_start_response(StatusCode::CREATED, &session_json(false))
            .expect("created session");
        assert_eq!(session.routine_kind, RoutineKind::Feeding);
    }

    #[test]
    fn server_errors_are_retryable_network_failures() {
        let error = interpret_start_response(StatusCode::BAD_GATEWAY, "").expect_err("error");
        assert!(error.is_retryable());
        let error = interpret_start_response(StatusCode::BAD_REQUEST, "nope").expect_err("error");
        assert!(!error.is_retryable());
    }

    #[test]
    fn open_lookup_treats_missing_and_closed_as_none() {
        assert!(interpret_open_response(StatusCode::NOT_FOUND, "").expect("404").is_none());
        assert!(interpret_open_response(StatusCode::NO_CONTENT, "").expect("204").is_none());
        assert!(interpret_open_response(StatusCode::OK, "null").expect("null").is_none());
        assert!(interpret_open_response(StatusCode::OK, &session_json(true))
            .expect("closed")
            .is_none());
        assert!(interpret_open_response(StatusCode::OK, &session_json(false))
            .expect("open")
            .is_some());
    }

    #[test]
    fn close_maps_missing_session_to_not_open() {
        let result = interpret_close_response(StatusCode::NOT_FOUND, "", "7", RoutineKind::Feeding);
        assert!(matches!(result, Err(InfraError::NotOpen { .. })));

        let closed = interpret_close_response(StatusCode::OK, &session_json(true), "7", RoutineKind::Feeding)
            .expect("closed");
        assert_eq!(closed.duration_seconds, Some(1230));
    }

    #[test]
    fn listing_skips_invalid_rows_and_keeps_the_window() {
        let day = ListSessionsRequest {
            kind: None,
            from: "2024-06-01T00:00:00Z".parse().expect("from"),
            to: "2024-06-02T00:00:00Z".parse().expect("to"),
        };
        let body = serde_json::json!([
            serde_json::from_str::<serde_json::Value>(&session_json(true)).expect("session"),
            {
                "id": " ",
                "subjectId": "7",
                "routineKind": "SLEEP",
                "startedAt": "2024-06-01T13:00:00Z"
            },
            {
                "id": "ses-43",
                "subjectId": "7",
                "routineKind": "BATH",
                "startedAt": "2024-06-02T08:00:00Z"
            }
        ])
        .to_string();

        let sessions = interpret_list_response(StatusCode::OK, &body, &day).expect("list");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "ses-42");

        assert!(matches!(
            interpret_list_response(StatusCode::BAD_GATEWAY, "", &day),
            Err(InfraError::Network(_))
        ));
    }
}
