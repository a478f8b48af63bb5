use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind-specific key/value bag (breast side, bottle volume, extraction method...).
pub type SessionAttributes = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum RoutineKind {
    Feeding,
    Sleep,
    Bath,
    MilkExtraction,
}

impl RoutineKind {
    pub const ALL: [RoutineKind; 4] = [
        RoutineKind::Feeding,
        RoutineKind::Sleep,
        RoutineKind::Bath,
        RoutineKind::MilkExtraction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Feeding => "FEEDING",
            Self::Sleep => "SLEEP",
            Self::Bath => "BATH",
            Self::MilkExtraction => "MILK_EXTRACTION",
        }
    }

    /// Lowercase name used in user-facing messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Feeding => "feeding",
            Self::Sleep => "sleep",
            Self::Bath => "bath",
            Self::MilkExtraction => "milk extraction",
        }
    }

    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Feeding => "feeding",
            Self::Sleep => "sleep",
            Self::Bath => "bath",
            Self::MilkExtraction => "milk-extraction",
        }
    }
}

impl fmt::Display for RoutineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutineKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "FEEDING" => Ok(Self::Feeding),
            "SLEEP" => Ok(Self::Sleep),
            "BATH" => Ok(Self::Bath),
            "MILK_EXTRACTION" => Ok(Self::MilkExtraction),
            _ => Err(format!("unknown routine kind: {}", value.trim())),
        }
    }
}

/// The pair the one-open-session invariant is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub subject_id: String,
    pub kind: RoutineKind,
}

impl SessionKey {
    pub fn new(subject_id: impl Into<String>, kind: RoutineKind) -> Self {
        Self {
            subject_id: subject_id.into(),
            kind,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject_id, self.kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutineSession {
    pub id: String,
    pub subject_id: String,
    pub routine_kind: RoutineKind,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: SessionAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

impl RoutineSession {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "session.id")?;
        validate_non_empty(&self.subject_id, "session.subject_id")?;
        if let Some(ended_at) = self.ended_at {
            if ended_at < self.started_at {
                return Err("session.ended_at must be >= session.started_at".to_string());
            }
        }
        if self.ended_at.is_none() && self.duration_seconds.is_some() {
            return Err("session.duration_seconds is only set once closed".to_string());
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.subject_id.clone(), self.routine_kind)
    }
}

/// Whole seconds between two instants, rounded down and never negative.
pub fn whole_seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().max(0)
}

/// Overlays `overlay` on `base`; keys present in both take the overlay value.
pub fn merge_attributes(base: &SessionAttributes, overlay: &SessionAttributes) -> SessionAttributes {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    #[serde(default)]
    pub attributes: SessionAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionRequest {
    #[serde(default)]
    pub attributes: SessionAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CloseSessionRequest {
    pub fn empty() -> Self {
        Self::default()
    }
}

pub(crate) fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_session() -> RoutineSession {
        RoutineSession {
            id: "ses-1".to_string(),
            subject_id: "7".to_string(),
            routine_kind: RoutineKind::Feeding,
            started_at: fixed_time("2024-06-01T12:00:00Z"),
            ended_at: None,
            attributes: SessionAttributes::from([(
                "side".to_string(),
                serde_json::json!("left"),
            )]),
            note: None,
            duration_seconds: None,
        }
    }

    #[test]
    fn session_validate_accepts_open_session() {
        assert!(sample_session().validate().is_ok());
        assert!(sample_session().is_open());
    }

    #[test]
    fn session_validate_rejects_end_before_start() {
        let mut session = sample_session();
        session.ended_at = Some(fixed_time("2024-06-01T11:59:59Z"));
        assert!(session.validate().is_err());
    }

    #[test]
    fn session_validate_rejects_duration_on_open_session() {
        let mut session = sample_session();
        session.duration_seconds = Some(10);
        assert!(session.validate().is_err());
    }

    #[test]
    fn session_validate_rejects_blank_subject() {
        let mut session = sample_session();
        session.subject_id = "  ".to_string();
        assert!(session.validate().is_err());
    }

    #[test]
    fn routine_kind_parses_loose_spellings() {
        assert_eq!("milk-extraction".parse::<RoutineKind>(), Ok(RoutineKind::MilkExtraction));
        assert_eq!(" sleep ".parse::<RoutineKind>(), Ok(RoutineKind::Sleep));
        assert!("nap".parse::<RoutineKind>().is_err());
    }

    #[test]
    fn session_uses_camel_case_wire_names() {
        let mut session = sample_session();
        session.routine_kind = RoutineKind::MilkExtraction;
        let value = serde_json::to_value(&session).expect("serialize session");
        assert_eq!(value["subjectId"], "7");
        assert_eq!(value["routineKind"], "MILK_EXTRACTION");
        assert!(value.get("endedAt").is_none());

        let decoded: RoutineSession = serde_json::from_value(value).expect("deserialize session");
        assert_eq!(decoded, session);
    }

    #[test]
    fn whole_seconds_round_down() {
        let start = fixed_time("2024-06-01T12:00:00Z");
        let end = start + chrono::Duration::milliseconds(59_999);
        assert_eq!(whole_seconds_between(start, end), 59);
        assert_eq!(whole_seconds_between(end, start), 0);
    }

    proptest! {
        #[test]
        fn merge_keeps_base_keys_and_prefers_overlay(
            base in proptest::collection::btree_map("[a-z]{1,6}", 0i64..100, 0..6),
            overlay in proptest::collection::btree_map("[a-z]{1,6}", 100i64..200, 0..6)
        ) {
            let base: SessionAttributes = base.into_iter().map(|(k, v)| (k, serde_json::json!(v))).collect();
            let overlay: SessionAttributes = overlay.into_iter().map(|(k, v)| (k, serde_json::json!(v))).collect();
            let merged = merge_attributes(&base, &overlay);

            for (key, value) in &overlay {
                prop_assert_eq!(merged.get(key), Some(value));
            }
            for (key, value) in &base {
                if !overlay.contains_key(key) {
                    prop_assert_eq!(merged.get(key), Some(value));
                }
            }
        }
    }
}
