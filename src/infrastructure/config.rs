use crate::domain::timezone::{ZoneId, DEFAULT_ZONE};
use crate::infrastructure::error::InfraError;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_TICK_INTERVAL_MILLIS: u64 = 1000;
const MIN_POLL_INTERVAL_SECONDS: u64 = 5;

pub const ENV_API_BASE_URL: &str = "ROUTINES_API_BASE_URL";
pub const ENV_API_TOKEN: &str = "ROUTINES_API_TOKEN";
pub const ENV_TIMEZONE: &str = "ROUTINES_TIMEZONE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub app_name: String,
    pub timezone: Option<String>,
    pub poll_interval: Duration,
    pub tick_interval: Duration,
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
}

fn default_app_config() -> serde_json::Value {
    serde_json::json!({
        "schema": 1,
        "appName": "Routines",
        "timezone": DEFAULT_ZONE,
        "pollIntervalSeconds": DEFAULT_POLL_INTERVAL_SECONDS,
        "tickIntervalMillis": DEFAULT_TICK_INTERVAL_MILLIS,
        "apiBaseUrl": null
    })
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    if !path.exists() {
        write_config(&path, &default_app_config())?;
    }
    Ok(())
}

fn write_config(path: &Path, value: &serde_json::Value) -> Result<(), InfraError> {
    let formatted = serde_json::to_string_pretty(value)?;
    fs::write(path, format!("{formatted}\n"))?;
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

fn optional_string(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Reads `config/app.json`, letting non-empty values from `lookup` override it.
pub fn load_app_config_with_lookup<F>(config_dir: &Path, lookup: F) -> Result<AppConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let app = read_config(&config_dir.join(APP_JSON))?;
    let env = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let poll_seconds = app
        .get("pollIntervalSeconds")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(DEFAULT_POLL_INTERVAL_SECONDS)
        .max(MIN_POLL_INTERVAL_SECONDS);
    let tick_millis = app
        .get("tickIntervalMillis")
        .and_then(serde_json::Value::as_u64)
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_TICK_INTERVAL_MILLIS);

    Ok(AppConfig {
        app_name: optional_string(&app, "appName").unwrap_or_else(|| "Routines".to_string()),
        timezone: env(ENV_TIMEZONE).or_else(|| optional_string(&app, "timezone")),
        poll_interval: Duration::from_secs(poll_seconds),
        tick_interval: Duration::from_millis(tick_millis),
        api_base_url: env(ENV_API_BASE_URL).or_else(|| optional_string(&app, "apiBaseUrl")),
        api_token: env(ENV_API_TOKEN),
    })
}

pub fn load_app_config(config_dir: &Path) -> Result<AppConfig, InfraError> {
    load_app_config_with_lookup(config_dir, |key| std::env::var(key).ok())
}

/// Persists the zone preference. Unknown zones are refused before anything is written.
pub fn save_timezone(config_dir: &Path, zone: &str) -> Result<ZoneId, InfraError> {
    let zone = ZoneId::parse(zone)?;
    let path = config_dir.join(APP_JSON);
    let mut app = read_config(&path)?;
    let object = app.as_object_mut().ok_or_else(|| {
        InfraError::InvalidConfig(format!("invalid object structure in {}", path.display()))
    })?;
    object.insert(
        "timezone".to_string(),
        serde_json::Value::String(zone.name().to_string()),
    );
    write_config(&path, &app)?;
    Ok(zone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_DIR: AtomicUsize = AtomicUsize::new(0);

    struct TempConfigDir {
        path: PathBuf,
    }

    impl TempConfigDir {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DIR.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "routine-sessions-config-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp config dir");
            ensure_default_configs(&path).expect("write defaults");
            Self { path }
        }
    }

    impl Drop for TempConfigDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn defaults_load_without_environment() {
        let dir = TempConfigDir::new();
        let config = load_app_config_with_lookup(&dir.path, |_| None).expect("load config");
        assert_eq!(config.timezone.as_deref(), Some(DEFAULT_ZONE));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert!(config.api_base_url.is_none());
    }

    #[test]
    fn environment_overrides_file_values() {
        let dir = TempConfigDir::new();
        let config = load_app_config_with_lookup(&dir.path, |key| match key {
            ENV_API_BASE_URL => Some(" https://api.example.com ".to_string()),
            ENV_TIMEZONE => Some("America/Sao_Paulo".to_string()),
            ENV_API_TOKEN => Some("   ".to_string()),
            _ => None,
        })
        .expect("load config");
        assert_eq!(config.api_base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.timezone.as_deref(), Some("America/Sao_Paulo"));
        assert!(config.api_token.is_none());
    }

    #[test]
    fn save_timezone_rejects_unknown_zone_and_keeps_previous() {
        let dir = TempConfigDir::new();
        save_timezone(&dir.path, "Asia/Tokyo").expect("save valid zone");
        assert!(matches!(
            save_timezone(&dir.path, "Atlantis/Capital"),
            Err(InfraError::InvalidZone(_))
        ));
        let config = load_app_config_with_lookup(&dir.path, |_| None).expect("load config");
        assert_eq!(config.timezone.as_deref(), Some("Asia/Tokyo"));
    }

    #[test]
    fn unsupported_schema_is_rejected() {
        let dir = TempConfigDir::new();
        fs::write(dir.path.join(APP_JSON), r#"{"schema": 2}"#).expect("overwrite config");
        assert!(matches!(
            load_app_config_with_lookup(&dir.path, |_| None),
            Err(InfraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let dir = TempConfigDir::new();
        fs::write(
            dir.path.join(APP_JSON),
            r#"{"schema": 1, "pollIntervalSeconds": 1}"#,
        )
        .expect("overwrite config");
        let config = load_app_config_with_lookup(&dir.path, |_| None).expect("load config");
        assert_eq!(config.poll_interval, Duration::from_secs(MIN_POLL_INTERVAL_SECONDS));
    }
}
