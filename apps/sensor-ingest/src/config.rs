use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TOPICS: &[&str] = &[
    "sensor/temperature/livingroom",
    "sensor/temperature/bedroom",
    "sensor/humidity/livingroom",
    "sensor/humidity/bedroom",
    "sensor/moisture/plant1",
    "sensor/moisture/plant2",
    "sensor/moisture/plant3",
];

const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 600;

/// Optional JSON file written by the installer. Values only apply where the
/// matching env var is unset.
#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    data_dir: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topics: Option<Vec<String>>,
    #[serde(default)]
    flush_interval_secs: Option<u64>,
    #[serde(default)]
    max_buffered: Option<usize>,
    #[serde(default)]
    http_bind: Option<String>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = env_optional("SENSOR_SETUP_CONFIG_PATH").map(PathBuf::from)?;
    read_setup_config(&path)
}

fn read_setup_config(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "sensor-ingest failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "sensor-ingest failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_topics: Vec<String>,
    pub flush_interval_secs: u64,
    /// Zero keeps the buffer unbounded.
    pub max_buffered: usize,
    pub http_bind: String,
    pub enable_http: bool,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            database_url: default_database_url(&data_dir),
            data_dir,
            db_pool_size: 4,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_client_id: "sensor_subscriber".to_string(),
            mqtt_keepalive_secs: 60,
            mqtt_topics: DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            max_buffered: 0,
            http_bind: "0.0.0.0:5000".to_string(),
            enable_http: true,
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let overrides = load_setup_config_overrides().unwrap_or_default();
        Self::from_sources(env_optional, &overrides)
    }

    fn from_sources(
        lookup: impl Fn(&str) -> Option<String>,
        overrides: &SetupConfigOverrides,
    ) -> Result<Self> {
        let defaults = Config::default();

        let data_dir = lookup("SENSOR_DATA_DIR")
            .or_else(|| non_empty(overrides.data_dir.as_deref()))
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let database_url = lookup("SENSOR_DATABASE_URL")
            .or_else(|| lookup("DATABASE_URL"))
            .or_else(|| non_empty(overrides.database_url.as_deref()))
            .unwrap_or_else(|| default_database_url(&data_dir));
        let db_pool_size =
            parse_or("SENSOR_DB_POOL_SIZE", lookup("SENSOR_DB_POOL_SIZE"), defaults.db_pool_size)?;

        let mqtt_host = lookup("SENSOR_MQTT_HOST")
            .or_else(|| non_empty(overrides.mqtt_host.as_deref()))
            .unwrap_or(defaults.mqtt_host);
        let mqtt_port = match lookup("SENSOR_MQTT_PORT") {
            Some(raw) => parse_value("SENSOR_MQTT_PORT", &raw)?,
            None => overrides
                .mqtt_port
                .filter(|v| *v != 0)
                .unwrap_or(defaults.mqtt_port),
        };
        let mqtt_username = lookup("SENSOR_MQTT_USERNAME")
            .or_else(|| non_empty(overrides.mqtt_username.as_deref()));
        let mqtt_password = lookup("SENSOR_MQTT_PASSWORD")
            .or_else(|| non_empty(overrides.mqtt_password.as_deref()));
        let mqtt_client_id = lookup("SENSOR_MQTT_CLIENT_ID").unwrap_or(defaults.mqtt_client_id);
        let mqtt_keepalive_secs = parse_or(
            "SENSOR_MQTT_KEEPALIVE_SECS",
            lookup("SENSOR_MQTT_KEEPALIVE_SECS"),
            defaults.mqtt_keepalive_secs,
        )?;
        let mqtt_topics = match lookup("SENSOR_MQTT_TOPICS") {
            Some(raw) => split_topics(&raw),
            None => overrides
                .mqtt_topics
                .as_ref()
                .map(|topics| {
                    topics
                        .iter()
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|topics| !topics.is_empty())
                .unwrap_or(defaults.mqtt_topics),
        };
        if mqtt_topics.is_empty() {
            bail!("SENSOR_MQTT_TOPICS must name at least one topic");
        }

        let flush_interval_secs = match lookup("SENSOR_FLUSH_INTERVAL_SECS") {
            Some(raw) => parse_value("SENSOR_FLUSH_INTERVAL_SECS", &raw)?,
            None => overrides
                .flush_interval_secs
                .unwrap_or(defaults.flush_interval_secs),
        };
        if flush_interval_secs == 0 {
            bail!("SENSOR_FLUSH_INTERVAL_SECS must be greater than zero");
        }
        let max_buffered = match lookup("SENSOR_MAX_BUFFERED") {
            Some(raw) => parse_value("SENSOR_MAX_BUFFERED", &raw)?,
            None => overrides.max_buffered.unwrap_or(defaults.max_buffered),
        };

        let http_bind = lookup("SENSOR_HTTP_BIND")
            .or_else(|| non_empty(overrides.http_bind.as_deref()))
            .unwrap_or(defaults.http_bind);
        let enable_http = match lookup("SENSOR_ENABLE_HTTP") {
            Some(raw) => parse_flag("SENSOR_ENABLE_HTTP", &raw)?,
            None => defaults.enable_http,
        };
        let otlp_endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            data_dir,
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive_secs,
            mqtt_topics,
            flush_interval_secs,
            max_buffered,
            http_bind,
            enable_http,
            otlp_endpoint,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn buffer_capacity(&self) -> Option<usize> {
        Some(self.max_buffered).filter(|cap| *cap > 0)
    }
}

fn default_database_url(data_dir: &Path) -> String {
    format!("sqlite://{}", data_dir.join("sensor_data.db").display())
}

fn split_topics(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("invalid {key}: {raw:?}"))
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid {key}: {raw:?} (expected true/false)"),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_stock_deployment() {
        let config =
            Config::from_sources(lookup_from(&[]), &SetupConfigOverrides::default()).unwrap();
        assert_eq!(config.flush_interval(), Duration::from_secs(600));
        assert_eq!(config.mqtt_topics.len(), DEFAULT_TOPICS.len());
        assert_eq!(config.database_url, "sqlite://data/sensor_data.db");
        assert_eq!(config.buffer_capacity(), None);
        assert_eq!(config.mqtt_client_id, "sensor_subscriber");
    }

    #[test]
    fn env_values_win_over_setup_file() {
        let overrides = SetupConfigOverrides {
            mqtt_host: Some("broker.lan".into()),
            flush_interval_secs: Some(120),
            mqtt_topics: Some(vec!["sensor/+/+".into()]),
            ..SetupConfigOverrides::default()
        };
        let config = Config::from_sources(
            lookup_from(&[("SENSOR_FLUSH_INTERVAL_SECS", "30"), ("SENSOR_MAX_BUFFERED", "500")]),
            &overrides,
        )
        .unwrap();
        assert_eq!(config.mqtt_host, "broker.lan");
        assert_eq!(config.flush_interval_secs, 30);
        assert_eq!(config.mqtt_topics, vec!["sensor/+/+".to_string()]);
        assert_eq!(config.buffer_capacity(), Some(500));
    }

    #[test]
    fn topics_list_is_comma_separated() {
        let config = Config::from_sources(
            lookup_from(&[("SENSOR_MQTT_TOPICS", "sensor/temperature/attic, sensor/moisture/fern,")]),
            &SetupConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(
            config.mqtt_topics,
            vec!["sensor/temperature/attic".to_string(), "sensor/moisture/fern".to_string()]
        );
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = Config::from_sources(
            lookup_from(&[("SENSOR_FLUSH_INTERVAL_SECS", "ten")]),
            &SetupConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("SENSOR_FLUSH_INTERVAL_SECS"));

        assert!(Config::from_sources(
            lookup_from(&[("SENSOR_FLUSH_INTERVAL_SECS", "0")]),
            &SetupConfigOverrides::default(),
        )
        .is_err());
    }

    #[test]
    fn http_flag_accepts_common_spellings_only() {
        for (raw, expected) in [("true", true), ("ON", true), ("1", true), ("no", false), ("0", false)] {
            let config = Config::from_sources(
                lookup_from(&[("SENSOR_ENABLE_HTTP", raw)]),
                &SetupConfigOverrides::default(),
            )
            .unwrap();
            assert_eq!(config.enable_http, expected, "{raw}");
        }

        let err = Config::from_sources(
            lookup_from(&[("SENSOR_ENABLE_HTTP", "maybe")]),
            &SetupConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("SENSOR_ENABLE_HTTP"));
    }

    #[test]
    fn setup_file_is_parsed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"mqtt_port": 8883, "data_dir": "/var/lib/sensors", "unknown_key": true}"#,
        )
        .unwrap();
        let overrides = read_setup_config(&path).expect("overrides");
        let config = Config::from_sources(lookup_from(&[]), &overrides).unwrap();
        assert_eq!(config.mqtt_port, 8883);
        assert_eq!(config.database_url, "sqlite:///var/lib/sensors/sensor_data.db");

        std::fs::write(&path, "{broken").unwrap();
        assert!(read_setup_config(&path).is_none());
    }
}
