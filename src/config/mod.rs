use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_CONFIG_FILE: &str = "xmsgd.toml";
pub const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub wire: WireConfig,
    pub dispatcher: DispatcherConfig,
    pub broker: BrokerConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 1279,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WireConfig {
    pub max_envelope_size_bytes: usize,
    pub idle_timeout_seconds: u64,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_envelope_size_bytes: 8 * 1024 * 1024,
            idle_timeout_seconds: 7_200,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    pub worker_threads: usize,
    // 0 keeps the pending-connection queue unbounded.
    pub max_pending: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_threads: 10,
            max_pending: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub bucket_count: usize,
    pub retention_window_seconds: u64,
    pub default_ticket_lifetime_seconds: u64,
    pub max_ticket_lifetime_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bucket_count: 47,
            retention_window_seconds: 4 * 3_600,
            default_ticket_lifetime_seconds: 4 * 3_600,
            max_ticket_lifetime_seconds: 48 * 3_600,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            sweep_interval_seconds: 60,
        }
    }
}

impl AppConfig {
    // `--config <path>` wins, then ./xmsgd.toml, then built-in defaults.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let (explicit_path, override_args) = split_config_path_arg(args)?;
        let path = explicit_path.or_else(|| {
            let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
            candidate.is_file().then_some(candidate)
        });

        match path {
            Some(path) => Self::load_from_toml_with_args(path, override_args),
            None => Self::load_defaults_with_args(override_args),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        let file_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path.as_ref().to_string_lossy().to_string(),
                    source,
                })?;

        let mut root_value = default_value()?;
        merge_tables(&mut root_value, file_value);
        Self::finish(root_value, args)
    }

    pub fn load_defaults_with_args(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        Self::finish(default_value()?, args)
    }

    fn finish(
        mut root_value: Value,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool, &'static str); 7] = [
            (
                "wire.max_envelope_size_bytes",
                self.wire.max_envelope_size_bytes > 0,
                "must be positive",
            ),
            (
                "wire.idle_timeout_seconds",
                self.wire.idle_timeout_seconds > 0,
                "must be positive",
            ),
            (
                "dispatcher.worker_threads",
                self.dispatcher.worker_threads > 0,
                "at least one worker thread is required",
            ),
            (
                "broker.bucket_count",
                self.broker.bucket_count > 0,
                "must be positive",
            ),
            (
                "broker.retention_window_seconds",
                self.broker.retention_window_seconds > 0,
                "must be positive",
            ),
            (
                "broker.max_ticket_lifetime_seconds",
                self.broker.max_ticket_lifetime_seconds
                    >= self.broker.default_ticket_lifetime_seconds,
                "must not be shorter than broker.default_ticket_lifetime_seconds",
            ),
            (
                "heartbeat.sweep_interval_seconds",
                self.heartbeat.sweep_interval_seconds > 0,
                "must be positive",
            ),
        ];

        for (key, valid, reason) in checks {
            if !valid {
                return Err(ConfigError::InvalidSetting { key, reason });
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Serialize(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidSetting {
        key: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Serialize(source) => write!(f, "failed to render default config: {source}"),
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidSetting { key, reason } => write!(f, "invalid '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::Serialize)
}

fn split_config_path_arg(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut path = None;
    let mut rest = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_PATH_ARG {
            let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            path = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }

    Ok((path, rest))
}

// File tables are laid over the defaults key by key; scalars replace.
fn merge_tables(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_tables(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(parts[parts.len() - 1]))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "xmsgd-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    #[test]
    fn defaults_apply_without_any_file() {
        let config = AppConfig::load_defaults_with_args(Vec::<String>::new())
            .expect("defaults should load");

        assert_eq!(config, AppConfig::default());
        assert_eq!(config.dispatcher.worker_threads, 10);
        assert_eq!(config.broker.bucket_count, 47);
        assert_eq!(config.broker.retention_window_seconds, 14_400);
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let path = write_temp_config(
            r#"
[logging]
level = "debug"

[dispatcher]
worker_threads = 4
"#,
            "partial",
        );

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.human_friendly);
        assert_eq!(config.dispatcher.worker_threads, 4);
        assert_eq!(config.dispatcher.max_pending, 0);
        assert_eq!(config.server.port, 1279);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(
            r#"
[server]
host = "127.0.0.1"
port = 4000
"#,
            "override",
        );

        let config = AppConfig::load_with_discovery(vec![
            "--config".to_owned(),
            path.to_string_lossy().to_string(),
            "--server.port".to_owned(),
            "4100".to_owned(),
            "--logging.human_friendly".to_owned(),
            "true".to_owned(),
            "--broker.bucket_count".to_owned(),
            "13".to_owned(),
        ])
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 4100);
        assert!(config.logging.human_friendly);
        assert_eq!(config.broker.bucket_count, 13);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--logging.nonexistent".to_owned(),
            "x".to_owned(),
        ])
        .expect_err("unknown override key should fail");

        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_override_with_wrong_type() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--dispatcher.worker_threads".to_owned(),
            "many".to_owned(),
        ])
        .expect_err("non-integer worker count should fail");

        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_keys_in_file() {
        let path = write_temp_config(
            r#"
[broker]
bucket_cnt = 3
"#,
            "typo",
        );

        let err = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect_err("misspelled key should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert!(matches!(err, ConfigError::Deserialize(_)));
    }

    #[test]
    fn rejects_zero_worker_threads() {
        let err = AppConfig::load_defaults_with_args(vec![
            "--dispatcher.worker_threads".to_owned(),
            "0".to_owned(),
        ])
        .expect_err("zero workers should fail validation");

        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                key: "dispatcher.worker_threads",
                ..
            }
        ));
    }

    #[test]
    fn missing_explicit_config_file_is_an_error() {
        let err = AppConfig::load_with_discovery(vec![
            "--config".to_owned(),
            "/nonexistent/xmsgd.toml".to_owned(),
        ])
        .expect_err("missing file should fail");

        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
