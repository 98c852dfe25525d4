use config::{Config, ConfigError, Environment, File};
use convert_engine::EngineSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "CONVERTCTL";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CliConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    /// Explicit ffmpeg executable; `PATH` is searched when unset.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
    #[serde(default = "default_smoothing_interval_ms")]
    pub smoothing_interval_ms: u64,
    /// Upper bound on how long a tool waits for the engine to load.
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

impl EngineConfig {
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            smoothing_interval_ms: self.smoothing_interval_ms,
        }
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            smoothing_interval_ms: default_smoothing_interval_ms(),
            acquire_timeout_ms: None,
        }
    }
}

fn default_smoothing_interval_ms() -> u64 {
    EngineSettings::default().smoothing_interval_ms
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub show_time: bool,
    #[serde(default)]
    pub show_target: bool,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            show_time: false,
            show_target: false,
            redaction: RedactionConfig::default(),
        }
    }
}

fn default_level() -> String {
    "warn".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedactionConfig {
    #[serde(default = "true_default")]
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<RedactionPattern>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
        }
    }
}

fn true_default() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

/// Load configuration from the working directory, an optional explicit file,
/// and `CONVERTCTL__*` environment variables.
pub fn load_config(explicit: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    load_config_from(&cwd, explicit)
}

/// Layering, lowest precedence first:
/// `convertctl.yaml` → `.convertctl.yaml` → explicit file → environment.
pub fn load_config_from(dir: &Path, explicit: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let mut builder = Config::builder()
        .add_source(File::from(dir.join("convertctl.yaml")).required(false))
        .add_source(File::from(dir.join(".convertctl.yaml")).required(false));

    if let Some(path) = explicit {
        builder = builder.add_source(File::from(path.to_path_buf()).required(true));
    }

    // Nested keys map like CONVERTCTL__ENGINE__FFMPEG_PATH=/usr/bin/ffmpeg
    builder
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    struct EnvGuard(&'static str);
    impl EnvGuard {
        fn new(key: &'static str, val: &str) -> Self {
            env::set_var(key, val);
            Self(key)
        }
    }
    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.0);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(dir.path(), None).expect("defaults should load");
        assert_eq!(config.engine.ffmpeg_path, None);
        assert_eq!(config.engine.smoothing_interval_ms, 16);
        assert_eq!(config.engine.acquire_timeout(), None);
        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.redaction.enabled);
    }

    #[test]
    #[serial]
    fn test_local_file_overrides_defaults_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("convertctl.yaml"),
            "engine:\n  smoothing_interval_ms: 40\n  acquire_timeout_ms: 1000\nlogging:\n  level: info\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join(".convertctl.yaml"),
            "engine:\n  acquire_timeout_ms: 250\n",
        )
        .unwrap();

        let config = load_config_from(dir.path(), None).expect("should load");
        assert_eq!(config.engine.smoothing_interval_ms, 40);
        assert_eq!(config.engine.acquire_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    #[serial]
    fn test_explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(load_config_from(dir.path(), Some(&missing)).is_err());
    }

    #[test]
    #[serial]
    fn test_env_var_override_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("convertctl.yaml"),
            "engine:\n  ffmpeg_path: /opt/ffmpeg/bin/ffmpeg\n",
        )
        .unwrap();
        let _guard = EnvGuard::new("CONVERTCTL__ENGINE__FFMPEG_PATH", "/usr/local/bin/ffmpeg");

        let config = load_config_from(dir.path(), None).expect("should load");
        assert_eq!(
            config.engine.ffmpeg_path,
            Some(PathBuf::from("/usr/local/bin/ffmpeg"))
        );
    }

    #[test]
    #[serial]
    fn test_type_coercion() {
        let dir = tempfile::tempdir().unwrap();
        let _g1 = EnvGuard::new("CONVERTCTL__ENGINE__SMOOTHING_INTERVAL_MS", "33");
        let _g2 = EnvGuard::new("CONVERTCTL__LOGGING__SHOW_TIME", "true");

        let config = load_config_from(dir.path(), None).expect("should load");
        assert_eq!(config.engine.smoothing_interval_ms, 33);
        assert_eq!(config.engine.settings().smoothing_interval_ms, 33);
        assert!(config.logging.show_time);
    }

    #[test]
    #[serial]
    fn test_redaction_patterns_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("convertctl.yaml"),
            r#"
logging:
  redaction:
    patterns:
      - name: home
        regex: "/home/[^/ ]+"
        placeholder: "/home/<user>"
"#,
        )
        .unwrap();
        let config = load_config_from(dir.path(), None).expect("should load");
        assert_eq!(config.logging.redaction.patterns.len(), 1);
        assert_eq!(config.logging.redaction.patterns[0].placeholder, "/home/<user>");
    }
}
