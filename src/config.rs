use crate::control::Platform;
use crate::detector::DeadlineSpec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from harness.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub command: CommandConfig,
    pub run: RunConfig,
    pub platform: PlatformConfig,
    pub reports: ReportsConfig,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub launcher: Vec<String>,
    pub inherit_env: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub timeout_secs: f64,
    pub poll_interval_ms: u64,
    /// Empty string disables the sentinel.
    pub sentinel_file: Option<PathBuf>,
    pub min_grace_ms: u64,
    pub drain_join_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformConfig {
    pub kind: Platform,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReportsConfig {
    pub dir: Option<PathBuf>,
    pub expected_count: usize,
}

// --- Default implementations ---

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1.0,
            poll_interval_ms: 50,
            sentinel_file: Some(PathBuf::from("tests/integration/test_end")),
            min_grace_ms: 1000,
            drain_join_timeout_ms: 2000,
        }
    }
}

impl RunConfig {
    /// Fails for negative, non-finite or too-large values.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.timeout_secs).map_err(|e| {
            ConfigError::Invalid(format!(
                "run.timeout_secs must be a non-negative number of seconds, got {}: {e}",
                self.timeout_secs
            ))
        })
    }

    pub fn sentinel(&self) -> Option<&Path> {
        self.sentinel_file
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// The timing parameters for a supervised run.
    pub fn deadline_spec(&self) -> Result<DeadlineSpec, ConfigError> {
        Ok(DeadlineSpec {
            timeout: self.timeout()?,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            sentinel_path: self.sentinel().map(Path::to_path_buf),
            min_grace: Duration::from_millis(self.min_grace_ms),
            drain_join_timeout: Duration::from_millis(self.drain_join_timeout_ms),
        })
    }
}

/// Errors that can occur while loading harness.toml.
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value parsed but makes no sense.
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl HarnessConfig {
    /// Check values serde cannot: durations and poll granularity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeout = self.run.timeout()?;
        if self.run.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "run.poll_interval_ms must be positive".to_string(),
            ));
        }
        let poll = Duration::from_millis(self.run.poll_interval_ms);
        if poll > timeout {
            tracing::warn!(
                poll_interval_ms = self.run.poll_interval_ms,
                timeout_secs = self.run.timeout_secs,
                "poll interval exceeds the timeout; deadline checks are clamped to the deadline"
            );
        }
        Ok(())
    }
}

/// Load config from `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<HarnessConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(HarnessConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    let config: HarnessConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.run.timeout().unwrap(), Duration::from_secs(1));
        assert_eq!(config.run.poll_interval_ms, 50);
        assert_eq!(
            config.run.sentinel(),
            Some(Path::new("tests/integration/test_end"))
        );
        assert_eq!(config.platform.kind, Platform::Local);
        assert!(config.command.program.is_empty());
        assert!(!config.command.inherit_env);
        assert!(config.reports.dir.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[command]
program = "src/launch_manager_daemon/launch_manager"
args = ["--verbose"]
launcher = ["/usr/bin/fakeroot", "/usr/bin/fakechroot", "-s", "chroot", "."]

[command.env]
LD_LIBRARY_PATH = "/opt/lib"

[run]
timeout_secs = 2.5
poll_interval_ms = 20
sentinel_file = "out/done"
min_grace_ms = 250

[platform]
kind = "local"

[reports]
dir = "tests/integration/smoke"
expected_count = 2
"#;
        let config: HarnessConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.command.args, vec!["--verbose"]);
        assert_eq!(config.command.launcher.len(), 5);
        assert_eq!(
            config.command.env.get("LD_LIBRARY_PATH").map(String::as_str),
            Some("/opt/lib")
        );

        let spec = config.run.deadline_spec().unwrap();
        assert_eq!(spec.timeout, Duration::from_millis(2500));
        assert_eq!(spec.poll_interval, Duration::from_millis(20));
        assert_eq!(spec.sentinel_path, Some(PathBuf::from("out/done")));
        assert_eq!(spec.min_grace, Duration::from_millis(250));
        // Unset fields keep their defaults.
        assert_eq!(spec.drain_join_timeout, Duration::from_secs(2));

        assert_eq!(
            config.reports.dir,
            Some(PathBuf::from("tests/integration/smoke"))
        );
        assert_eq!(config.reports.expected_count, 2);
    }

    #[test]
    fn test_empty_sentinel_disables_it() {
        let config: HarnessConfig = toml::from_str("[run]\nsentinel_file = \"\"\n").unwrap();
        assert_eq!(config.run.sentinel(), None);
        assert_eq!(config.run.deadline_spec().unwrap().sentinel_path, None);
    }

    #[test]
    fn test_virtualized_platform_parses() {
        let config: HarnessConfig =
            toml::from_str("[platform]\nkind = \"virtualized\"\n").unwrap();
        assert_eq!(config.platform.kind, Platform::Virtualized);
    }

    #[test]
    fn test_unknown_platform_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "[platform]\nkind = \"mainframe\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.run.poll_interval_ms, 50);
    }

    #[test]
    fn test_negative_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "[run]\ntimeout_secs = -1.0\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unrepresentable_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "[run]\ntimeout_secs = 1e20\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("run.timeout_secs"));

        // Overrides applied after loading hit the same check.
        let mut config = HarnessConfig::default();
        config.run.timeout_secs = f64::NAN;
        assert!(config.run.deadline_spec().is_err());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = HarnessConfig::default();
        config.run.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
