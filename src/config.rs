use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from watchbench.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct BenchConfig {
    pub bench: BenchSettings,
    pub markers: MarkerConfig,
    pub data: DataConfig,
    pub report: ReportConfig,
    #[serde(rename = "tool")]
    pub tools: Vec<ToolConfig>,
    #[serde(rename = "fixture")]
    pub fixtures: Vec<FixtureConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BenchSettings {
    pub iterations: u32,
    pub rounds: u32,
    pub sample_files: usize,
    pub parallel: bool,
    pub poll_interval_ms: u64,
    pub initial_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub completion_timeout_secs: u64,
    pub terminate_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Substring printed when a check cycle starts.
    pub start: String,
    /// Substrings printed when a check cycle ends; any of them counts.
    pub end: Vec<String>,
    /// Regex with one capture group holding the reported error count.
    pub diagnostics: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub dir: PathBuf,
    pub history: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ReportConfig {
    /// Tool name whose results every other tool is compared against.
    pub baseline: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_extension() -> String {
    "ts".to_string()
}

fn default_exclude_dirs() -> Vec<String> {
    vec![
        "node_modules".to_string(),
        ".git".to_string(),
        "worktrees".to_string(),
    ]
}

// --- Default implementations ---

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            iterations: 1,
            rounds: 10,
            sample_files: 5,
            parallel: true,
            poll_interval_ms: 25,
            initial_timeout_secs: 300,
            idle_timeout_secs: 60,
            completion_timeout_secs: 60,
            terminate_grace_ms: 2000,
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            start: "File change detected. Starting incremental compilation...".to_string(),
            end: vec![
                "Watching for file changes.".to_string(),
                "Compilation complete.".to_string(),
            ],
            diagnostics: Some(r"Found (\d+) errors?".to_string()),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".watchbench"),
            history: true,
        }
    }
}

impl BenchSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Errors raised while loading or validating the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
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

impl BenchConfig {
    /// Read, parse and validate a config file.
    ///
    /// Relative fixture roots and the data directory are resolved against the
    /// config file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config = Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        let base = path.parent().unwrap_or(Path::new(""));
        config
            .resolve_paths(base)
            .map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Make fixture roots and the data directory absolute, treating relative
    /// ones as relative to `base` (itself relative to the current directory).
    ///
    /// The fixture root is both the child's working directory and the
    /// `{root}` argument, so it must not be relative to either.
    pub fn resolve_paths(&mut self, base: &Path) -> std::io::Result<()> {
        let base = if base.as_os_str().is_empty() {
            std::env::current_dir()?
        } else {
            std::path::absolute(base)?
        };
        for fixture in &mut self.fixtures {
            if fixture.root.is_relative() {
                fixture.root = base.join(&fixture.root);
            }
        }
        if self.data.dir.is_relative() {
            self.data.dir = base.join(&self.data.dir);
        }
        Ok(())
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tools.is_empty() {
            return Err(ConfigError::Invalid("at least one [[tool]] is required".into()));
        }
        if self.fixtures.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[fixture]] is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for tool in &self.tools {
            check_name("tool", &tool.name)?;
            if tool.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "tool '{}' has an empty command",
                    tool.name
                )));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tool name '{}'",
                    tool.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for fixture in &self.fixtures {
            check_name("fixture", &fixture.name)?;
            if !seen.insert(fixture.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate fixture name '{}'",
                    fixture.name
                )));
            }
            for pattern in &fixture.exclude {
                glob::Pattern::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "fixture '{}' has a bad exclude pattern '{pattern}': {e}",
                        fixture.name
                    ))
                })?;
            }
        }

        if self.markers.start.is_empty() {
            return Err(ConfigError::Invalid("markers.start must not be empty".into()));
        }
        if self.markers.end.is_empty() || self.markers.end.iter().any(|m| m.is_empty()) {
            return Err(ConfigError::Invalid(
                "markers.end needs at least one non-empty marker".into(),
            ));
        }
        if let Some(pattern) = &self.markers.diagnostics {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("markers.diagnostics is not a valid regex: {e}"))
            })?;
        }

        if self.bench.sample_files == 0 {
            return Err(ConfigError::Invalid(
                "bench.sample_files must be greater than 0".into(),
            ));
        }

        if self.bench.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "bench.poll_interval_ms must be greater than 0".into(),
            ));
        }

        if let Some(baseline) = &self.report.baseline {
            if !self.tools.iter().any(|t| &t.name == baseline) {
                return Err(ConfigError::Invalid(format!(
                    "report.baseline names unknown tool '{baseline}'"
                )));
            }
        }

        Ok(())
    }
}

/// Names become `tool/fixture` labels, so they must be non-empty and slash-free.
fn check_name(kind: &str, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("a {kind} has an empty name")));
    }
    if name.contains('/') {
        return Err(ConfigError::Invalid(format!(
            "{kind} name '{name}' must not contain '/'"
        )));
    }
    Ok(())
}
