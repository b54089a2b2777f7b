//! Configuration types and toolkit discovery.
//!
//! Configuration is a JSON document deserialized into [`PipelineConfig`].
//! The toolkit root comes from the config file or, when absent there, from
//! the `RSTPATH` environment variable, read once at load time. Everything a
//! child process sees in its environment is derived here and passed down
//! explicitly.

use crate::errors::ConfigurationError;
use crate::pipeline::RetryPolicy;
use crate::registry::{FitAlgorithm, StageConfig, StageRegistry};
use crate::store::absolute_path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming the toolkit installation root.
pub const RSTPATH_VAR: &str = "RSTPATH";

/// Configuration for locating the RST installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolkitConfig {
    /// Installation root. Falls back to `$RSTPATH`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Directory under the root holding the binaries.
    #[serde(default = "default_bin_subdir")]
    pub bin_subdir: String,
    /// Variables copied from the parent environment into every child.
    #[serde(default = "default_pass_env")]
    pub pass_env: Vec<String>,
    /// Extra variables set on every child, overriding everything else.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_bin_subdir() -> String {
    "bin".to_string()
}

fn default_pass_env() -> Vec<String> {
    [
        "HOME",
        "LD_LIBRARY_PATH",
        "SD_HDWPATH",
        "SD_RADAR",
        "SD_MODEL_TABLE",
        "AACGM_v2_DAT_PREFIX",
        "IGRF_PATH",
        "ISTP_PATH",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            root: None,
            bin_subdir: default_bin_subdir(),
            pass_env: default_pass_env(),
            env: BTreeMap::new(),
        }
    }
}

impl ToolkitConfig {
    /// Creates a toolkit configuration with an explicit root.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Self::default()
        }
    }

    /// Adds an extra child environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// A located toolkit installation.
#[derive(Debug, Clone)]
pub struct Toolkit {
    root: PathBuf,
    bin_dir: PathBuf,
    env: BTreeMap<String, String>,
}

impl Toolkit {
    /// Locates the toolkit using the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ToolkitNotFound` if no root is configured or its `bin`
    /// directory does not exist.
    pub fn locate(config: &ToolkitConfig) -> Result<Self, ConfigurationError> {
        Self::locate_with(config, |key| std::env::var(key).ok())
    }

    /// Locates the toolkit reading environment variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`Toolkit::locate`].
    pub fn locate_with(
        config: &ToolkitConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let root = config
            .root
            .clone()
            .or_else(|| lookup(RSTPATH_VAR).filter(|v| !v.is_empty()).map(PathBuf::from))
            .ok_or_else(|| {
                ConfigurationError::toolkit_not_found(format!(
                    "no toolkit root configured and ${RSTPATH_VAR} is unset"
                ))
            })?;

        let root = absolute_path(&root);
        let bin_dir = root.join(&config.bin_subdir);
        if !bin_dir.is_dir() {
            return Err(ConfigurationError::toolkit_not_found(format!(
                "{} is not a directory",
                bin_dir.display()
            )));
        }

        let mut env = BTreeMap::new();
        for key in &config.pass_env {
            if let Some(value) = lookup(key) {
                env.insert(key.clone(), value);
            }
        }
        env.insert(RSTPATH_VAR.to_string(), root.display().to_string());

        let mut path_entries = vec![bin_dir.clone()];
        if let Some(parent_path) = lookup("PATH") {
            path_entries.extend(std::env::split_paths(&parent_path));
        }
        if let Ok(joined) = std::env::join_paths(path_entries) {
            env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
        }

        env.extend(config.env.clone());

        info!(root = %root.display(), "RST toolkit located");
        Ok(Self { root, bin_dir, env })
    }

    /// Returns the installation root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the binary directory.
    #[must_use]
    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Returns the environment every child process receives.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Resolves a tool name to a file under the binary directory.
    ///
    /// # Errors
    ///
    /// Returns `ToolkitNotFound` if the file does not exist.
    pub fn resolve_executable(&self, name: &str) -> Result<PathBuf, ConfigurationError> {
        let path = self.bin_dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(ConfigurationError::toolkit_not_found(format!(
                "{} does not exist",
                path.display()
            )))
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Toolkit location.
    #[serde(default)]
    pub toolkit: ToolkitConfig,
    /// Directory receiving every produced artifact.
    pub output_dir: PathBuf,
    /// Working directory for tool processes. Defaults to `output_dir`.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Default per-invocation timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Retry policy for timeouts and transient spawn failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Whether artifacts carry a SHA-256 checksum.
    #[serde(default)]
    pub checksums: bool,
    /// Fitting algorithm for the standard chain.
    #[serde(default)]
    pub fit_algorithm: FitAlgorithm,
    /// Default number of inputs processed at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Stage table. Empty means the standard RST chain.
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

fn default_timeout_secs() -> f64 {
    600.0
}

fn default_max_concurrency() -> usize {
    4
}

impl PipelineConfig {
    /// Creates a configuration with defaults and the given output directory.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            toolkit: ToolkitConfig::default(),
            output_dir: output_dir.into(),
            working_dir: None,
            timeout_secs: default_timeout_secs(),
            retry: RetryPolicy::default(),
            checksums: false,
            fit_algorithm: FitAlgorithm::default(),
            max_concurrency: default_max_concurrency(),
            stages: Vec::new(),
        }
    }

    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loading pipeline configuration");
        Self::from_json(&text)
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or invalid.
    pub fn from_json(text: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the toolkit configuration.
    #[must_use]
    pub fn with_toolkit(mut self, toolkit: ToolkitConfig) -> Self {
        self.toolkit = toolkit;
        self
    }

    /// Sets the default timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables checksums.
    #[must_use]
    pub fn with_checksums(mut self, enabled: bool) -> Self {
        self.checksums = enabled;
        self
    }

    /// Sets the stage table.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<StageConfig>) -> Self {
        self.stages = stages;
        self
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStage` naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            return Err(ConfigurationError::invalid_stage(
                "*",
                format!("timeout_secs must be positive, got {}", self.timeout_secs),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigurationError::invalid_stage("*", "max_concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_stage("*", "retry.max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Returns the default per-invocation timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    /// Returns the working directory for tool processes.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        self.working_dir.as_deref().unwrap_or(&self.output_dir)
    }

    /// Builds the stage registry: the configured table, or the standard
    /// RST chain when none is configured.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if a binary is missing or the graph
    /// is invalid.
    pub fn build_registry(&self, toolkit: &Toolkit) -> Result<StageRegistry, ConfigurationError> {
        if self.stages.is_empty() {
            StageRegistry::rst_defaults(toolkit, self.fit_algorithm)
        } else {
            StageRegistry::load(self.stages.clone(), toolkit)
        }
    }
}
