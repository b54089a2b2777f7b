//! Stage descriptors and their configuration form.

use crate::config::Toolkit;
use crate::errors::ConfigurationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern"));

/// Placeholders filled in by the executor for every stage invocation.
pub const BUILTIN_PLACEHOLDERS: &[&str] = &["input", "output", "output_dir", "radar", "window", "stage"];

/// Where a stage's tool writes its product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// The tool writes the product to stdout; the runner redirects it into the output file.
    #[default]
    Stdout,
    /// The tool receives `{output}` as an argument and writes the file itself.
    Argument,
}

/// Argument list with `{name}` placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgTemplate(Vec<String>);

impl ArgTemplate {
    /// Creates a template from raw argument strings.
    #[must_use]
    pub fn new(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(args.into_iter().map(Into::into).collect())
    }

    /// Returns the raw argument strings.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.0
    }

    /// Returns every placeholder name referenced by the template.
    #[must_use]
    pub fn placeholders(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .0
            .iter()
            .flat_map(|arg| PLACEHOLDER.captures_iter(arg).map(|c| c[1].to_string()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Substitutes placeholders. Names without a value are left as written.
    #[must_use]
    pub fn render(&self, vars: &HashMap<String, String>) -> Vec<String> {
        self.0
            .iter()
            .map(|arg| {
                PLACEHOLDER
                    .replace_all(arg, |caps: &regex::Captures<'_>| {
                        vars.get(&caps[1])
                            .cloned()
                            .unwrap_or_else(|| caps[0].to_string())
                    })
                    .into_owned()
            })
            .collect()
    }
}

/// Immutable description of one processing stage.
///
/// A stage without a predecessor is a source stage: it names the raw input
/// type and never runs a tool. Every other stage runs `executable`.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    /// Unique stage name, also embedded in artifact file names.
    pub name: String,
    /// The stage whose output this stage consumes.
    pub predecessor: Option<String>,
    /// Resolved path of the tool.
    pub executable: Option<PathBuf>,
    /// Argument template.
    pub args: ArgTemplate,
    /// Extension of the produced file, without the leading dot.
    pub output_extension: String,
    /// How the tool delivers its output.
    pub output_mode: OutputMode,
    /// Whether an existing artifact of this stage may be reused.
    pub idempotent: bool,
    /// Whether outputs are removed by `remove_temporary`.
    pub temporary: bool,
    /// Per-invocation timeout overriding the runner default.
    pub timeout: Option<Duration>,
    /// Exit codes treated as success.
    pub success_codes: Vec<i32>,
    /// Pattern with one capture group extracting a number from stderr.
    pub metric_pattern: Option<Regex>,
    /// Named values available to the argument template.
    pub params: BTreeMap<String, String>,
}

impl StageDescriptor {
    fn base(name: impl Into<String>, output_extension: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predecessor: None,
            executable: None,
            args: ArgTemplate::default(),
            output_extension: output_extension.into(),
            output_mode: OutputMode::Stdout,
            idempotent: true,
            temporary: false,
            timeout: None,
            success_codes: vec![0],
            metric_pattern: None,
            params: BTreeMap::new(),
        }
    }

    /// Creates a source stage for raw input files with the given extension.
    #[must_use]
    pub fn source(name: impl Into<String>, extension: impl Into<String>) -> Self {
        Self::base(name, extension)
    }

    /// Creates a tool stage consuming `predecessor`'s output.
    #[must_use]
    pub fn tool(
        name: impl Into<String>,
        predecessor: impl Into<String>,
        executable: impl Into<PathBuf>,
        output_extension: impl Into<String>,
    ) -> Self {
        let mut stage = Self::base(name, output_extension);
        stage.predecessor = Some(predecessor.into());
        stage.executable = Some(executable.into());
        stage.args = ArgTemplate::new(["{input}"]);
        stage
    }

    /// Sets the argument template.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = ArgTemplate::new(args);
        self
    }

    /// Sets the output mode.
    #[must_use]
    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    /// Adds a template parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Sets the per-invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the exit codes treated as success.
    #[must_use]
    pub fn with_success_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.success_codes = codes.into_iter().collect();
        self
    }

    /// Sets the stderr metric pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern does not compile.
    pub fn with_metric_pattern(mut self, pattern: &str) -> Result<Self, ConfigurationError> {
        let regex = Regex::new(pattern).map_err(|e| {
            ConfigurationError::invalid_stage(&self.name, format!("bad metric pattern: {e}"))
        })?;
        self.metric_pattern = Some(regex);
        Ok(self)
    }

    /// Marks outputs as temporary.
    #[must_use]
    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    /// Disables reuse of existing artifacts.
    #[must_use]
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    /// Returns true for source stages.
    #[must_use]
    pub fn is_source(&self) -> bool {
        self.predecessor.is_none()
    }

    /// Returns true if `code` is one of the stage's success codes.
    #[must_use]
    pub fn is_success(&self, code: Option<i32>) -> bool {
        code.is_some_and(|c| self.success_codes.contains(&c))
    }

    /// Returns true if `file_name` carries this stage's output extension.
    #[must_use]
    pub fn matches_file_name(&self, file_name: &str) -> bool {
        file_name
            .strip_suffix(self.output_extension.as_str())
            .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1)
    }

    /// Extracts the stage metric from stderr text.
    #[must_use]
    pub fn extract_metric(&self, stderr: &str) -> Option<f64> {
        let caps = self.metric_pattern.as_ref()?.captures(stderr)?;
        caps.get(1)?.as_str().trim().parse().ok()
    }

    /// Checks the descriptor in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !name_ok {
            return Err(ConfigurationError::invalid_stage(
                &self.name,
                "names may only contain ASCII letters, digits, '-' and '_'",
            ));
        }

        if self.output_extension.is_empty()
            || self.output_extension.starts_with('.')
            || self.output_extension.contains(['/', '\\'])
        {
            return Err(ConfigurationError::invalid_stage(
                &self.name,
                format!("invalid output extension '{}'", self.output_extension),
            ));
        }

        if self.predecessor.as_deref() == Some(self.name.as_str()) {
            return Err(ConfigurationError::invalid_stage(
                &self.name,
                "a stage cannot depend on itself",
            ));
        }

        match (&self.predecessor, &self.executable) {
            (None, Some(_)) => {
                return Err(ConfigurationError::invalid_stage(
                    &self.name,
                    "source stages (no predecessor) cannot run an executable",
                ))
            }
            (Some(_), None) => {
                return Err(ConfigurationError::invalid_stage(
                    &self.name,
                    "stages with a predecessor need an executable",
                ))
            }
            _ => {}
        }

        if self.is_source() {
            return Ok(());
        }

        let placeholders = self.args.placeholders();
        if let Some(unknown) = placeholders.iter().find(|p| {
            !BUILTIN_PLACEHOLDERS.contains(&p.as_str()) && !self.params.contains_key(p.as_str())
        }) {
            return Err(ConfigurationError::invalid_stage(
                &self.name,
                format!("argument template uses unknown placeholder '{{{unknown}}}'"),
            ));
        }

        if !placeholders.iter().any(|p| p == "input") {
            return Err(ConfigurationError::invalid_stage(
                &self.name,
                "argument template must reference {input}",
            ));
        }

        if self.output_mode == OutputMode::Argument && !placeholders.iter().any(|p| p == "output") {
            return Err(ConfigurationError::invalid_stage(
                &self.name,
                "argument output mode requires {output} in the template",
            ));
        }

        if self.success_codes.is_empty() {
            return Err(ConfigurationError::invalid_stage(&self.name, "no success codes"));
        }

        Ok(())
    }
}

fn default_idempotent() -> bool {
    true
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

/// Configuration form of a stage, as read from the pipeline config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name.
    pub name: String,
    /// Predecessor stage name; omitted for source stages.
    #[serde(default)]
    pub predecessor: Option<String>,
    /// Tool name relative to the toolkit `bin` directory, or an absolute path.
    #[serde(default)]
    pub executable: Option<String>,
    /// Argument template.
    #[serde(default)]
    pub args: Vec<String>,
    /// Output extension without the leading dot.
    pub output_extension: String,
    /// Output mode.
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Whether existing artifacts may be reused.
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    /// Whether outputs are temporary.
    #[serde(default)]
    pub temporary: bool,
    /// Timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// Exit codes treated as success.
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
    /// Stderr metric pattern.
    #[serde(default)]
    pub metric_pattern: Option<String>,
    /// Template parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl StageConfig {
    /// Converts the configuration into a descriptor.
    ///
    /// Relative executables are resolved against the toolkit's `bin`
    /// directory and must exist there.
    ///
    /// # Errors
    ///
    /// Returns `ToolkitNotFound` for a missing binary, or `InvalidStage`
    /// for inconsistent settings.
    pub fn into_descriptor(self, toolkit: Option<&Toolkit>) -> Result<StageDescriptor, ConfigurationError> {
        let executable = match self.executable.as_deref() {
            None => None,
            Some(exe) => {
                let path = PathBuf::from(exe);
                let resolved = match toolkit {
                    Some(toolkit) if path.is_relative() => toolkit.resolve_executable(exe)?,
                    _ => path,
                };
                Some(resolved)
            }
        };

        let timeout = match self.timeout_secs {
            Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
            Some(secs) => {
                return Err(ConfigurationError::invalid_stage(
                    &self.name,
                    format!("timeout must be positive, got {secs}"),
                ))
            }
            None => None,
        };

        let mut descriptor = StageDescriptor::base(self.name, self.output_extension);
        descriptor.predecessor = self.predecessor;
        descriptor.executable = executable;
        descriptor.args = ArgTemplate::new(self.args);
        descriptor.output_mode = self.output_mode;
        descriptor.idempotent = self.idempotent;
        descriptor.temporary = self.temporary;
        descriptor.timeout = timeout;
        descriptor.success_codes = self.success_codes;
        descriptor.params = self.params;

        let descriptor = match self.metric_pattern {
            Some(pattern) => descriptor.with_metric_pattern(&pattern)?,
            None => descriptor,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_template_placeholders_and_render() {
        let template = ArgTemplate::new(["{fit_version}", "-o", "{output}", "{input}"]);
        assert_eq!(template.placeholders(), vec!["fit_version", "input", "output"]);

        let vars: HashMap<String, String> = [
            ("fit_version", "-fitacf3"),
            ("input", "/in/a.rawacf"),
            ("output", "/out/a.fitacf"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert_eq!(
            template.render(&vars),
            vec!["-fitacf3", "-o", "/out/a.fitacf", "/in/a.rawacf"]
        );
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let template = ArgTemplate::new(["--x={missing}"]);
        assert_eq!(template.render(&HashMap::new()), vec!["--x={missing}"]);
    }

    #[test]
    fn test_source_and_tool_validation() {
        assert!(StageDescriptor::source("rawacf", "rawacf").validate().is_ok());
        assert!(StageDescriptor::tool("fitacf", "rawacf", "/bin/make_fit", "fitacf")
            .validate()
            .is_ok());

        let mut bad_source = StageDescriptor::source("rawacf", "rawacf");
        bad_source.executable = Some(PathBuf::from("/bin/true"));
        assert!(bad_source.validate().is_err());

        let mut bad_tool = StageDescriptor::tool("fitacf", "rawacf", "/bin/make_fit", "fitacf");
        bad_tool.executable = None;
        assert!(bad_tool.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_names_and_templates() {
        assert!(StageDescriptor::source("raw.acf", "rawacf").validate().is_err());
        assert!(StageDescriptor::source("raw", ".rawacf").validate().is_err());
        assert!(StageDescriptor::tool("a", "a", "/bin/x", "x").validate().is_err());

        let unknown = StageDescriptor::tool("grid", "fitacf", "/bin/make_grid", "grid")
            .with_args(["{input}", "{nope}"]);
        assert!(unknown.validate().is_err());

        let no_input = StageDescriptor::tool("grid", "fitacf", "/bin/make_grid", "grid").with_args(["-v"]);
        assert!(no_input.validate().is_err());

        let argument_mode = StageDescriptor::tool("grid", "fitacf", "/bin/make_grid", "grid")
            .with_output_mode(OutputMode::Argument);
        assert!(argument_mode.validate().is_err());
        assert!(argument_mode
            .with_args(["{input}", "{output}"])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_matches_file_name() {
        let fit = StageDescriptor::tool("fitacf", "rawacf", "/bin/make_fit", "fitacf");
        let despeck = StageDescriptor::tool("despeck", "fitacf", "/bin/fsr", "despeck.fitacf");

        assert!(fit.matches_file_name("20240101.0000.00.sas.fitacf"));
        assert!(fit.matches_file_name("x.despeck.fitacf"));
        assert!(despeck.matches_file_name("x.despeck.fitacf"));
        assert!(!despeck.matches_file_name("x.fitacf"));
        assert!(!fit.matches_file_name("fitacf"));
        assert!(!fit.matches_file_name("xfitacf"));
    }

    #[test]
    fn test_extract_metric() {
        let stage = StageDescriptor::tool("despeck", "fitacf", "/bin/fsr", "despeck.fitacf")
            .with_metric_pattern(r"\(\s*([0-9.]+)\s*%")
            .unwrap();
        let stderr = "Number of points removed: 812 (12.5% of total)\n";
        assert_eq!(stage.extract_metric(stderr), Some(12.5));
        assert_eq!(stage.extract_metric("nothing here"), None);
    }

    #[test]
    fn test_is_success() {
        let stage = StageDescriptor::tool("grid", "fitacf", "/bin/make_grid", "grid").with_success_codes([0, 1]);
        assert!(stage.is_success(Some(0)));
        assert!(stage.is_success(Some(1)));
        assert!(!stage.is_success(Some(2)));
        assert!(!stage.is_success(None));
    }

    #[test]
    fn test_stage_config_into_descriptor() {
        let config: StageConfig = serde_json::from_value(serde_json::json!({
            "name": "fitacf",
            "predecessor": "rawacf",
            "executable": "/opt/rst/bin/make_fit",
            "args": ["{fit_version}", "{input}"],
            "output_extension": "fitacf",
            "timeout_secs": 30.0,
            "params": {"fit_version": "-fitacf3"}
        }))
        .unwrap();

        let descriptor = config.into_descriptor(None).unwrap();
        assert_eq!(descriptor.executable, Some(PathBuf::from("/opt/rst/bin/make_fit")));
        assert_eq!(descriptor.timeout, Some(Duration::from_secs(30)));
        assert_eq!(descriptor.output_mode, OutputMode::Stdout);
        assert!(descriptor.idempotent);
        assert_eq!(descriptor.success_codes, vec![0]);
    }

    #[test]
    fn test_stage_config_rejects_bad_timeout() {
        let config: StageConfig = serde_json::from_value(serde_json::json!({
            "name": "grid",
            "predecessor": "fitacf",
            "executable": "/bin/make_grid",
            "args": ["{input}"],
            "output_extension": "grid",
            "timeout_secs": -1.0
        }))
        .unwrap();
        assert!(config.into_descriptor(None).is_err());
    }
}
