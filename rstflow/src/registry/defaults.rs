//! The standard RST processing chain.

use super::{StageDescriptor, StageRegistry};
use crate::config::Toolkit;
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Pattern matching the percentage `fit_speck_removal` reports on stderr.
pub const DESPECK_METRIC_PATTERN: &str = r"\(\s*([0-9]+(?:\.[0-9]+)?)\s*%";

/// Fitting algorithm used by `make_fit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FitAlgorithm {
    /// FITACF 2.5.
    #[serde(rename = "2.5")]
    V2_5,
    /// FITACF 3.0.
    #[default]
    #[serde(rename = "3")]
    V3,
}

impl FitAlgorithm {
    /// Returns the `make_fit` flag selecting this algorithm.
    #[must_use]
    pub fn flag(&self) -> &'static str {
        match self {
            Self::V2_5 => "-fitacf2",
            Self::V3 => "-fitacf3",
        }
    }
}

impl fmt::Display for FitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V2_5 => write!(f, "2.5"),
            Self::V3 => write!(f, "3"),
        }
    }
}

impl FromStr for FitAlgorithm {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "2.5" => Ok(Self::V2_5),
            "3" | "3.0" => Ok(Self::V3),
            other => Err(ConfigurationError::invalid_stage(
                "fitacf",
                format!("FITACF version unavailable: {other}"),
            )),
        }
    }
}

/// Builds the standard descriptors with executables under `bin_dir`.
///
/// `rawacf` (source) → `fitacf` (`make_fit`) → `despeck`
/// (`fit_speck_removal`) → `grid` (`make_grid`). All tools write their
/// product to stdout.
///
/// # Errors
///
/// Only fails if the built-in metric pattern does not compile.
pub fn rst_descriptors(
    bin_dir: impl Into<PathBuf>,
    fit: FitAlgorithm,
) -> Result<Vec<StageDescriptor>, ConfigurationError> {
    let bin_dir = bin_dir.into();
    Ok(vec![
        StageDescriptor::source("rawacf", "rawacf"),
        StageDescriptor::tool("fitacf", "rawacf", bin_dir.join("make_fit"), "fitacf")
            .with_args(["{fit_version}", "{input}"])
            .with_param("fit_version", fit.flag()),
        StageDescriptor::tool(
            "despeck",
            "fitacf",
            bin_dir.join("fit_speck_removal"),
            "despeck.fitacf",
        )
        .with_metric_pattern(DESPECK_METRIC_PATTERN)?,
        StageDescriptor::tool("grid", "despeck", bin_dir.join("make_grid"), "grid"),
    ])
}

impl StageRegistry {
    /// Loads the standard RST chain against an installed toolkit.
    ///
    /// # Errors
    ///
    /// Returns `ToolkitNotFound` if any of the standard binaries is missing.
    pub fn rst_defaults(toolkit: &Toolkit, fit: FitAlgorithm) -> Result<Self, ConfigurationError> {
        let descriptors = rst_descriptors(toolkit.bin_dir(), fit)?;
        for descriptor in &descriptors {
            if let Some(exe) = descriptor.executable.as_ref() {
                if !exe.is_file() {
                    return Err(ConfigurationError::toolkit_not_found(format!(
                        "stage '{}' needs {}",
                        descriptor.name,
                        exe.display()
                    )));
                }
            }
        }
        Self::from_descriptors(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_algorithm_parse() {
        assert_eq!("2.5".parse::<FitAlgorithm>().unwrap(), FitAlgorithm::V2_5);
        assert_eq!("3".parse::<FitAlgorithm>().unwrap(), FitAlgorithm::V3);
        assert!("2.0".parse::<FitAlgorithm>().is_err());
        assert_eq!(FitAlgorithm::V2_5.flag(), "-fitacf2");
    }

    #[test]
    fn test_fit_algorithm_serde() {
        let fit: FitAlgorithm = serde_json::from_str(r#""2.5""#).unwrap();
        assert_eq!(fit, FitAlgorithm::V2_5);
        assert_eq!(serde_json::to_string(&FitAlgorithm::V3).unwrap(), r#""3""#);
    }

    #[test]
    fn test_rst_descriptors_chain() {
        let registry =
            StageRegistry::from_descriptors(rst_descriptors("/opt/rst/bin", FitAlgorithm::V3).unwrap())
                .unwrap();

        let chain: Vec<String> = registry
            .dependency_chain("grid")
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(chain, vec!["rawacf", "fitacf", "despeck", "grid"]);

        let fit = registry.resolve("fitacf").unwrap();
        assert_eq!(fit.params.get("fit_version").map(String::as_str), Some("-fitacf3"));
        assert_eq!(
            fit.executable.as_deref(),
            Some(std::path::Path::new("/opt/rst/bin/make_fit"))
        );
    }

    #[test]
    fn test_despeck_metric() {
        let descriptors = rst_descriptors("/opt/rst/bin", FitAlgorithm::V3).unwrap();
        let despeck = &descriptors[2];
        assert_eq!(despeck.extract_metric("Removed 40 points (3.25% of data)"), Some(3.25));
    }
}
