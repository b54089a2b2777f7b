//! Raw input validation.
//!
//! The planner never opens input files itself; it asks an
//! [`InputValidator`] whether a file is usable and which stage's output
//! type it carries. The record format is opaque to this crate, so the
//! default validator only looks at the file system and the file name.

use crate::compression::strip_codec_suffix;
use crate::errors::PlanningError;
use crate::registry::StageDescriptor;
use std::fs::File;
use std::path::Path;

/// Decides whether an input file can ground a pipeline.
#[cfg_attr(test, mockall::automock)]
pub trait InputValidator: Send + Sync {
    /// Checks that the file exists, is readable and is non-empty.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` describing the problem.
    fn check(&self, input: &Path) -> Result<(), PlanningError>;

    /// Returns true if the file is of the type `stage` produces, once
    /// expanded if it is an archive.
    fn accepts(&self, input: &Path, stage: &StageDescriptor) -> bool;
}

/// Validates by file metadata and extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionValidator;

impl ExtensionValidator {
    /// Creates a new validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn invalid(input: &Path, message: impl Into<String>) -> PlanningError {
    PlanningError::InvalidInput {
        input: input.to_path_buf(),
        message: message.into(),
    }
}

impl InputValidator for ExtensionValidator {
    fn check(&self, input: &Path) -> Result<(), PlanningError> {
        let metadata = std::fs::metadata(input).map_err(|e| invalid(input, e.to_string()))?;
        if !metadata.is_file() {
            return Err(invalid(input, "not a regular file"));
        }
        if metadata.len() == 0 {
            return Err(invalid(input, "file is empty"));
        }
        File::open(input).map_err(|e| invalid(input, format!("unreadable: {e}")))?;
        Ok(())
    }

    fn accepts(&self, input: &Path, stage: &StageDescriptor) -> bool {
        input
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| stage.matches_file_name(strip_codec_suffix(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_rejects_missing_empty_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let validator = ExtensionValidator::new();

        let missing = dir.path().join("20240101.0000.00.sas.rawacf");
        assert!(matches!(
            validator.check(&missing),
            Err(PlanningError::InvalidInput { .. })
        ));

        std::fs::write(&missing, "").unwrap();
        let err = validator.check(&missing).unwrap_err();
        assert!(err.to_string().contains("empty"));

        assert!(validator.check(dir.path()).is_err());

        std::fs::write(&missing, "records").unwrap();
        assert!(validator.check(&missing).is_ok());
    }

    #[test]
    fn test_accepts_by_extension() {
        let validator = ExtensionValidator::new();
        let raw = StageDescriptor::source("rawacf", "rawacf");
        let fit = StageDescriptor::tool("fitacf", "rawacf", "/bin/make_fit", "fitacf");

        let input = Path::new("/data/20240101.0000.00.sas.rawacf");
        assert!(validator.accepts(input, &raw));
        assert!(!validator.accepts(input, &fit));
        assert!(validator.accepts(Path::new("/data/x.fitacf"), &fit));
    }

    #[test]
    fn test_accepts_archived_input() {
        let validator = ExtensionValidator::new();
        let raw = StageDescriptor::source("rawacf", "rawacf");

        assert!(validator.accepts(Path::new("/data/20240101.0000.00.sas.rawacf.bz2"), &raw));
        assert!(validator.accepts(Path::new("/data/20240101.0000.00.sas.rawacf.gz"), &raw));
        assert!(!validator.accepts(Path::new("/data/20240101.0000.00.sas.rawacf.zip"), &raw));
    }
}
