//! On-disk fixtures: fake toolkit installs and raw input files.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::{Toolkit, ToolkitConfig};
use crate::discovery::InputFile;
use crate::errors::ConfigurationError;

/// Shell-script stand-in for `make_fit`: prints a header and the input.
pub const FAKE_MAKE_FIT: &str = r#"[ -s "$2" ] || { echo "make_fit: cannot read $2" >&2; exit 1; }
echo "fit $1"
cat "$2"
"#;

/// Shell-script stand-in for `fit_speck_removal`: reports a removal ratio.
pub const FAKE_SPECK_REMOVAL: &str = r#"cat "$1"
echo "Removed 3 of 24 points (12.5% of data)" >&2
"#;

/// Shell-script stand-in for `make_grid`.
pub const FAKE_MAKE_GRID: &str = r#"echo grid
cat "$1"
"#;

/// A toolkit installation whose binaries are shell scripts.
#[derive(Debug, Clone)]
pub struct FakeToolkit {
    root: PathBuf,
}

impl FakeToolkit {
    /// Creates `root/bin`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("bin"))?;
        Ok(Self { root })
    }

    /// Returns the installation root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes an executable `/bin/sh` script named `name` into `bin/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    #[cfg(unix)]
    pub fn install(&self, name: &str, body: &str) -> io::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.root.join("bin").join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Installs `make_fit`, `fit_speck_removal` and `make_grid`.
    ///
    /// # Errors
    ///
    /// Returns an error if a script cannot be written.
    #[cfg(unix)]
    pub fn install_rst_tools(&self) -> io::Result<()> {
        self.install("make_fit", FAKE_MAKE_FIT)?;
        self.install("fit_speck_removal", FAKE_SPECK_REMOVAL)?;
        self.install("make_grid", FAKE_MAKE_GRID)?;
        Ok(())
    }

    /// Returns the toolkit config pointing at this install.
    #[must_use]
    pub fn config(&self) -> ToolkitConfig {
        ToolkitConfig::with_root(&self.root)
    }

    /// Locates the toolkit, inheriting `PATH` from the test process.
    ///
    /// # Errors
    ///
    /// Returns `ToolkitNotFound` if `bin/` is missing.
    pub fn toolkit(&self) -> Result<Toolkit, ConfigurationError> {
        Toolkit::locate_with(&self.config(), |key| std::env::var(key).ok())
    }
}

/// Writes a raw input named `<slug>.00.<radar>.<extension>` into `dir`.
///
/// # Errors
///
/// Returns an error if the file cannot be written or the name does not
/// parse as a SuperDARN product name.
pub fn write_input(
    dir: &Path,
    window_slug: &str,
    radar: &str,
    extension: &str,
    content: &str,
) -> io::Result<InputFile> {
    let path = dir.join(format!("{window_slug}.00.{radar}.{extension}"));
    std::fs::write(&path, content)?;
    InputFile::from_path(&path, extension).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a product name: {}", path.display()),
        )
    })
}
