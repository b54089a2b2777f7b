//! Compressed raw inputs.
//!
//! Raw SuperDARN files are usually distributed as `.bz2` archives, and
//! sometimes as `.gz`. RST tools only read plain files, so an archived
//! input is expanded next to its artifacts before the first tool stage
//! runs. Archives themselves are never modified or deleted.

use crate::store::staging_path;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Compression applied to a file, recognised by its final extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// A plain file.
    #[default]
    None,
    /// `.gz`
    Gzip,
    /// `.bz2`
    Bzip2,
}

impl Codec {
    /// Detects the codec from `path`'s extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("bz2") => Self::Bzip2,
            Some("gz") => Self::Gzip,
            _ => Self::None,
        }
    }

    /// Returns the file name suffix, without the dot.
    #[must_use]
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gz"),
            Self::Bzip2 => Some("bz2"),
        }
    }

    /// Returns true for an archive.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        self != Self::None
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix().unwrap_or("none"))
    }
}

/// Returns `name` without a recognised compression suffix.
#[must_use]
pub fn strip_codec_suffix(name: &str) -> &str {
    name.strip_suffix(".bz2")
        .or_else(|| name.strip_suffix(".gz"))
        .unwrap_or(name)
}

fn decoder(codec: Codec, input: BufReader<File>) -> Box<dyn Read> {
    match codec {
        Codec::Bzip2 => Box::new(BzDecoder::new(input)),
        Codec::Gzip => Box::new(GzDecoder::new(input)),
        Codec::None => Box::new(input),
    }
}

/// Decompresses `src` into `dst` according to `src`'s extension.
///
/// Returns the number of bytes written.
///
/// # Errors
///
/// Returns an error if either file cannot be opened or the archive is
/// corrupt.
pub fn decompress_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = decoder(Codec::from_path(src), BufReader::new(File::open(src)?));
    let mut writer = BufWriter::new(File::create(dst)?);
    let written = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(written)
}

/// Compresses `src` into `dst` with `codec`.
///
/// Returns the number of uncompressed bytes read.
///
/// # Errors
///
/// Returns an error if either file cannot be opened or written.
pub fn compress_file(src: &Path, dst: &Path, codec: Codec) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(src)?);
    let writer = BufWriter::new(File::create(dst)?);
    let read = match codec {
        Codec::Bzip2 => {
            let mut encoder = BzEncoder::new(writer, bzip2::Compression::default());
            let read = io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?.flush()?;
            read
        }
        Codec::Gzip => {
            let mut encoder = GzEncoder::new(writer, flate2::Compression::default());
            let read = io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?.flush()?;
            read
        }
        Codec::None => {
            let mut writer = writer;
            let read = io::copy(&mut reader, &mut writer)?;
            writer.flush()?;
            read
        }
    };
    Ok(read)
}

/// Expands `archive` into `dir` under its name minus the codec suffix.
///
/// The data is written to a staging file first and renamed into place, so
/// an interrupted expansion never leaves a truncated plain file behind.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, the archive cannot
/// be decoded or the rename fails.
pub fn expand_input(archive: &Path, dir: &Path) -> io::Result<PathBuf> {
    let name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "archive has no file name"))?;
    std::fs::create_dir_all(dir)?;
    let target = dir.join(strip_codec_suffix(name));
    let staging = staging_path(&target);

    match decompress_file(archive, &staging) {
        Ok(bytes) => {
            std::fs::rename(&staging, &target)?;
            debug!(archive = %archive.display(), target = %target.display(), bytes, "Input expanded");
            Ok(target)
        }
        Err(e) => {
            if let Err(cleanup) = std::fs::remove_file(&staging) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(path = %staging.display(), error = %cleanup, "Failed to remove partial expansion");
                }
            }
            Err(e)
        }
    }
}
