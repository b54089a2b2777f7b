//! Input discovery.
//!
//! SuperDARN products are named `YYYYMMDD.HHMM.SS.<radar>[.<channel>].<ext>`,
//! e.g. `20240115.0200.00.sas.rawacf`. The name alone carries the radar and
//! the time window, so a directory of raw files can be turned into batch
//! inputs without opening any of them. Archived inputs (`.bz2`, `.gz`) are
//! recognised under the name they expand to.

use crate::compression::{strip_codec_suffix, Codec};
use crate::core::{ArtifactKey, RadarId, TimeWindow};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::debug;

#[allow(clippy::expect_used)]
static FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4})(\d{2})(\d{2})\.(\d{2})(\d{2})(?:\.(\d{2}))?\.([A-Za-z0-9_-]+)\.(.+)$")
        .expect("filename pattern")
});

/// Components of a SuperDARN file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    /// Radar site code.
    pub radar: String,
    /// Start of the covered interval.
    pub window: TimeWindow,
    /// Everything after the radar code: optional channel and extension.
    pub suffix: String,
}

/// Parses a SuperDARN file name. Returns `None` for anything else.
#[must_use]
pub fn parse_filename(name: &str) -> Option<ParsedName> {
    let caps = FILENAME.captures(name)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());

    let year = i32::try_from(num(1)?).ok()?;
    let date = NaiveDate::from_ymd_opt(year, num(2)?, num(3)?)?;
    let time = NaiveTime::from_hms_opt(num(4)?, num(5)?, 0)?;

    Some(ParsedName {
        radar: caps[7].to_string(),
        window: TimeWindow::new(NaiveDateTime::new(date, time)),
        suffix: caps[8].to_string(),
    })
}

/// One raw file plus the key its products are stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputFile {
    /// Path of the raw file.
    pub path: PathBuf,
    /// Radar and time window.
    pub key: ArtifactKey,
}

impl InputFile {
    /// Creates an input with an explicit key.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, key: ArtifactKey) -> Self {
        Self {
            path: path.into(),
            key,
        }
    }

    /// Derives the key from a SuperDARN file name ending in `.extension`.
    ///
    /// A channel letter between radar and extension is folded into the
    /// radar identifier (`pgr.a.rawacf` → `pgr-a`) so channels never share
    /// output files. A trailing `.bz2` or `.gz` is ignored.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>, extension: &str) -> Option<Self> {
        let path = path.into();
        let parsed = parse_filename(strip_codec_suffix(path.file_name()?.to_str()?))?;

        let radar = if parsed.suffix == extension {
            parsed.radar
        } else {
            let channel = parsed.suffix.strip_suffix(extension)?.strip_suffix('.')?;
            format!("{}-{channel}", parsed.radar)
        };

        let key = ArtifactKey::new(RadarId::new(radar).ok()?, parsed.window);
        Some(Self { path, key })
    }

    /// Compression of the file on disk.
    #[must_use]
    pub fn codec(&self) -> Codec {
        Codec::from_path(&self.path)
    }

    fn plain_name(&self) -> Option<&str> {
        self.path.file_name()?.to_str().map(strip_codec_suffix)
    }
}

/// Lists the files in `dir` named like SuperDARN products with `extension`.
///
/// Results are sorted by path. Non-matching entries are skipped. When a
/// plain file and an archive of it sit side by side, only the plain file is
/// returned.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn discover_inputs(dir: &Path, extension: &str) -> io::Result<Vec<InputFile>> {
    let mut inputs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        match InputFile::from_path(entry.path(), extension) {
            Some(input) => inputs.push(input),
            None => debug!(path = %entry.path().display(), "Skipping non-matching file"),
        }
    }
    inputs.sort();
    inputs.dedup_by(|later, kept| later.key == kept.key && later.plain_name() == kept.plain_name());
    debug!(dir = %dir.display(), extension, found = inputs.len(), "Inputs discovered");
    Ok(inputs)
}

/// Calendar granularity for [`group_inputs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// `YYYY-MM-DD`
    #[default]
    Day,
    /// `YYYY-MM`
    Month,
    /// `YYYY`
    Year,
}

impl GroupBy {
    fn label(self, window: &TimeWindow) -> String {
        let date = window.start().date();
        match self {
            Self::Day => date.format("%Y-%m-%d").to_string(),
            Self::Month => format!("{:04}-{:02}", date.year(), date.month()),
            Self::Year => format!("{:04}", date.year()),
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Month => write!(f, "month"),
            Self::Year => write!(f, "year"),
        }
    }
}

impl FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Self::Day),
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            other => Err(format!("Invalid grouping method: {other}")),
        }
    }
}

/// Groups inputs by calendar period of their time window.
///
/// Groups are keyed by label (`2024-01-15`, `2024-01` or `2024`) and
/// sorted; inputs keep their relative order inside a group.
#[must_use]
pub fn group_inputs(inputs: &[InputFile], by: GroupBy) -> BTreeMap<String, Vec<InputFile>> {
    let mut groups: BTreeMap<String, Vec<InputFile>> = BTreeMap::new();
    for input in inputs {
        groups
            .entry(by.label(&input.key.time_window))
            .or_default()
            .push(input.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_filename() {
        let parsed = parse_filename("20240115.0212.00.sas.rawacf").unwrap();
        assert_eq!(parsed.radar, "sas");
        assert_eq!(parsed.window.to_string(), "2024-01-15T02:12");
        assert_eq!(parsed.suffix, "rawacf");

        let no_seconds = parse_filename("20240115.0212.pgr.a.fitacf").unwrap();
        assert_eq!(no_seconds.suffix, "a.fitacf");

        assert!(parse_filename("20241315.0212.00.sas.rawacf").is_none());
        assert!(parse_filename("README.md").is_none());
    }

    #[test]
    fn test_input_from_path_folds_channel() {
        let plain = InputFile::from_path("/raw/20240115.0200.00.sas.rawacf", "rawacf").unwrap();
        assert_eq!(plain.key.to_string(), "sas@2024-01-15T02:00");

        let channel = InputFile::from_path("/raw/20240115.0200.00.pgr.a.rawacf", "rawacf").unwrap();
        assert_eq!(channel.key.radar_id.as_str(), "pgr-a");

        assert!(InputFile::from_path("/raw/20240115.0200.00.sas.fitacf", "rawacf").is_none());
    }

    #[test]
    fn test_archived_inputs_are_discovered() {
        let archived = InputFile::from_path("/raw/20240115.0200.00.pgr.a.rawacf.bz2", "rawacf").unwrap();
        assert_eq!(archived.key.to_string(), "pgr-a@2024-01-15T02:00");
        assert_eq!(archived.codec(), Codec::Bzip2);

        let dir = tempfile::tempdir().unwrap();
        for name in [
            "20240115.0200.00.sas.rawacf",
            "20240115.0200.00.sas.rawacf.bz2",
            "20240115.0400.00.sas.rawacf.gz",
            "20240115.0600.00.sas.fitacf.bz2",
        ] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }

        let inputs = discover_inputs(dir.path(), "rawacf").unwrap();
        let names: Vec<_> = inputs
            .iter()
            .map(|i| i.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["20240115.0200.00.sas.rawacf", "20240115.0400.00.sas.rawacf.gz"]
        );
        assert_eq!(inputs[1].codec(), Codec::Gzip);
    }

    #[test]
    fn test_discover_inputs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "20240116.0000.00.sas.rawacf",
            "20240115.0200.00.sas.rawacf",
            "20240115.0200.00.sas.fitacf",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        std::fs::create_dir(dir.path().join("20240117.0000.00.sas.rawacf")).unwrap();

        let inputs = discover_inputs(dir.path(), "rawacf").unwrap();
        let names: Vec<_> = inputs
            .iter()
            .map(|i| i.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["20240115.0200.00.sas.rawacf", "20240116.0000.00.sas.rawacf"]
        );
    }

    #[test]
    fn test_group_inputs() {
        let inputs: Vec<InputFile> = [
            "20240115.0000.00.sas.rawacf",
            "20240115.0200.00.sas.rawacf",
            "20240116.0000.00.sas.rawacf",
            "20240201.0000.00.sas.rawacf",
            "20250101.0000.00.sas.rawacf",
        ]
        .iter()
        .map(|name| InputFile::from_path(format!("/raw/{name}"), "rawacf").unwrap())
        .collect();

        let by_day = group_inputs(&inputs, GroupBy::Day);
        assert_eq!(by_day["2024-01-15"].len(), 2);
        assert_eq!(by_day.len(), 4);

        let by_month = group_inputs(&inputs, GroupBy::Month);
        assert_eq!(by_month.keys().collect::<Vec<_>>(), vec!["2024-01", "2024-02", "2025-01"]);

        let by_year = group_inputs(&inputs, GroupBy::Year);
        assert_eq!(by_year["2024"].len(), 4);
    }

    #[test]
    fn test_group_by_parse() {
        assert_eq!("month".parse::<GroupBy>().unwrap(), GroupBy::Month);
        assert!("week".parse::<GroupBy>().is_err());
        assert_eq!(GroupBy::Year.to_string(), "year");
    }
}
