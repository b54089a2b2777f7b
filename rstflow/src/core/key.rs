//! Partitioning keys: radar identifier and time window.

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Accepted textual forms for a time window start, tried in order.
const WINDOW_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y%m%d.%H%M",
];

/// Format used when a window is embedded in a file name.
const WINDOW_SLUG_FORMAT: &str = "%Y%m%d.%H%M";

/// Errors produced when parsing a key component.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    /// The radar identifier is empty or contains unsupported characters.
    #[error("Invalid radar identifier: '{0}'")]
    InvalidRadar(String),

    /// The time window could not be parsed.
    #[error("Invalid time window: '{0}'")]
    InvalidWindow(String),
}

/// Identifier of a SuperDARN radar site (e.g. `sas`, `pgr`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RadarId(String);

impl RadarId {
    /// Creates a radar identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty or is not made of ASCII
    /// letters, digits, `-` or `_`.
    pub fn new(id: impl Into<String>) -> Result<Self, KeyParseError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(id))
        } else {
            Err(KeyParseError::InvalidRadar(id))
        }
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RadarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RadarId {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RadarId {
    type Error = KeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RadarId> for String {
    fn from(value: RadarId) -> Self {
        value.0
    }
}

/// Start of the observation interval a file covers, at minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeWindow(NaiveDateTime);

impl TimeWindow {
    /// Creates the window containing `start`.
    ///
    /// Seconds and fractions are dropped so every instant inside one minute
    /// maps to the same key and the same artifact file name.
    #[must_use]
    pub fn new(start: NaiveDateTime) -> Self {
        let minute = start
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(start);
        Self(minute)
    }

    /// Returns the window start.
    #[must_use]
    pub fn start(&self) -> NaiveDateTime {
        self.0
    }

    /// Returns the compact `YYYYMMDD.HHMM` form used in file names.
    #[must_use]
    pub fn slug(&self) -> String {
        self.0.format(WINDOW_SLUG_FORMAT).to_string()
    }

    /// Parses the compact `YYYYMMDD.HHMM` form.
    #[must_use]
    pub fn from_slug(slug: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(slug, WINDOW_SLUG_FORMAT)
            .ok()
            .map(Self::new)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M"))
    }
}

impl FromStr for TimeWindow {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        WINDOW_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
            .map(Self::new)
            .ok_or_else(|| KeyParseError::InvalidWindow(s.to_string()))
    }
}

impl TryFrom<String> for TimeWindow {
    type Error = KeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeWindow> for String {
    fn from(value: TimeWindow) -> Self {
        value.to_string()
    }
}

/// The unit of mutual exclusion: one radar over one time window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// The radar.
    pub radar_id: RadarId,
    /// The time window.
    pub time_window: TimeWindow,
}

impl ArtifactKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(radar_id: RadarId, time_window: TimeWindow) -> Self {
        Self {
            radar_id,
            time_window,
        }
    }

    /// Parses both components from strings.
    ///
    /// # Errors
    ///
    /// Returns an error if either component is malformed.
    pub fn parse(radar_id: &str, time_window: &str) -> Result<Self, KeyParseError> {
        Ok(Self::new(radar_id.parse()?, time_window.parse()?))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.radar_id, self.time_window)
    }
}
