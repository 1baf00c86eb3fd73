use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix shared by every generated title key.
const ID_PREFIX: &str = "tt";

/// Minimum number of digits in a generated key.
const ID_WIDTH: usize = 7;

/// Validation errors raised at the model boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("unknown title type: {0}")]
    UnknownTitleType(String),

    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("update carries no changes")]
    EmptyChanges,
}

impl ModelError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Title key (`tconst`).
///
/// Keys are opaque strings on lookup. Generated keys are `tt` followed by a
/// zero-padded sequence number, and ordering compares that number first so
/// `tt10000000` sorts after `tt9999999`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TitleId(String);

impl TitleId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for the given sequence number.
    pub fn from_number(number: u64) -> Self {
        Self(format!("{}{:0width$}", ID_PREFIX, number, width = ID_WIDTH))
    }

    /// Sequence number encoded after the two-character prefix, if numeric.
    pub fn number(&self) -> Option<u64> {
        self.0.get(ID_PREFIX.len()..)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for TitleId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number()
            .unwrap_or(0)
            .cmp(&other.number().unwrap_or(0))
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for TitleId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TitleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TitleId {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Title category. The wire spelling follows the IMDb `titleType` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TitleType {
    Movie,
    Short,
    TvSeries,
    TvEpisode,
    TvMovie,
    TvMiniSeries,
    TvSpecial,
    TvShort,
    TvPilot,
    Video,
    VideoGame,
}

impl TitleType {
    pub const ALL: [TitleType; 11] = [
        TitleType::Movie,
        TitleType::Short,
        TitleType::TvSeries,
        TitleType::TvEpisode,
        TitleType::TvMovie,
        TitleType::TvMiniSeries,
        TitleType::TvSpecial,
        TitleType::TvShort,
        TitleType::TvPilot,
        TitleType::Video,
        TitleType::VideoGame,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TitleType::Movie => "movie",
            TitleType::Short => "short",
            TitleType::TvSeries => "tvSeries",
            TitleType::TvEpisode => "tvEpisode",
            TitleType::TvMovie => "tvMovie",
            TitleType::TvMiniSeries => "tvMiniSeries",
            TitleType::TvSpecial => "tvSpecial",
            TitleType::TvShort => "tvShort",
            TitleType::TvPilot => "tvPilot",
            TitleType::Video => "video",
            TitleType::VideoGame => "videoGame",
        }
    }
}

impl fmt::Display for TitleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TitleType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TitleType::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| ModelError::UnknownTitleType(s.to_string()))
    }
}

/// A stored title.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    pub id: TitleId,
    pub title_type: TitleType,
    pub primary_title: String,
    pub start_year: Option<i32>,
    pub runtime_minutes: Option<i32>,
    pub genres: Vec<String>,
    /// Set by the node that first accepted the write; replicas copy it.
    pub last_updated: DateTime<Utc>,
}

/// Attributes of a title that does not have a key yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTitle {
    pub title_type: TitleType,
    pub primary_title: String,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub runtime_minutes: Option<i32>,
    #[serde(default)]
    pub genres: Vec<String>,
}

impl NewTitle {
    pub fn new(title_type: TitleType, primary_title: impl Into<String>) -> Self {
        Self {
            title_type,
            primary_title: primary_title.into(),
            start_year: None,
            runtime_minutes: None,
            genres: Vec::new(),
        }
    }

    pub fn with_start_year(mut self, year: i32) -> Self {
        self.start_year = Some(year);
        self
    }

    pub fn with_runtime(mut self, minutes: i32) -> Self {
        self.runtime_minutes = Some(minutes);
        self
    }

    pub fn with_genres<I, S>(mut self, genres: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.genres = genres.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        validate_primary_title(&self.primary_title)?;
        if let Some(year) = self.start_year {
            validate_year(year)?;
        }
        if let Some(minutes) = self.runtime_minutes {
            validate_runtime(minutes)?;
        }
        validate_genres(&self.genres)
    }

    pub fn into_title(self, id: TitleId, last_updated: DateTime<Utc>) -> Title {
        Title {
            id,
            title_type: self.title_type,
            primary_title: self.primary_title,
            start_year: self.start_year,
            runtime_minutes: self.runtime_minutes,
            genres: self.genres,
            last_updated,
        }
    }
}

/// Partial update of a title, one optional field per mutable column.
///
/// The title type is not part of the change set: moving a title between
/// fragments is not supported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_minutes: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genres: Option<Vec<String>>,
}

impl TitleChanges {
    pub fn runtime(minutes: i32) -> Self {
        Self {
            runtime_minutes: Some(minutes),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary_title.is_none()
            && self.start_year.is_none()
            && self.runtime_minutes.is_none()
            && self.genres.is_none()
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.is_empty() {
            return Err(ModelError::EmptyChanges);
        }
        if let Some(title) = &self.primary_title {
            validate_primary_title(title)?;
        }
        if let Some(year) = self.start_year {
            validate_year(year)?;
        }
        if let Some(minutes) = self.runtime_minutes {
            validate_runtime(minutes)?;
        }
        if let Some(genres) = &self.genres {
            validate_genres(genres)?;
        }
        Ok(())
    }

    /// Returns `title` with every set field replaced.
    pub fn apply_to(&self, title: &Title, last_updated: DateTime<Utc>) -> Title {
        let mut updated = title.clone();
        if let Some(primary_title) = &self.primary_title {
            updated.primary_title = primary_title.clone();
        }
        if let Some(year) = self.start_year {
            updated.start_year = Some(year);
        }
        if let Some(minutes) = self.runtime_minutes {
            updated.runtime_minutes = Some(minutes);
        }
        if let Some(genres) = &self.genres {
            updated.genres = genres.clone();
        }
        updated.last_updated = last_updated;
        updated
    }

    /// True when every set field already has the given value in `title`.
    pub fn matches(&self, title: &Title) -> bool {
        self.primary_title
            .as_ref()
            .map_or(true, |v| *v == title.primary_title)
            && self.start_year.map_or(true, |v| Some(v) == title.start_year)
            && self
                .runtime_minutes
                .map_or(true, |v| Some(v) == title.runtime_minutes)
            && self.genres.as_ref().map_or(true, |v| *v == title.genres)
    }
}

/// Genres are stored as one comma-separated column.
pub fn encode_genres(genres: &[String]) -> Option<String> {
    if genres.is_empty() {
        None
    } else {
        Some(genres.join(","))
    }
}

pub fn decode_genres(column: Option<&str>) -> Vec<String> {
    column
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn validate_primary_title(title: &str) -> Result<(), ModelError> {
    if title.trim().is_empty() {
        return Err(ModelError::invalid("primary_title", "must not be blank"));
    }
    if title.chars().count() > 512 {
        return Err(ModelError::invalid("primary_title", "longer than 512 characters"));
    }
    Ok(())
}

fn validate_year(year: i32) -> Result<(), ModelError> {
    if !(1870..=2100).contains(&year) {
        return Err(ModelError::invalid("start_year", format!("{} out of range", year)));
    }
    Ok(())
}

fn validate_runtime(minutes: i32) -> Result<(), ModelError> {
    if minutes < 0 {
        return Err(ModelError::invalid("runtime_minutes", "must not be negative"));
    }
    Ok(())
}

fn validate_genres(genres: &[String]) -> Result<(), ModelError> {
    if genres.iter().any(|g| g.contains(',') || g.trim().is_empty()) {
        return Err(ModelError::invalid(
            "genres",
            "entries must be non-empty and contain no commas",
        ));
    }
    Ok(())
}
