//! Core domain model for BOFA: browser feed configuration, release records and
//! publication timestamp coercion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "bofa-core";

/// Output shape of every feed timestamp. The offset is a literal, not a conversion.
pub const PUB_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S +0000";

const DATE_TIME_INPUT_FORMAT: &str = "%B %d, %Y %I:%M %p";
const DATE_ONLY_INPUT_FORMAT: &str = "%B %d, %Y";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    Chrome,
    Edge,
    Firefox,
}

impl Browser {
    pub const ALL: [Browser; 3] = [Browser::Chrome, Browser::Edge, Browser::Firefox];

    pub fn as_str(&self) -> &'static str {
        match self {
            Browser::Chrome => "chrome",
            Browser::Edge => "edge",
            Browser::Firefox => "firefox",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Browser::Chrome => "Chrome",
            Browser::Edge => "Edge",
            Browser::Firefox => "Firefox",
        }
    }

    /// Directory (relative to the workspace root) holding this browser's snapshots and feed.
    pub fn files_dir(&self) -> String {
        format!("latest_{}_files", self.as_str())
    }
}

impl fmt::Display for Browser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown browser `{0}` (expected chrome, edge or firefox)")]
pub struct UnknownBrowser(pub String);

impl FromStr for Browser {
    type Err = UnknownBrowser;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Browser::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownBrowser(s.to_string()))
    }
}

/// Static per-browser channel metadata. Passed explicitly into every merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserFeedConfig {
    pub name: String,
    pub feed_filename: String,
    pub channel_title: String,
    pub channel_description: String,
    pub release_notes_url: String,
    pub item_title: String,
    pub image_url: String,
}

/// Raw per-browser release fields as extracted from a vendor snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRelease {
    pub short_version: Option<String>,
    pub update_download: Option<String>,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingField {
    Version,
    DownloadUrl,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingField::Version => f.write_str("version"),
            MissingField::DownloadUrl => f.write_str("download url"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: missing {field}; skipping")]
pub struct MissingDataError {
    pub name: String,
    pub field: MissingField,
}

/// Validated release data handed to the feed merge engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub feed: BrowserFeedConfig,
    pub version: String,
    pub download_url: String,
    pub last_updated: String,
}

impl ReleaseRecord {
    /// Normalize raw fields into a record, rejecting entries without a version or download URL.
    pub fn from_raw(feed: BrowserFeedConfig, raw: &RawRelease) -> Result<Self, MissingDataError> {
        let version = trimmed(raw.short_version.as_deref());
        let download_url = trimmed(raw.update_download.as_deref());
        let last_updated = trimmed(raw.last_updated.as_deref());

        if version.is_empty() {
            return Err(MissingDataError {
                name: feed.name,
                field: MissingField::Version,
            });
        }
        if download_url.is_empty() {
            return Err(MissingDataError {
                name: feed.name,
                field: MissingField::DownloadUrl,
            });
        }

        Ok(Self {
            feed,
            version,
            download_url,
            last_updated,
        })
    }

    pub fn name(&self) -> &str {
        &self.feed.name
    }

    pub fn feed_id(&self) -> &str {
        &self.feed.feed_filename
    }
}

fn trimmed(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    DateTime,
    DateOnly,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubDate {
    pub text: String,
    pub source: TimestampSource,
}

impl PubDate {
    pub fn is_fallback(&self) -> bool {
        self.source == TimestampSource::Fallback
    }
}

/// Coerce a loose vendor date string into a feed publication timestamp.
pub fn coerce_pub_date(raw: &str) -> PubDate {
    coerce_pub_date_at(raw, Utc::now())
}

/// Same as [`coerce_pub_date`] with an explicit clock for the fallback branch.
pub fn coerce_pub_date_at(raw: &str, now: DateTime<Utc>) -> PubDate {
    let cleaned = strip_zone_abbreviation(raw.trim());

    if let Ok(parsed) = NaiveDateTime::parse_from_str(cleaned, DATE_TIME_INPUT_FORMAT) {
        return PubDate {
            text: parsed.format(PUB_DATE_FORMAT).to_string(),
            source: TimestampSource::DateTime,
        };
    }

    if let Some(midnight) = NaiveDate::parse_from_str(cleaned, DATE_ONLY_INPUT_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return PubDate {
            text: midnight.format(PUB_DATE_FORMAT).to_string(),
            source: TimestampSource::DateOnly,
        };
    }

    let today = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or(now.naive_utc());
    PubDate {
        text: today.format(PUB_DATE_FORMAT).to_string(),
        source: TimestampSource::Fallback,
    }
}

/// Drop a trailing ` EDT`-style token (2-4 uppercase ASCII letters). `AM`/`PM` are kept.
fn strip_zone_abbreviation(input: &str) -> &str {
    match input.rsplit_once(' ') {
        Some((head, zone))
            if (2..=4).contains(&zone.len())
                && zone.chars().all(|c| c.is_ascii_uppercase())
                && !matches!(zone, "AM" | "PM") =>
        {
            head
        }
        _ => input,
    }
}
