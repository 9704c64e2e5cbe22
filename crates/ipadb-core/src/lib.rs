//! Core catalog model and provenance types for ipadb.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod keys;

pub const CRATE_NAME: &str = "ipadb-core";

/// Description written when the feed carries none.
pub const DEFAULT_DESCRIPTION: &str = "Injected with Premium";

/// Publisher written when the feed carries none.
pub const DEFAULT_DEVELOPER: &str = "apptesters.org";

/// One listing as published by the upstream feed.
///
/// Every field is optional on the wire; the normalizer decides what is fatal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListingRecord {
    #[serde(rename = "bundleID", default)]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(rename = "localizedDescription", default)]
    pub localized_description: Option<String>,
    #[serde(rename = "iconURL", default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(rename = "downloadURL", default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub down: Option<String>,
    #[serde(rename = "developerName", default)]
    pub developer_name: Option<String>,
    #[serde(rename = "versionDate", default)]
    pub version_date: Option<String>,
}

impl ListingRecord {
    /// Display name with surrounding whitespace removed, `None` when blank.
    pub fn display_name(&self) -> Option<&str> {
        non_blank(self.name.as_deref())
    }

    pub fn bundle_identifier(&self) -> Option<&str> {
        non_blank(self.bundle_id.as_deref())
    }

    pub fn icon_ref(&self) -> Option<&str> {
        non_blank(self.icon_url.as_deref()).or_else(|| non_blank(self.icon.as_deref()))
    }

    pub fn download_ref(&self) -> Option<&str> {
        non_blank(self.download_url.as_deref()).or_else(|| non_blank(self.down.as_deref()))
    }

    pub fn release_date(&self) -> Option<DateTime<Utc>> {
        self.version_date.as_deref().and_then(parse_timestamp)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Which pipeline produced a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    #[serde(rename = "apptesters")]
    Automated,
    #[serde(rename = "manual")]
    Curated,
    #[serde(other)]
    Unrecognized,
}

impl Provenance {
    pub const AUTOMATED_MARKER: &'static str = "apptesters";
    pub const CURATED_MARKER: &'static str = "manual";

    /// Maps the on-disk `source` marker to a provenance. Missing or unknown
    /// markers are never treated as automated.
    pub fn from_marker(marker: Option<&str>) -> Self {
        match marker {
            Some(Self::AUTOMATED_MARKER) => Self::Automated,
            Some(Self::CURATED_MARKER) => Self::Curated,
            _ => Self::Unrecognized,
        }
    }

    pub fn marker(self) -> Option<&'static str> {
        match self {
            Self::Automated => Some(Self::AUTOMATED_MARKER),
            Self::Curated => Some(Self::CURATED_MARKER),
            Self::Unrecognized => None,
        }
    }
}

/// Category tag attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Game,
    Social,
    Photo,
    Music,
    Utility,
    Productivity,
}

impl Tag {
    /// Fixed precedence order, also used to break score ties.
    pub const ALL: [Tag; 6] = [
        Tag::Game,
        Tag::Social,
        Tag::Photo,
        Tag::Music,
        Tag::Utility,
        Tag::Productivity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Game => "game",
            Tag::Social => "social",
            Tag::Photo => "photo",
            Tag::Music => "music",
            Tag::Utility => "utility",
            Tag::Productivity => "productivity",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Promotional badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Badge {
    New,
    Trending,
    Top,
    Vip,
}

impl Badge {
    pub fn as_str(self) -> &'static str {
        match self {
            Badge::New => "new",
            Badge::Trending => "trending",
            Badge::Top => "top",
            Badge::Vip => "vip",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EntryKind {
    #[default]
    #[serde(rename = "ipa")]
    Ipa,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Ipa => "ipa",
        }
    }
}

/// Canonical catalog entry produced by the automated sync path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub desc: String,
    pub tags: Vec<Tag>,
    pub badge: Option<Badge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub developer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub source: Provenance,
    #[serde(rename = "bundleID", default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    pub last_sync: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey {
            name: self.name.clone(),
            bundle_id: self.bundle_id.clone(),
        }
    }

    pub fn version_key(&self) -> VersionKey {
        VersionKey {
            identity: self.identity_key(),
            version: self.version.clone(),
        }
    }
}

impl From<&CatalogEntry> for CatalogRecord {
    /// Mirrors the derived `Serialize` layout without a fallible detour.
    fn from(entry: &CatalogEntry) -> Self {
        fn put(map: &mut Map<String, JsonValue>, key: &str, value: Option<&str>) {
            if let Some(value) = value {
                map.insert(key.to_string(), JsonValue::String(value.to_string()));
            }
        }

        let mut map = Map::new();
        put(&mut map, "id", Some(&entry.id));
        put(&mut map, "type", Some(entry.kind.as_str()));
        put(&mut map, "name", Some(&entry.name));
        put(&mut map, "icon", entry.icon.as_deref());
        put(&mut map, "desc", Some(&entry.desc));
        map.insert(
            "tags".to_string(),
            JsonValue::Array(
                entry
                    .tags
                    .iter()
                    .map(|t| JsonValue::String(t.as_str().to_string()))
                    .collect(),
            ),
        );
        map.insert(
            "badge".to_string(),
            entry
                .badge
                .map_or(JsonValue::Null, |b| JsonValue::String(b.as_str().to_string())),
        );
        put(&mut map, "fileLink", entry.file_link.as_deref());
        put(&mut map, "version", entry.version.as_deref());
        put(&mut map, "developer", Some(&entry.developer));
        put(&mut map, "date", entry.date.as_deref());
        put(&mut map, "source", entry.source.marker());
        put(&mut map, "bundleID", entry.bundle_id.as_deref());
        put(
            &mut map,
            "lastSync",
            Some(&entry.last_sync.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        Self(JsonValue::Object(map))
    }
}

/// Field pair used to recognize "the same app" across sync runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub name: String,
    pub bundle_id: Option<String>,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bundle_id {
            Some(bundle_id) => write!(f, "{} ({bundle_id})", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Identity key plus version; distinct versions are distinct artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionKey {
    pub identity: IdentityKey,
    pub version: Option<String>,
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {}",
            self.identity,
            self.version.as_deref().unwrap_or("<none>")
        )
    }
}

/// A stored catalog element, kept as raw JSON so entries this crate does not
/// own round-trip unchanged. All accessors read defensively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogRecord(JsonValue);

impl CatalogRecord {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &JsonValue {
        &self.0
    }

    pub fn into_value(self) -> JsonValue {
        self.0
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.as_object()?.get(key)?.as_str()
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn bundle_id(&self) -> Option<&str> {
        self.str_field("bundleID")
    }

    pub fn version(&self) -> Option<&str> {
        self.str_field("version")
    }

    pub fn provenance(&self) -> Provenance {
        Provenance::from_marker(self.str_field("source"))
    }

    /// `date` field, `None` when absent or unparsable.
    pub fn release_date(&self) -> Option<DateTime<Utc>> {
        self.str_field("date").and_then(parse_timestamp)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.str_field("lastSync").and_then(parse_timestamp)
    }

    /// Release date, falling back to the last sync time.
    pub fn recency(&self) -> Option<DateTime<Utc>> {
        self.release_date().or_else(|| self.last_sync())
    }

    /// `None` for records without a name: they can never match a candidate.
    pub fn identity_key(&self) -> Option<IdentityKey> {
        Some(IdentityKey {
            name: self.name()?.to_string(),
            bundle_id: self.bundle_id().map(ToString::to_string),
        })
    }

    pub fn version_key(&self) -> Option<VersionKey> {
        Some(VersionKey {
            identity: self.identity_key()?,
            version: self.version().map(ToString::to_string),
        })
    }
}

impl From<JsonValue> for CatalogRecord {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

/// Parses the timestamp shapes seen in feeds and stored catalogs: RFC 3339,
/// naive date-times (read as UTC) and bare `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
