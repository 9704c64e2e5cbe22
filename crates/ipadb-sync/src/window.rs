//! Which feed listings a sync run considers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use ipadb_core::ListingRecord;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncWindow {
    /// Listings with a parsable `versionDate` inside the last N hours.
    LastHours(u32),
    /// Listings whose `versionDate` starts with today's UTC date.
    #[default]
    Today,
    /// Every listing in the feed.
    Full,
}

impl SyncWindow {
    /// `hours == Some(0)` behaves like no hours at all.
    pub fn from_request(hours: Option<u32>, mode: Option<&str>) -> Result<Self, String> {
        match (hours.filter(|h| *h > 0), mode) {
            (Some(hours), _) => Ok(Self::LastHours(hours)),
            (None, Some(mode)) => mode.parse(),
            (None, None) => Ok(Self::Today),
        }
    }

    pub fn includes(&self, record: &ListingRecord, now: DateTime<Utc>) -> bool {
        match self {
            Self::Full => true,
            Self::Today => {
                let today = now.format("%Y-%m-%d").to_string();
                record
                    .version_date
                    .as_deref()
                    .is_some_and(|d| d.trim_start().starts_with(&today))
            }
            Self::LastHours(hours) => {
                // A span reaching past the representable range has no cutoff.
                let cutoff = now.checked_sub_signed(Duration::hours(i64::from(*hours)));
                record
                    .release_date()
                    .is_some_and(|d| cutoff.map_or(true, |cutoff| d >= cutoff))
            }
        }
    }

    pub fn filter(&self, records: Vec<ListingRecord>, now: DateTime<Utc>) -> Vec<ListingRecord> {
        records
            .into_iter()
            .filter(|record| self.includes(record, now))
            .collect()
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastHours(hours) => write!(f, "{hours}h"),
            Self::Today => f.write_str("today"),
            Self::Full => f.write_str("full"),
        }
    }
}

impl FromStr for SyncWindow {
    type Err = String;

    /// Accepts `today`, `full`, `24h` or a bare hour count.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim().to_ascii_lowercase();
        match raw.as_str() {
            "today" => return Ok(Self::Today),
            "full" | "all" => return Ok(Self::Full),
            _ => {}
        }
        let digits = raw.strip_suffix('h').unwrap_or(&raw);
        match digits.parse::<u32>() {
            Ok(0) => Ok(Self::Today),
            Ok(hours) => Ok(Self::LastHours(hours)),
            Err(_) => Err(format!("unknown sync window `{raw}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
    }

    fn dated(date: Option<&str>) -> ListingRecord {
        ListingRecord {
            name: Some("Foo".into()),
            version_date: date.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn last_hours_needs_a_parsable_recent_date() {
        let window = SyncWindow::LastHours(24);
        assert!(window.includes(&dated(Some("2026-03-09T13:00:00Z")), now()));
        assert!(window.includes(&dated(Some("2026-03-09T12:00:00Z")), now()));
        assert!(!window.includes(&dated(Some("2026-03-09T11:59:59Z")), now()));
        assert!(!window.includes(&dated(Some("last tuesday")), now()));
        assert!(!window.includes(&dated(None), now()));
    }

    #[test]
    fn today_matches_the_utc_date_prefix() {
        let window = SyncWindow::Today;
        assert!(window.includes(&dated(Some("2026-03-10T01:00:00Z")), now()));
        assert!(window.includes(&dated(Some("2026-03-10")), now()));
        assert!(!window.includes(&dated(Some("2026-03-09T23:59:59Z")), now()));
        assert!(!window.includes(&dated(None), now()));
    }

    #[test]
    fn full_keeps_everything() {
        let records = vec![dated(None), dated(Some("1999-01-01")), dated(Some("junk"))];
        assert_eq!(SyncWindow::Full.filter(records, now()).len(), 3);
    }

    #[test]
    fn huge_hour_counts_reach_back_without_overflow() {
        let window = "4294967295h".parse::<SyncWindow>().unwrap();
        assert_eq!(window, SyncWindow::LastHours(u32::MAX));
        assert!(window.includes(&dated(Some("1999-01-01")), now()));
        assert!(!window.includes(&dated(Some("junk")), now()));
        let window = SyncWindow::from_request(Some(u32::MAX), None).unwrap();
        assert_eq!(window.filter(vec![dated(Some("2001-09-09")), dated(None)], now()).len(), 1);
    }

    #[test]
    fn parses_request_shapes() {
        assert_eq!("today".parse::<SyncWindow>(), Ok(SyncWindow::Today));
        assert_eq!("FULL".parse::<SyncWindow>(), Ok(SyncWindow::Full));
        assert_eq!("48h".parse::<SyncWindow>(), Ok(SyncWindow::LastHours(48)));
        assert_eq!("6".parse::<SyncWindow>(), Ok(SyncWindow::LastHours(6)));
        assert!("week".parse::<SyncWindow>().is_err());

        assert_eq!(SyncWindow::from_request(Some(12), Some("full")), Ok(SyncWindow::LastHours(12)));
        assert_eq!(SyncWindow::from_request(Some(0), Some("full")), Ok(SyncWindow::Full));
        assert_eq!(SyncWindow::from_request(None, None), Ok(SyncWindow::Today));
        assert_eq!(SyncWindow::LastHours(24).to_string(), "24h");
    }
}
