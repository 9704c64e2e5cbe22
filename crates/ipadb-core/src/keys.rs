//! License key ledger model: issuing, redeeming and revoking limited-use keys.
//!
//! Functions here operate on an in-memory snapshot of the ledger; callers own
//! persistence and must write the snapshot back when a call mutates it.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters used in key codes.
pub const KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub const ISSUER_BOT: &str = "telegram_bot";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseKey {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_uses: Option<u32>,
    #[serde(default)]
    pub current_uses: u32,
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl LicenseKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_uses.is_some_and(|max| self.current_uses >= max)
    }

    pub fn remaining_uses(&self) -> Option<u32> {
        self.max_uses.map(|max| max.saturating_sub(self.current_uses))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewKeyRequest {
    /// Validity in days; `None` or zero means no expiry.
    #[serde(default, rename = "duration")]
    pub duration_days: Option<u32>,
    /// `None` or zero means unlimited uses.
    #[serde(default)]
    pub max_uses: Option<u32>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Generates a `XXXX-XXXX-XXXX-XXXX` code.
pub fn generate_key_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    let groups: Vec<String> = (0..4).map(|_| random_chars(rng, KEY_ALPHABET, 4)).collect();
    groups.join("-")
}

fn random_chars<R: Rng + ?Sized>(rng: &mut R, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

pub fn issue_key<R: Rng + ?Sized>(
    request: &NewKeyRequest,
    now: DateTime<Utc>,
    rng: &mut R,
) -> LicenseKey {
    let duration_days = request.duration_days.filter(|d| *d > 0);
    let max_uses = request.max_uses.filter(|m| *m > 0);
    let notes = request
        .notes
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| {
            format!(
                "{} days, {} uses",
                duration_days.map_or_else(|| "∞".to_string(), |d| d.to_string()),
                max_uses.map_or_else(|| "∞".to_string(), |m| m.to_string()),
            )
        });

    LicenseKey {
        id: format!(
            "key_{}_{}",
            now.timestamp_millis(),
            random_chars(rng, ID_ALPHABET, 9)
        ),
        key: generate_key_code(rng),
        created_at: Some(now),
        // Past the calendar's range a key simply never expires.
        expires_at: duration_days.and_then(|d| now.checked_add_signed(Duration::days(i64::from(d)))),
        max_uses,
        current_uses: 0,
        active: true,
        created_by: Some(ISSUER_BOT.to_string()),
        notes: Some(notes),
        last_used_at: None,
    }
}

/// Codes are stored upper-case; lookups are case-insensitive.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyRejection {
    #[error("key does not exist")]
    NotFound,
    #[error("key has been deactivated")]
    Inactive,
    #[error("key expired at {expired_at}")]
    Expired { expired_at: DateTime<Utc> },
    #[error("key used {current_uses} of {max_uses} times")]
    MaxUsesReached { max_uses: u32, current_uses: u32 },
}

impl KeyRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "KEY_NOT_FOUND",
            Self::Inactive => "KEY_INACTIVE",
            Self::Expired { .. } => "KEY_EXPIRED",
            Self::MaxUsesReached { .. } => "KEY_MAX_USES_REACHED",
        }
    }

    /// Rejections that deactivate the key and therefore need persisting.
    pub fn mutates_ledger(&self) -> bool {
        matches!(self, Self::Expired { .. } | Self::MaxUsesReached { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    pub remaining_uses: Option<u32>,
    pub is_unlimited: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Consumes one use of `code`. Expired or exhausted keys are deactivated in
/// place before the rejection is returned.
pub fn redeem(
    keys: &mut [LicenseKey],
    code: &str,
    now: DateTime<Utc>,
) -> Result<Redemption, KeyRejection> {
    let code = normalize_code(code);
    let key = keys
        .iter_mut()
        .find(|k| k.key == code)
        .ok_or(KeyRejection::NotFound)?;

    if !key.active {
        return Err(KeyRejection::Inactive);
    }
    if let Some(expired_at) = key.expires_at.filter(|at| *at < now) {
        key.active = false;
        return Err(KeyRejection::Expired { expired_at });
    }
    if let Some(max_uses) = key.max_uses.filter(|_| key.is_exhausted()) {
        key.active = false;
        return Err(KeyRejection::MaxUsesReached {
            max_uses,
            current_uses: key.current_uses,
        });
    }

    key.current_uses = key.current_uses.saturating_add(1);
    key.last_used_at = Some(now);
    Ok(Redemption {
        remaining_uses: key.remaining_uses(),
        is_unlimited: key.max_uses.is_none(),
        expires_at: key.expires_at,
    })
}

/// Removes `code` from the ledger, returning the removed key.
pub fn revoke(keys: &mut Vec<LicenseKey>, code: &str) -> Option<LicenseKey> {
    let code = normalize_code(code);
    let idx = keys.iter().position(|k| k.key == code)?;
    Some(keys.remove(idx))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub expired: usize,
    pub total_uses: u64,
}

impl KeyStats {
    pub fn collect(keys: &[LicenseKey], now: DateTime<Utc>) -> Self {
        keys.iter().fold(Self::default(), |mut stats, key| {
            stats.total += 1;
            if key.active {
                stats.active += 1;
            } else {
                stats.inactive += 1;
            }
            if key.is_expired(now) {
                stats.expired += 1;
            }
            stats.total_uses += u64::from(key.current_uses);
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).single().unwrap()
    }

    fn key(code: &str) -> LicenseKey {
        LicenseKey {
            id: format!("key_{code}"),
            key: code.to_string(),
            created_at: Some(now()),
            expires_at: None,
            max_uses: None,
            current_uses: 0,
            active: true,
            created_by: None,
            notes: None,
            last_used_at: None,
        }
    }

    #[test]
    fn generated_codes_use_four_groups_of_four() {
        let mut rng = StdRng::seed_from_u64(7);
        let code = generate_key_code(&mut rng);
        let groups: Vec<&str> = code.split('-').collect();
        assert_eq!(groups.len(), 4);
        for group in groups {
            assert_eq!(group.len(), 4);
            assert!(group.bytes().all(|b| KEY_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn issued_key_applies_limits_and_default_note() {
        let mut rng = StdRng::seed_from_u64(1);
        let issued = issue_key(
            &NewKeyRequest {
                duration_days: Some(30),
                max_uses: Some(0),
                notes: None,
            },
            now(),
            &mut rng,
        );
        assert!(issued.active);
        assert_eq!(issued.max_uses, None);
        assert_eq!(issued.expires_at, Some(now() + Duration::days(30)));
        assert_eq!(issued.notes.as_deref(), Some("30 days, ∞ uses"));
        assert!(issued.id.starts_with(&format!("key_{}_", now().timestamp_millis())));
    }

    #[test]
    fn durations_past_the_calendar_never_expire() {
        let mut rng = StdRng::seed_from_u64(2);
        let request = NewKeyRequest {
            duration_days: Some(u32::MAX),
            ..Default::default()
        };
        let issued = issue_key(&request, now(), &mut rng);
        assert_eq!(issued.expires_at, None);
        assert!(!issued.is_expired(now()));
        assert_eq!(issued.notes.as_deref(), Some("4294967295 days, ∞ uses"));
    }

    #[test]
    fn redeem_counts_uses_until_exhausted() {
        let mut keys = vec![LicenseKey {
            max_uses: Some(2),
            ..key("AAAA-BBBB-CCCC-DDDD")
        }];

        let first = redeem(&mut keys, "aaaa-bbbb-cccc-dddd", now()).unwrap();
        assert_eq!(first.remaining_uses, Some(1));
        assert!(!first.is_unlimited);
        let second = redeem(&mut keys, "AAAA-BBBB-CCCC-DDDD", now()).unwrap();
        assert_eq!(second.remaining_uses, Some(0));

        let err = redeem(&mut keys, "AAAA-BBBB-CCCC-DDDD", now()).unwrap_err();
        assert_eq!(
            err,
            KeyRejection::MaxUsesReached {
                max_uses: 2,
                current_uses: 2
            }
        );
        assert!(err.mutates_ledger());
        assert!(!keys[0].active);
        assert_eq!(keys[0].last_used_at, Some(now()));

        let err = redeem(&mut keys, "AAAA-BBBB-CCCC-DDDD", now()).unwrap_err();
        assert_eq!(err.code(), "KEY_INACTIVE");
        assert!(!err.mutates_ledger());
    }

    #[test]
    fn expired_keys_are_deactivated() {
        let expired_at = now() - Duration::hours(1);
        let mut keys = vec![LicenseKey {
            expires_at: Some(expired_at),
            ..key("EXPD-0000-0000-0000")
        }];
        let err = redeem(&mut keys, "EXPD-0000-0000-0000", now()).unwrap_err();
        assert_eq!(err, KeyRejection::Expired { expired_at });
        assert!(!keys[0].active);
        assert_eq!(keys[0].current_uses, 0);
    }

    #[test]
    fn unknown_code_is_not_found() {
        let mut keys = vec![key("AAAA-AAAA-AAAA-AAAA")];
        assert_eq!(
            redeem(&mut keys, "ZZZZ-ZZZZ-ZZZZ-ZZZZ", now()),
            Err(KeyRejection::NotFound)
        );
    }

    #[test]
    fn revoke_removes_only_the_matching_key() {
        let mut keys = vec![key("AAAA-AAAA-AAAA-AAAA"), key("BBBB-BBBB-BBBB-BBBB")];
        let removed = revoke(&mut keys, " bbbb-bbbb-bbbb-bbbb ").unwrap();
        assert_eq!(removed.key, "BBBB-BBBB-BBBB-BBBB");
        assert_eq!(keys.len(), 1);
        assert!(revoke(&mut keys, "BBBB-BBBB-BBBB-BBBB").is_none());
    }

    #[test]
    fn stats_cover_activity_and_expiry() {
        let keys = vec![
            LicenseKey {
                current_uses: 3,
                ..key("A")
            },
            LicenseKey {
                active: false,
                expires_at: Some(now() - Duration::days(1)),
                current_uses: 1,
                ..key("B")
            },
        ];
        let stats = KeyStats::collect(&keys, now());
        assert_eq!(
            stats,
            KeyStats {
                total: 2,
                active: 1,
                inactive: 1,
                expired: 1,
                total_uses: 4
            }
        );
    }
}
