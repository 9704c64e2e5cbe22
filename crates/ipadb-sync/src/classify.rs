//! Keyword classifier for category tags and promotional badges.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use ipadb_core::{Badge, Tag};
use serde::Deserialize;
use tracing::debug;

pub const NAME_WEIGHT: u32 = 3;
pub const BUNDLE_WEIGHT: u32 = 2;
pub const DESCRIPTION_WEIGHT: u32 = 1;
pub const MAX_TAGS: usize = 2;

/// A release this recent (or dated in the future) earns the `new` badge.
pub const NEW_BADGE_WINDOW_DAYS: i64 = 7;

const GAME_KEYWORDS: &[&str] = &[
    "game", "play", "racing", "clash", "craft", "puzzle", "arcade",
];
const SOCIAL_KEYWORDS: &[&str] = &[
    "social",
    "chat",
    "messenger",
    "instagram",
    "facebook",
    "tiktok",
];
const PHOTO_KEYWORDS: &[&str] = &[
    "photo",
    "camera",
    "pic",
    "image",
    "snap",
    "filter",
    "lightroom",
    "video",
];
const MUSIC_KEYWORDS: &[&str] = &["music", "audio", "sound", "song", "spotify", "piano"];
const UTILITY_KEYWORDS: &[&str] = &[
    "utility",
    "tool",
    "manager",
    "vpn",
    "scanner",
    "calculator",
];
const PRODUCTIVITY_KEYWORDS: &[&str] = &[
    "productivity",
    "note",
    "todo",
    "office",
    "pdf",
    "document",
];

const TRENDING_KEYWORDS: &[&str] = &[
    "facebook",
    "instagram",
    "minecraft",
    "netflix",
    "spotify",
    "telegram",
    "tiktok",
    "whatsapp",
    "youtube",
];
const PREMIUM_KEYWORDS: &[&str] = &["gold", "plus", "premium", "pro", "unlocked", "vip"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TagRule {
    pub tag: Tag,
    pub keywords: Vec<String>,
}

/// Keyword tables driving the classifier. Rule order is the tie-break order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClassifierRules {
    pub tags: Vec<TagRule>,
    pub trending: Vec<String>,
    pub premium: Vec<String>,
}

fn owned(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| (*w).to_string()).collect()
}

impl Default for ClassifierRules {
    fn default() -> Self {
        let table = [
            (Tag::Game, GAME_KEYWORDS),
            (Tag::Social, SOCIAL_KEYWORDS),
            (Tag::Photo, PHOTO_KEYWORDS),
            (Tag::Music, MUSIC_KEYWORDS),
            (Tag::Utility, UTILITY_KEYWORDS),
            (Tag::Productivity, PRODUCTIVITY_KEYWORDS),
        ];
        Self {
            tags: table
                .into_iter()
                .map(|(tag, words)| TagRule {
                    tag,
                    keywords: owned(words),
                })
                .collect(),
            trending: owned(TRENDING_KEYWORDS),
            premium: owned(PREMIUM_KEYWORDS),
        }
    }
}

impl ClassifierRules {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let mut rules: Self = serde_yaml::from_str(raw).context("parsing classifier rules")?;
        for rule in &mut rules.tags {
            lowercase_all(&mut rule.keywords);
        }
        lowercase_all(&mut rules.trending);
        lowercase_all(&mut rules.premium);
        rules.trending.sort();
        Ok(rules)
    }

    pub fn from_yaml_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
    }
}

fn lowercase_all(words: &mut [String]) {
    for word in words {
        *word = word.to_lowercase();
    }
}

/// Text the classifier looks at for one listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierInput<'a> {
    pub name: Option<&'a str>,
    pub description: Option<&'a str>,
    pub bundle_id: Option<&'a str>,
    pub release_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub tags: Vec<Tag>,
    pub badge: Option<Badge>,
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: ClassifierRules,
}

impl Classifier {
    pub fn new(rules: ClassifierRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    pub fn classify(&self, input: ClassifierInput<'_>, now: DateTime<Utc>) -> Classification {
        Classification {
            tags: self.tags(input),
            badge: self.badge(input, now),
        }
    }

    /// Per-rule scores in rule order.
    pub fn scores(&self, input: ClassifierInput<'_>) -> Vec<(Tag, u32)> {
        let name = lower(input.name);
        let desc = lower(input.description);
        let bundle = lower(input.bundle_id);
        self.rules
            .tags
            .iter()
            .map(|rule| {
                let score = rule
                    .keywords
                    .iter()
                    .map(|kw| {
                        let kw = kw.as_str();
                        let mut s = 0;
                        if name.contains(kw) {
                            s += NAME_WEIGHT;
                        }
                        if bundle.contains(kw) {
                            s += BUNDLE_WEIGHT;
                        }
                        if desc.contains(kw) {
                            s += DESCRIPTION_WEIGHT;
                        }
                        s
                    })
                    .sum();
                (rule.tag, score)
            })
            .collect()
    }

    pub fn tags(&self, input: ClassifierInput<'_>) -> Vec<Tag> {
        let mut scored: Vec<(Tag, u32)> = self
            .scores(input)
            .into_iter()
            .filter(|(_, score)| *score > 0)
            .collect();
        // Stable: equal scores keep rule order.
        scored.sort_by(|a, b| b.1.cmp(&a.1));

        let mut tags: Vec<Tag> = Vec::with_capacity(MAX_TAGS);
        for (tag, _) in scored {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
            if tags.len() == MAX_TAGS {
                break;
            }
        }
        if tags.is_empty() {
            tags.push(Tag::Utility);
        }
        tags
    }

    pub fn badge(&self, input: ClassifierInput<'_>, now: DateTime<Utc>) -> Option<Badge> {
        if let Some(released) = input.release_date {
            if now - released <= Duration::days(NEW_BADGE_WINDOW_DAYS) {
                return Some(Badge::New);
            }
        }

        let name = lower(input.name);
        let mut trending: Vec<&str> = self
            .rules
            .trending
            .iter()
            .map(String::as_str)
            .filter(|kw| name.contains(kw))
            .collect();
        trending.sort_unstable();
        if let Some(keyword) = trending.first() {
            debug!(keyword, name = %name, "trending keyword matched");
            return Some(Badge::Trending);
        }

        let desc = lower(input.description);
        self.rules
            .premium
            .iter()
            .any(|kw| name.contains(kw.as_str()) || desc.contains(kw.as_str()))
            .then_some(Badge::Top)
    }
}

fn lower(value: Option<&str>) -> String {
    value.unwrap_or_default().to_lowercase()
}
