use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};

/// A platform Trawl knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Instagram,
    #[serde(rename = "tiktok")]
    TikTok,
    Shopee,
    PlayStore,
    GoogleMaps,
    GoogleNews,
    GoogleJobs,
    #[serde(rename = "linkedin")]
    LinkedIn,
}

impl Source {
    pub const ALL: [Source; 8] = [
        Source::Instagram,
        Source::TikTok,
        Source::Shopee,
        Source::PlayStore,
        Source::GoogleMaps,
        Source::GoogleNews,
        Source::GoogleJobs,
        Source::LinkedIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Instagram => "instagram",
            Source::TikTok => "tiktok",
            Source::Shopee => "shopee",
            Source::PlayStore => "play-store",
            Source::GoogleMaps => "google-maps",
            Source::GoogleNews => "google-news",
            Source::GoogleJobs => "google-jobs",
            Source::LinkedIn => "linkedin",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Source {
    type Err = AppError;

    /// Accepts `"PlayStore"`, `"play-store"`, `"play_store"` and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "instagram" | "ig" => Ok(Source::Instagram),
            "tiktok" => Ok(Source::TikTok),
            "shopee" => Ok(Source::Shopee),
            "playstore" => Ok(Source::PlayStore),
            "googlemaps" | "maps" => Ok(Source::GoogleMaps),
            "googlenews" | "news" => Ok(Source::GoogleNews),
            "googlejobs" | "jobs" => Ok(Source::GoogleJobs),
            "linkedin" => Ok(Source::LinkedIn),
            _ => Err(AppError::InvalidInput(format!("Unknown source: {s}"))),
        }
    }
}

/// What to query on a given source: a username, keyword, shop or app id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    source: Source,
    id: String,
}

impl Target {
    pub fn new(source: Source, id: impl AsRef<str>) -> Result<Self, AppError> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "Empty target identifier for {source}"
            )));
        }
        Ok(Self {
            source,
            id: id.to_string(),
        })
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// Normalized identity and aggregate attributes of a target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileRecord {
    pub username: String,
    pub display_name: Option<String>,
    pub follower_count: u64,
    pub following_count: u64,
    /// Source-specific attributes (bio, rating, verified, ...).
    pub extra_metrics: BTreeMap<String, serde_json::Value>,
    pub scraped_at: DateTime<Utc>,
}

impl ProfileRecord {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: None,
            follower_count: 0,
            following_count: 0,
            extra_metrics: BTreeMap::new(),
            scraped_at: Utc::now(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_counts(mut self, followers: u64, following: u64) -> Self {
        self.follower_count = followers;
        self.following_count = following;
        self
    }

    /// Adds a metric, skipping JSON nulls so absent values stay absent.
    pub fn with_metric(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.extra_metrics.insert(key.to_string(), value);
        }
        self
    }

    /// Records `engagement_rate` and `avg_likes` computed over `items`.
    ///
    /// Engagement rate is the mean of likes + comments per item, as a
    /// percentage of followers. Both metrics are 0 with no items or no
    /// followers.
    pub fn apply_engagement(&mut self, items: &[ItemRecord]) {
        let (rate, avg_likes) = if items.is_empty() || self.follower_count == 0 {
            (0.0, 0.0)
        } else {
            let n = items.len() as f64;
            let likes: i64 = items.iter().map(|i| i.count("likes")).sum();
            let comments: i64 = items.iter().map(|i| i.count("comments")).sum();
            let avg_engagement = (likes + comments) as f64 / n;
            (
                round_to(avg_engagement / self.follower_count as f64 * 100.0, 2),
                round_to(likes as f64 / n, 1),
            )
        };
        self.extra_metrics
            .insert("engagement_rate".to_string(), serde_json::json!(rate));
        self.extra_metrics
            .insert("avg_likes".to_string(), serde_json::json!(avg_likes));
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// A normalized content unit: post, video, product, review or job listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemRecord {
    /// Absent for sources that do not date their items (e.g. shop listings).
    pub timestamp: Option<DateTime<Utc>>,
    pub caption: String,
    pub engagement_counts: BTreeMap<String, i64>,
    pub url: String,
    pub extra_fields: BTreeMap<String, serde_json::Value>,
}

impl ItemRecord {
    pub fn new(caption: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            caption: caption.into(),
            engagement_counts: BTreeMap::new(),
            url: url.into(),
            extra_fields: BTreeMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_count(mut self, key: &str, value: i64) -> Self {
        self.engagement_counts.insert(key.to_string(), value);
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.extra_fields.insert(key.to_string(), value);
        }
        self
    }

    /// Engagement count for `key`, 0 when the source does not report it.
    pub fn count(&self, key: &str) -> i64 {
        self.engagement_counts.get(key).copied().unwrap_or(0)
    }
}

/// What an extractor hands back on success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedData {
    pub profile: ProfileRecord,
    pub items: Vec<ItemRecord>,
}

/// Terminal outcome of one extraction job.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ExtractionResult {
    Success {
        job_id: Uuid,
        target: Target,
        profile: ProfileRecord,
        items: Vec<ItemRecord>,
        attempts: u32,
        finished_at: DateTime<Utc>,
    },
    Failure {
        job_id: Uuid,
        target: Target,
        kind: ErrorKind,
        message: String,
        attempts: u32,
        finished_at: DateTime<Utc>,
    },
}

impl ExtractionResult {
    pub fn success(job_id: Uuid, target: Target, data: ExtractedData, attempts: u32) -> Self {
        ExtractionResult::Success {
            job_id,
            target,
            profile: data.profile,
            items: data.items,
            attempts,
            finished_at: Utc::now(),
        }
    }

    pub fn failure(job_id: Uuid, target: Target, error: &AppError, attempts: u32) -> Self {
        ExtractionResult::Failure {
            job_id,
            target,
            kind: error.kind(),
            message: error.to_string(),
            attempts,
            finished_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            ExtractionResult::Success { job_id, .. } | ExtractionResult::Failure { job_id, .. } => {
                *job_id
            }
        }
    }

    pub fn target(&self) -> &Target {
        match self {
            ExtractionResult::Success { target, .. } | ExtractionResult::Failure { target, .. } => {
                target
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ExtractionResult::Success { attempts, .. }
            | ExtractionResult::Failure { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExtractionResult::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_roundtrip() {
        for source in Source::ALL {
            let parsed: Source = source.as_str().parse().unwrap();
            assert_eq!(parsed, source);
        }
    }

    #[test]
    fn test_source_parse_is_lenient() {
        assert_eq!("PlayStore".parse::<Source>().unwrap(), Source::PlayStore);
        assert_eq!("google_news".parse::<Source>().unwrap(), Source::GoogleNews);
        assert_eq!("TikTok".parse::<Source>().unwrap(), Source::TikTok);
        assert!("myspace".parse::<Source>().is_err());
    }

    #[test]
    fn test_source_serde_matches_display() {
        for source in Source::ALL {
            let json = serde_json::to_string(&source).unwrap();
            assert_eq!(json, format!("\"{source}\""));
        }
    }

    #[test]
    fn test_target_trims_and_rejects_empty() {
        let t = Target::new(Source::Instagram, "  nasa \n").unwrap();
        assert_eq!(t.id(), "nasa");
        assert_eq!(t.to_string(), "instagram:nasa");

        let err = Target::new(Source::Instagram, "   ").unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn test_engagement_rate() {
        let mut profile = ProfileRecord::new("shop").with_counts(1000, 10);
        let items = vec![
            ItemRecord::new("a", "u1")
                .with_count("likes", 40)
                .with_count("comments", 10),
            ItemRecord::new("b", "u2").with_count("likes", 20),
        ];
        profile.apply_engagement(&items);

        // (70 / 2) / 1000 * 100 = 3.5
        assert_eq!(profile.extra_metrics["engagement_rate"], serde_json::json!(3.5));
        assert_eq!(profile.extra_metrics["avg_likes"], serde_json::json!(30.0));
    }

    #[test]
    fn test_engagement_rate_without_followers_is_zero() {
        let mut profile = ProfileRecord::new("nobody");
        profile.apply_engagement(&[ItemRecord::new("a", "u").with_count("likes", 5)]);
        assert_eq!(profile.extra_metrics["engagement_rate"], serde_json::json!(0.0));
    }

    #[test]
    fn test_metric_skips_null() {
        let profile = ProfileRecord::new("x")
            .with_metric("bio", serde_json::Value::Null)
            .with_metric("verified", true);
        assert!(!profile.extra_metrics.contains_key("bio"));
        assert_eq!(profile.extra_metrics["verified"], serde_json::json!(true));
    }

    #[test]
    fn test_failure_result_carries_kind() {
        let target = Target::new(Source::Shopee, "123").unwrap();
        let result = ExtractionResult::failure(
            Uuid::new_v4(),
            target.clone(),
            &AppError::NotFound("shop 123".into()),
            1,
        );
        assert!(!result.is_success());
        assert_eq!(result.target(), &target);
        match result {
            ExtractionResult::Failure { kind, .. } => assert_eq!(kind, ErrorKind::Permanent),
            _ => panic!("expected failure"),
        }
    }
}
