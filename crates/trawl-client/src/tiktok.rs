//! TikTok profiles from the rehydration JSON embedded in the profile page.
//!
//! The page carries the user and their stats; it only sometimes embeds an
//! `itemList`. When it does not, the videos come from the web app's
//! post-list endpoint keyed by the user's `secUid`. Neither list is
//! reliably ordered, so items are filtered client-side instead of stopping
//! at the first old one.

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde_json::Value;
use trawl_core::error::AppError;
use trawl_core::models::{ExtractedData, ItemRecord, ProfileRecord, Source, Target};
use trawl_core::traits::Extractor;
use trawl_core::window::{ItemOrder, ItemWindow};
use url::Url;

use crate::http::{HttpClient, parse_json};
use crate::json;

const STATE_SCRIPT: &str = "script#__UNIVERSAL_DATA_FOR_REHYDRATION__";
const USER_DETAIL: &str = "/__DEFAULT_SCOPE__/webapp.user-detail";
const VIDEO_LIST_ENDPOINT: &str = "https://www.tiktok.com/api/post/item_list/";
const ACCEPT_LANGUAGE: (&str, &str) = ("Accept-Language", "en-US,en;q=0.9");

#[derive(Clone)]
pub struct TikTokExtractor {
    http: HttpClient,
}

impl TikTokExtractor {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    async fn fetch_video_list(&self, sec_uid: &str, max_items: usize) -> Result<Value, AppError> {
        let url = video_list_url(sec_uid, max_items)?;
        self.http.get_json(Source::TikTok, &url, &[ACCEPT_LANGUAGE]).await
    }
}

impl Extractor for TikTokExtractor {
    fn item_order(&self) -> ItemOrder {
        ItemOrder::Unordered
    }

    async fn fetch(
        &self,
        target: &Target,
        max_items: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<ExtractedData, AppError> {
        let username = target.id().trim().trim_start_matches('@').to_string();
        let url = Url::parse(&format!("https://www.tiktok.com/@{username}"))
            .map_err(|e| AppError::InvalidInput(format!("Bad TikTok username '{username}': {e}")))?;

        let html = self
            .http
            .get_text(Source::TikTok, &url, &[ACCEPT_LANGUAGE])
            .await?;
        let state = extract_state(&html)?;
        let mut data = parse_state(&state, &username, max_items, since)?;

        let Some(sec_uid) = missing_video_list(&state) else {
            return Ok(data);
        };
        // The profile is already good; a failed list only costs the items.
        match self.fetch_video_list(&sec_uid, max_items).await {
            Ok(body) => {
                data.items = video_list(&body, &data.profile.username, max_items, since);
                data.profile.apply_engagement(&data.items);
            }
            Err(e) => tracing::warn!(%username, error = %e, "TikTok video list unavailable"),
        }
        Ok(data)
    }
}

/// The user's `secUid` when the page carries no embedded video list.
fn missing_video_list(state: &Value) -> Option<String> {
    let detail = state.pointer(USER_DETAIL)?;
    if detail.get("itemList").is_some_and(Value::is_array) {
        return None;
    }
    json::text(detail, "/userInfo/user/secUid")
}

fn video_list_url(sec_uid: &str, max_items: usize) -> Result<Url, AppError> {
    let count = max_items.max(1).to_string();
    Url::parse_with_params(
        VIDEO_LIST_ENDPOINT,
        &[
            ("aid", "1988"),
            ("count", count.as_str()),
            ("cursor", "0"),
            ("secUid", sec_uid),
        ],
    )
    .map_err(|e| AppError::InvalidInput(format!("Bad TikTok secUid '{sec_uid}': {e}")))
}

/// Videos of a post-list response.
fn video_list(
    body: &Value,
    username: &str,
    max_items: usize,
    since: Option<DateTime<Utc>>,
) -> Vec<ItemRecord> {
    let list = body
        .pointer("/itemList")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    videos(list, username, max_items, since)
}

fn videos(
    list: &[Value],
    username: &str,
    max_items: usize,
    since: Option<DateTime<Utc>>,
) -> Vec<ItemRecord> {
    let mut window = ItemWindow::new(max_items, since, ItemOrder::Unordered);
    window.extend(list.iter().map(|item| parse_video(item, username)));
    window.into_items()
}

/// Pulls the rehydration JSON out of the profile page.
fn extract_state(html: &str) -> Result<Value, AppError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(STATE_SCRIPT)
        .map_err(|e| AppError::ParseError(format!("Invalid selector: {e:?}")))?;
    let script = document
        .select(&selector)
        .next()
        .ok_or_else(|| AppError::ParseError("TikTok page has no rehydration data".into()))?;
    parse_json(&script.text().collect::<String>())
}

fn parse_state(
    state: &Value,
    username: &str,
    max_items: usize,
    since: Option<DateTime<Utc>>,
) -> Result<ExtractedData, AppError> {
    let detail = state
        .pointer(USER_DETAIL)
        .ok_or_else(|| AppError::ParseError("TikTok page has no user-detail scope".into()))?;

    let user = match detail.pointer("/userInfo/user") {
        Some(user) if user.is_object() => user,
        _ => {
            return Err(AppError::NotFound(format!(
                "TikTok user @{username} does not exist"
            )));
        }
    };
    let stats = detail.pointer("/userInfo/stats").unwrap_or(&Value::Null);

    let mut profile = ProfileRecord::new(json::text(user, "/uniqueId").unwrap_or_else(|| username.to_string()))
        .with_counts(
            json::count(stats, "/followerCount"),
            json::count(stats, "/followingCount"),
        )
        .with_metric("user_id", json::raw(user, "/id"))
        .with_metric("bio", json::text(user, "/signature"))
        .with_metric("profile_pic", json::raw(user, "/avatarLarger"))
        .with_metric("total_likes", json::count(stats, "/heartCount"))
        .with_metric("total_videos", json::count(stats, "/videoCount"))
        .with_metric("is_verified", json::flag(user, "/verified"));
    if let Some(name) = json::text(user, "/nickname") {
        profile = profile.with_display_name(name);
    }

    let list = detail
        .pointer("/itemList")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let items = videos(list, &profile.username, max_items, since);
    profile.apply_engagement(&items);
    Ok(ExtractedData { profile, items })
}

fn parse_video(item: &Value, username: &str) -> ItemRecord {
    let id = json::text(item, "/id").unwrap_or_default();
    ItemRecord::new(
        json::text(item, "/desc").unwrap_or_default(),
        format!("https://www.tiktok.com/@{username}/video/{id}"),
    )
    .with_timestamp(json::unix_time(item, "/createTime"))
    .with_count("likes", json::int(item, "/stats/diggCount"))
    .with_count("comments", json::int(item, "/stats/commentCount"))
    .with_count("views", json::int(item, "/stats/playCount"))
    .with_count("shares", json::int(item, "/stats/shareCount"))
}
