//! Instagram profiles through the public `web_profile_info` endpoint.
//!
//! The endpoint returns the profile and its latest timeline posts,
//! newest first, in one response.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use trawl_core::error::AppError;
use trawl_core::models::{ExtractedData, ItemRecord, ProfileRecord, Source, Target};
use trawl_core::traits::Extractor;
use trawl_core::window::{ItemOrder, ItemWindow};
use url::Url;

use crate::http::HttpClient;
use crate::json;

const PROFILE_ENDPOINT: &str = "https://www.instagram.com/api/v1/users/web_profile_info/";
const WEB_APP_ID: &str = "936619743392459";

#[derive(Clone)]
pub struct InstagramExtractor {
    http: HttpClient,
}

impl InstagramExtractor {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

impl Extractor for InstagramExtractor {
    async fn fetch(
        &self,
        target: &Target,
        max_items: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<ExtractedData, AppError> {
        let username = normalize_username(target.id());
        if username.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "'{}' is not an Instagram username",
                target.id()
            )));
        }

        let url = Url::parse_with_params(PROFILE_ENDPOINT, &[("username", username.as_str())])
            .map_err(|e| AppError::InvalidInput(format!("Bad username '{username}': {e}")))?;
        let referer = format!("https://www.instagram.com/{username}/");
        let headers = [
            ("X-IG-App-ID", WEB_APP_ID),
            ("X-ASBD-ID", "129477"),
            ("X-Requested-With", "XMLHttpRequest"),
            ("Referer", referer.as_str()),
        ];

        let body = self.http.get_json(Source::Instagram, &url, &headers).await?;
        parse_profile(&body, max_items, since)
    }
}

/// Accepts `user`, `@user` and profile URLs.
pub fn normalize_username(raw: &str) -> String {
    let raw = raw.trim();
    let raw = raw
        .split_once("instagram.com/")
        .map_or(raw, |(_, rest)| rest);
    raw.split(['/', '?'])
        .next()
        .unwrap_or_default()
        .trim_start_matches('@')
        .to_string()
}

fn parse_profile(
    body: &Value,
    max_items: usize,
    since: Option<DateTime<Utc>>,
) -> Result<ExtractedData, AppError> {
    let user = match body.pointer("/data/user") {
        Some(user) if user.is_object() => user,
        _ => {
            return Err(AppError::Blocked(
                "Instagram returned no user data: empty or private account".into(),
            ));
        }
    };

    let username = json::text(user, "/username")
        .ok_or_else(|| AppError::ParseError("Instagram user has no username".into()))?;

    let mut profile = ProfileRecord::new(&username)
        .with_counts(
            json::count(user, "/edge_followed_by/count"),
            json::count(user, "/edge_follow/count"),
        )
        .with_metric("user_id", json::raw(user, "/id"))
        .with_metric("bio", json::raw(user, "/biography"))
        .with_metric("profile_pic", json::raw(user, "/profile_pic_url"))
        .with_metric("is_business", json::flag(user, "/is_business_account"))
        .with_metric("business_category", json::raw(user, "/business_category_name"))
        .with_metric("external_url", json::raw(user, "/external_url"))
        .with_metric("is_verified", json::flag(user, "/is_verified"))
        .with_metric(
            "total_posts",
            json::count(user, "/edge_owner_to_timeline_media/count"),
        );
    if let Some(name) = json::text(user, "/full_name") {
        profile = profile.with_display_name(name);
    }

    let mut window = ItemWindow::new(max_items, since, ItemOrder::NewestFirst);
    let edges = user
        .pointer("/edge_owner_to_timeline_media/edges")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    window.extend(edges.iter().filter_map(|edge| edge.get("node")).map(parse_post));

    let items = window.into_items();
    profile.apply_engagement(&items);
    Ok(ExtractedData { profile, items })
}

fn parse_post(node: &Value) -> ItemRecord {
    let caption = json::text(node, "/edge_media_to_caption/edges/0/node/text").unwrap_or_default();
    let shortcode = json::text(node, "/shortcode").unwrap_or_default();
    let is_video = json::flag(node, "/is_video");

    let tagged: Vec<String> = node
        .pointer("/edge_media_to_tagged_user/edges")
        .and_then(Value::as_array)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|e| json::text(e, "/node/user/username"))
                .collect()
        })
        .unwrap_or_default();

    let mut item = ItemRecord::new(
        caption.clone(),
        format!("https://www.instagram.com/p/{shortcode}/"),
    )
    .with_timestamp(json::unix_time(node, "/taken_at_timestamp"))
    .with_count("likes", json::int(node, "/edge_media_preview_like/count"))
    .with_count("comments", json::int(node, "/edge_media_to_comment/count"))
    .with_field("hashtags", words_with_prefix(&caption, '#'))
    .with_field("mentions", words_with_prefix(&caption, '@'))
    .with_field("is_video", is_video)
    .with_field("typename", json::raw(node, "/__typename"))
    .with_field("location", json::raw(node, "/location/name"))
    .with_field("tagged_users", tagged);
    if is_video {
        item = item.with_count("views", json::int(node, "/video_view_count"));
    }
    item
}

/// Distinct words starting with `prefix`, without the prefix, sorted.
fn words_with_prefix(caption: &str, prefix: char) -> Vec<String> {
    caption
        .split_whitespace()
        .filter_map(|word| word.strip_prefix(prefix))
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
