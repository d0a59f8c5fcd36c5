//! Shopee shops and their best-selling products.
//!
//! A target can be a numeric shop id, a `shop/<id>` URL, a
//! `product/<shop>/<item>` URL, or a shop username, which costs one extra
//! lookup to resolve. Products carry no dates, so `since` never filters
//! them out.

use chrono::{DateTime, Utc};
use serde_json::Value;
use trawl_core::error::AppError;
use trawl_core::models::{ExtractedData, ItemRecord, ProfileRecord, Source, Target};
use trawl_core::traits::Extractor;
use trawl_core::window::{ItemOrder, ItemWindow};
use url::Url;

use crate::http::HttpClient;
use crate::json;

const DEFAULT_BASE_URL: &str = "https://shopee.co.id";
const IMAGE_CDN: &str = "https://down-id.img.susercontent.com/file";
/// Shopee prices are integers scaled by 100 000.
const PRICE_SCALE: f64 = 100_000.0;

/// How a target names its shop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShopRef {
    Id(String),
    Username(String),
}

impl ShopRef {
    pub fn parse(input: &str) -> Result<Self, AppError> {
        let input = input.trim();
        if let Some(id) = digits_after(input, "product/").or_else(|| digits_after(input, "shop/")) {
            return Ok(ShopRef::Id(id.to_string()));
        }
        if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(ShopRef::Id(input.to_string()));
        }

        let path = input.split('?').next().unwrap_or_default().trim_end_matches('/');
        let username = path.rsplit('/').next().unwrap_or_default();
        if username.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "'{input}' does not name a Shopee shop"
            )));
        }
        Ok(ShopRef::Username(username.to_string()))
    }
}

/// The run of digits right after `marker`, if any.
fn digits_after<'a>(input: &'a str, marker: &str) -> Option<&'a str> {
    let start = input.find(marker)? + marker.len();
    let rest = &input[start..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

#[derive(Clone)]
pub struct ShopeeExtractor {
    http: HttpClient,
    base_url: String,
}

impl ShopeeExtractor {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Regional storefront, e.g. `https://shopee.sg`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, AppError> {
        Url::parse_with_params(&format!("{}{path}", self.base_url), params)
            .map_err(|e| AppError::ConfigError(format!("Bad Shopee base URL: {e}")))
    }

    async fn get(&self, url: &Url) -> Result<Value, AppError> {
        let referer = format!("{}/", self.base_url);
        self.http
            .get_json(Source::Shopee, url, &[("Referer", referer.as_str())])
            .await
    }

    async fn resolve_shop_id(&self, shop: ShopRef) -> Result<String, AppError> {
        match shop {
            ShopRef::Id(id) => Ok(id),
            ShopRef::Username(username) => {
                let url = self.endpoint(
                    "/api/v4/shop/get_shop_detail",
                    &[("username", username.as_str())],
                )?;
                let body = self.get(&url).await?;
                json::text(&body, "/data/shopid").ok_or_else(|| {
                    AppError::NotFound(format!("No Shopee shop named '{username}'"))
                })
            }
        }
    }
}

impl Extractor for ShopeeExtractor {
    fn item_order(&self) -> ItemOrder {
        ItemOrder::Unordered
    }

    async fn fetch(
        &self,
        target: &Target,
        max_items: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<ExtractedData, AppError> {
        let shop_id = self.resolve_shop_id(ShopRef::parse(target.id())?).await?;

        let detail_url =
            self.endpoint("/api/v4/shop/get_shop_detail", &[("shopid", shop_id.as_str())])?;
        let detail = self.get(&detail_url).await?;
        let mut profile = parse_shop(&detail, &shop_id)?;

        let limit = max_items.to_string();
        let items_url = self.endpoint(
            "/api/v4/guide/get_search_items",
            &[
                ("limit", limit.as_str()),
                ("offset", "0"),
                ("order_by", "sales"),
                ("shopid", shop_id.as_str()),
            ],
        )?;
        let listing = self.get(&items_url).await?;
        let mut products = search_products(&listing);

        let recommended;
        if products.is_empty() {
            tracing::debug!(%shop_id, "Search listing empty, falling back to shop recommendations");
            let recommend_url = self.endpoint(
                "/api/v4/recommend/recommend",
                &[
                    ("bundle", "shop_page_product_tab_main"),
                    ("limit", limit.as_str()),
                    ("shopid", shop_id.as_str()),
                ],
            )?;
            recommended = self.get(&recommend_url).await?;
            products = recommended_products(&recommended);
        }
        let items = parse_items(products, &self.base_url, &shop_id, max_items, since);

        profile.apply_engagement(&items);
        Ok(ExtractedData { profile, items })
    }
}

fn parse_shop(body: &Value, shop_id: &str) -> Result<ProfileRecord, AppError> {
    let shop = match body.get("data") {
        Some(data) if data.is_object() => data,
        _ => {
            // Shopee answers 200 with an error code when it wants a captcha.
            let code = json::count(body, "/error");
            return Err(if code != 0 {
                AppError::Blocked(format!("Shopee refused shop {shop_id} (error {code})"))
            } else {
                AppError::NotFound(format!("Shopee shop {shop_id} does not exist"))
            });
        }
    };

    let rating = shop
        .get("rating_star")
        .and_then(Value::as_f64)
        .map(|r| (r * 100.0).round() / 100.0);
    let portrait = json::text(shop, "/portrait").map(|p| format!("{IMAGE_CDN}/{p}"));

    let mut profile = ProfileRecord::new(
        json::text(shop, "/account/username").unwrap_or_else(|| shop_id.to_string()),
    )
    .with_counts(json::count(shop, "/follower_count"), 0)
    .with_metric("shop_id", shop_id)
    .with_metric("rating", rating)
    .with_metric("is_verified", json::flag(shop, "/is_shopee_verified"))
    .with_metric("bio", json::text(shop, "/description"))
    .with_metric("profile_pic", portrait);
    if let Some(name) = json::text(shop, "/name") {
        profile = profile.with_display_name(name);
    }
    Ok(profile)
}

/// Products of a `get_search_items` response.
fn search_products(body: &Value) -> &[Value] {
    body.pointer("/data/items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Products of the first section of a `recommend` response.
fn recommended_products(body: &Value) -> &[Value] {
    body.pointer("/data/sections/0/data/item")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn parse_items(
    products: &[Value],
    base_url: &str,
    shop_id: &str,
    max_items: usize,
    since: Option<DateTime<Utc>>,
) -> Vec<ItemRecord> {
    let mut window = ItemWindow::new(max_items, since, ItemOrder::Unordered);
    window.extend(products.iter().map(|item| {
        // Search results wrap the product in `item_basic`.
        let basic = item.get("item_basic").unwrap_or(item);
        parse_product(basic, base_url, shop_id)
    }));
    window.into_items()
}

fn parse_product(basic: &Value, base_url: &str, shop_id: &str) -> ItemRecord {
    let item_id = json::text(basic, "/itemid").unwrap_or_default();
    let price = basic
        .get("price")
        .and_then(Value::as_f64)
        .map_or(0.0, |p| p / PRICE_SCALE);

    ItemRecord::new(
        json::text(basic, "/name").unwrap_or_default(),
        format!("{base_url}/product/{shop_id}/{item_id}"),
    )
    .with_count("likes", json::int(basic, "/liked_count"))
    .with_count("sold", json::int(basic, "/historical_sold"))
    .with_field("price", price)
    .with_field("stock", json::count(basic, "/stock"))
}
