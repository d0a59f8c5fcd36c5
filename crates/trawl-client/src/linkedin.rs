//! LinkedIn job postings from the guest job-search fragment.
//!
//! The target is a search keyword. Results are requested sorted by date,
//! newest first, so a `since` cutoff ends collection at the first older
//! posting.
//!
//! Each kept card is then opened for its full description and criteria.
//! Those page loads go through the shared rate limiter and a time budget;
//! cards that were not reached keep their search fields only.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use trawl_core::error::AppError;
use trawl_core::models::{ExtractedData, ItemRecord, ProfileRecord, Source, Target};
use trawl_core::rate_limit::RateLimiter;
use trawl_core::traits::Extractor;
use trawl_core::window::{ItemOrder, ItemWindow};
use url::Url;

use crate::http::HttpClient;

const SEARCH_ENDPOINT: &str =
    "https://www.linkedin.com/jobs-guest/jobs/api/seeMoreJobPostings/search";
const ACCEPT_LANGUAGE: (&str, &str) = ("Accept-Language", "en-US,en;q=0.9");
const DEFAULT_DETAIL_BUDGET: Duration = Duration::from_secs(10);

/// Job criteria headings and the item fields they fill.
const CRITERIA: [(&str, &str); 4] = [
    ("Seniority level", "seniority_level"),
    ("Employment type", "employment_type"),
    ("Job function", "job_function"),
    ("Industries", "industries"),
];

#[derive(Clone)]
pub struct LinkedInExtractor {
    http: HttpClient,
    limiter: RateLimiter,
    location: String,
    detail_budget: Duration,
}

impl LinkedInExtractor {
    /// `limiter` paces the per-posting page loads; pass the one the run
    /// controller uses so they count against the same LinkedIn bucket.
    pub fn new(http: HttpClient, limiter: RateLimiter) -> Self {
        Self {
            http,
            limiter,
            location: "Worldwide".to_string(),
            detail_budget: DEFAULT_DETAIL_BUDGET,
        }
    }

    /// Restricts the search to a country or city, e.g. `"Indonesia"`.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Time allowed for opening postings after the search. Zero skips them.
    pub fn with_detail_budget(mut self, budget: Duration) -> Self {
        self.detail_budget = budget;
        self
    }

    /// Fills in posting details for as many `items` as the budget allows.
    async fn add_details(&self, items: &mut [ItemRecord]) {
        if self.detail_budget.is_zero() {
            return;
        }

        let pass = async {
            let mut opened = 0usize;
            for item in items.iter_mut() {
                match self.fetch_detail(&item.url).await {
                    Ok(fields) => {
                        item.extra_fields.extend(
                            fields.into_iter().map(|(k, v)| (k.to_string(), v.into())),
                        );
                        opened += 1;
                    }
                    // A removed posting only costs its own details.
                    Err(AppError::NotFound(_) | AppError::InvalidInput(_)) => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, %opened, "Stopping LinkedIn detail pass");
                        break;
                    }
                }
            }
            opened
        };

        match tokio::time::timeout(self.detail_budget, pass).await {
            Ok(opened) => tracing::debug!(%opened, total = items.len(), "LinkedIn details added"),
            Err(_) => tracing::debug!(
                budget_ms = %self.detail_budget.as_millis(),
                "LinkedIn detail pass ran out of time"
            ),
        }
    }

    async fn fetch_detail(&self, link: &str) -> Result<Vec<(&'static str, String)>, AppError> {
        let url = Url::parse(link)
            .map_err(|e| AppError::InvalidInput(format!("Bad job link '{link}': {e}")))?;
        self.limiter.acquire(Source::LinkedIn).await?;
        let html = self
            .http
            .get_text(Source::LinkedIn, &url, &[ACCEPT_LANGUAGE])
            .await?;
        parse_detail(&html)
    }
}

impl Extractor for LinkedInExtractor {
    async fn fetch(
        &self,
        target: &Target,
        max_items: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<ExtractedData, AppError> {
        let keyword = target.id().trim();
        let url = Url::parse_with_params(
            SEARCH_ENDPOINT,
            &[
                ("keywords", keyword),
                ("location", self.location.as_str()),
                ("sortBy", "DD"),
                ("start", "0"),
            ],
        )
        .map_err(|e| AppError::InvalidInput(format!("Bad search keyword '{keyword}': {e}")))?;

        let html = self
            .http
            .get_text(Source::LinkedIn, &url, &[ACCEPT_LANGUAGE])
            .await?;
        let mut data = parse_search(&html, keyword, &self.location, max_items, since)?;
        self.add_details(&mut data.items).await;
        Ok(data)
    }
}

fn selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css).map_err(|e| AppError::ParseError(format!("Invalid selector {css}: {e:?}")))
}

struct CardSelectors {
    card: Selector,
    title: Selector,
    company: Selector,
    location: Selector,
    link: Selector,
    posted: Selector,
}

impl CardSelectors {
    fn new() -> Result<Self, AppError> {
        Ok(Self {
            card: selector("li")?,
            title: selector("h3.base-search-card__title")?,
            company: selector("h4.base-search-card__subtitle")?,
            location: selector("span.job-search-card__location")?,
            link: selector("a.base-card__full-link")?,
            posted: selector("time")?,
        })
    }
}

fn parse_search(
    html: &str,
    keyword: &str,
    location: &str,
    max_items: usize,
    since: Option<DateTime<Utc>>,
) -> Result<ExtractedData, AppError> {
    let selectors = CardSelectors::new()?;
    let document = Html::parse_fragment(html);

    let mut window = ItemWindow::new(max_items, since, ItemOrder::NewestFirst);
    let mut skipped = 0usize;
    for card in document.select(&selectors.card) {
        match parse_card(card, &selectors) {
            Some(item) => {
                if !window.offer(item) {
                    break;
                }
            }
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::debug!(%keyword, %skipped, "Skipped incomplete job cards");
    }

    let items = window.into_items();
    let profile = ProfileRecord::new(keyword)
        .with_metric("category", "jobs")
        .with_metric("location", location)
        .with_metric("results", items.len());
    Ok(ExtractedData { profile, items })
}

fn parse_card(card: ElementRef<'_>, selectors: &CardSelectors) -> Option<ItemRecord> {
    let text_of = |selector: &Selector| {
        card.select(selector)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|text| !text.is_empty())
    };

    let title = text_of(&selectors.title)?;
    let link = card
        .select(&selectors.link)
        .next()
        .and_then(|a| a.value().attr("href"))?;
    let link = link.split('?').next().unwrap_or(link).to_string();
    let company = text_of(&selectors.company).unwrap_or_default();
    let location = text_of(&selectors.location).unwrap_or_default();

    let posted = card
        .select(&selectors.posted)
        .next()
        .and_then(|t| t.value().attr("datetime"))
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc());

    Some(
        ItemRecord::new(format!("[{company}] {title} in {location}"), link)
            .with_timestamp(posted)
            .with_field("title", title)
            .with_field("company", company)
            .with_field("location", location),
    )
}

/// Detail fields found on a posting page. Missing parts are left out.
fn parse_detail(html: &str) -> Result<Vec<(&'static str, String)>, AppError> {
    let document = Html::parse_document(html);
    let first_text = |css: &str| -> Result<Option<String>, AppError> {
        Ok(document
            .select(&selector(css)?)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|text| !text.is_empty()))
    };

    let mut fields = Vec::new();

    let description = document.select(&selector("div.description__text")?).next().map(|div| {
        div.text()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    });
    if let Some(description) = description.filter(|d| !d.is_empty()) {
        fields.push(("description", description));
    }

    let heading = selector("h3")?;
    let value = selector("span")?;
    for criterion in document.select(&selector("li.description__job-criteria-item")?) {
        let text_of = |sel: &Selector| {
            criterion
                .select(sel)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
        };
        let (Some(name), Some(text)) = (text_of(&heading), text_of(&value)) else {
            continue;
        };
        if let Some((_, field)) = CRITERIA.iter().find(|(label, _)| *label == name) {
            fields.push((*field, text));
        }
    }

    if let Some(applicants) = first_text(".num-applicants__caption")? {
        fields.push(("applicants_count", applicants));
    }
    let company_link = document
        .select(&selector("a.topcard__org-name-link")?)
        .next()
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| href.split('?').next())
        .filter(|href| !href.is_empty());
    if let Some(link) = company_link {
        fields.push(("company_link", link.to_string()));
    }
    Ok(fields)
}
