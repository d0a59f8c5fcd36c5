//! Google News search feeds, for news coverage and job ads.
//!
//! The target is a keyword. Both sources read the Indonesian edition of the
//! Google News RSS search; the jobs feed narrows the query to job ads from
//! the past week. Feed entries come in relevance order, not by date.

use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use scraper::Html;
use trawl_core::error::AppError;
use trawl_core::models::{ExtractedData, ItemRecord, ProfileRecord, Source, Target};
use trawl_core::traits::Extractor;
use trawl_core::window::{ItemOrder, ItemWindow};
use url::Url;

use crate::http::HttpClient;

const SEARCH_ENDPOINT: &str = "https://news.google.com/rss/search";
const EDITION: [(&str, &str); 3] = [("hl", "id"), ("gl", "ID"), ("ceid", "ID:id")];
const JOBS_SUFFIX: &str = "lowongan kerja";
const JOBS_PERIOD: &str = "when:7d";

/// Which search the extractor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    News,
    Jobs,
}

impl Feed {
    fn source(self) -> Source {
        match self {
            Feed::News => Source::GoogleNews,
            Feed::Jobs => Source::GoogleJobs,
        }
    }

    fn category(self) -> &'static str {
        match self {
            Feed::News => "news",
            Feed::Jobs => "jobs",
        }
    }

    fn query(self, keyword: &str) -> String {
        match self {
            Feed::News => keyword.to_string(),
            Feed::Jobs => format!("{keyword} {JOBS_SUFFIX} {JOBS_PERIOD}"),
        }
    }
}

#[derive(Clone)]
pub struct GoogleNewsExtractor {
    http: HttpClient,
    feed: Feed,
}

impl GoogleNewsExtractor {
    pub fn news(http: HttpClient) -> Self {
        Self {
            http,
            feed: Feed::News,
        }
    }

    pub fn jobs(http: HttpClient) -> Self {
        Self {
            http,
            feed: Feed::Jobs,
        }
    }

    fn search_url(&self, keyword: &str) -> Result<Url, AppError> {
        let query = self.feed.query(keyword);
        let mut params = vec![("q", query.as_str())];
        params.extend(EDITION);
        Url::parse_with_params(SEARCH_ENDPOINT, &params)
            .map_err(|e| AppError::InvalidInput(format!("Bad search keyword '{keyword}': {e}")))
    }
}

impl Extractor for GoogleNewsExtractor {
    fn item_order(&self) -> ItemOrder {
        ItemOrder::Unordered
    }

    async fn fetch(
        &self,
        target: &Target,
        max_items: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<ExtractedData, AppError> {
        let keyword = target.id().trim();
        let url = self.search_url(keyword)?;
        let xml = self
            .http
            .get_text(
                self.feed.source(),
                &url,
                &[("Accept-Language", "id-ID,id;q=0.9")],
            )
            .await?;
        let entries = parse_feed(&xml)?;
        Ok(collect(entries, self.feed, keyword, max_items, since))
    }
}

/// One `<item>` of the feed, fields as raw text.
#[derive(Debug, Default)]
struct FeedEntry {
    title: String,
    link: String,
    published: String,
    description: String,
    publisher: String,
    publisher_url: Option<String>,
}

impl FeedEntry {
    fn push(&mut self, field: &str, text: &str) {
        let slot = match field {
            "title" => &mut self.title,
            "link" => &mut self.link,
            "pubDate" => &mut self.published,
            "description" => &mut self.description,
            "source" => &mut self.publisher,
            _ => return,
        };
        slot.push_str(text);
    }

    fn into_item(self, feed: Feed) -> ItemRecord {
        let description = strip_html(&self.description);
        let publisher = self.publisher.trim().to_string();
        let headline = headline(self.title.trim(), &publisher).to_string();
        let caption = match feed {
            Feed::Jobs if !description.is_empty() => description.clone(),
            _ => headline.clone(),
        };
        let published = DateTime::parse_from_rfc2822(self.published.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc));

        ItemRecord::new(caption, self.link.trim())
            .with_timestamp(published)
            .with_field("title", headline)
            .with_field("publisher", publisher)
            .with_field("publisher_url", self.publisher_url)
            .with_field("description", description)
    }
}

fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, AppError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut entry: Option<FeedEntry> = None;
    let mut field = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "item" {
                    entry = Some(FeedEntry::default());
                } else if name == "source" {
                    if let Some(entry) = entry.as_mut() {
                        entry.publisher_url = e
                            .try_get_attribute("url")
                            .ok()
                            .flatten()
                            .and_then(|attr| attr.unescape_value().ok())
                            .map(|url| url.into_owned());
                    }
                }
                field = name;
            }
            Ok(Event::Text(e)) => {
                if let Some(entry) = entry.as_mut() {
                    let text = e
                        .unescape()
                        .map_err(|err| AppError::ParseError(format!("Bad feed text: {err}")))?;
                    entry.push(&field, &text);
                }
            }
            Ok(Event::CData(e)) => {
                if let Some(entry) = entry.as_mut() {
                    entry.push(&field, &String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"item" {
                    entries.extend(entry.take());
                }
                field.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(AppError::ParseError(format!(
                    "Malformed feed at byte {}: {e}",
                    reader.error_position()
                )));
            }
            _ => {}
        }
    }
    Ok(entries)
}

fn collect(
    entries: Vec<FeedEntry>,
    feed: Feed,
    keyword: &str,
    max_items: usize,
    since: Option<DateTime<Utc>>,
) -> ExtractedData {
    let mut window = ItemWindow::new(max_items, since, ItemOrder::Unordered);
    window.extend(
        entries
            .into_iter()
            .filter(|entry| !entry.link.trim().is_empty())
            .map(|entry| entry.into_item(feed)),
    );

    let items = window.into_items();
    let profile = ProfileRecord::new(keyword)
        .with_metric("category", feed.category())
        .with_metric("query", feed.query(keyword))
        .with_metric("results", items.len());
    ExtractedData { profile, items }
}

/// Feed titles end in `" - Publisher"`.
fn headline<'a>(title: &'a str, publisher: &str) -> &'a str {
    if publisher.is_empty() {
        return title;
    }
    title
        .strip_suffix(publisher)
        .and_then(|rest| rest.strip_suffix(" - "))
        .unwrap_or(title)
}

/// Plain text of an HTML snippet, whitespace collapsed.
fn strip_html(snippet: &str) -> String {
    let fragment = Html::parse_fragment(snippet);
    fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
