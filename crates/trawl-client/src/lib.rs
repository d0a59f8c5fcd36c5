pub mod google_news;
pub mod http;
pub mod instagram;
mod json;
pub mod linkedin;
pub mod shopee;
pub mod tiktok;

pub use google_news::GoogleNewsExtractor;
pub use http::HttpClient;
pub use instagram::InstagramExtractor;
pub use linkedin::LinkedInExtractor;
pub use shopee::ShopeeExtractor;
pub use tiktok::TikTokExtractor;

use trawl_core::config::EngineConfig;
use trawl_core::error::AppError;
use trawl_core::models::Source;
use trawl_core::rate_limit::RateLimiter;
use trawl_core::traits::ExtractorRegistry;

/// Registry with every built-in platform extractor sharing one HTTP client,
/// paced by the default engine limits.
pub fn default_registry() -> Result<ExtractorRegistry, AppError> {
    Ok(registry_with(
        HttpClient::new()?,
        EngineConfig::default().rate_limiter(),
    ))
}

/// Extractors that make follow-up calls inside one fetch pace them through
/// `limiter`; pass the limiter the run controller uses.
pub fn registry_with(http: HttpClient, limiter: RateLimiter) -> ExtractorRegistry {
    ExtractorRegistry::new()
        .with(Source::Instagram, InstagramExtractor::new(http.clone()))
        .with(Source::TikTok, TikTokExtractor::new(http.clone()))
        .with(Source::Shopee, ShopeeExtractor::new(http.clone()))
        .with(Source::GoogleNews, GoogleNewsExtractor::news(http.clone()))
        .with(Source::GoogleJobs, GoogleNewsExtractor::jobs(http.clone()))
        .with(Source::LinkedIn, LinkedInExtractor::new(http, limiter))
}
