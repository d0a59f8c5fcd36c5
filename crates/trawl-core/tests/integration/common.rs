use std::sync::Arc;
use std::time::Duration;

use trawl_core::testutil::{MockExtractor, MockReporter};
use trawl_core::{EngineConfig, ExtractorRegistry, RateLimit, RunController, Source, Target};

/// Config whose buckets never make a test wait.
pub fn fast_config() -> EngineConfig {
    let roomy = RateLimit::new(1_000, Duration::from_millis(1));
    Source::ALL
        .into_iter()
        .fold(EngineConfig::default(), |config, source| {
            config.with_rate_limit(source, roomy)
        })
        .with_default_rate_limit(roomy)
}

/// Controller serving Instagram and Shopee from `extractor`.
pub fn controller_with(extractor: MockExtractor, config: EngineConfig) -> (RunController, MockReporter) {
    let reporter = MockReporter::new();
    let registry = ExtractorRegistry::new()
        .with(Source::Instagram, extractor.clone())
        .with(Source::Shopee, extractor);
    let controller = RunController::with_reporter(config, registry, Arc::new(reporter.clone()))
        .expect("valid test config");
    (controller, reporter)
}

pub fn targets(source: Source, ids: &[&str]) -> Vec<Target> {
    ids.iter()
        .map(|id| Target::new(source, *id).expect("non-empty id"))
        .collect()
}
