use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::AppError;
use crate::models::{ExtractedData, Source, Target};
use crate::window::ItemOrder;

/// Pulls a profile and its items from one source.
///
/// Implementations must not retry internally: the scheduler owns retries
/// and classifies failures through [`AppError::kind`]. `max_items` is an
/// upper bound, not a promise.
pub trait Extractor: Send + Sync {
    /// Order in which the source lists items; decides whether a `since`
    /// cutoff may stop collection early.
    fn item_order(&self) -> ItemOrder {
        ItemOrder::NewestFirst
    }

    fn fetch(
        &self,
        target: &Target,
        max_items: usize,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<ExtractedData, AppError>> + Send;
}

/// Object-safe view of an [`Extractor`], so extractors of different
/// types can share one registry.
pub trait DynExtractor: Send + Sync {
    fn item_order(&self) -> ItemOrder;

    fn fetch_boxed<'a>(
        &'a self,
        target: &'a Target,
        max_items: usize,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<ExtractedData, AppError>>;
}

impl<E: Extractor> DynExtractor for E {
    fn item_order(&self) -> ItemOrder {
        Extractor::item_order(self)
    }

    fn fetch_boxed<'a>(
        &'a self,
        target: &'a Target,
        max_items: usize,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<ExtractedData, AppError>> {
        Box::pin(self.fetch(target, max_items, since))
    }
}

/// Maps each source to the extractor that serves it.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<Source, Arc<dyn DynExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `extractor` for `source`, replacing any previous one.
    pub fn register<E>(&mut self, source: Source, extractor: E) -> &mut Self
    where
        E: Extractor + 'static,
    {
        self.extractors.insert(source, Arc::new(extractor));
        self
    }

    pub fn with<E>(mut self, source: Source, extractor: E) -> Self
    where
        E: Extractor + 'static,
    {
        self.register(source, extractor);
        self
    }

    pub fn get(&self, source: Source) -> Option<Arc<dyn DynExtractor>> {
        self.extractors.get(&source).cloned()
    }

    pub fn contains(&self, source: Source) -> bool {
        self.extractors.contains_key(&source)
    }

    /// Registered sources, in declaration order.
    pub fn sources(&self) -> Vec<Source> {
        let mut sources: Vec<_> = self.extractors.keys().copied().collect();
        sources.sort();
        sources
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractorRegistry")
            .field("sources", &self.sources())
            .finish()
    }
}
