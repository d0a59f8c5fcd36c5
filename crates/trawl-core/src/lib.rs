pub mod aggregator;
pub mod config;
pub mod controller;
pub mod error;
pub mod job;
pub mod models;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod testutil;
pub mod traits;
pub mod window;

pub use aggregator::{Progress, RunState};
pub use config::EngineConfig;
pub use controller::{RunController, RunHandle};
pub use error::{AppError, ErrorKind};
pub use job::{RunOptions, RunStatus};
pub use models::{
    ExtractedData, ExtractionResult, ItemRecord, ProfileRecord, Source, Target,
};
pub use rate_limit::{RateLimit, RateLimiter};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{TracingWorkerReporter, WorkerEvent, WorkerReporter};
pub use traits::{DynExtractor, Extractor, ExtractorRegistry};
pub use window::{ItemOrder, ItemWindow};
