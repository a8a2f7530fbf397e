//! MongoScope Library
//!
//! Core modules for the MongoScope query profiling service.

use std::sync::Arc;

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use services::{
    CommandMonitor, MongoExplainClient, PersistentQueryProfilerService, ProfilerError,
    ProfilerSettings, QueryProfilerService,
};
pub use utils::{ApiError, ApiResult, RateLimiter};

/// Application shared state
///
/// All services are wrapped in Arc for cheap cloning and thread safety.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub profiler: Arc<QueryProfilerService>,
    pub persistent: Option<Arc<PersistentQueryProfilerService>>,
    pub rate_limiter: Arc<RateLimiter>,
}
