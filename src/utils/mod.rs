//! Shared utilities

pub mod bson_ext;
pub mod error;
pub mod metrics_sink;
pub mod rate_limiter;

pub use error::{ApiError, ApiResult};
pub use rate_limiter::RateLimiter;
