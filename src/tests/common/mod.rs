// Common test utilities and helpers

use std::sync::Arc;

use crate::services::{ProfilerSettings, QueryProfilerService};

/// Profiler with no database connection and small, predictable limits.
pub fn create_test_profiler() -> Arc<QueryProfilerService> {
    Arc::new(QueryProfilerService::in_memory(ProfilerSettings {
        slow_threshold_ms: 100.0,
        max_records: 100,
        frequent_pattern_threshold: 10,
        low_efficiency_ratio: 0.1,
    }))
}

/// Record the canonical three-query workload used across the flow tests:
/// two finds on `users` (50ms and 300ms, same shape) and one on `orders`
/// (120ms).
pub fn seed_workload(profiler: &QueryProfilerService) {
    profiler.record_slow_query(
        "users",
        "find",
        &bson::doc! { "email": "a@example.com" },
        50.0,
        None,
    );
    profiler.record_slow_query(
        "users",
        "find",
        &bson::doc! { "email": "b@example.com" },
        300.0,
        None,
    );
    profiler.record_slow_query(
        "orders",
        "find",
        &bson::doc! { "status": "pending" },
        120.0,
        None,
    );
}
