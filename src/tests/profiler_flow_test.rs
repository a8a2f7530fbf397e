use crate::models::SlowQueryFilter;
use crate::tests::common::{create_test_profiler, seed_workload};

#[test]
fn test_listing_returns_slowest_first() {
    let profiler = create_test_profiler();
    seed_workload(&profiler);

    let records = profiler.get_slow_queries(&SlowQueryFilter::default());
    let times: Vec<f64> = records.iter().map(|r| r.execution_time_ms).collect();
    assert_eq!(times, vec![300.0, 120.0, 50.0]);
}

#[test]
fn test_collection_filter_keeps_order() {
    let profiler = create_test_profiler();
    seed_workload(&profiler);

    let filter = SlowQueryFilter { collection: Some("users".to_string()), ..Default::default() };
    let records = profiler.get_slow_queries(&filter);
    let times: Vec<f64> = records.iter().map(|r| r.execution_time_ms).collect();
    assert_eq!(times, vec![300.0, 50.0]);
    assert!(records.iter().all(|r| r.collection == "users"));
}

#[test]
fn test_min_time_and_limit_compose() {
    let profiler = create_test_profiler();
    seed_workload(&profiler);

    let filter = SlowQueryFilter {
        min_execution_time_ms: Some(100.0),
        limit: Some(1),
        ..Default::default()
    };
    let records = profiler.get_slow_queries(&filter);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].execution_time_ms, 300.0);
}

#[test]
fn test_summary_over_workload() {
    let profiler = create_test_profiler();
    seed_workload(&profiler);

    let summary = profiler.get_summary();
    assert_eq!(summary.total_slow_queries, 3);
    assert_eq!(summary.avg_execution_time_ms, 156.67);
    assert_eq!(summary.max_execution_time_ms, 300.0);
    assert_eq!(summary.collections_affected, vec!["orders", "users"]);
    assert_eq!(summary.threshold_ms, 100.0);
    // Both `users` finds share one normalized shape.
    assert_eq!(summary.unique_patterns, 2);
}

#[test]
fn test_recorded_shapes_carry_no_literals() {
    let profiler = create_test_profiler();
    seed_workload(&profiler);

    let records = profiler.get_slow_queries(&SlowQueryFilter::default());
    for record in &records {
        let rendered = record.query_shape.to_string();
        assert!(!rendered.contains("example.com"), "literal leaked: {}", rendered);
        assert!(!rendered.contains("pending"), "literal leaked: {}", rendered);
    }
}

#[test]
fn test_same_shape_counts_one_pattern() {
    let profiler = create_test_profiler();
    seed_workload(&profiler);

    let stats = profiler.get_pattern_statistics();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].count, 2);
    assert!(stats[0].pattern.starts_with("users:find:"));
    assert_eq!(stats[1].count, 1);
}

#[test]
fn test_aggregation_records_mix_with_finds() {
    let profiler = create_test_profiler();
    seed_workload(&profiler);
    profiler.record_slow_aggregation(
        "orders",
        &[
            bson::doc! { "$match": { "status": "shipped" } },
            bson::doc! { "$group": { "_id": "$customer_id", "total": { "$sum": "$amount" } } },
        ],
        450.0,
        None,
    );

    let filter = SlowQueryFilter { operation: Some("aggregate".to_string()), ..Default::default() };
    let records = profiler.get_slow_queries(&filter);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].collection, "orders");
    assert!(records[0].query_shape.is_array());

    let summary = profiler.get_summary();
    assert_eq!(summary.total_slow_queries, 4);
    assert_eq!(summary.max_execution_time_ms, 450.0);
}
