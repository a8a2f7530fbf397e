//! Profiler data models
//!
//! These models represent parsed MongoDB explain output and slow-query
//! telemetry. They are designed to be serializable for API responses and
//! stable enough to act as the contract between the profiler service,
//! the recommendation rules, and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ============================================================================
// Plan Stage Vocabulary
// ============================================================================

/// One node kind in a query execution plan tree.
///
/// MongoDB reports stage names as free-form strings; unrecognized names map
/// to `Other` so callers can distinguish "really a FETCH" from "we didn't
/// recognize this stage".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStage {
    Collscan,
    Ixscan,
    Fetch,
    Sort,
    Projection,
    Limit,
    Skip,
    ShardMerge,
    #[default]
    Other,
}

impl QueryStage {
    /// Map a raw explain stage name to the closed vocabulary.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "COLLSCAN" => Self::Collscan,
            "IXSCAN" => Self::Ixscan,
            "FETCH" => Self::Fetch,
            "SORT" | "SORT_MERGE" => Self::Sort,
            "PROJECTION" | "PROJECTION_SIMPLE" | "PROJECTION_COVERED" | "PROJECTION_DEFAULT" => {
                Self::Projection
            }
            "LIMIT" => Self::Limit,
            "SKIP" => Self::Skip,
            "SHARD_MERGE" | "SHARDING_FILTER" => Self::ShardMerge,
            _ => Self::Other,
        }
    }
}

/// Severity of an optimization recommendation.
///
/// Ordering matters: recommendations are returned critical-first, so the
/// derived `Ord` puts `Info < Warning < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    Info = 0,
    Warning = 1,
    Critical = 2,
}

// ============================================================================
// Execution Statistics
// ============================================================================

/// Execution statistics extracted from an `executionStats` explain section.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct QueryStats {
    pub execution_time_ms: f64,
    pub docs_examined: u64,
    pub docs_returned: u64,
    pub keys_examined: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_used: Option<String>,
    pub is_covered_query: bool,
    pub memory_usage_bytes: u64,
}

impl QueryStats {
    /// Ratio of documents returned to documents examined.
    ///
    /// Defined as `1.0` when nothing was examined: nothing examined, nothing
    /// missed, and it keeps every caller free of division-by-zero checks.
    pub fn efficiency_ratio(&self) -> f64 {
        if self.docs_examined == 0 {
            1.0
        } else {
            self.docs_returned as f64 / self.docs_examined as f64
        }
    }

    /// A query is covered when the index alone answered it: no document was
    /// fetched, the index produced at least as many keys as results, and it
    /// actually returned something.
    pub fn compute_covered(docs_examined: u64, keys_examined: u64, n_returned: u64) -> bool {
        docs_examined == 0 && keys_examined >= n_returned && n_returned > 0
    }
}

// ============================================================================
// Explain Plan Tree
// ============================================================================

/// A node in a parsed explain plan.
///
/// MongoDB expresses predecessors either as a single `inputStage` or as an
/// `inputStages` array (OR plans, merges). Both collapse into `predecessors`
/// here; every consumer walks them identically.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExplainStage {
    pub stage: QueryStage,
    /// Raw stage name as reported by the server.
    pub stage_name: String,
    pub docs_examined: u64,
    pub keys_examined: u64,
    pub execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    pub direction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_condition: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub predecessors: Vec<ExplainStage>,
}

impl Default for ExplainStage {
    fn default() -> Self {
        Self {
            stage: QueryStage::Other,
            stage_name: String::new(),
            docs_examined: 0,
            keys_examined: 0,
            execution_time_ms: 0.0,
            index_name: None,
            direction: "forward".to_string(),
            filter_condition: None,
            predecessors: Vec::new(),
        }
    }
}

impl ExplainStage {
    /// Depth-first check over this node and every predecessor.
    pub fn any_stage(&self, stage: QueryStage) -> bool {
        if self.stage == stage {
            return true;
        }
        self.predecessors.iter().any(|p| p.any_stage(stage))
    }

    /// First node matching `stage`, walking predecessors depth-first.
    pub fn find_stage(&self, stage: QueryStage) -> Option<&ExplainStage> {
        if self.stage == stage {
            return Some(self);
        }
        self.predecessors.iter().find_map(|p| p.find_stage(stage))
    }
}

/// A fully parsed explain result for a `find`-shaped query.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExplainPlan {
    /// Fingerprint of collection + normalized shape.
    pub query_id: String,
    pub collection: String,
    /// PII-free query shape the plan was produced for.
    pub query_shape: serde_json::Value,
    pub winning_plan: ExplainStage,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rejected_plans: Vec<ExplainStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<QueryStats>,
    #[serde(default)]
    pub server_info: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Aggregation Explain
// ============================================================================

/// One pipeline stage as reported by an aggregation explain.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct AggregationExplainStage {
    /// Pipeline operator, e.g. `"$match"`.
    pub stage_name: String,
    pub uses_disk: bool,
    pub memory_usage_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup_collection: Option<String>,
    /// `"indexedLoopJoin"` or `"nestedLoopJoin"` for `$lookup` stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup_strategy: Option<String>,
}

/// A fully parsed aggregation explain result.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AggregationExplainPlan {
    pub query_id: String,
    pub collection: String,
    /// PII-free pipeline shape, one entry per stage.
    pub pipeline_shape: Vec<serde_json::Value>,
    pub stages: Vec<AggregationExplainStage>,
    #[serde(default)]
    pub server_info: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Slow Query Telemetry
// ============================================================================

/// One recorded slow operation.
///
/// `recommendations` exists for API completeness; the profiler only fills it
/// at explain/analyze time, never at record time.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SlowQueryRecord {
    pub query_id: String,
    pub collection: String,
    pub operation: String,
    pub query_shape: serde_json::Value,
    pub execution_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain_plan: Option<ExplainPlan>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub recommendations: Vec<OptimizationRecommendation>,
}

// ============================================================================
// Recommendations
// ============================================================================

/// One actionable piece of optimization advice.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OptimizationRecommendation {
    /// Deterministic: `{query_id}-{detector tag}`, so the same condition on
    /// the same fingerprint always yields the same id.
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: SeverityLevel,
    /// One of `"index"`, `"query"`, `"schema"`, `"connection"`.
    pub category: String,
    pub suggested_action: String,
    pub estimated_improvement: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_example: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation_link: Option<String>,
}

// ============================================================================
// Reports
// ============================================================================

/// Filters for listing recorded slow queries. All present filters must
/// match (AND semantics).
#[derive(Debug, Clone, Default)]
pub struct SlowQueryFilter {
    /// Only records for this collection.
    pub collection: Option<String>,
    /// Only records for this operation, e.g. `"find"`.
    pub operation: Option<String>,
    /// Only records at least this slow.
    pub min_execution_time_ms: Option<f64>,
    /// Only records at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
}

/// One index on a collection.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IndexInfo {
    pub name: String,
    /// Key spec, e.g. `{ "status": 1, "created_at": -1 }`.
    pub keys: serde_json::Value,
    pub unique: bool,
    pub sparse: bool,
}

/// Size and index report for one collection.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct CollectionStatsReport {
    pub collection: String,
    pub document_count: u64,
    pub avg_obj_size_bytes: u64,
    pub storage_size_bytes: u64,
    pub total_index_size_bytes: u64,
    pub capped: bool,
    pub indexes: Vec<IndexInfo>,
}

/// Aggregate view over the recorded slow queries.
///
/// All fields are zero/empty when nothing has been recorded.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct ProfilerSummary {
    pub total_slow_queries: u64,
    pub unique_patterns: u64,
    /// Rounded to two decimal places.
    pub avg_execution_time_ms: f64,
    pub max_execution_time_ms: f64,
    /// Sorted, deduplicated.
    pub collections_affected: Vec<String>,
    /// The slow threshold the profiler is running with.
    pub threshold_ms: f64,
}

/// Occurrence count for one query pattern.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PatternStat {
    /// `{collection}:{operation}:{canonical shape}`.
    pub pattern: String,
    pub count: u64,
}

/// Per-fingerprint statistics over a time window, from the persistent store.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PatternWindowStat {
    pub query_id: String,
    pub collection: String,
    pub operation: String,
    pub count: u64,
    pub min_execution_time_ms: f64,
    pub avg_execution_time_ms: f64,
    pub max_execution_time_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse_known() {
        assert_eq!(QueryStage::parse("COLLSCAN"), QueryStage::Collscan);
        assert_eq!(QueryStage::parse("IXSCAN"), QueryStage::Ixscan);
        assert_eq!(QueryStage::parse("PROJECTION_COVERED"), QueryStage::Projection);
    }

    #[test]
    fn test_stage_parse_unknown_maps_to_other() {
        assert_eq!(QueryStage::parse("COLUMN_SCAN"), QueryStage::Other);
        assert_eq!(QueryStage::parse(""), QueryStage::Other);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(SeverityLevel::Critical > SeverityLevel::Warning);
        assert!(SeverityLevel::Warning > SeverityLevel::Info);
    }

    #[test]
    fn test_efficiency_ratio_zero_examined() {
        let stats = QueryStats::default();
        assert_eq!(stats.efficiency_ratio(), 1.0);
    }

    #[test]
    fn test_efficiency_ratio_partial() {
        let stats = QueryStats { docs_examined: 1000, docs_returned: 50, ..Default::default() };
        assert_eq!(stats.efficiency_ratio(), 0.05);
    }

    #[test]
    fn test_covered_query_requires_results() {
        assert!(QueryStats::compute_covered(0, 10, 10));
        assert!(!QueryStats::compute_covered(0, 0, 0));
        assert!(!QueryStats::compute_covered(5, 10, 10));
        assert!(!QueryStats::compute_covered(0, 5, 10));
    }

    #[test]
    fn test_any_stage_walks_predecessors() {
        let plan = ExplainStage {
            stage: QueryStage::Fetch,
            stage_name: "FETCH".into(),
            predecessors: vec![ExplainStage {
                stage: QueryStage::Collscan,
                stage_name: "COLLSCAN".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(plan.any_stage(QueryStage::Collscan));
        assert!(!plan.any_stage(QueryStage::Sort));
    }
}
