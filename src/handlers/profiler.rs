//! Profiler HTTP handlers
//!
//! Thin request/response mapping over the profiler services. Every
//! success body carries `"status": "success"`; failures go through
//! `ApiError` and carry `"status": "error"` with a stable error code.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

use crate::models::SlowQueryFilter;
use crate::services::persistent_profiler::{DEFAULT_PATTERN_DAYS, DEFAULT_SUMMARY_HOURS};
use crate::utils::bson_ext::json_to_document;
use crate::utils::{ApiError, ApiResult};
use crate::AppState;

const VERBOSITIES: &[&str] = &["queryPlanner", "executionStats", "allPlansExecution"];

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize, IntoParams)]
pub struct SlowQueryParams {
    /// Maximum number of records to return
    pub limit: Option<usize>,
    /// Only records for this collection
    pub collection: Option<String>,
    /// Only records for this operation, e.g. "find"
    pub operation: Option<String>,
    /// Only records at least this slow, in milliseconds
    pub min_time: Option<f64>,
    /// Lookback window in hours
    pub hours: Option<i64>,
}

impl SlowQueryParams {
    fn into_filter(self) -> SlowQueryFilter {
        SlowQueryFilter {
            collection: self.collection,
            operation: self.operation,
            min_execution_time_ms: self.min_time,
            since: self.hours.map(|h| Utc::now() - Duration::hours(h.max(0))),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SummaryParams {
    /// Lookback window in hours (persistent store only)
    pub hours: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PatternParams {
    /// Lookback window in days (persistent store only)
    pub days: Option<i64>,
}

/// Body of the explain and recommendation endpoints. Exactly one of
/// `query` or `pipeline` selects the explain kind; an absent `query`
/// explains a full-collection find.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExplainRequest {
    pub collection: String,
    /// Filter document for a find-shaped explain
    pub query: Option<serde_json::Value>,
    /// Aggregation pipeline, one object per stage
    pub pipeline: Option<Vec<serde_json::Value>>,
    /// "queryPlanner" (default), "executionStats", or "allPlansExecution".
    /// Higher verbosities make the server actually execute the query.
    pub verbosity: Option<String>,
}

impl ExplainRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.collection.trim().is_empty() {
            return Err(ApiError::invalid_data("collection is required"));
        }
        if self.query.is_some() && self.pipeline.is_some() {
            return Err(ApiError::invalid_data("provide either query or pipeline, not both"));
        }
        if let Some(verbosity) = &self.verbosity {
            if !VERBOSITIES.contains(&verbosity.as_str()) {
                return Err(ApiError::invalid_data(format!(
                    "unknown verbosity '{}', expected one of: {}",
                    verbosity,
                    VERBOSITIES.join(", ")
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// List recent slow queries
#[utoipa::path(
    get,
    path = "/api/profiler/slow-queries",
    params(SlowQueryParams),
    responses(
        (status = 200, description = "Matching slow query records, slowest first"),
        (status = 401, description = "Missing or invalid API token"),
        (status = 429, description = "Rate limit exceeded")
    ),
    tag = "Profiler"
)]
pub async fn list_slow_queries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SlowQueryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = params.into_filter();
    let records = match &state.persistent {
        Some(persistent) => persistent.get_slow_queries(&filter).await,
        None => state.profiler.get_slow_queries(&filter),
    };
    Ok(Json(json!({
        "status": "success",
        "count": records.len(),
        "slow_queries": records,
    })))
}

/// Explain a query or aggregation pipeline
#[utoipa::path(
    post,
    path = "/api/profiler/explain",
    request_body = ExplainRequest,
    responses(
        (status = 200, description = "Parsed explain plan"),
        (status = 400, description = "Invalid request or broken query shape"),
        (status = 503, description = "No database connection configured")
    ),
    tag = "Profiler"
)]
pub async fn explain_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExplainRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    request.validate()?;
    let verbosity = request.verbosity.as_deref();

    if let Some(pipeline) = &request.pipeline {
        let stages: Vec<bson::Document> = pipeline.iter().map(json_to_document).collect();
        let plan = state
            .profiler
            .get_aggregation_explain(&request.collection, &stages, verbosity)
            .await?;
        return Ok(Json(json!({ "status": "success", "explain_plan": plan })));
    }

    let query = request.query.as_ref().map(json_to_document).unwrap_or_default();
    let plan = state
        .profiler
        .get_explain_plan(&request.collection, &query, verbosity)
        .await?;
    Ok(Json(json!({ "status": "success", "explain_plan": plan })))
}

/// Explain and produce optimization recommendations in one call
#[utoipa::path(
    post,
    path = "/api/profiler/recommendations",
    request_body = ExplainRequest,
    responses(
        (status = 200, description = "Explain plan plus severity-ordered recommendations"),
        (status = 400, description = "Invalid request or broken query shape"),
        (status = 503, description = "No database connection configured")
    ),
    tag = "Profiler"
)]
pub async fn recommend(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExplainRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    request.validate()?;
    let verbosity = request.verbosity.as_deref();

    if let Some(pipeline) = &request.pipeline {
        let stages: Vec<bson::Document> = pipeline.iter().map(json_to_document).collect();
        let (plan, recommendations) = state
            .profiler
            .analyze_pipeline(&request.collection, &stages, verbosity)
            .await?;
        return Ok(Json(json!({
            "status": "success",
            "explain_plan": plan,
            "recommendations": recommendations,
            "recommendation_count": recommendations.len(),
        })));
    }

    let query = request.query.as_ref().map(json_to_document).unwrap_or_default();
    let (plan, recommendations) = state
        .profiler
        .analyze_query(&request.collection, &query, verbosity)
        .await?;
    Ok(Json(json!({
        "status": "success",
        "explain_plan": plan,
        "recommendations": recommendations,
        "recommendation_count": recommendations.len(),
    })))
}

/// Aggregate statistics over recorded slow queries
#[utoipa::path(
    get,
    path = "/api/profiler/summary",
    params(SummaryParams),
    responses(
        (status = 200, description = "Totals, averages and affected collections")
    ),
    tag = "Profiler"
)]
pub async fn summary(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SummaryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let summary = match &state.persistent {
        Some(persistent) => {
            persistent
                .get_summary(params.hours.unwrap_or(DEFAULT_SUMMARY_HOURS))
                .await
        }
        None => state.profiler.get_summary(),
    };
    Ok(Json(json!({ "status": "success", "summary": summary })))
}

/// Collection size and index report
#[utoipa::path(
    get,
    path = "/api/profiler/collection/{name}/stats",
    params(("name" = String, Path, description = "Collection name")),
    responses(
        (status = 200, description = "collStats plus index list"),
        (status = 400, description = "Invalid collection name"),
        (status = 503, description = "No database connection configured")
    ),
    tag = "Profiler"
)]
pub async fn collection_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = sanitize_collection_name(&name)?;
    let stats = state.profiler.get_collection_stats(&name).await?;
    Ok(Json(json!({ "status": "success", "stats": stats })))
}

/// Query pattern frequency statistics
#[utoipa::path(
    get,
    path = "/api/profiler/patterns",
    params(PatternParams),
    responses(
        (status = 200, description = "Patterns with occurrence counts, most frequent first")
    ),
    tag = "Profiler"
)]
pub async fn patterns(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PatternParams>,
) -> ApiResult<Json<serde_json::Value>> {
    match &state.persistent {
        Some(persistent) => {
            let stats = persistent
                .get_pattern_statistics(params.days.unwrap_or(DEFAULT_PATTERN_DAYS))
                .await
                .map_err(|err| ApiError::internal_error(format!("database error: {}", err)))?;
            Ok(Json(json!({ "status": "success", "patterns": stats })))
        }
        None => {
            let stats = state.profiler.get_pattern_statistics();
            Ok(Json(json!({ "status": "success", "patterns": stats })))
        }
    }
}

/// Collection names come from the URL path; keep them to the characters
/// MongoDB namespaces actually use.
fn sanitize_collection_name(name: &str) -> Result<String, ApiError> {
    let name = name.trim();
    if name.is_empty()
        || name.len() > 120
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        || name.starts_with("system.")
    {
        return Err(ApiError::invalid_data("invalid collection name"));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_collection_name() {
        assert_eq!(sanitize_collection_name("users").unwrap(), "users");
        assert_eq!(sanitize_collection_name(" app.events ").unwrap(), "app.events");
        assert!(sanitize_collection_name("").is_err());
        assert!(sanitize_collection_name("users; drop").is_err());
        assert!(sanitize_collection_name("system.indexes").is_err());
    }

    #[test]
    fn test_explain_request_validation() {
        let ok = ExplainRequest {
            collection: "users".to_string(),
            query: Some(serde_json::json!({ "a": 1 })),
            pipeline: None,
            verbosity: Some("executionStats".to_string()),
        };
        assert!(ok.validate().is_ok());

        let both = ExplainRequest {
            collection: "users".to_string(),
            query: Some(serde_json::json!({})),
            pipeline: Some(vec![]),
            verbosity: None,
        };
        assert!(both.validate().is_err());

        let bad_verbosity = ExplainRequest {
            collection: "users".to_string(),
            query: None,
            pipeline: None,
            verbosity: Some("loud".to_string()),
        };
        assert!(bad_verbosity.validate().is_err());

        let no_collection = ExplainRequest {
            collection: "  ".to_string(),
            query: None,
            pipeline: None,
            verbosity: None,
        };
        assert!(no_collection.validate().is_err());
    }

    #[test]
    fn test_params_map_to_filter() {
        let params = SlowQueryParams {
            limit: Some(10),
            collection: Some("users".to_string()),
            operation: None,
            min_time: Some(200.0),
            hours: Some(24),
        };
        let filter = params.into_filter();
        assert_eq!(filter.limit, Some(10));
        assert_eq!(filter.min_execution_time_ms, Some(200.0));
        assert!(filter.since.is_some());
    }
}
