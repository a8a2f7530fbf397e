//! Query profiler service
//!
//! Records slow operations as PII-free query shapes, runs caller-supplied
//! queries through `explain`, and turns parsed plans into optimization
//! recommendations.
//!
//! Recording is synchronous and lock-cheap: a bounded ring buffer keeps the
//! most recent records while an unbounded pattern counter tracks how often
//! each fingerprint recurs.

pub mod error;
pub mod parser;
pub mod rules;
pub mod shape;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bson::Document;
use chrono::Utc;
use dashmap::DashMap;

use crate::models::{
    AggregationExplainPlan, CollectionStatsReport, ExplainPlan, IndexInfo,
    OptimizationRecommendation, PatternStat, ProfilerSummary, SlowQueryFilter, SlowQueryRecord,
};
use crate::services::mongo_client::{MongoExplainClient, VERBOSITY_QUERY_PLANNER};
use crate::utils::bson_ext::document_to_json;
use crate::utils::metrics_sink::{
    self, MetricsSink, NoopSink,
};

pub use error::ProfilerError;
pub use rules::RuleThresholds;

/// Default cap on records returned by a listing when none is requested.
const DEFAULT_LIST_LIMIT: usize = 100;

// ============================================================================
// Settings
// ============================================================================

/// Tunables for the profiler, filled from configuration.
#[derive(Debug, Clone)]
pub struct ProfilerSettings {
    /// Operations at or above this duration count as slow.
    pub slow_threshold_ms: f64,
    /// Ring buffer capacity; the oldest record is evicted beyond this.
    pub max_records: usize,
    pub frequent_pattern_threshold: u64,
    pub low_efficiency_ratio: f64,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        Self {
            slow_threshold_ms: 100.0,
            max_records: 1000,
            frequent_pattern_threshold: 10,
            low_efficiency_ratio: 0.1,
        }
    }
}

impl ProfilerSettings {
    fn thresholds(&self) -> RuleThresholds {
        RuleThresholds {
            frequent_pattern_threshold: self.frequent_pattern_threshold,
            low_efficiency_ratio: self.low_efficiency_ratio,
        }
    }
}

// ============================================================================
// Service
// ============================================================================

/// In-memory slow-query profiler.
pub struct QueryProfilerService {
    client: Option<MongoExplainClient>,
    settings: ProfilerSettings,
    thresholds: RuleThresholds,
    buffer: Mutex<VecDeque<SlowQueryRecord>>,
    /// Occurrence counts keyed by `{collection}:{operation}:{canonical
    /// shape}`. Not bounded with the buffer: pattern counts must survive
    /// ring-buffer eviction.
    patterns: DashMap<String, u64>,
    /// Occurrence counts keyed by fingerprint, summed across operations.
    /// The frequent-pattern rule matches plans by fingerprint, which does
    /// not carry the operation.
    fingerprints: DashMap<String, u64>,
    metrics: Arc<dyn MetricsSink>,
}

impl QueryProfilerService {
    pub fn new(
        client: Option<MongoExplainClient>,
        settings: ProfilerSettings,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let thresholds = settings.thresholds();
        Self {
            client,
            settings,
            thresholds,
            buffer: Mutex::new(VecDeque::new()),
            patterns: DashMap::new(),
            fingerprints: DashMap::new(),
            metrics,
        }
    }

    /// Profiler with no database connection and no metrics. Recording and
    /// listing work; explain and stats return `NoDatabase`.
    pub fn in_memory(settings: ProfilerSettings) -> Self {
        Self::new(None, settings, Arc::new(NoopSink))
    }

    pub fn slow_threshold_ms(&self) -> f64 {
        self.settings.slow_threshold_ms
    }

    fn buffer_guard(&self) -> MutexGuard<'_, VecDeque<SlowQueryRecord>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record a slow `find`-shaped operation. The raw query is normalized
    /// before anything is stored; no literal values survive. Returns the
    /// stored record.
    pub fn record_slow_query(
        &self,
        collection: &str,
        operation: &str,
        query: &Document,
        execution_time_ms: f64,
        client_info: Option<serde_json::Value>,
    ) -> SlowQueryRecord {
        let query_shape = shape::normalize_query_shape(query);
        let query_id = shape::generate_query_id(collection, &query_shape);
        let pattern =
            format!("{}:{}:{}", collection, operation, shape::canonical_shape(&query_shape));
        self.note_pattern(&query_id, pattern);

        let record = SlowQueryRecord {
            query_id,
            collection: collection.to_string(),
            operation: operation.to_string(),
            query_shape: document_to_json(&query_shape),
            execution_time_ms,
            timestamp: Utc::now(),
            client_info,
            explain_plan: None,
            recommendations: Vec::new(),
        };
        self.push_record(record.clone());
        record
    }

    /// Record a slow aggregation. The pipeline shape keeps one entry per
    /// stage so arity-sensitive analysis stays possible.
    pub fn record_slow_aggregation(
        &self,
        collection: &str,
        pipeline: &[Document],
        execution_time_ms: f64,
        client_info: Option<serde_json::Value>,
    ) -> SlowQueryRecord {
        let pipeline_shape = shape::normalize_pipeline_shape(pipeline);
        let query_id = shape::generate_pipeline_id(collection, &pipeline_shape);
        let canonical: Vec<String> =
            pipeline_shape.iter().map(shape::canonical_shape).collect();
        let pattern = format!("{}:aggregate:[{}]", collection, canonical.join(","));
        self.note_pattern(&query_id, pattern);

        let record = SlowQueryRecord {
            query_id,
            collection: collection.to_string(),
            operation: "aggregate".to_string(),
            query_shape: serde_json::Value::Array(
                pipeline_shape.iter().map(document_to_json).collect(),
            ),
            execution_time_ms,
            timestamp: Utc::now(),
            client_info,
            explain_plan: None,
            recommendations: Vec::new(),
        };
        self.push_record(record.clone());
        record
    }

    fn note_pattern(&self, query_id: &str, pattern: String) {
        *self.patterns.entry(pattern).or_insert(0) += 1;
        *self.fingerprints.entry(query_id.to_string()).or_insert(0) += 1;
    }

    fn push_record(&self, record: SlowQueryRecord) {
        // The event carries the normalized shape, never the raw query.
        tracing::debug!(
            collection = %record.collection,
            operation = %record.operation,
            query_id = %record.query_id,
            query_shape = %record.query_shape,
            execution_time_ms = record.execution_time_ms,
            "recorded slow query"
        );
        self.metrics.counter_inc(
            metrics_sink::SLOW_QUERIES_RECORDED,
            &[
                ("collection", record.collection.clone()),
                ("operation", record.operation.clone()),
            ],
        );
        self.metrics.histogram_observe(
            metrics_sink::SLOW_QUERY_DURATION_MS,
            record.execution_time_ms,
            &[("collection", record.collection.clone())],
        );

        let mut buffer = self.buffer_guard();
        if buffer.len() >= self.settings.max_records {
            buffer.pop_front();
        }
        buffer.push_back(record);
        self.metrics.gauge_set(metrics_sink::BUFFER_SIZE, buffer.len() as f64);
    }

    // ========================================================================
    // Listing and Summaries
    // ========================================================================

    /// Recorded slow queries matching `filter`, slowest first.
    pub fn get_slow_queries(&self, filter: &SlowQueryFilter) -> Vec<SlowQueryRecord> {
        let buffer = self.buffer_guard();
        let mut matches: Vec<SlowQueryRecord> = buffer
            .iter()
            .filter(|record| {
                filter
                    .collection
                    .as_ref()
                    .is_none_or(|c| &record.collection == c)
                    && filter
                        .operation
                        .as_ref()
                        .is_none_or(|op| &record.operation == op)
                    && filter
                        .min_execution_time_ms
                        .is_none_or(|min| record.execution_time_ms >= min)
                    && filter.since.is_none_or(|cutoff| record.timestamp >= cutoff)
            })
            .cloned()
            .collect();
        drop(buffer);

        matches.sort_by(|a, b| {
            b.execution_time_ms
                .partial_cmp(&a.execution_time_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT));
        matches
    }

    /// All observed patterns with their occurrence counts, most frequent
    /// first.
    pub fn get_pattern_statistics(&self) -> Vec<PatternStat> {
        let mut stats: Vec<PatternStat> = self
            .patterns
            .iter()
            .map(|entry| PatternStat { pattern: entry.key().clone(), count: *entry.value() })
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.pattern.cmp(&b.pattern)));
        stats
    }

    /// Aggregate view over the buffered records.
    pub fn get_summary(&self) -> ProfilerSummary {
        let buffer = self.buffer_guard();
        if buffer.is_empty() {
            return ProfilerSummary {
                threshold_ms: self.settings.slow_threshold_ms,
                ..Default::default()
            };
        }

        let total = buffer.len() as u64;
        let sum: f64 = buffer.iter().map(|r| r.execution_time_ms).sum();
        let max = buffer
            .iter()
            .map(|r| r.execution_time_ms)
            .fold(0.0_f64, f64::max);
        let mut collections: Vec<String> =
            buffer.iter().map(|r| r.collection.clone()).collect();
        drop(buffer);
        collections.sort();
        collections.dedup();

        ProfilerSummary {
            total_slow_queries: total,
            unique_patterns: self.patterns.len() as u64,
            avg_execution_time_ms: (sum / total as f64 * 100.0).round() / 100.0,
            max_execution_time_ms: max,
            collections_affected: collections,
            threshold_ms: self.settings.slow_threshold_ms,
        }
    }

    // ========================================================================
    // Explain
    // ========================================================================

    fn require_client(&self) -> Result<&MongoExplainClient, ProfilerError> {
        self.client.as_ref().ok_or(ProfilerError::NoDatabase)
    }

    /// Explain a query exactly as the caller provided it, so executing
    /// verbosities measure the real document flow. The normalized shape is
    /// used only for the fingerprint and the returned plan's `query_shape`.
    pub async fn get_explain_plan(
        &self,
        collection: &str,
        query: &Document,
        verbosity: Option<&str>,
    ) -> Result<ExplainPlan, ProfilerError> {
        let prepared = prepare_find_explain(collection, query)?;

        let client = self.require_client()?;
        let verbosity = verbosity.unwrap_or(VERBOSITY_QUERY_PLANNER);
        let raw = match client
            .explain_find(collection, prepared.target, verbosity)
            .await
        {
            Ok(raw) => {
                self.note_explain_outcome("ok");
                raw
            }
            Err(err) => {
                self.note_explain_outcome("error");
                return Err(err.into());
            }
        };

        Ok(parser::parse_explain_plan(
            &prepared.query_id,
            collection,
            &prepared.query_shape,
            &raw,
        ))
    }

    /// Explain an aggregation pipeline as provided. Placeholder-damaged
    /// stages (`$limit`, `$skip`, `$sample`) are repaired to executable
    /// values before the pipeline is sent.
    pub async fn get_aggregation_explain(
        &self,
        collection: &str,
        pipeline: &[Document],
        verbosity: Option<&str>,
    ) -> Result<AggregationExplainPlan, ProfilerError> {
        let prepared = prepare_pipeline_explain(collection, pipeline)?;

        let client = self.require_client()?;
        let verbosity = verbosity.unwrap_or(VERBOSITY_QUERY_PLANNER);
        let raw = match client
            .explain_aggregate(collection, prepared.target.clone(), verbosity)
            .await
        {
            Ok(raw) => {
                self.note_explain_outcome("ok");
                raw
            }
            Err(err) => {
                self.note_explain_outcome("error");
                return Err(err.into());
            }
        };

        Ok(parser::parse_aggregation_explain(
            &prepared.query_id,
            collection,
            &prepared.pipeline_shape,
            &prepared.target,
            &raw,
        ))
    }

    fn note_explain_outcome(&self, outcome: &str) {
        self.metrics.counter_inc(
            metrics_sink::EXPLAINS_TOTAL,
            &[("outcome", outcome.to_string())],
        );
    }

    // ========================================================================
    // Recommendations
    // ========================================================================

    /// Run the find-plan rules over an already-parsed plan.
    pub fn generate_recommendations(&self, plan: &ExplainPlan) -> Vec<OptimizationRecommendation> {
        let pattern_count = self
            .fingerprints
            .get(&plan.query_id)
            .map(|count| *count)
            .unwrap_or(0);
        let recommendations = rules::evaluate_plan(plan, pattern_count, &self.thresholds);
        self.note_recommendations(&recommendations);
        recommendations
    }

    /// Run the aggregation rules over an already-parsed plan.
    pub fn generate_pipeline_recommendations(
        &self,
        plan: &AggregationExplainPlan,
    ) -> Vec<OptimizationRecommendation> {
        let recommendations = rules::evaluate_pipeline(plan, &self.thresholds);
        self.note_recommendations(&recommendations);
        recommendations
    }

    /// Explain and analyze in one step.
    pub async fn analyze_query(
        &self,
        collection: &str,
        query: &Document,
        verbosity: Option<&str>,
    ) -> Result<(ExplainPlan, Vec<OptimizationRecommendation>), ProfilerError> {
        let plan = self.get_explain_plan(collection, query, verbosity).await?;
        let recommendations = self.generate_recommendations(&plan);
        Ok((plan, recommendations))
    }

    /// Explain and analyze an aggregation in one step.
    pub async fn analyze_pipeline(
        &self,
        collection: &str,
        pipeline: &[Document],
        verbosity: Option<&str>,
    ) -> Result<(AggregationExplainPlan, Vec<OptimizationRecommendation>), ProfilerError> {
        let plan = self
            .get_aggregation_explain(collection, pipeline, verbosity)
            .await?;
        let recommendations = self.generate_pipeline_recommendations(&plan);
        Ok((plan, recommendations))
    }

    fn note_recommendations(&self, recommendations: &[OptimizationRecommendation]) {
        for rec in recommendations {
            self.metrics.counter_inc(
                metrics_sink::RECOMMENDATIONS_TOTAL,
                &[("severity", format!("{:?}", rec.severity).to_lowercase())],
            );
        }
    }

    // ========================================================================
    // Collection Stats
    // ========================================================================

    /// Size and index report for one collection.
    pub async fn get_collection_stats(
        &self,
        collection: &str,
    ) -> Result<CollectionStatsReport, ProfilerError> {
        let client = self.require_client()?;
        let stats = client.coll_stats(collection).await?;
        let indexes = client.list_indexes(collection).await?;

        Ok(CollectionStatsReport {
            collection: collection.to_string(),
            document_count: doc_u64(&stats, "count"),
            avg_obj_size_bytes: doc_u64(&stats, "avgObjSize"),
            storage_size_bytes: doc_u64(&stats, "storageSize"),
            total_index_size_bytes: doc_u64(&stats, "totalIndexSize"),
            capped: stats.get_bool("capped").unwrap_or(false),
            indexes: indexes
                .into_iter()
                .map(|model| {
                    let options = model.options.unwrap_or_default();
                    IndexInfo {
                        name: options.name.unwrap_or_default(),
                        keys: document_to_json(&model.keys),
                        unique: options.unique.unwrap_or(false),
                        sparse: options.sparse.unwrap_or(false),
                    }
                })
                .collect(),
        })
    }
}

/// Inputs for one find explain: `target` goes to the server verbatim while
/// the normalized shape names the plan.
struct PreparedFindExplain {
    query_id: String,
    query_shape: Document,
    target: Document,
}

fn prepare_find_explain(
    collection: &str,
    query: &Document,
) -> Result<PreparedFindExplain, ProfilerError> {
    if shape::contains_legacy_array_placeholder(query) {
        return Err(ProfilerError::legacy_shape());
    }
    let query_shape = shape::normalize_query_shape(query);
    let query_id = shape::generate_query_id(collection, &query_shape);
    Ok(PreparedFindExplain { query_id, query_shape, target: query.clone() })
}

struct PreparedPipelineExplain {
    query_id: String,
    pipeline_shape: Vec<Document>,
    target: Vec<Document>,
}

fn prepare_pipeline_explain(
    collection: &str,
    pipeline: &[Document],
) -> Result<PreparedPipelineExplain, ProfilerError> {
    if shape::pipeline_contains_legacy_placeholder(pipeline) {
        return Err(ProfilerError::legacy_shape());
    }
    let pipeline_shape = shape::normalize_pipeline_shape(pipeline);
    let query_id = shape::generate_pipeline_id(collection, &pipeline_shape);
    Ok(PreparedPipelineExplain {
        query_id,
        pipeline_shape,
        target: shape::repair_pipeline_for_explain(pipeline),
    })
}

fn doc_u64(doc: &Document, key: &str) -> u64 {
    match doc.get(key) {
        Some(bson::Bson::Int32(n)) => (*n).max(0) as u64,
        Some(bson::Bson::Int64(n)) => (*n).max(0) as u64,
        Some(bson::Bson::Double(d)) if *d >= 0.0 => *d as u64,
        _ => 0,
    }
}
