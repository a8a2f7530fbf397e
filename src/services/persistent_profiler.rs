//! Persistent profiler
//!
//! Mirrors every recorded slow query into a MongoDB collection so history
//! survives restarts and summaries can cover time windows larger than the
//! in-memory ring buffer. Persistence is strictly best-effort: a storage
//! failure never loses the in-memory record.

use std::sync::Arc;

use bson::{doc, Bson, Document};
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;

use crate::models::{PatternWindowStat, ProfilerSummary, SlowQueryFilter, SlowQueryRecord};
use crate::services::mongo_client::MongoExplainClient;
use crate::services::query_profiler::QueryProfilerService;
use crate::utils::bson_ext::{document_to_json, json_to_bson};

/// Default lookback for persistent summaries.
pub const DEFAULT_SUMMARY_HOURS: i64 = 24;
/// Default lookback for pattern statistics.
pub const DEFAULT_PATTERN_DAYS: i64 = 7;

/// Profiler that writes through to a MongoDB collection.
pub struct PersistentQueryProfilerService {
    inner: Arc<QueryProfilerService>,
    records: mongodb::Collection<Document>,
}

impl PersistentQueryProfilerService {
    pub fn new(
        inner: Arc<QueryProfilerService>,
        client: &MongoExplainClient,
        collection_name: &str,
    ) -> Self {
        Self { inner, records: client.collection(collection_name) }
    }

    /// The wrapped in-memory profiler; explain and recommendation calls go
    /// straight to it.
    pub fn inner(&self) -> &Arc<QueryProfilerService> {
        &self.inner
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record in memory, then persist. The stored record is returned even
    /// when the write fails.
    pub async fn record_slow_query(
        &self,
        collection: &str,
        operation: &str,
        query: &Document,
        execution_time_ms: f64,
        client_info: Option<serde_json::Value>,
    ) -> SlowQueryRecord {
        let record = self.inner.record_slow_query(
            collection,
            operation,
            query,
            execution_time_ms,
            client_info,
        );
        self.persist(&record).await;
        record
    }

    pub async fn record_slow_aggregation(
        &self,
        collection: &str,
        pipeline: &[Document],
        execution_time_ms: f64,
        client_info: Option<serde_json::Value>,
    ) -> SlowQueryRecord {
        let record = self
            .inner
            .record_slow_aggregation(collection, pipeline, execution_time_ms, client_info);
        self.persist(&record).await;
        record
    }

    async fn persist(&self, record: &SlowQueryRecord) {
        if let Err(err) = self.records.insert_one(record_to_document(record)).await {
            tracing::warn!(
                error = %err,
                query_id = %record.query_id,
                "failed to persist slow query record"
            );
        }
    }

    // ========================================================================
    // Queries over the Store
    // ========================================================================

    /// Slow queries from the persistent store, slowest first. Falls back to
    /// the in-memory buffer when the store is unreachable.
    pub async fn get_slow_queries(&self, filter: &SlowQueryFilter) -> Vec<SlowQueryRecord> {
        let limit = filter.limit.unwrap_or(100) as i64;

        let result = self
            .records
            .find(filter_query(filter))
            .sort(doc! { "execution_time_ms": -1 })
            .limit(limit)
            .await;
        match result {
            Ok(cursor) => match cursor.try_collect::<Vec<Document>>().await {
                Ok(docs) => docs.iter().map(document_to_record).collect(),
                Err(err) => {
                    tracing::warn!(error = %err, "persistent store read failed, using buffer");
                    self.inner.get_slow_queries(filter)
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "persistent store query failed, using buffer");
                self.inner.get_slow_queries(filter)
            }
        }
    }

    /// Summary over the last `hours` hours of persisted records. Falls back
    /// to the in-memory summary when the aggregation fails.
    pub async fn get_summary(&self, hours: i64) -> ProfilerSummary {
        let cutoff = Utc::now() - Duration::hours(hours.max(1));
        let pipeline = vec![
            doc! { "$match": { "timestamp": { "$gte": bson::DateTime::from_chrono(cutoff) } } },
            doc! { "$group": {
                "_id": Bson::Null,
                "total": { "$sum": 1 },
                "avg_ms": { "$avg": "$execution_time_ms" },
                "max_ms": { "$max": "$execution_time_ms" },
                "collections": { "$addToSet": "$collection" },
                "patterns": { "$addToSet": "$query_id" },
            } },
        ];

        let docs: Vec<Document> = match self.records.aggregate(pipeline).await {
            Ok(cursor) => match cursor.try_collect().await {
                Ok(docs) => docs,
                Err(err) => {
                    tracing::warn!(error = %err, "summary aggregation failed, using buffer");
                    return self.inner.get_summary();
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "summary aggregation failed, using buffer");
                return self.inner.get_summary();
            }
        };

        let Some(group) = docs.first() else {
            return ProfilerSummary {
                threshold_ms: self.inner.slow_threshold_ms(),
                ..Default::default()
            };
        };

        let mut collections: Vec<String> = group
            .get_array("collections")
            .map(|items| {
                items
                    .iter()
                    .filter_map(|b| b.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        collections.sort();

        let avg = number(group, "avg_ms");
        ProfilerSummary {
            total_slow_queries: number(group, "total") as u64,
            unique_patterns: group.get_array("patterns").map(|p| p.len()).unwrap_or(0) as u64,
            avg_execution_time_ms: (avg * 100.0).round() / 100.0,
            max_execution_time_ms: number(group, "max_ms"),
            collections_affected: collections,
            threshold_ms: self.inner.slow_threshold_ms(),
        }
    }

    /// Per-fingerprint statistics over the last `days` days, most frequent
    /// first.
    pub async fn get_pattern_statistics(
        &self,
        days: i64,
    ) -> mongodb::error::Result<Vec<PatternWindowStat>> {
        let cutoff = Utc::now() - Duration::days(days.max(1));
        let pipeline = vec![
            doc! { "$match": { "timestamp": { "$gte": bson::DateTime::from_chrono(cutoff) } } },
            doc! { "$group": {
                "_id": "$query_id",
                "collection": { "$first": "$collection" },
                "operation": { "$first": "$operation" },
                "count": { "$sum": 1 },
                "min_ms": { "$min": "$execution_time_ms" },
                "avg_ms": { "$avg": "$execution_time_ms" },
                "max_ms": { "$max": "$execution_time_ms" },
            } },
            doc! { "$sort": { "count": -1 } },
        ];

        let cursor = self.records.aggregate(pipeline).await?;
        let docs: Vec<Document> = cursor.try_collect().await?;
        Ok(docs
            .iter()
            .map(|group| PatternWindowStat {
                query_id: group.get_str("_id").unwrap_or_default().to_string(),
                collection: group.get_str("collection").unwrap_or_default().to_string(),
                operation: group.get_str("operation").unwrap_or_default().to_string(),
                count: number(group, "count") as u64,
                min_execution_time_ms: number(group, "min_ms"),
                avg_execution_time_ms: number(group, "avg_ms"),
                max_execution_time_ms: number(group, "max_ms"),
            })
            .collect())
    }
}

/// The Mongo filter equivalent of [`SlowQueryFilter`], criterion for
/// criterion, so the store and the in-memory buffer match the same records.
fn filter_query(filter: &SlowQueryFilter) -> Document {
    let mut query = Document::new();
    if let Some(collection) = &filter.collection {
        query.insert("collection", collection);
    }
    if let Some(operation) = &filter.operation {
        query.insert("operation", operation);
    }
    if let Some(min) = filter.min_execution_time_ms {
        query.insert("execution_time_ms", doc! { "$gte": min });
    }
    if let Some(since) = filter.since {
        query.insert("timestamp", doc! { "$gte": bson::DateTime::from_chrono(since) });
    }
    query
}

// ============================================================================
// Document Mapping
// ============================================================================

fn record_to_document(record: &SlowQueryRecord) -> Document {
    let mut doc = doc! {
        "query_id": &record.query_id,
        "collection": &record.collection,
        "operation": &record.operation,
        "query_shape": json_to_bson(&record.query_shape),
        "execution_time_ms": record.execution_time_ms,
        "timestamp": bson::DateTime::from_chrono(record.timestamp),
    };
    if let Some(client_info) = &record.client_info {
        doc.insert("client_info", json_to_bson(client_info));
    }
    doc
}

fn document_to_record(doc: &Document) -> SlowQueryRecord {
    let timestamp: DateTime<Utc> = doc
        .get_datetime("timestamp")
        .map(|dt| dt.to_chrono())
        .unwrap_or_else(|_| Utc::now());
    SlowQueryRecord {
        query_id: doc.get_str("query_id").unwrap_or_default().to_string(),
        collection: doc.get_str("collection").unwrap_or_default().to_string(),
        operation: doc.get_str("operation").unwrap_or_default().to_string(),
        query_shape: doc
            .get("query_shape")
            .cloned()
            .map(|b| b.into_relaxed_extjson())
            .unwrap_or(serde_json::Value::Null),
        execution_time_ms: number(doc, "execution_time_ms"),
        timestamp,
        client_info: doc
            .get("client_info")
            .cloned()
            .map(|b| b.into_relaxed_extjson()),
        explain_plan: None,
        recommendations: Vec::new(),
    }
}

fn number(doc: &Document, key: &str) -> f64 {
    match doc.get(key) {
        Some(Bson::Int32(n)) => *n as f64,
        Some(Bson::Int64(n)) => *n as f64,
        Some(Bson::Double(d)) => *d,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_record() -> SlowQueryRecord {
        SlowQueryRecord {
            query_id: "deadbeefdeadbeef".to_string(),
            collection: "users".to_string(),
            operation: "find".to_string(),
            query_shape: json!({ "status": "<value>" }),
            execution_time_ms: 150.5,
            timestamp: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).single().unwrap(),
            client_info: Some(json!({ "driver": "test" })),
            explain_plan: None,
            recommendations: Vec::new(),
        }
    }

    #[test]
    fn test_record_round_trips_through_document() {
        let record = sample_record();
        let doc = record_to_document(&record);
        let back = document_to_record(&doc);
        assert_eq!(back.query_id, record.query_id);
        assert_eq!(back.collection, record.collection);
        assert_eq!(back.operation, record.operation);
        assert_eq!(back.execution_time_ms, record.execution_time_ms);
        assert_eq!(back.timestamp, record.timestamp);
        assert_eq!(back.query_shape["status"], "<value>");
        assert_eq!(back.client_info.unwrap()["driver"], "test");
    }

    #[test]
    fn test_filter_query_includes_every_criterion() {
        let since = Utc.with_ymd_and_hms(2026, 8, 20, 0, 0, 0).single().unwrap();
        let filter = SlowQueryFilter {
            collection: Some("users".to_string()),
            operation: Some("find".to_string()),
            min_execution_time_ms: Some(50.0),
            since: Some(since),
            limit: None,
        };
        let query = filter_query(&filter);
        assert_eq!(query.get_str("collection").unwrap(), "users");
        assert_eq!(query.get_str("operation").unwrap(), "find");
        let min = query.get_document("execution_time_ms").unwrap();
        assert_eq!(min.get_f64("$gte").unwrap(), 50.0);
        let cutoff = query.get_document("timestamp").unwrap().get_datetime("$gte").unwrap();
        assert_eq!(cutoff.to_chrono(), since);
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(filter_query(&SlowQueryFilter::default()).is_empty());
    }

    #[test]
    fn test_document_mapping_defaults_missing_fields() {
        let record = document_to_record(&doc! { "query_id": "abc" });
        assert_eq!(record.query_id, "abc");
        assert_eq!(record.collection, "");
        assert_eq!(record.execution_time_ms, 0.0);
        assert!(record.client_info.is_none());
    }
}
