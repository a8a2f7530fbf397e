//! Explain document parsing
//!
//! Maps raw `explain` output into the typed plan tree. A partially-shaped
//! or future-schema explain document degrades to zeroed fields instead of
//! failing the caller.

use bson::{Bson, Document};
use chrono::Utc;

use crate::models::{
    AggregationExplainPlan, AggregationExplainStage, ExplainPlan, ExplainStage, QueryStage,
    QueryStats,
};
use crate::utils::bson_ext::document_to_json;

/// Parse a raw `find` explain document into a typed plan.
pub fn parse_explain_plan(
    query_id: &str,
    collection: &str,
    query_shape: &Document,
    raw: &Document,
) -> ExplainPlan {
    let query_planner = raw.get_document("queryPlanner").cloned().unwrap_or_default();
    let execution_stats = raw.get_document("executionStats").ok();

    // executionStats mirrors the winning plan with per-stage counts; prefer
    // it when the caller opted into an executing verbosity.
    let winning_plan = execution_stats
        .and_then(|stats| stats.get_document("executionStages").ok())
        .or_else(|| query_planner.get_document("winningPlan").ok())
        .map(parse_stage)
        .unwrap_or_default();

    let rejected_plans = query_planner
        .get_array("rejectedPlans")
        .map(|plans| {
            plans
                .iter()
                .filter_map(|p| p.as_document())
                .map(parse_stage)
                .collect()
        })
        .unwrap_or_default();

    let stats = execution_stats.map(|section| parse_query_stats(section, &winning_plan));

    let server_info = raw
        .get_document("serverInfo")
        .map(document_to_json)
        .unwrap_or(serde_json::Value::Object(Default::default()));

    ExplainPlan {
        query_id: query_id.to_string(),
        collection: collection.to_string(),
        query_shape: document_to_json(query_shape),
        winning_plan,
        rejected_plans,
        stats,
        server_info,
        timestamp: Utc::now(),
    }
}

/// Parse one plan node, collapsing `inputStage`/`inputStages` into a single
/// predecessor list.
pub fn parse_stage(doc: &Document) -> ExplainStage {
    let stage_name = doc.get_str("stage").unwrap_or_default().to_string();

    let mut predecessors = Vec::new();
    if let Ok(input) = doc.get_document("inputStage") {
        predecessors.push(parse_stage(input));
    }
    if let Ok(inputs) = doc.get_array("inputStages") {
        predecessors.extend(inputs.iter().filter_map(|s| s.as_document()).map(parse_stage));
    }
    // Sharded plans nest per-shard winning plans under "shards".
    if let Ok(shards) = doc.get_array("shards") {
        for shard in shards.iter().filter_map(|s| s.as_document()) {
            if let Ok(plan) = shard.get_document("winningPlan") {
                predecessors.push(parse_stage(plan));
            }
        }
    }

    ExplainStage {
        stage: QueryStage::parse(&stage_name),
        stage_name,
        docs_examined: get_u64(doc, "docsExamined"),
        keys_examined: get_u64(doc, "keysExamined"),
        execution_time_ms: get_f64(doc, "executionTimeMillisEstimate"),
        index_name: doc.get_str("indexName").ok().map(str::to_string),
        direction: doc.get_str("direction").unwrap_or("forward").to_string(),
        filter_condition: doc
            .get_document("filter")
            .ok()
            .map(document_to_json),
        predecessors,
    }
}

fn parse_query_stats(section: &Document, winning_plan: &ExplainStage) -> QueryStats {
    let docs_examined = get_u64(section, "totalDocsExamined");
    let keys_examined = get_u64(section, "totalKeysExamined");
    let n_returned = get_u64(section, "nReturned");

    let index_used = winning_plan
        .find_stage(QueryStage::Ixscan)
        .and_then(|stage| stage.index_name.clone());

    QueryStats {
        execution_time_ms: get_f64(section, "executionTimeMillis"),
        docs_examined,
        docs_returned: n_returned,
        keys_examined,
        index_used,
        is_covered_query: QueryStats::compute_covered(docs_examined, keys_examined, n_returned),
        memory_usage_bytes: get_u64(section, "totalMemoryUsageBytes"),
    }
}

/// Parse a raw aggregation explain document.
///
/// Servers report executed pipelines under a top-level `stages` array; when
/// that section is absent (fully pushed-down pipelines, older servers) the
/// stage list is derived from the submitted pipeline so the pipeline rules
/// still have an ordering to walk.
pub fn parse_aggregation_explain(
    query_id: &str,
    collection: &str,
    pipeline_shape: &[Document],
    pipeline: &[Document],
    raw: &Document,
) -> AggregationExplainPlan {
    let stages = match raw.get_array("stages") {
        Ok(reported) => reported
            .iter()
            .filter_map(|s| s.as_document())
            .map(parse_aggregation_stage)
            .collect(),
        Err(_) => pipeline.iter().map(stage_from_pipeline_entry).collect(),
    };

    let server_info = raw
        .get_document("serverInfo")
        .map(document_to_json)
        .unwrap_or(serde_json::Value::Object(Default::default()));

    AggregationExplainPlan {
        query_id: query_id.to_string(),
        collection: collection.to_string(),
        pipeline_shape: pipeline_shape.iter().map(document_to_json).collect(),
        stages,
        server_info,
        timestamp: Utc::now(),
    }
}

fn parse_aggregation_stage(doc: &Document) -> AggregationExplainStage {
    // Each reported stage is a single-key document: { "$sort": { ... } }.
    let (stage_name, body) = doc
        .iter()
        .find(|(key, _)| key.starts_with('$'))
        .map(|(key, value)| (key.clone(), value.as_document().cloned().unwrap_or_default()))
        .unwrap_or_default();

    let mut stage = AggregationExplainStage {
        stage_name,
        uses_disk: doc
            .get_bool("usedDisk")
            .or_else(|_| body.get_bool("usedDisk"))
            .unwrap_or(false),
        memory_usage_bytes: get_u64(doc, "maxUsedMemBytes").max(get_u64(&body, "maxUsedMemBytes")),
        lookup_collection: None,
        lookup_strategy: None,
    };

    if stage.stage_name == "$lookup" {
        stage.lookup_collection = body.get_str("from").ok().map(str::to_string);
        stage.lookup_strategy = body.get_str("strategy").ok().map(str::to_string);
    }

    stage
}

fn stage_from_pipeline_entry(entry: &Document) -> AggregationExplainStage {
    let stage_name = entry
        .keys()
        .find(|key| key.starts_with('$'))
        .cloned()
        .unwrap_or_default();

    let mut stage = AggregationExplainStage { stage_name, ..Default::default() };

    if stage.stage_name == "$lookup" {
        if let Ok(body) = entry.get_document("$lookup") {
            stage.lookup_collection = body.get_str("from").ok().map(str::to_string);
        }
    }

    stage
}

fn get_u64(doc: &Document, key: &str) -> u64 {
    match doc.get(key) {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(d)) if *d >= 0.0 => *d as u64,
        _ => 0,
    }
}

fn get_f64(doc: &Document, key: &str) -> f64 {
    match doc.get(key) {
        Some(Bson::Int32(n)) => *n as f64,
        Some(Bson::Int64(n)) => *n as f64,
        Some(Bson::Double(d)) => *d,
        _ => 0.0,
    }
}
