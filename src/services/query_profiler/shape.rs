//! Query-shape normalization and fingerprinting
//!
//! Converts arbitrary query/pipeline filter documents into a PII-free
//! "shape": structurally identical, but with every literal value replaced by
//! a placeholder. Shapes are safe to log, safe to expose on the dashboard,
//! and collapse structurally identical queries onto one fingerprint.

use bson::{doc, Bson, Document};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Placeholder for any scrubbed literal.
pub const VALUE_PLACEHOLDER: &str = "<value>";

/// Placeholder for an explicit null literal.
pub const NULL_PLACEHOLDER: &str = "<null>";

/// Legacy length-encoded array placeholder, e.g. `"<3 items>"`. Shapes
/// recorded before per-element normalization contain these; they break
/// fixed-arity operators when fed back into explain, so they are rejected
/// up front instead of coerced.
static LEGACY_ARRAY_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\d+ items>").expect("valid regex"));

/// Normalize a query document into its PII-free shape.
///
/// Keys are schema, not data, and survive verbatim. Values are scrubbed via
/// [`normalize_value`] with no surrounding sort context.
pub fn normalize_query_shape(query: &Document) -> Document {
    normalize_document(query, None)
}

/// Normalize every stage of an aggregation pipeline.
pub fn normalize_pipeline_shape(pipeline: &[Document]) -> Vec<Document> {
    pipeline.iter().map(normalize_query_shape).collect()
}

fn normalize_document(doc: &Document, parent_key: Option<&str>) -> Document {
    let mut shape = Document::new();
    for (key, value) in doc.iter() {
        // A $sort/$orderby key switches the context for everything below it;
        // any other key inherits the existing context unchanged, so deeply
        // nested sort documents keep their direction semantics at every depth.
        let child_context = if is_sort_key(key) { Some(key.as_str()) } else { parent_key };
        shape.insert(key.clone(), normalize_value(value, child_context));
    }
    shape
}

fn normalize_value(value: &Bson, parent_key: Option<&str>) -> Bson {
    match value {
        Bson::Document(d) => Bson::Document(normalize_document(d, parent_key)),
        Bson::Array(items) => normalize_array(items, parent_key),
        other => normalize_scalar(other, parent_key),
    }
}

/// Arrays keep their exact length. Operators like `$eq` and `$in` carry a
/// fixed arity; collapsing `[a, b, c]` into one placeholder would make the
/// shape syntactically invalid when re-explained.
fn normalize_array(items: &[Bson], parent_key: Option<&str>) -> Bson {
    Bson::Array(items.iter().map(|item| normalize_value(item, parent_key)).collect())
}

fn normalize_scalar(value: &Bson, parent_key: Option<&str>) -> Bson {
    if in_sort_context(parent_key) {
        if let Some(direction) = sort_direction(value) {
            return Bson::Int32(direction);
        }
    }

    match value {
        Bson::Null => Bson::String(NULL_PLACEHOLDER.to_string()),
        // Strings starting with "$" are field-path/operator references
        // ("$user_id"), part of the query structure rather than user data.
        Bson::String(s) if s.starts_with('$') => Bson::String(s.clone()),
        // Everything else, known scalar or not, is scrubbed.
        _ => Bson::String(VALUE_PLACEHOLDER.to_string()),
    }
}

fn is_sort_key(key: &str) -> bool {
    key == "$sort" || key == "$orderby"
}

fn in_sort_context(parent_key: Option<&str>) -> bool {
    parent_key.map(is_sort_key).unwrap_or(false)
}

/// Sort direction values (`1`, `-1`, `1.0`, `-1.0`) are query structure:
/// altering them would make the shape un-executable by explain.
fn sort_direction(value: &Bson) -> Option<i32> {
    match value {
        Bson::Int32(1) | Bson::Int64(1) => Some(1),
        Bson::Int32(-1) | Bson::Int64(-1) => Some(-1),
        Bson::Double(d) if *d == 1.0 => Some(1),
        Bson::Double(d) if *d == -1.0 => Some(-1),
        _ => None,
    }
}

// ============================================================================
// Fingerprinting
// ============================================================================

/// Stable fingerprint of a collection plus a normalized query shape.
///
/// SHA-256 over `"{collection}:{canonical json}"`, truncated to 16 hex
/// characters. Canonical JSON sorts object keys recursively, so two shapes
/// that differ only in key order produce the same id.
pub fn generate_query_id(collection: &str, query_shape: &Document) -> String {
    let canonical = canonical_json(&Bson::Document(query_shape.clone()));
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Fingerprint for an aggregation pipeline shape.
pub fn generate_pipeline_id(collection: &str, pipeline_shape: &[Document]) -> String {
    let stages: Vec<Bson> =
        pipeline_shape.iter().map(|d| Bson::Document(d.clone())).collect();
    let wrapper = doc! { "pipeline": stages };
    generate_query_id(collection, &wrapper)
}

/// Canonical rendering of a normalized shape, used for pattern keys.
pub fn canonical_shape(query_shape: &Document) -> String {
    canonical_json(&Bson::Document(query_shape.clone()))
}

fn canonical_json(value: &Bson) -> String {
    match value {
        Bson::Document(d) => {
            let mut keys: Vec<&String> = d.keys().collect();
            keys.sort();
            let entries: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let v = d.get(k).expect("key taken from document");
                    format!("{}:{}", json_string(k), canonical_json(v))
                })
                .collect();
            format!("{{{}}}", entries.join(","))
        }
        Bson::Array(items) => {
            let entries: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", entries.join(","))
        }
        Bson::String(s) => json_string(s),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(d) => d.to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::Null => "null".to_string(),
        // Normalized shapes only contain the variants above; anything else
        // degrades to its extended-JSON rendering rather than panicking.
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

fn json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

// ============================================================================
// Legacy Shape Detection & Pipeline Repair
// ============================================================================

/// Whether any string in the document still carries the legacy `"<N items>"`
/// array placeholder.
pub fn contains_legacy_array_placeholder(doc: &Document) -> bool {
    doc.iter().any(|(_, v)| bson_has_legacy_placeholder(v))
}

/// Same check across a whole pipeline.
pub fn pipeline_contains_legacy_placeholder(pipeline: &[Document]) -> bool {
    pipeline.iter().any(contains_legacy_array_placeholder)
}

fn bson_has_legacy_placeholder(value: &Bson) -> bool {
    match value {
        Bson::String(s) => LEGACY_ARRAY_PLACEHOLDER.is_match(s),
        Bson::Document(d) => contains_legacy_array_placeholder(d),
        Bson::Array(items) => items.iter().any(bson_has_legacy_placeholder),
        _ => false,
    }
}

/// Repair placeholder values that would make explain fail outright.
///
/// A previously normalized pipeline may carry `"<value>"` where the server
/// requires a real integer. Only three numeric fields are ever touched:
/// `$limit` (fallback 10), `$skip` (fallback 0), and `$sample.size`
/// (fallback 10). Every other stage passes through unchanged.
pub fn repair_pipeline_for_explain(pipeline: &[Document]) -> Vec<Document> {
    pipeline
        .iter()
        .map(|stage| {
            let mut repaired = stage.clone();
            if let Some(limit) = stage.get("$limit") {
                if positive_int(limit).is_none() {
                    repaired.insert("$limit", Bson::Int64(10));
                }
            }
            if let Some(skip) = stage.get("$skip") {
                if non_negative_int(skip).is_none() {
                    repaired.insert("$skip", Bson::Int64(0));
                }
            }
            if let Some(Bson::Document(sample)) = stage.get("$sample") {
                if sample.get("size").and_then(positive_int).is_none() {
                    let mut fixed = sample.clone();
                    fixed.insert("size", Bson::Int64(10));
                    repaired.insert("$sample", Bson::Document(fixed));
                }
            }
            repaired
        })
        .collect()
}

fn positive_int(value: &Bson) -> Option<i64> {
    as_int(value).filter(|n| *n > 0)
}

fn non_negative_int(value: &Bson) -> Option<i64> {
    as_int(value).filter(|n| *n >= 0)
}

fn as_int(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(d) if d.fract() == 0.0 => Some(*d as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_are_scrubbed() {
        let query = doc! {
            "email": "alice@example.com",
            "age": 42,
            "score": 3.5,
            "active": true,
        };
        let shape = normalize_query_shape(&query);
        assert_eq!(shape.get_str("email").unwrap(), VALUE_PLACEHOLDER);
        assert_eq!(shape.get_str("age").unwrap(), VALUE_PLACEHOLDER);
        assert_eq!(shape.get_str("score").unwrap(), VALUE_PLACEHOLDER);
        assert_eq!(shape.get_str("active").unwrap(), VALUE_PLACEHOLDER);
    }

    #[test]
    fn test_null_gets_dedicated_placeholder() {
        let shape = normalize_query_shape(&doc! { "deleted_at": Bson::Null });
        assert_eq!(shape.get_str("deleted_at").unwrap(), NULL_PLACEHOLDER);
    }

    #[test]
    fn test_field_references_survive() {
        let shape = normalize_query_shape(&doc! { "$expr": { "$eq": ["$owner_id", "$user_id"] } });
        let expr = shape.get_document("$expr").unwrap();
        let args = expr.get_array("$eq").unwrap();
        assert_eq!(args[0], Bson::String("$owner_id".into()));
        assert_eq!(args[1], Bson::String("$user_id".into()));
    }

    #[test]
    fn test_sort_directions_survive() {
        let shape = normalize_query_shape(&doc! { "$sort": { "created_at": -1, "name": 1 } });
        let sort = shape.get_document("$sort").unwrap();
        assert_eq!(sort.get_i32("created_at").unwrap(), -1);
        assert_eq!(sort.get_i32("name").unwrap(), 1);
    }

    #[test]
    fn test_float_sort_directions_become_ints() {
        let shape = normalize_query_shape(&doc! { "$sort": { "rank": -1.0 } });
        assert_eq!(shape.get_document("$sort").unwrap().get_i32("rank").unwrap(), -1);
    }

    #[test]
    fn test_sort_context_propagates_through_nesting() {
        let query = doc! { "$facet": { "sub": { "$sort": { "field": 1 } } } };
        let shape = normalize_query_shape(&query);
        let sort = shape
            .get_document("$facet")
            .unwrap()
            .get_document("sub")
            .unwrap()
            .get_document("$sort")
            .unwrap();
        assert_eq!(sort.get_i32("field").unwrap(), 1);
    }

    #[test]
    fn test_non_direction_values_under_sort_are_scrubbed() {
        let shape = normalize_query_shape(&doc! { "$sort": { "field": 5 } });
        assert_eq!(shape.get_document("$sort").unwrap().get_str("field").unwrap(), VALUE_PLACEHOLDER);
    }

    #[test]
    fn test_array_arity_preserved() {
        for n in [0usize, 1, 3, 10] {
            let values: Vec<Bson> = (0..n).map(|i| Bson::Int32(i as i32)).collect();
            let shape = normalize_query_shape(&doc! { "status": { "$in": values } });
            let arr = shape.get_document("status").unwrap().get_array("$in").unwrap();
            assert_eq!(arr.len(), n);
        }
    }

    #[test]
    fn test_mixed_array_normalized_per_element() {
        let query = doc! { "$or": [ { "a": 1 }, { "b": "secret" }, "loose" ] };
        let shape = normalize_query_shape(&query);
        let or = shape.get_array("$or").unwrap();
        assert_eq!(or.len(), 3);
        assert_eq!(or[0].as_document().unwrap().get_str("a").unwrap(), VALUE_PLACEHOLDER);
        assert_eq!(or[1].as_document().unwrap().get_str("b").unwrap(), VALUE_PLACEHOLDER);
        assert_eq!(or[2], Bson::String(VALUE_PLACEHOLDER.into()));
    }

    #[test]
    fn test_no_pii_leaks_through() {
        let query = doc! {
            "email": "bob@corp.example",
            "phone": "+1-555-0100",
            "card": "4111111111111111",
            "$or": [ { "token": "sk-live-abcdef123456" } ],
            "ids": { "$in": ["alice@example.com", "555-867-5309"] },
        };
        let shape = normalize_query_shape(&query);
        let rendered = Bson::Document(shape).into_relaxed_extjson().to_string();
        for secret in
            ["bob@corp.example", "555-0100", "4111111111111111", "sk-live", "alice@example.com", "867-5309"]
        {
            assert!(!rendered.contains(secret), "leaked {}", secret);
        }
    }

    #[test]
    fn test_fingerprint_key_order_independent() {
        let a = normalize_query_shape(&doc! { "a": 1, "b": 2 });
        let b = normalize_query_shape(&doc! { "b": 2, "a": 1 });
        assert_eq!(generate_query_id("c", &a), generate_query_id("c", &b));
    }

    #[test]
    fn test_fingerprint_varies_by_collection_and_shape() {
        let shape = normalize_query_shape(&doc! { "a": 1 });
        let other = normalize_query_shape(&doc! { "a": 1, "b": 2 });
        assert_ne!(generate_query_id("users", &shape), generate_query_id("orders", &shape));
        assert_ne!(generate_query_id("users", &shape), generate_query_id("users", &other));
    }

    #[test]
    fn test_fingerprint_is_16_hex_chars() {
        let id = generate_query_id("users", &normalize_query_shape(&doc! { "a": 1 }));
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_legacy_placeholder_detection() {
        assert!(contains_legacy_array_placeholder(&doc! { "tags": "<3 items>" }));
        assert!(contains_legacy_array_placeholder(
            &doc! { "a": { "$in": ["<10 items>"] } }
        ));
        assert!(!contains_legacy_array_placeholder(&doc! { "tags": "<value>" }));
        assert!(!contains_legacy_array_placeholder(&doc! { "tags": "< items>" }));
    }

    #[test]
    fn test_pipeline_repair_limit_and_skip() {
        let pipeline =
            vec![doc! { "$limit": "<value>" }, doc! { "$skip": "<value>" }, doc! { "$match": {} }];
        let repaired = repair_pipeline_for_explain(&pipeline);
        assert_eq!(repaired[0].get_i64("$limit").unwrap(), 10);
        assert_eq!(repaired[1].get_i64("$skip").unwrap(), 0);
        assert_eq!(repaired[2], doc! { "$match": {} });
    }

    #[test]
    fn test_pipeline_repair_sample_size() {
        let repaired = repair_pipeline_for_explain(&[doc! { "$sample": { "size": "<value>" } }]);
        assert_eq!(repaired[0].get_document("$sample").unwrap().get_i64("size").unwrap(), 10);
    }

    #[test]
    fn test_pipeline_repair_keeps_valid_values() {
        let repaired = repair_pipeline_for_explain(&[
            doc! { "$limit": 25 },
            doc! { "$skip": 0 },
            doc! { "$sample": { "size": 5 } },
        ]);
        assert_eq!(repaired[0].get_i32("$limit").unwrap(), 25);
        assert_eq!(repaired[1].get_i32("$skip").unwrap(), 0);
        assert_eq!(repaired[2].get_document("$sample").unwrap().get_i32("size").unwrap(), 5);
    }

    #[test]
    fn test_zero_limit_is_repaired() {
        let repaired = repair_pipeline_for_explain(&[doc! { "$limit": 0 }]);
        assert_eq!(repaired[0].get_i64("$limit").unwrap(), 10);
    }
}
