//! JSON/BSON conversion helpers
//!
//! The HTTP surface speaks JSON while the driver speaks BSON; these
//! conversions keep integer values as integers (sort directions, limits)
//! instead of round-tripping everything through doubles.

use bson::{Bson, Document};

/// Convert a JSON value into BSON, preserving integer-ness where possible.
pub fn json_to_bson(value: &serde_json::Value) -> Bson {
    match value {
        serde_json::Value::Null => Bson::Null,
        serde_json::Value::Bool(val) => Bson::Boolean(*val),
        serde_json::Value::Number(num) => {
            if let Some(val) = num.as_i64() {
                Bson::Int64(val)
            } else if let Some(val) = num.as_f64() {
                Bson::Double(val)
            } else {
                Bson::String(num.to_string())
            }
        }
        serde_json::Value::String(val) => Bson::String(val.clone()),
        serde_json::Value::Array(items) => {
            Bson::Array(items.iter().map(json_to_bson).collect())
        }
        serde_json::Value::Object(map) => {
            let mut doc = Document::new();
            for (key, val) in map {
                doc.insert(key, json_to_bson(val));
            }
            Bson::Document(doc)
        }
    }
}

/// Convert a JSON object into a BSON document. Non-objects yield an empty
/// document rather than an error; the caller validates presence separately.
pub fn json_to_document(value: &serde_json::Value) -> Document {
    match json_to_bson(value) {
        Bson::Document(doc) => doc,
        _ => Document::new(),
    }
}

/// Render a BSON document as relaxed extended JSON for API responses.
pub fn document_to_json(doc: &Document) -> serde_json::Value {
    Bson::Document(doc.clone()).into_relaxed_extjson()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_integers_stay_integers() {
        let doc = json_to_document(&json!({ "$sort": { "a": -1 } }));
        let sort = doc.get_document("$sort").unwrap();
        assert_eq!(sort.get_i64("a").unwrap(), -1);
    }

    #[test]
    fn test_round_trip_object() {
        let value = json!({ "a": [1, "x", null], "b": { "c": true } });
        let doc = json_to_document(&value);
        assert_eq!(doc.get_array("a").unwrap().len(), 3);
        assert!(doc.get_document("b").unwrap().get_bool("c").unwrap());
    }

    #[test]
    fn test_non_object_becomes_empty_document() {
        assert!(json_to_document(&json!(42)).is_empty());
        assert!(json_to_document(&json!("s")).is_empty());
    }
}
