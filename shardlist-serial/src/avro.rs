//! Avro schema inference for serde rows.
//!
//! Avro needs a writer schema up front, but store elements are arbitrary
//! serde values. The schema is inferred from the first row of a batch:
//! every field becomes a `["null", T]` union so that rows with missing or
//! null fields still encode.

use apache_avro::Schema;
use serde_json::{json, Value};

use crate::error::{Result, SerialError};

pub(crate) fn infer_schema(sample: &Value) -> Result<Schema> {
    let doc = match sample {
        Value::Object(_) => record_schema(sample, "Row"),
        other => {
            // Scalar rows are wrapped nowhere; encode them as a one-field
            // record would lose shape. Refuse instead.
            return Err(SerialError::Encode {
                format: "avro".to_string(),
                reason: format!("avro rows must be maps, got: {other}"),
            });
        }
    };
    Schema::parse(&doc).map_err(|e| SerialError::Encode {
        format: "avro".to_string(),
        reason: format!("schema inference failed: {e}"),
    })
}

fn record_schema(value: &Value, name: &str) -> Value {
    let fields: Vec<Value> = value
        .as_object()
        .expect("record_schema called on a map")
        .iter()
        .map(|(k, v)| {
            json!({
                "name": k,
                "type": ["null", type_of(v, k)],
                "default": null,
            })
        })
        .collect();
    json!({
        "type": "record",
        "name": name,
        "fields": fields,
    })
}

fn type_of(value: &Value, name: &str) -> Value {
    match value {
        Value::Null => json!("string"),
        Value::Bool(_) => json!("boolean"),
        Value::Number(n) if n.is_f64() => json!("double"),
        Value::Number(_) => json!("long"),
        Value::String(_) => json!("string"),
        Value::Array(items) => {
            let item_type = items
                .first()
                .map(|v| type_of(v, name))
                .unwrap_or_else(|| json!("string"));
            json!({"type": "array", "items": item_type})
        }
        Value::Object(_) => record_schema(value, &format!("{name}_record")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_union_fields_from_first_row() {
        let schema = infer_schema(&json!({
            "name": "a",
            "count": 3,
            "score": 0.5,
            "tags": ["x", "y"],
        }))
        .unwrap();
        match schema {
            Schema::Record(record) => {
                assert_eq!(record.fields.len(), 4);
            }
            other => panic!("expected record schema, got {other:?}"),
        }
    }

    #[test]
    fn rejects_scalar_rows() {
        assert!(infer_schema(&json!(42)).is_err());
    }
}
