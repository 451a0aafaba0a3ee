//! Tagged value codec for the step cache.
//!
//! Step outcomes travel to and from the orchestrator as JSON. Types JSON
//! cannot express natively are wrapped: `{"__type":"Date","value":ISO8601}`,
//! `{"__type":"BigInt","value":"<decimal>"}`, `{"__type":"Map","value":
//! [[k,v],…]}`, `{"__type":"Set","value":[…]}`. Unknown `__type` tags pass
//! through untouched.
//!
//! Dates wrap only at the top level; a date nested inside an array or object
//! degrades to its ISO-8601 string on encode. BigInt/Map/Set wrap at any
//! depth.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

const TYPE_TAG: &str = "__type";

/// The typed side of the step-cache wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum StepValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(i128),
    String(String),
    Date(DateTime<Utc>),
    Array(Vec<StepValue>),
    Object(BTreeMap<String, StepValue>),
    Map(Vec<(StepValue, StepValue)>),
    Set(Vec<StepValue>),
}

impl StepValue {
    /// Encode to the wire representation.
    pub fn encode(&self) -> Value {
        match self {
            // Only a top-level date gets the wrapper.
            StepValue::Date(d) => json!({ TYPE_TAG: "Date", "value": iso(d) }),
            other => other.encode_nested(),
        }
    }

    fn encode_nested(&self) -> Value {
        match self {
            StepValue::Null => Value::Null,
            StepValue::Bool(b) => Value::Bool(*b),
            StepValue::Int(i) => json!(i),
            StepValue::Float(f) => {
                // Non-finite floats have no JSON form.
                serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
            }
            StepValue::BigInt(i) => json!({ TYPE_TAG: "BigInt", "value": i.to_string() }),
            StepValue::String(s) => Value::String(s.clone()),
            StepValue::Date(d) => Value::String(iso(d)),
            StepValue::Array(items) => {
                Value::Array(items.iter().map(StepValue::encode_nested).collect())
            }
            StepValue::Object(fields) => {
                let map = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.encode_nested()))
                    .collect();
                Value::Object(map)
            }
            StepValue::Map(entries) => {
                let pairs: Vec<Value> = entries
                    .iter()
                    .map(|(k, v)| Value::Array(vec![k.encode_nested(), v.encode_nested()]))
                    .collect();
                json!({ TYPE_TAG: "Map", "value": pairs })
            }
            StepValue::Set(items) => {
                let vals: Vec<Value> = items.iter().map(StepValue::encode_nested).collect();
                json!({ TYPE_TAG: "Set", "value": vals })
            }
        }
    }

    /// Decode from the wire representation.
    pub fn decode(value: &Value) -> StepValue {
        match value {
            Value::Null => StepValue::Null,
            Value::Bool(b) => StepValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    StepValue::Int(i)
                } else {
                    StepValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => StepValue::String(s.clone()),
            Value::Array(items) => StepValue::Array(items.iter().map(StepValue::decode).collect()),
            Value::Object(map) => {
                if let Some(Value::String(tag)) = map.get(TYPE_TAG) {
                    if let Some(decoded) = decode_tagged(tag, map.get("value")) {
                        return decoded;
                    }
                    // Unknown (or malformed) tag: pass the object through.
                }
                StepValue::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), StepValue::decode(v)))
                        .collect(),
                )
            }
        }
    }
}

fn decode_tagged(tag: &str, value: Option<&Value>) -> Option<StepValue> {
    match (tag, value) {
        ("Date", Some(Value::String(s))) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| StepValue::Date(d.with_timezone(&Utc))),
        ("BigInt", Some(Value::String(s))) => s.parse::<i128>().ok().map(StepValue::BigInt),
        ("Map", Some(Value::Array(pairs))) => {
            let mut entries = Vec::with_capacity(pairs.len());
            for pair in pairs {
                let kv = pair.as_array()?;
                if kv.len() != 2 {
                    return None;
                }
                entries.push((StepValue::decode(&kv[0]), StepValue::decode(&kv[1])));
            }
            Some(StepValue::Map(entries))
        }
        ("Set", Some(Value::Array(items))) => {
            Some(StepValue::Set(items.iter().map(StepValue::decode).collect()))
        }
        _ => None,
    }
}

fn iso(d: &DateTime<Utc>) -> String {
    d.to_rfc3339_opts(SecondsFormat::Millis, true)
}
