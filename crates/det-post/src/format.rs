//! Output record assembly and the serialized detection format.
//!
//! A result document is `{"format": [...]}` with one object per
//! detection; the empty string is the canonical empty result. Both
//! sides live here: [`RecordBuilder`] renders records from mapped
//! values and [`parse_detections`] reads a document back.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::PostProcError;

/// Value type of one output record field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldKind {
    FloatArray,
    Float,
    Int,
}

impl FromStr for FieldKind {
    type Err = PostProcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "FLOAT_ARRAY" => Ok(Self::FloatArray),
            "FLOAT" => Ok(Self::Float),
            "INT" => Ok(Self::Int),
            other => Err(PostProcError::UnknownFieldType(other.to_string())),
        }
    }
}

/// Declared fields of the serialized detection record.
#[derive(Clone, Debug)]
pub struct OutputSchema {
    fields: BTreeMap<String, FieldKind>,
}

impl OutputSchema {
    /// Keys every detection record must declare.
    pub const REQUIRED_KEYS: [&'static str; 3] = ["bbox", "label_id", "confidence"];

    pub fn new(fields: BTreeMap<String, FieldKind>) -> Result<Self, PostProcError> {
        for key in Self::REQUIRED_KEYS {
            if !fields.contains_key(key) {
                return Err(PostProcError::MissingField(format!(
                    "post_proc_output.format.{key}"
                )));
            }
        }
        Ok(Self { fields })
    }

    pub fn kind(&self, key: &str) -> Option<FieldKind> {
        self.fields.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

/// Builds serialized records one at a time from mapped values.
#[derive(Debug)]
pub struct RecordBuilder<'a> {
    schema: &'a OutputSchema,
    record: Map<String, Value>,
}

impl<'a> RecordBuilder<'a> {
    pub fn new(schema: &'a OutputSchema) -> Self {
        Self { schema, record: Map::new() }
    }

    /// Sets one field, enforcing the declared arity and value type.
    pub fn set(&mut self, key: &str, values: &[f32]) -> Result<(), PostProcError> {
        let kind = self
            .schema
            .kind(key)
            .ok_or_else(|| PostProcError::UnregisteredKey(key.to_string()))?;
        let value = match kind {
            FieldKind::FloatArray => Value::from(values.to_vec()),
            FieldKind::Float => {
                if values.len() != 1 {
                    return Err(PostProcError::FieldArity {
                        key: key.to_string(),
                        expected: "exactly 1",
                        actual: values.len(),
                    });
                }
                Value::from(values[0])
            }
            FieldKind::Int => {
                if values.len() != 1 {
                    return Err(PostProcError::FieldArity {
                        key: key.to_string(),
                        expected: "exactly 1",
                        actual: values.len(),
                    });
                }
                let value = values[0];
                if (value as i64) as f32 != value {
                    return Err(PostProcError::NotIntegral { key: key.to_string(), value });
                }
                Value::from(value as i64)
            }
        };
        self.record.insert(key.to_string(), value);
        Ok(())
    }

    /// Returns the finished record and resets for the next one.
    pub fn finish(&mut self) -> Value {
        Value::Object(std::mem::take(&mut self.record))
    }
}

/// Renders the result document for a non-empty set of records.
pub fn serialize_records(records: Vec<Value>) -> String {
    Value::Object(Map::from_iter([("format".to_string(), Value::Array(records))])).to_string()
}

/// One detection parsed back from a result document.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DetectedObject {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub class_id: i32,
    pub confidence: f32,
}

/// Parses a result document back into detections.
///
/// The empty string yields no objects. Unknown record keys are skipped
/// with a warning; structural problems are errors.
pub fn parse_detections(text: &str) -> Result<Vec<DetectedObject>, PostProcError> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let doc: Value = serde_json::from_str(text)?;
    let records = doc
        .get("format")
        .and_then(Value::as_array)
        .ok_or_else(|| PostProcError::MissingField("format".to_string()))?;
    let mut objects = Vec::with_capacity(records.len());
    for record in records {
        let fields = record
            .as_object()
            .ok_or_else(|| PostProcError::BadResultField("format entry".to_string()))?;
        let mut object = DetectedObject::default();
        for (key, value) in fields {
            match key.as_str() {
                "bbox" => {
                    let coords = parse_bbox(value)?;
                    object.x = coords[0];
                    object.y = coords[1];
                    object.w = coords[2];
                    object.h = coords[3];
                }
                "label_id" => {
                    object.class_id = value
                        .as_i64()
                        .ok_or_else(|| PostProcError::BadResultField("label_id".to_string()))?
                        as i32;
                }
                "confidence" => {
                    object.confidence = value
                        .as_f64()
                        .ok_or_else(|| PostProcError::BadResultField("confidence".to_string()))?
                        as f32;
                }
                other => warn!(key = other, "skipping unknown detection field"),
            }
        }
        objects.push(object);
    }
    Ok(objects)
}

fn parse_bbox(value: &Value) -> Result<[f32; 4], PostProcError> {
    let entries = value
        .as_array()
        .filter(|entries| entries.len() >= 4)
        .ok_or_else(|| PostProcError::BadResultField("bbox".to_string()))?;
    let mut coords = [0.0f32; 4];
    for (slot, entry) in coords.iter_mut().zip(entries) {
        *slot = entry
            .as_f64()
            .ok_or_else(|| PostProcError::BadResultField("bbox".to_string()))? as f32;
    }
    Ok(coords)
}
