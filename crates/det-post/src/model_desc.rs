//! Parsing and validation of detection model descriptions.
//!
//! A model description is a JSON document shipped next to the model
//! file. It names the output layout, the shape of one candidate box
//! record, the processors to run and the mapping from record fields to
//! serialized output keys. Everything is validated here so the hot
//! path can index records without further checks.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PostProcError;
use crate::format::{FieldKind, OutputSchema};
use crate::ops::MappingOp;

/// Arrangement of candidate boxes inside an output layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputLayout {
    /// One fixed-size record per candidate.
    B,
    /// Anchor grid, field-major per anchor.
    BCxCy,
    /// Anchor grid, cell-major.
    CxCyB,
}

impl FromStr for OutputLayout {
    type Err = PostProcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "B" => Ok(Self::B),
            "BCxCy" => Ok(Self::BCxCy),
            "CxCyB" => Ok(Self::CxCyB),
            other => Err(PostProcError::UnknownLayout(other.to_string())),
        }
    }
}

/// Interpretation of the four location fields of a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BoxFormat {
    /// Center x, center y, width, height.
    CenterSize,
    /// Top-left x, top-left y, width, height.
    CornerSize,
    /// Top-left x, top-left y, bottom-right x, bottom-right y.
    Corner,
}

impl FromStr for BoxFormat {
    type Err = PostProcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "CENTER_SIZE" => Ok(Self::CenterSize),
            "CORNER_SIZE" => Ok(Self::CornerSize),
            "CORNER" => Ok(Self::Corner),
            other => Err(PostProcError::UnknownBoxFormat(other.to_string())),
        }
    }
}

/// Field positions inside one candidate box record.
#[derive(Clone, Debug)]
pub struct BoxRecordLayout {
    pub size: usize,
    pub box_format: BoxFormat,
    pub location_index: [usize; 4],
    pub confidence_index: Option<usize>,
    pub first_class_prob_index: Option<usize>,
    pub predict_label_index: Option<usize>,
    pub batchid_index: Option<usize>,
}

/// Output layout plus record shape of a detection model.
#[derive(Clone, Debug)]
pub struct DetectionFormat {
    pub layout: OutputLayout,
    pub record: BoxRecordLayout,
}

/// Class id to name table with an "unknown" fallback.
#[derive(Clone, Debug, Default)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn label_name(&self, id: i32) -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.labels.get(idx))
            .map_or("unknown", String::as_str)
    }

    pub fn label_index(&self, name: &str) -> Option<usize> {
        self.labels.iter().position(|label| label == name)
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }
}

/// Validated output-side description of a detection model.
#[derive(Clone, Debug)]
pub struct ModelOutputDesc {
    pub labels: LabelTable,
    pub detection: Option<DetectionFormat>,
    pub conf_thresh: f32,
    pub max_roi: usize,
}

impl ModelOutputDesc {
    pub fn num_classes(&self) -> usize {
        self.labels.num_classes()
    }

    /// The detection format, or an error when the model ships none.
    pub fn require_detection(&self) -> Result<&DetectionFormat, PostProcError> {
        self.detection.as_ref().ok_or_else(|| {
            PostProcError::MissingField("model_output.format.detection_output".to_string())
        })
    }
}

/// One processor entry from the model description, built lazily
/// through the processor registry.
#[derive(Clone, Debug)]
pub struct ProcessorDesc {
    pub name: String,
    pub params: Value,
}

/// Gather indices and operator chain for one output key.
#[derive(Clone, Debug)]
pub struct FieldMapping {
    pub key: String,
    pub indices: Vec<usize>,
    pub ops: Vec<MappingOp>,
}

/// Parsed and validated model description for a detection model.
#[derive(Clone, Debug)]
pub struct ModelProcConfig {
    pub model_type: String,
    pub function_name: String,
    pub output: ModelOutputDesc,
    pub schema: OutputSchema,
    pub processors: Vec<ProcessorDesc>,
    pub mappings: Vec<FieldMapping>,
}

/// Keys every model description document must carry.
pub(crate) const REQUIRED_TOP_LEVEL: [&str; 6] = [
    "json_schema_version",
    "model_type",
    "model_input",
    "model_output",
    "post_proc_output",
    "labels_table",
];

const DEFAULT_CONF_THRESH: f32 = 0.01;

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Deserialize)]
struct RawModelProc {
    json_schema_version: String,
    model_type: String,
    model_output: RawModelOutput,
    post_proc_output: RawPostProc,
    labels_table: Vec<RawLabelTable>,
}

#[derive(Deserialize)]
struct RawModelOutput {
    class_label_table: String,
    #[serde(default)]
    format: Option<RawOutputFormat>,
}

#[derive(Deserialize)]
struct RawOutputFormat {
    layout: String,
    #[serde(default)]
    detection_output: Option<RawDetectionOutput>,
}

#[derive(Deserialize)]
struct RawDetectionOutput {
    size: usize,
    bbox_format: String,
    location_index: Vec<i64>,
    #[serde(default)]
    confidence_index: Option<i64>,
    #[serde(default)]
    first_class_prob_index: Option<i64>,
    #[serde(default)]
    predict_label_index: Option<i64>,
    #[serde(default)]
    batchid_index: Option<i64>,
}

#[derive(Deserialize)]
struct RawPostProc {
    function_name: String,
    #[serde(default)]
    process: Vec<RawProcess>,
    format: BTreeMap<String, String>,
    #[serde(default)]
    mapping: BTreeMap<String, RawMapping>,
}

#[derive(Deserialize)]
struct RawProcess {
    name: String,
    #[serde(default = "empty_object")]
    params: Value,
}

#[derive(Deserialize)]
struct RawMapping {
    input: RawMappingInput,
    op: Vec<RawOp>,
}

#[derive(Deserialize)]
struct RawMappingInput {
    index: Vec<usize>,
}

#[derive(Deserialize)]
struct RawOp {
    name: String,
    #[serde(default = "empty_object")]
    params: Value,
}

#[derive(Deserialize)]
struct RawLabelTable {
    name: String,
    labels: Vec<String>,
}

impl ModelProcConfig {
    /// Parses and validates a model description document.
    pub fn from_json(text: &str) -> Result<Self, PostProcError> {
        let doc: Value = serde_json::from_str(text)?;
        for key in REQUIRED_TOP_LEVEL {
            if doc.get(key).is_none() {
                return Err(PostProcError::MissingField(key.to_string()));
            }
        }
        let raw: RawModelProc = serde_json::from_value(doc)?;
        debug!(
            version = %raw.json_schema_version,
            model_type = %raw.model_type,
            "parsed model description"
        );

        let labels = build_labels(&raw.model_output.class_label_table, &raw.labels_table)?;
        let detection = match raw.model_output.format {
            Some(format) => Some(build_detection_format(format, labels.num_classes())?),
            None => None,
        };
        let output = ModelOutputDesc {
            labels,
            detection,
            conf_thresh: DEFAULT_CONF_THRESH,
            max_roi: 0,
        };

        let schema = build_schema(&raw.post_proc_output.format)?;
        let mappings = build_mappings(&schema, &raw.post_proc_output.mapping)?;
        let processors = raw
            .post_proc_output
            .process
            .into_iter()
            .map(|process| ProcessorDesc { name: process.name, params: process.params })
            .collect();

        Ok(Self {
            model_type: raw.model_type,
            function_name: raw.post_proc_output.function_name,
            output,
            schema,
            processors,
            mappings,
        })
    }
}

fn build_labels(
    table_name: &str,
    tables: &[RawLabelTable],
) -> Result<LabelTable, PostProcError> {
    let table = tables.iter().find(|table| table.name == table_name).ok_or_else(|| {
        PostProcError::InvalidDescription(format!(
            "class_label_table {table_name:?} not found in labels_table"
        ))
    })?;
    Ok(LabelTable::new(table.labels.clone()))
}

fn build_detection_format(
    format: RawOutputFormat,
    num_classes: usize,
) -> Result<DetectionFormat, PostProcError> {
    let layout: OutputLayout = format.layout.parse()?;
    let raw = format.detection_output.ok_or_else(|| {
        PostProcError::MissingField("model_output.format.detection_output".to_string())
    })?;
    let record = build_record(raw, num_classes)?;
    Ok(DetectionFormat { layout, record })
}

fn build_record(
    raw: RawDetectionOutput,
    num_classes: usize,
) -> Result<BoxRecordLayout, PostProcError> {
    if raw.size == 0 {
        return Err(PostProcError::InvalidDescription(
            "detection_output.size must be positive".to_string(),
        ));
    }
    if raw.location_index.len() != 4 {
        return Err(PostProcError::InvalidDescription(format!(
            "location_index must hold 4 entries, got {}",
            raw.location_index.len()
        )));
    }
    let mut location_index = [0usize; 4];
    for (slot, &index) in location_index.iter_mut().zip(&raw.location_index) {
        *slot = field_index("location_index", index, raw.size)?;
    }
    let confidence_index = optional_index("confidence_index", raw.confidence_index, raw.size)?;
    let first_class_prob_index =
        optional_index("first_class_prob_index", raw.first_class_prob_index, raw.size)?;
    let predict_label_index =
        optional_index("predict_label_index", raw.predict_label_index, raw.size)?;
    let batchid_index = optional_index("batchid_index", raw.batchid_index, raw.size)?;

    if confidence_index.is_none() && first_class_prob_index.is_none() {
        return Err(PostProcError::InvalidDescription(
            "either confidence_index or first_class_prob_index is required".to_string(),
        ));
    }
    if first_class_prob_index.is_none() && predict_label_index.is_none() {
        return Err(PostProcError::InvalidDescription(
            "either first_class_prob_index or predict_label_index is required".to_string(),
        ));
    }
    if let Some(first) = first_class_prob_index
        && first + num_classes > raw.size
    {
        return Err(PostProcError::InvalidDescription(format!(
            "first_class_prob_index {first} plus {num_classes} classes exceeds record size {}",
            raw.size
        )));
    }

    Ok(BoxRecordLayout {
        size: raw.size,
        box_format: raw.bbox_format.parse()?,
        location_index,
        confidence_index,
        first_class_prob_index,
        predict_label_index,
        batchid_index,
    })
}

fn field_index(name: &str, value: i64, size: usize) -> Result<usize, PostProcError> {
    let index = usize::try_from(value).map_err(|_| {
        PostProcError::InvalidDescription(format!("{name} must not be negative, got {value}"))
    })?;
    if index >= size {
        return Err(PostProcError::IndexOutOfBounds { index, len: size });
    }
    Ok(index)
}

fn optional_index(
    name: &str,
    value: Option<i64>,
    size: usize,
) -> Result<Option<usize>, PostProcError> {
    value.map(|value| field_index(name, value, size)).transpose()
}

fn build_schema(raw: &BTreeMap<String, String>) -> Result<OutputSchema, PostProcError> {
    let mut fields = BTreeMap::new();
    for (key, kind) in raw {
        fields.insert(key.clone(), FieldKind::from_str(kind)?);
    }
    OutputSchema::new(fields)
}

fn build_mappings(
    schema: &OutputSchema,
    raw: &BTreeMap<String, RawMapping>,
) -> Result<Vec<FieldMapping>, PostProcError> {
    let mut mappings = Vec::new();
    for key in schema.keys() {
        let mapping = raw.get(key).ok_or_else(|| {
            PostProcError::MissingField(format!("post_proc_output.mapping.{key}"))
        })?;
        let mut ops = Vec::with_capacity(mapping.op.len());
        for op in &mapping.op {
            if op.params.as_object().is_some_and(|params| !params.is_empty()) {
                warn!(op = %op.name, "mapping operator ignores its parameters");
            }
            ops.push(MappingOp::from_str(&op.name)?);
        }
        mappings.push(FieldMapping {
            key: key.to_string(),
            indices: mapping.input.index.clone(),
            ops,
        });
    }
    Ok(mappings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> Value {
        serde_json::json!({
            "json_schema_version": "1.2.0",
            "model_type": "detection",
            "model_input": { "format": "BGR" },
            "model_output": {
                "class_label_table": "coco",
                "format": {
                    "layout": "B",
                    "detection_output": {
                        "size": 7,
                        "bbox_format": "CORNER_SIZE",
                        "location_index": [3, 4, 5, 6],
                        "confidence_index": 2,
                        "predict_label_index": 1,
                        "batchid_index": 0
                    }
                }
            },
            "post_proc_output": {
                "function_name": "detection_to_json",
                "format": {
                    "bbox": "FLOAT_ARRAY",
                    "label_id": "INT",
                    "confidence": "FLOAT"
                },
                "mapping": {
                    "bbox": { "input": { "index": [3, 4, 5, 6] }, "op": [{ "name": "identity" }] },
                    "label_id": { "input": { "index": [1] }, "op": [{ "name": "identity" }] },
                    "confidence": { "input": { "index": [2] }, "op": [{ "name": "identity" }] }
                }
            },
            "labels_table": [
                { "name": "coco", "labels": ["person", "bicycle", "car"] }
            ]
        })
    }

    #[test]
    fn parses_a_complete_description() {
        let config = ModelProcConfig::from_json(&sample_doc().to_string()).unwrap();
        assert_eq!(config.model_type, "detection");
        assert_eq!(config.output.num_classes(), 3);
        let format = config.output.require_detection().unwrap();
        assert_eq!(format.layout, OutputLayout::B);
        assert_eq!(format.record.size, 7);
        assert_eq!(format.record.location_index, [3, 4, 5, 6]);
        assert_eq!(format.record.batchid_index, Some(0));
        assert_eq!(config.mappings.len(), 3);
        assert_eq!(config.mappings[0].key, "bbox");
    }

    #[test]
    fn rejects_unknown_layout() {
        let mut doc = sample_doc();
        doc["model_output"]["format"]["layout"] = Value::from("BHW");
        assert!(matches!(
            ModelProcConfig::from_json(&doc.to_string()),
            Err(PostProcError::UnknownLayout(layout)) if layout == "BHW"
        ));
    }

    #[test]
    fn rejects_missing_top_level_field() {
        let mut doc = sample_doc();
        doc.as_object_mut().unwrap().remove("labels_table");
        assert!(matches!(
            ModelProcConfig::from_json(&doc.to_string()),
            Err(PostProcError::MissingField(field)) if field == "labels_table"
        ));
    }

    #[test]
    fn rejects_mapping_gaps() {
        let mut doc = sample_doc();
        doc["post_proc_output"]["mapping"].as_object_mut().unwrap().remove("label_id");
        assert!(matches!(
            ModelProcConfig::from_json(&doc.to_string()),
            Err(PostProcError::MissingField(field)) if field == "post_proc_output.mapping.label_id"
        ));
    }

    #[test]
    fn rejects_out_of_range_record_index() {
        let mut doc = sample_doc();
        doc["model_output"]["format"]["detection_output"]["confidence_index"] = Value::from(9);
        assert!(matches!(
            ModelProcConfig::from_json(&doc.to_string()),
            Err(PostProcError::IndexOutOfBounds { index: 9, len: 7 })
        ));
    }

    #[test]
    fn model_without_format_has_no_detection_output() {
        let mut doc = sample_doc();
        doc["model_output"].as_object_mut().unwrap().remove("format");
        let config = ModelProcConfig::from_json(&doc.to_string()).unwrap();
        assert!(config.output.detection.is_none());
        assert!(config.output.require_detection().is_err());
    }

    #[test]
    fn labels_fall_back_to_unknown() {
        let labels = LabelTable::new(vec!["person".to_string()]);
        assert_eq!(labels.label_name(0), "person");
        assert_eq!(labels.label_name(5), "unknown");
        assert_eq!(labels.label_name(-1), "unknown");
        assert_eq!(labels.label_index("person"), Some(0));
        assert_eq!(labels.label_index("bus"), None);
    }
}
