use thiserror::Error;

/// Errors surfaced by model description parsing and post-processing.
#[derive(Debug, Error)]
pub enum PostProcError {
    #[error("unknown model output layout: {0} (supported: B, BCxCy, CxCyB)")]
    UnknownLayout(String),
    #[error("unknown bbox format: {0} (supported: CENTER_SIZE, CORNER_SIZE, CORNER)")]
    UnknownBoxFormat(String),
    #[error("unknown output field type: {0} (supported: FLOAT_ARRAY, FLOAT, INT)")]
    UnknownFieldType(String),
    #[error("unknown box processor: {0}")]
    UnknownProcessor(String),
    #[error("unknown mapping operator: {0}")]
    UnknownOperator(String),
    #[error("unknown feature converter: {0} (supported: embedding)")]
    UnknownConverter(String),
    #[error("unknown feature encode method: {0} (supported: quantization, identity)")]
    UnknownMethod(String),
    #[error("missing required model description field: {0}")]
    MissingField(String),
    #[error("invalid model description: {0}")]
    InvalidDescription(String),
    #[error("field index {index} out of bounds for record of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("output key {key}: expected {expected} value(s), got {actual}")]
    FieldArity { key: String, expected: &'static str, actual: usize },
    #[error("output key {key}: {value} is not an integral value")]
    NotIntegral { key: String, value: f32 },
    #[error("output key {0} is not declared in the output format")]
    UnregisteredKey(String),
    #[error("operator {op} requires at least {min} input value(s), got {count}")]
    OperandCount { op: &'static str, min: usize, count: usize },
    #[error("malformed detection result field: {0}")]
    BadResultField(String),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Blob(#[from] infer_data::BlobError),
}
