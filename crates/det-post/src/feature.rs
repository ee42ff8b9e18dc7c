//! Feature (embedding) model post-processing.
//!
//! Feature models emit one float vector per region. The encoder either
//! quantizes it to int8 after L2 normalization or passes the raw bytes
//! through, and always serializes the result as base64.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::PostProcError;
use crate::model_desc::REQUIRED_TOP_LEVEL;

/// How a feature vector is encoded before serialization.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EncodeMethod {
    /// L2-normalize, scale and round into the int8 range.
    Quantization { scale: f32 },
    /// Raw little-endian float bytes.
    Identity,
}

impl EncodeMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Quantization { .. } => "quantization",
            Self::Identity => "identity",
        }
    }
}

/// One `post_proc_output` entry of a feature model description.
#[derive(Clone, Debug)]
pub struct FeatureProcDesc {
    pub layer_name: String,
    pub converter: String,
    pub method: String,
    pub quantization_scale: Option<f32>,
}

fn default_layer() -> String {
    "ANY".to_string()
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFeatureEntry {
    #[serde(default = "default_layer")]
    layer_name: String,
    #[serde(default)]
    converter: String,
    #[serde(default)]
    method: String,
    #[serde(default = "empty_object")]
    params: Value,
}

/// Parses the `post_proc_output` entries of a feature model
/// description. Unknown entry keys are rejected.
pub fn parse_feature_proc(text: &str) -> Result<Vec<FeatureProcDesc>, PostProcError> {
    let doc: Value = serde_json::from_str(text)?;
    for key in REQUIRED_TOP_LEVEL {
        if doc.get(key).is_none() {
            return Err(PostProcError::MissingField(key.to_string()));
        }
    }
    let entries: Vec<RawFeatureEntry> =
        serde_json::from_value(doc.get("post_proc_output").cloned().unwrap_or_default())?;
    let mut descs = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.converter.is_empty() {
            warn!(layer = %entry.layer_name, "feature entry has no converter set");
        }
        let quantization_scale = entry
            .params
            .get("quantization_scale")
            .and_then(Value::as_f64)
            .map(|scale| scale as f32);
        descs.push(FeatureProcDesc {
            layer_name: entry.layer_name,
            converter: entry.converter,
            method: entry.method,
            quantization_scale,
        });
    }
    Ok(descs)
}

/// Encodes feature vectors for transport.
#[derive(Clone, Copy, Debug)]
pub struct FeatureEncoder {
    method: EncodeMethod,
}

impl FeatureEncoder {
    pub fn new(method: EncodeMethod) -> Self {
        Self { method }
    }

    /// Builds the encoder from a parsed description entry.
    pub fn from_desc(desc: &FeatureProcDesc) -> Result<Self, PostProcError> {
        if desc.converter != "embedding" {
            return Err(PostProcError::UnknownConverter(desc.converter.clone()));
        }
        let method = match desc.method.as_str() {
            "quantization" => {
                let scale = desc.quantization_scale.ok_or_else(|| {
                    PostProcError::MissingField("params.quantization_scale".to_string())
                })?;
                EncodeMethod::Quantization { scale }
            }
            "identity" => EncodeMethod::Identity,
            other => return Err(PostProcError::UnknownMethod(other.to_string())),
        };
        Ok(Self { method })
    }

    pub fn method(&self) -> EncodeMethod {
        self.method
    }

    /// Encodes the vector to base64. Quantization rescales the data in
    /// place before rounding.
    pub fn encode(&self, data: &mut [f32]) -> String {
        match self.method {
            EncodeMethod::Quantization { scale } => {
                let bytes: Vec<u8> =
                    quantize_to_i8(data, scale).into_iter().map(|value| value as u8).collect();
                STANDARD.encode(bytes)
            }
            EncodeMethod::Identity => {
                let mut bytes = Vec::with_capacity(data.len() * 4);
                for value in data.iter() {
                    bytes.extend_from_slice(&value.to_le_bytes());
                }
                STANDARD.encode(bytes)
            }
        }
    }
}

/// L2-normalizes and scales the vector in place, then rounds each
/// element into the int8 range. A zero vector quantizes to zeros.
fn quantize_to_i8(data: &mut [f32], scale: f32) -> Vec<i8> {
    let norm = data.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vec![0; data.len()];
    }
    let factor = scale / norm;
    let mut quantized = Vec::with_capacity(data.len());
    for value in data.iter_mut() {
        *value *= factor;
        quantized.push(value.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8);
    }
    quantized
}
