use std::str::FromStr;

use crate::error::PostProcError;

/// Scalar operator applied to the gathered values of one output key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MappingOp {
    Identity,
    Sigmoid,
    YoloMultiply,
    Argmax,
    Argmin,
    Max,
    Min,
}

impl FromStr for MappingOp {
    type Err = PostProcError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "identity" => Ok(Self::Identity),
            "sigmoid" => Ok(Self::Sigmoid),
            "yolo_multiply" => Ok(Self::YoloMultiply),
            "argmax" => Ok(Self::Argmax),
            "argmin" => Ok(Self::Argmin),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            other => Err(PostProcError::UnknownOperator(other.to_string())),
        }
    }
}

impl MappingOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Sigmoid => "sigmoid",
            Self::YoloMultiply => "yolo_multiply",
            Self::Argmax => "argmax",
            Self::Argmin => "argmin",
            Self::Max => "max",
            Self::Min => "min",
        }
    }

    /// Applies the operator to `values` in place. Reducing operators
    /// leave a single element behind.
    pub fn apply(&self, values: &mut Vec<f32>) -> Result<(), PostProcError> {
        let min_operands = if *self == Self::YoloMultiply { 2 } else { 1 };
        if values.len() < min_operands {
            return Err(PostProcError::OperandCount {
                op: self.name(),
                min: min_operands,
                count: values.len(),
            });
        }
        match self {
            Self::Identity => {}
            Self::Sigmoid => {
                for value in values.iter_mut() {
                    *value = sigmoid(*value);
                }
            }
            Self::YoloMultiply => {
                let best = values[1..].iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let merged = values[0] * best;
                values.clear();
                values.push(merged);
            }
            Self::Argmax => {
                let index = argmax(values) as f32;
                reduce(values, index);
            }
            Self::Argmin => {
                let index = argmin(values) as f32;
                reduce(values, index);
            }
            Self::Max => {
                let best = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                reduce(values, best);
            }
            Self::Min => {
                let best = values.iter().copied().fold(f32::INFINITY, f32::min);
                reduce(values, best);
            }
        }
        Ok(())
    }
}

fn reduce(values: &mut Vec<f32>, result: f32) {
    values.clear();
    values.push(result);
}

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Index of the first maximum element.
pub(crate) fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (index, &value) in values.iter().enumerate() {
        if value > values[best] {
            best = index;
        }
    }
    best
}

/// Index of the first minimum element.
pub(crate) fn argmin(values: &[f32]) -> usize {
    let mut best = 0;
    for (index, &value) in values.iter().enumerate() {
        if value < values[best] {
            best = index;
        }
    }
    best
}
