use serde::Deserialize;

/// Geometry of the pre-processing applied to a frame before inference.
///
/// The flags record which steps ran; the offsets and scales carry the
/// numbers needed to map detection coordinates back onto the source
/// frame. A default value means no transformation took place.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransformInfo {
    pub resized: bool,
    pub resize_scale_x: f32,
    pub resize_scale_y: f32,
    pub cropped: bool,
    pub crop_x: f32,
    pub crop_y: f32,
    pub padded: bool,
    pub padding_x: f32,
    pub padding_y: f32,
    pub before_width: f32,
    pub before_height: f32,
}

impl TransformInfo {
    /// True when any pre-processing step has to be undone.
    pub fn was_transformation(&self) -> bool {
        self.resized || self.cropped || self.padded
    }
}
