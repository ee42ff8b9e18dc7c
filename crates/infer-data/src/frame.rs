use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::blob::BlobMap;
use crate::transform::TransformInfo;

/// Identity of one frame within one stream.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FrameKey {
    pub stream_id: u32,
    pub frame_id: u32,
}

impl FrameKey {
    pub fn new(stream_id: u32, frame_id: u32) -> Self {
        Self { stream_id, frame_id }
    }
}

/// Axis-aligned rectangle in pixel coordinates.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// True for the all-zero rectangle, which stands for "unset".
    pub fn is_zero(&self) -> bool {
        self.x == 0 && self.y == 0 && self.width == 0 && self.height == 0
    }
}

/// Base64 feature blob attached to a region by the feature stage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EncodedFeature {
    pub data: String,
    pub len: usize,
    pub method: String,
}

/// One rectified region of interest.
#[derive(Clone, Debug, Serialize)]
pub struct RoiRecord {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub label: String,
    pub label_id: i32,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<EncodedFeature>,
}

impl RoiRecord {
    pub fn rect(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }
}

/// Descriptor of one batched entry handed to the inference engine.
///
/// Detection batches whole frames, so `region_count` tells how many
/// entries share the same frame key. Feature extraction batches
/// detected regions and carries the record being described in `roi`.
#[derive(Clone, Debug)]
pub struct RegionMeta {
    pub key: FrameKey,
    pub region_count: u32,
    pub frame_width: i32,
    pub frame_height: i32,
    pub transform: Option<TransformInfo>,
    pub filter_region: Option<Rect>,
    pub roi: Option<RoiRecord>,
}

/// Everything the engine hands back for one completed request.
#[derive(Debug, Default)]
pub struct InferenceOutput {
    pub blobs: BlobMap,
    pub regions: Vec<RegionMeta>,
}

/// Final per-frame output of a post-processing stage.
#[derive(Clone, Debug, Serialize)]
pub struct FrameResult {
    pub stream_id: u32,
    pub frame_id: u32,
    pub width: i32,
    pub height: i32,
    pub rois: Vec<RoiRecord>,
    pub timestamp_ms: i64,
}

impl FrameResult {
    pub fn new(key: FrameKey, width: i32, height: i32, rois: Vec<RoiRecord>) -> Self {
        Self {
            stream_id: key.stream_id,
            frame_id: key.frame_id,
            width,
            height,
            rois,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn key(&self) -> FrameKey {
        FrameKey::new(self.stream_id, self.frame_id)
    }
}
