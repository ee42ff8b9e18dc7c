//! Shared data model for the detection post-processing pipeline.
//!
//! Raw engine outputs enter as [`OutputBlob`] tensors grouped in a
//! [`BlobMap`], are rewritten in place by the post-processing stages,
//! and leave the pipeline as [`FrameResult`] values carrying the
//! rectified regions of interest.

pub mod blob;
pub mod frame;
pub mod transform;

pub use blob::{BlobError, BlobMap, OutputBlob};
pub use frame::{
    EncodedFeature, FrameKey, FrameResult, InferenceOutput, Rect, RegionMeta, RoiRecord,
};
pub use transform::TransformInfo;
