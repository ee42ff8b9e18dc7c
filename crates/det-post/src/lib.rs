//! Model-output post-processing for detection and feature models.
//!
//! The crate turns raw output tensors into serialized detection
//! records: [`model_desc`] parses and validates the model description,
//! [`decode`] splits layer buffers into candidate box views,
//! [`processor`] hosts the box processors that rewrite those views in
//! place, and [`postproc`] drives the whole chain and renders the JSON
//! document consumed downstream. [`feature`] covers the embedding
//! models with quantization and base64 encoding.

pub mod decode;
pub mod error;
pub mod feature;
pub mod format;
pub mod model_desc;
pub mod ops;
pub mod postproc;
pub mod processor;

pub use error::PostProcError;
pub use feature::{EncodeMethod, FeatureEncoder, FeatureProcDesc, parse_feature_proc};
pub use format::{DetectedObject, FieldKind, OutputSchema, RecordBuilder, parse_detections};
pub use model_desc::{
    BoxFormat, BoxRecordLayout, DetectionFormat, FieldMapping, LabelTable, ModelOutputDesc,
    ModelProcConfig, OutputLayout, ProcessorDesc,
};
pub use ops::MappingOp;
pub use postproc::DetectionPostProcessor;
pub use processor::{BoxProcessor, ProcessorRegistry, ProcessorScope};
