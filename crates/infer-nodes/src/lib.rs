//! Worker layer that turns raw inference outputs into completed frame
//! results.
//!
//! The crate is split into focused submodules:
//! - `config`: node settings parsed from JSON with validated defaults.
//! - `detection`: the detection output stage (post-process, rectify,
//!   completion tracking).
//! - `feature`: the embedding output stage attaching encoded features.
//! - `rectify`: coordinate un-transformation, clipping and filtering.
//! - `tracker`: per-frame region completion bookkeeping.
//! - `worker`: channel-driven worker threads hosting the stages.
//! - `watchdog`: heartbeat monitoring for stalled stages.
//! - `telemetry`: tracing subscriber and Prometheus recorder setup.

pub mod config;
pub mod detection;
pub mod feature;
pub mod rectify;
pub mod telemetry;
pub mod tracker;
pub mod watchdog;
pub mod worker;

pub use config::{NodeConfig, TelemetryOptions};
pub use detection::DetectionOutputStage;
pub use feature::FeatureStage;
pub use rectify::GeometryRectifier;
pub use tracker::CompletionTracker;
pub use watchdog::{HealthComponent, PipelineHealth, WatchdogState, spawn_watchdog};
pub use worker::{spawn_detection_worker, spawn_feature_worker};
