//! Detection output stage.
//!
//! Consumes raw engine outputs batch entry by batch entry, runs the
//! model's post-processing chain, rectifies the surviving boxes into
//! frame coordinates and assembles completed frames once every batch
//! entry of a frame has been accounted for.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::Context;
use det_post::{DetectionPostProcessor, ModelProcConfig, ProcessorRegistry, parse_detections};
use infer_data::{FrameKey, FrameResult, InferenceOutput, RoiRecord};
use tracing::{debug, error};

use crate::config::NodeConfig;
use crate::rectify::GeometryRectifier;
use crate::tracker::CompletionTracker;

/// Accumulated regions of a frame still waiting for batch entries.
#[derive(Debug)]
pub(crate) struct PendingFrame {
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) rois: Vec<RoiRecord>,
}

/// Per-worker detection stage state.
pub struct DetectionOutputStage {
    post: DetectionPostProcessor,
    rectifier: GeometryRectifier,
    tracker: CompletionTracker,
    pending: HashMap<FrameKey, PendingFrame>,
}

impl DetectionOutputStage {
    /// Builds the stage from the shared parsed model description and
    /// the node configuration. The description is snapshotted into the
    /// processor chain, so the stage holds no reference back into it.
    pub fn new(
        model_proc: &ModelProcConfig,
        config: &NodeConfig,
        registry: &ProcessorRegistry,
    ) -> anyhow::Result<Self> {
        let rectifier = GeometryRectifier::new(
            config.threshold,
            config.filter_labels.clone(),
            config.filter_region_threshold,
            config.max_roi,
        );
        let post = DetectionPostProcessor::new(
            model_proc.clone(),
            registry,
            config.threshold,
            config.max_roi,
        )
        .context("failed to build post-processing chain")?;
        Ok(Self {
            post,
            rectifier,
            tracker: CompletionTracker::new(),
            pending: HashMap::new(),
        })
    }

    /// Processes one engine output and returns every frame the output
    /// completed, in completion order.
    ///
    /// A failed batch entry contributes no regions but still counts
    /// towards its frame's completion, so one bad entry cannot stall
    /// the rest of the frame.
    pub fn handle_output(&mut self, output: &mut InferenceOutput) -> Vec<FrameResult> {
        let started = Instant::now();
        let mut completed = Vec::new();
        let InferenceOutput { blobs, regions } = output;

        for (batch_idx, region) in regions.iter().enumerate() {
            self.tracker.put(region.key);

            let parsed =
                self.post.run(blobs, batch_idx).and_then(|text| parse_detections(&text));
            let rois = match parsed {
                Ok(objects) => self.rectifier.rectify(
                    objects,
                    &self.post.desc().labels,
                    region.frame_width,
                    region.frame_height,
                    region.transform.as_ref(),
                    region.filter_region,
                ),
                Err(err) => {
                    error!(
                        stream = region.key.stream_id,
                        frame = region.key.frame_id,
                        "post-processing failed: {err}"
                    );
                    metrics::counter!("infer_postproc_failures_total").increment(1);
                    Vec::new()
                }
            };
            if rois.is_empty() {
                debug!(
                    "nothing detected on frame {} of stream {}",
                    region.key.frame_id, region.key.stream_id
                );
            }
            metrics::counter!("infer_detections_total").increment(rois.len() as u64);

            let pending = self.pending.entry(region.key).or_insert_with(|| PendingFrame {
                width: region.frame_width,
                height: region.frame_height,
                rois: Vec::new(),
            });
            pending.rois.extend(rois);

            if self.tracker.is_completed(region.key, region.region_count) {
                self.tracker.erase(region.key);
                if let Some(frame) = self.pending.remove(&region.key) {
                    completed.push(FrameResult::new(
                        region.key,
                        frame.width,
                        frame.height,
                        frame.rois,
                    ));
                    metrics::counter!("infer_frames_emitted_total", "stage" => "detection")
                        .increment(1);
                }
            }
        }

        metrics::gauge!("infer_pending_frames", "stage" => "detection")
            .set(self.pending.len() as f64);
        metrics::histogram!("infer_stage_latency_seconds", "stage" => "detection")
            .record(started.elapsed().as_secs_f64());
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infer_data::{BlobMap, OutputBlob, RegionMeta};
    use serde_json::json;

    fn model_doc() -> String {
        json!({
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
                "process": [],
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
        .to_string()
    }

    fn stage(config: &NodeConfig) -> DetectionOutputStage {
        let model_proc = ModelProcConfig::from_json(&model_doc()).unwrap();
        let registry = ProcessorRegistry::with_builtins();
        DetectionOutputStage::new(&model_proc, config, &registry).unwrap()
    }

    fn region(key: FrameKey, region_count: u32) -> RegionMeta {
        RegionMeta {
            key,
            region_count,
            frame_width: 640,
            frame_height: 480,
            transform: None,
            filter_region: None,
            roi: None,
        }
    }

    #[test]
    fn emits_a_completed_frame_with_rectified_rois() {
        let config = NodeConfig { threshold: 0.5, ..NodeConfig::default() };
        let mut stage = stage(&config);

        let mut blobs = BlobMap::new();
        blobs.insert(
            "detection_out".to_string(),
            OutputBlob::new(
                "detection_out",
                vec![1, 14],
                vec![
                    0.0, 0.0, 0.9, 0.1, 0.2, 0.5, 0.25, // person
                    0.0, 2.0, 0.8, 0.5, 0.5, 0.2, 0.2, // car
                ],
            ),
        );
        let mut output = InferenceOutput {
            blobs,
            regions: vec![region(FrameKey::new(1, 7), 1)],
        };

        let frames = stage.handle_output(&mut output);
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.key(), FrameKey::new(1, 7));
        assert_eq!((frame.width, frame.height), (640, 480));
        assert_eq!(frame.rois.len(), 2);

        let person = &frame.rois[0];
        assert_eq!((person.x, person.y, person.width, person.height), (64, 96, 320, 120));
        assert_eq!(person.label, "person");
        assert_eq!(person.label_id, 0);

        let car = &frame.rois[1];
        assert_eq!((car.x, car.y, car.width, car.height), (320, 240, 128, 96));
        assert_eq!(car.label, "car");
    }

    #[test]
    fn frames_complete_only_when_all_batch_entries_arrived() {
        let config = NodeConfig { threshold: 0.5, ..NodeConfig::default() };
        let mut stage = stage(&config);
        let split = FrameKey::new(1, 1);
        let whole = FrameKey::new(1, 2);

        // First output carries one of two entries for `split` and the
        // only entry for `whole`.
        let mut blobs = BlobMap::new();
        blobs.insert(
            "detection_out".to_string(),
            OutputBlob::new(
                "detection_out",
                vec![1, 14],
                vec![
                    0.0, 0.0, 0.9, 0.1, 0.1, 0.2, 0.2, // batch 0, split
                    1.0, 2.0, 0.8, 0.3, 0.3, 0.2, 0.2, // batch 1, whole
                ],
            ),
        );
        let mut output = InferenceOutput {
            blobs,
            regions: vec![region(split, 2), region(whole, 1)],
        };
        let frames = stage.handle_output(&mut output);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].key(), whole);
        assert_eq!(frames[0].rois.len(), 1);
        assert_eq!(frames[0].rois[0].label, "car");

        // Second output completes `split` with its accumulated regions.
        let mut blobs = BlobMap::new();
        blobs.insert(
            "detection_out".to_string(),
            OutputBlob::new(
                "detection_out",
                vec![1, 7],
                vec![0.0, 2.0, 0.7, 0.5, 0.5, 0.1, 0.1],
            ),
        );
        let mut output = InferenceOutput { blobs, regions: vec![region(split, 2)] };
        let frames = stage.handle_output(&mut output);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].key(), split);
        assert_eq!(frames[0].rois.len(), 2);
        assert_eq!(frames[0].rois[0].label, "person");
        assert_eq!(frames[0].rois[1].label, "car");
    }

    #[test]
    fn an_empty_output_still_completes_its_frame() {
        let config = NodeConfig { threshold: 0.5, ..NodeConfig::default() };
        let mut stage = stage(&config);
        let key = FrameKey::new(4, 11);

        let mut output = InferenceOutput { blobs: BlobMap::new(), regions: vec![region(key, 1)] };
        let frames = stage.handle_output(&mut output);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].key(), key);
        assert!(frames[0].rois.is_empty());
    }

    #[test]
    fn rejects_an_unregistered_processor() {
        let mut doc: serde_json::Value = serde_json::from_str(&model_doc()).unwrap();
        doc["post_proc_output"]["process"] = json!([{ "name": "does_not_exist" }]);
        let model_proc = ModelProcConfig::from_json(&doc.to_string()).unwrap();
        let config = NodeConfig::default();
        let registry = ProcessorRegistry::with_builtins();
        assert!(DetectionOutputStage::new(&model_proc, &config, &registry).is_err());
    }
}
