//! Feature extraction output stage.
//!
//! Each batch entry of a feature model corresponds to one detected
//! region. The stage encodes the matching output vector and attaches
//! it to the region's ROI record, then reassembles frames with the
//! same completion accounting as the detection stage.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use anyhow::Context;
use det_post::{FeatureEncoder, FeatureProcDesc};
use infer_data::{EncodedFeature, FrameKey, FrameResult, InferenceOutput};
use tracing::warn;

use crate::detection::PendingFrame;
use crate::tracker::CompletionTracker;

/// Layer name an encoder binds to when the description names none.
const ANY_LAYER: &str = "ANY";

/// Per-worker feature stage state.
pub struct FeatureStage {
    encoders: BTreeMap<String, FeatureEncoder>,
    tracker: CompletionTracker,
    pending: HashMap<FrameKey, PendingFrame>,
}

impl FeatureStage {
    /// Builds the per-layer encoders from the shared parsed feature
    /// description entries.
    pub fn new(descs: &[FeatureProcDesc]) -> anyhow::Result<Self> {
        let mut encoders = BTreeMap::new();
        for desc in descs {
            let encoder = FeatureEncoder::from_desc(desc)
                .with_context(|| format!("invalid feature entry for layer {}", desc.layer_name))?;
            encoders.insert(desc.layer_name.clone(), encoder);
        }
        Ok(Self { encoders, tracker: CompletionTracker::new(), pending: HashMap::new() })
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.len()
    }

    /// Processes one engine output and returns every frame the output
    /// completed, in completion order.
    ///
    /// Output layers without a registered encoder are skipped with a
    /// warning, as are batch entries that lost their source ROI.
    pub fn handle_output(&mut self, output: &mut InferenceOutput) -> Vec<FrameResult> {
        let started = Instant::now();
        let mut completed = Vec::new();
        let InferenceOutput { blobs, regions } = output;

        for (batch_idx, region) in regions.iter_mut().enumerate() {
            self.tracker.put(region.key);

            let mut roi = region.roi.take();
            match roi.as_mut() {
                Some(record) => {
                    for (layer, blob) in blobs.iter_mut() {
                        let encoder = self
                            .encoders
                            .get(layer)
                            .or_else(|| self.encoders.get(ANY_LAYER));
                        let Some(encoder) = encoder else {
                            warn!(layer = %layer, "no feature processor for output layer");
                            continue;
                        };
                        let sample = match blob.sample_mut(batch_idx) {
                            Ok(sample) => sample,
                            Err(err) => {
                                warn!(layer = %layer, "skipping output layer: {err}");
                                continue;
                            }
                        };
                        let len = sample.len();
                        let data = encoder.encode(sample);
                        record.feature = Some(EncodedFeature {
                            data,
                            len,
                            method: encoder.method().name().to_string(),
                        });
                    }
                }
                None => warn!(
                    "batch entry {} of frame {} carries no source roi",
                    batch_idx, region.key.frame_id
                ),
            }

            let pending = self.pending.entry(region.key).or_insert_with(|| PendingFrame {
                width: region.frame_width,
                height: region.frame_height,
                rois: Vec::new(),
            });
            if let Some(record) = roi {
                pending.rois.push(record);
            }

            if self.tracker.is_completed(region.key, region.region_count) {
                self.tracker.erase(region.key);
                if let Some(frame) = self.pending.remove(&region.key) {
                    completed.push(FrameResult::new(
                        region.key,
                        frame.width,
                        frame.height,
                        frame.rois,
                    ));
                    metrics::counter!("infer_frames_emitted_total", "stage" => "feature")
                        .increment(1);
                }
            }
        }

        metrics::gauge!("infer_pending_frames", "stage" => "feature")
            .set(self.pending.len() as f64);
        metrics::histogram!("infer_stage_latency_seconds", "stage" => "feature")
            .record(started.elapsed().as_secs_f64());
        completed
    }
}
