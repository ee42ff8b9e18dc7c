//! Layer decoding: splitting a raw output buffer into candidate views.

use crate::error::PostProcError;
use crate::model_desc::{BoxRecordLayout, ModelOutputDesc, OutputLayout};

/// Batch id value that marks the end of valid records.
pub const END_OF_BATCH: f32 = -1.0;

/// Splits one layer buffer into per-candidate views.
///
/// Layout `B` yields one fixed-size record per surviving candidate,
/// filtered by batch id and confidence. The anchor layouts pass the
/// whole buffer through as a single view for the anchor processor to
/// expand.
pub fn decode_layer<'a>(
    data: &'a mut [f32],
    desc: &ModelOutputDesc,
    target_batch: usize,
) -> Result<Vec<&'a mut [f32]>, PostProcError> {
    let format = desc.require_detection()?;
    match format.layout {
        OutputLayout::B => Ok(decode_records(
            data,
            &format.record,
            desc.num_classes(),
            desc.conf_thresh,
            target_batch,
        )),
        OutputLayout::BCxCy | OutputLayout::CxCyB => Ok(vec![data]),
    }
}

fn decode_records<'a>(
    data: &'a mut [f32],
    record: &BoxRecordLayout,
    num_classes: usize,
    conf_thresh: f32,
    target_batch: usize,
) -> Vec<&'a mut [f32]> {
    let mut views = Vec::new();
    let target = target_batch as f32;
    for candidate in data.chunks_exact_mut(record.size) {
        if let Some(batch_index) = record.batchid_index {
            let batch_id = candidate[batch_index];
            if batch_id == END_OF_BATCH {
                break;
            }
            if batch_id != target {
                continue;
            }
        }
        let mut confidence = 1.0;
        if let Some(index) = record.confidence_index {
            confidence = candidate[index];
            if confidence < conf_thresh {
                continue;
            }
        }
        if let Some(first) = record.first_class_prob_index {
            let class_probs = &candidate[first..first + num_classes];
            let best = class_probs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            confidence *= best;
            if confidence < conf_thresh {
                continue;
            }
        }
        views.push(candidate);
    }
    views
}
