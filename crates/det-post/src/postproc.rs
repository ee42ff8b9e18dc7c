//! Driver for the detection post-processing chain.
//!
//! One [`DetectionPostProcessor::run`] call covers a single batch
//! entry: every layer is decoded into candidate views, the per-layer
//! processors rewrite them, the views are merged across layers, the
//! merged-set processors run, and the survivors are mapped into the
//! serialized result document.

use infer_data::BlobMap;

use crate::decode::decode_layer;
use crate::error::PostProcError;
use crate::format::{OutputSchema, RecordBuilder, serialize_records};
use crate::model_desc::{FieldMapping, ModelOutputDesc, ModelProcConfig};
use crate::processor::{BoxProcessor, ProcessorRegistry};

/// Runs decode, processors and output mapping for one model.
pub struct DetectionPostProcessor {
    desc: ModelOutputDesc,
    processors: Vec<Box<dyn BoxProcessor>>,
    schema: OutputSchema,
    mappings: Vec<FieldMapping>,
}

impl DetectionPostProcessor {
    /// Builds the processor chain from a parsed model description.
    ///
    /// `conf_thresh` and `max_roi` come from the node configuration
    /// and override the description defaults before the processors
    /// snapshot them.
    pub fn new(
        mut config: ModelProcConfig,
        registry: &ProcessorRegistry,
        conf_thresh: f32,
        max_roi: usize,
    ) -> Result<Self, PostProcError> {
        config.output.conf_thresh = conf_thresh;
        config.output.max_roi = max_roi;
        let mut processors = Vec::with_capacity(config.processors.len());
        for processor in &config.processors {
            processors.push(registry.build(&processor.name, &config.output, &processor.params)?);
        }
        Ok(Self {
            desc: config.output,
            processors,
            schema: config.schema,
            mappings: config.mappings,
        })
    }

    pub fn desc(&self) -> &ModelOutputDesc {
        &self.desc
    }

    /// Post-processes one batch entry. Returns the serialized result
    /// document, or the empty string when nothing survives.
    ///
    /// The blob map is rewritten in place; raw values of the target
    /// batch are consumed and transformed records left behind.
    pub fn run(&self, blobs: &mut BlobMap, target_batch: usize) -> Result<String, PostProcError> {
        let format = self.desc.require_detection()?;
        let has_batch_id = format.record.batchid_index.is_some();

        let mut union: Vec<&mut [f32]> = Vec::new();
        for (layer, blob) in blobs.iter_mut() {
            let sample_len = blob.sample_len();
            // Layouts with a batch id column keep all batches in one
            // span; the others are sliced per sample.
            let data = if has_batch_id {
                blob.head_mut(sample_len)?
            } else {
                blob.sample_mut(target_batch)?
            };
            let mut candidates = decode_layer(data, &self.desc, target_batch)?;
            if candidates.is_empty() {
                continue;
            }
            for processor in &self.processors {
                if processor.scope().matches_layer(layer) {
                    processor.apply(&mut candidates)?;
                }
            }
            union.append(&mut candidates);
        }

        if union.is_empty() {
            return Ok(String::new());
        }
        for processor in &self.processors {
            if processor.scope().matches_union() {
                processor.apply(&mut union)?;
            }
        }
        self.render(&union)
    }

    fn render(&self, candidates: &[&mut [f32]]) -> Result<String, PostProcError> {
        let mut builder = RecordBuilder::new(&self.schema);
        let mut records = Vec::with_capacity(candidates.len());
        let mut gathered = Vec::new();
        for view in candidates {
            for mapping in &self.mappings {
                gathered.clear();
                for &index in &mapping.indices {
                    let value =
                        view.get(index).copied().ok_or(PostProcError::IndexOutOfBounds {
                            index,
                            len: view.len(),
                        })?;
                    gathered.push(value);
                }
                for op in &mapping.ops {
                    op.apply(&mut gathered)?;
                }
                builder.set(&mapping.key, &gathered)?;
            }
            records.push(builder.finish());
        }
        Ok(serialize_records(records))
    }
}
