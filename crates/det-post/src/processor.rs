//! Box processors that rewrite candidate records between decode and
//! output mapping.
//!
//! Every processor works on the same currency: a vector of mutable
//! record views into the layer buffers. Processors may rewrite fields
//! in place and may drop candidates, but never change the float length
//! of a record. The registry maps processor names from the model
//! description to factories, so custom processors can be added next to
//! the built-in `bbox_transform`, `anchor_transform` and `NMS`.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::Value;

use crate::error::PostProcError;
use crate::model_desc::{BoxFormat, BoxRecordLayout, ModelOutputDesc, OutputLayout};
use crate::ops::{argmax, sigmoid};

/// Layer selector for a processor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessorScope {
    /// Runs during the per-layer pass on every layer.
    Any,
    /// Runs once on the merged candidates of all layers.
    All,
    /// Runs on candidates of one named layer only.
    Layer(String),
}

impl ProcessorScope {
    pub fn parse(value: &str) -> Self {
        match value {
            "ANY" => Self::Any,
            "ALL" => Self::All,
            other => Self::Layer(other.to_string()),
        }
    }

    /// True when the processor runs during the per-layer pass of `layer`.
    pub fn matches_layer(&self, layer: &str) -> bool {
        match self {
            Self::Any => true,
            Self::All => false,
            Self::Layer(name) => name == layer,
        }
    }

    /// True when the processor runs on the merged candidate set.
    pub fn matches_union(&self) -> bool {
        matches!(self, Self::All)
    }
}

/// A transformation over candidate box views.
pub trait BoxProcessor: Send + Sync {
    fn name(&self) -> &str;
    fn scope(&self) -> &ProcessorScope;
    fn apply<'a>(&self, candidates: &mut Vec<&'a mut [f32]>) -> Result<(), PostProcError>;
}

type ProcessorFactory =
    dyn Fn(&ModelOutputDesc, &Value) -> Result<Box<dyn BoxProcessor>, PostProcError> + Send + Sync;

/// Name-indexed factories for box processors.
pub struct ProcessorRegistry {
    factories: HashMap<String, Box<ProcessorFactory>>,
}

impl ProcessorRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self { factories: HashMap::new() };
        registry.register("bbox_transform", |desc, params| {
            let processor = BboxTransformProcessor::from_params(desc, params)?;
            Ok(Box::new(processor) as Box<dyn BoxProcessor>)
        });
        registry.register("anchor_transform", |desc, params| {
            let processor = AnchorTransformProcessor::from_params(desc, params)?;
            Ok(Box::new(processor) as Box<dyn BoxProcessor>)
        });
        registry.register("NMS", |desc, params| {
            let processor = NmsProcessor::from_params(desc, params)?;
            Ok(Box::new(processor) as Box<dyn BoxProcessor>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ModelOutputDesc, &Value) -> Result<Box<dyn BoxProcessor>, PostProcError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn build(
        &self,
        name: &str,
        desc: &ModelOutputDesc,
        params: &Value,
    ) -> Result<Box<dyn BoxProcessor>, PostProcError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PostProcError::UnknownProcessor(name.to_string()))?;
        factory(desc, params)
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn default_scale() -> f32 {
    1.0
}

fn default_layer() -> String {
    "ANY".to_string()
}

#[derive(Deserialize)]
struct BboxTransformParams {
    target_type: String,
    #[serde(default = "default_scale")]
    scale_w: f32,
    #[serde(default = "default_scale")]
    scale_h: f32,
    #[serde(default)]
    clip_normalized_rect: bool,
    #[serde(default = "default_layer")]
    apply_to_layer: String,
}

/// Rescales box coordinates and converts between box formats.
pub struct BboxTransformProcessor {
    scope: ProcessorScope,
    record: BoxRecordLayout,
    target: BoxFormat,
    scale_w: f32,
    scale_h: f32,
    clip: bool,
}

impl BboxTransformProcessor {
    pub fn from_params(desc: &ModelOutputDesc, params: &Value) -> Result<Self, PostProcError> {
        let params: BboxTransformParams = serde_json::from_value(params.clone())?;
        let format = desc.require_detection()?;
        Ok(Self {
            scope: ProcessorScope::parse(&params.apply_to_layer),
            record: format.record.clone(),
            target: params.target_type.parse()?,
            scale_w: params.scale_w,
            scale_h: params.scale_h,
            clip: params.clip_normalized_rect,
        })
    }
}

impl BoxProcessor for BboxTransformProcessor {
    fn name(&self) -> &str {
        "bbox_transform"
    }

    fn scope(&self) -> &ProcessorScope {
        &self.scope
    }

    fn apply<'a>(&self, candidates: &mut Vec<&'a mut [f32]>) -> Result<(), PostProcError> {
        let [ix, iy, iw, ih] = self.record.location_index;
        for view in candidates.iter_mut() {
            view[ix] /= self.scale_w;
            view[iy] /= self.scale_h;
            view[iw] /= self.scale_w;
            view[ih] /= self.scale_h;
            if self.record.box_format != self.target {
                convert_format(view, &self.record.location_index, self.record.box_format, self.target);
            }
            if self.clip {
                for &index in &self.record.location_index {
                    view[index] = view[index].clamp(0.0, 1.0);
                }
            }
        }
        Ok(())
    }
}

/// Converts the location fields between box formats, via CORNER_SIZE.
fn convert_format(view: &mut [f32], location: &[usize; 4], from: BoxFormat, to: BoxFormat) {
    let [ix, iy, iw, ih] = *location;
    match from {
        BoxFormat::CenterSize => {
            view[ix] -= view[iw] / 2.0;
            view[iy] -= view[ih] / 2.0;
        }
        BoxFormat::Corner => {
            view[iw] -= view[ix];
            view[ih] -= view[iy];
        }
        BoxFormat::CornerSize => {}
    }
    match to {
        BoxFormat::CenterSize => {
            view[ix] += view[iw] / 2.0;
            view[iy] += view[ih] / 2.0;
        }
        BoxFormat::Corner => {
            view[iw] += view[ix];
            view[ih] += view[iy];
        }
        BoxFormat::CornerSize => {}
    }
}

#[derive(Deserialize)]
struct AnchorTransformParams {
    anchors: Vec<f32>,
    bbox_prediction: RawBboxPrediction,
    out_feature: Vec<f32>,
    #[serde(default)]
    output_sigmoid_activation: bool,
    #[serde(default)]
    clip_normalized_rect: bool,
    #[serde(default = "default_layer")]
    apply_to_layer: String,
}

#[derive(Deserialize)]
struct RawBboxPrediction {
    pred_bbox_xy: RawXyPrediction,
    pred_bbox_wh: RawWhPrediction,
}

#[derive(Deserialize)]
struct RawXyPrediction {
    factor: f32,
    grid_offset: f32,
    #[serde(default)]
    scale_w: Option<f32>,
    #[serde(default)]
    scale_h: Option<f32>,
}

#[derive(Deserialize)]
struct RawWhPrediction {
    factor: f32,
    transform: String,
    scale_w: f32,
    scale_h: f32,
}

#[derive(Clone, Copy)]
struct XyPrediction {
    factor: f32,
    grid_offset: f32,
    scale_w: f32,
    scale_h: f32,
}

#[derive(Clone, Copy)]
struct WhPrediction {
    factor: f32,
    transform: WhTransform,
    scale_w: f32,
    scale_h: f32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WhTransform {
    Exponential,
    Square,
}

impl WhTransform {
    fn parse(value: &str) -> Result<Self, PostProcError> {
        match value {
            "exponential" => Ok(Self::Exponential),
            "square" => Ok(Self::Square),
            other => Err(PostProcError::InvalidDescription(format!(
                "unknown bbox transform function: {other} (supported: exponential, square)"
            ))),
        }
    }

    fn apply(&self, value: f32) -> f32 {
        match self {
            Self::Exponential => value.exp(),
            Self::Square => value * value,
        }
    }
}

/// Memory order of the anchor grid inside a layer buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum GridOrder {
    /// `BCxCy`: one contiguous plane per record field.
    FieldMajor,
    /// `CxCyB`: one contiguous record per grid cell.
    CellMajor,
}

/// Decodes anchor-grid predictions into plain box records.
///
/// Surviving records are written back over the start of the layer
/// buffer and the candidate views re-split from there, so downstream
/// processors see ordinary `CORNER_SIZE` records.
pub struct AnchorTransformProcessor {
    scope: ProcessorScope,
    order: GridOrder,
    record: BoxRecordLayout,
    num_classes: usize,
    conf_thresh: f32,
    anchors: Vec<(f32, f32)>,
    feature_w: usize,
    feature_h: usize,
    xy: XyPrediction,
    wh: WhPrediction,
    sigmoid_activation: bool,
    clip: bool,
}

impl AnchorTransformProcessor {
    pub fn from_params(desc: &ModelOutputDesc, params: &Value) -> Result<Self, PostProcError> {
        let params: AnchorTransformParams = serde_json::from_value(params.clone())?;
        let format = desc.require_detection()?;
        let order = match format.layout {
            OutputLayout::BCxCy => GridOrder::FieldMajor,
            OutputLayout::CxCyB => GridOrder::CellMajor,
            OutputLayout::B => {
                return Err(PostProcError::InvalidDescription(
                    "anchor_transform requires an anchor grid layout (BCxCy or CxCyB)".to_string(),
                ));
            }
        };
        let record = format.record.clone();
        if record.box_format != BoxFormat::CenterSize {
            return Err(PostProcError::InvalidDescription(
                "anchor_transform only supports bbox_format CENTER_SIZE".to_string(),
            ));
        }
        if record.confidence_index.is_none() && record.first_class_prob_index.is_none() {
            return Err(PostProcError::InvalidDescription(
                "anchor_transform needs confidence_index or first_class_prob_index".to_string(),
            ));
        }
        if params.out_feature.len() != 2 {
            return Err(PostProcError::InvalidDescription(format!(
                "out_feature must hold 2 entries, got {}",
                params.out_feature.len()
            )));
        }
        if params.anchors.is_empty() || params.anchors.len() % 2 != 0 {
            return Err(PostProcError::InvalidDescription(
                "anchors must hold width/height pairs".to_string(),
            ));
        }
        let anchors = params
            .anchors
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
            .collect();
        let raw_xy = params.bbox_prediction.pred_bbox_xy;
        let raw_wh = params.bbox_prediction.pred_bbox_wh;
        Ok(Self {
            scope: ProcessorScope::parse(&params.apply_to_layer),
            order,
            record,
            num_classes: desc.num_classes(),
            conf_thresh: desc.conf_thresh,
            anchors,
            feature_w: params.out_feature[0] as usize,
            feature_h: params.out_feature[1] as usize,
            xy: XyPrediction {
                factor: raw_xy.factor,
                grid_offset: raw_xy.grid_offset,
                scale_w: raw_xy.scale_w.unwrap_or(params.out_feature[0]),
                scale_h: raw_xy.scale_h.unwrap_or(params.out_feature[1]),
            },
            wh: WhPrediction {
                factor: raw_wh.factor,
                transform: WhTransform::parse(&raw_wh.transform)?,
                scale_w: raw_wh.scale_w,
                scale_h: raw_wh.scale_h,
            },
            sigmoid_activation: params.output_sigmoid_activation,
            clip: params.clip_normalized_rect,
        })
    }

    fn grid_index(&self, field: usize, anchor: usize, cell_x: usize, cell_y: usize) -> usize {
        let feature_size = self.feature_w * self.feature_h;
        let box_size = self.record.size;
        match self.order {
            GridOrder::FieldMajor => {
                let offset = anchor * box_size * feature_size + cell_y * self.feature_w + cell_x;
                field * feature_size + offset
            }
            GridOrder::CellMajor => {
                let offset = (cell_y * self.feature_w + cell_x) * self.anchors.len() * box_size
                    + anchor * box_size;
                offset + field
            }
        }
    }

    fn activate(&self, value: f32) -> f32 {
        if self.sigmoid_activation { sigmoid(value) } else { value }
    }

    fn clip_value(&self, value: f32) -> f32 {
        if self.clip { value.clamp(0.0, 1.0) } else { value }
    }

    fn decode_grid(&self, data: &[f32]) -> Vec<Vec<f32>> {
        let record = &self.record;
        let size = record.size;
        let [ix, iy, iw, ih] = record.location_index;
        let mut records = Vec::new();
        for (anchor, &(anchor_w, anchor_h)) in self.anchors.iter().enumerate() {
            for cell_x in 0..self.feature_w {
                for cell_y in 0..self.feature_h {
                    let mut confidence = 1.0;
                    if let Some(index) = record.confidence_index {
                        confidence =
                            self.activate(data[self.grid_index(index, anchor, cell_x, cell_y)]);
                        if confidence < self.conf_thresh {
                            continue;
                        }
                    }
                    if let Some(first) = record.first_class_prob_index {
                        let mut best = data[self.grid_index(first, anchor, cell_x, cell_y)];
                        for class in 1..self.num_classes {
                            let prob =
                                data[self.grid_index(first + class, anchor, cell_x, cell_y)];
                            if prob > best {
                                best = prob;
                            }
                        }
                        confidence *= self.activate(best);
                        if confidence < self.conf_thresh {
                            continue;
                        }
                    }

                    let raw_x = self.activate(data[self.grid_index(ix, anchor, cell_x, cell_y)]);
                    let raw_y = self.activate(data[self.grid_index(iy, anchor, cell_x, cell_y)]);
                    let raw_w = self.activate(data[self.grid_index(iw, anchor, cell_x, cell_y)]);
                    let raw_h = self.activate(data[self.grid_index(ih, anchor, cell_x, cell_y)]);

                    let x_center = (cell_x as f32 + raw_x * self.xy.factor + self.xy.grid_offset)
                        / self.xy.scale_w;
                    let y_center = (cell_y as f32 + raw_y * self.xy.factor + self.xy.grid_offset)
                        / self.xy.scale_h;
                    let width =
                        self.wh.transform.apply(raw_w * self.wh.factor) * anchor_w / self.wh.scale_w;
                    let height =
                        self.wh.transform.apply(raw_h * self.wh.factor) * anchor_h / self.wh.scale_h;
                    let corner_x = x_center - width / 2.0;
                    let corner_y = y_center - height / 2.0;

                    let mut decoded = vec![0.0f32; size];
                    for (field, slot) in decoded.iter_mut().enumerate() {
                        *slot = if field == ix {
                            self.clip_value(corner_x)
                        } else if field == iy {
                            self.clip_value(corner_y)
                        } else if field == iw {
                            self.clip_value(width)
                        } else if field == ih {
                            self.clip_value(height)
                        } else {
                            self.activate(data[self.grid_index(field, anchor, cell_x, cell_y)])
                        };
                    }
                    records.push(decoded);
                }
            }
        }
        records
    }
}

impl BoxProcessor for AnchorTransformProcessor {
    fn name(&self) -> &str {
        "anchor_transform"
    }

    fn scope(&self) -> &ProcessorScope {
        &self.scope
    }

    fn apply<'a>(&self, candidates: &mut Vec<&'a mut [f32]>) -> Result<(), PostProcError> {
        if candidates.is_empty() {
            return Ok(());
        }
        let size = self.record.size;
        let grid_len = self.anchors.len() * size * self.feature_w * self.feature_h;
        let views = std::mem::take(candidates);
        for view in views {
            if view.len() < grid_len {
                return Err(PostProcError::InvalidDescription(format!(
                    "anchor grid needs {grid_len} values, layer holds {}",
                    view.len()
                )));
            }
            let records = self.decode_grid(view);
            let used = records.len() * size;
            for (index, record) in records.iter().enumerate() {
                view[index * size..(index + 1) * size].copy_from_slice(record);
            }
            for chunk in view[..used].chunks_exact_mut(size) {
                candidates.push(chunk);
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct NmsParams {
    iou_threshold: f32,
    #[serde(default)]
    class_agnostic: bool,
    #[serde(default = "default_layer")]
    apply_to_layer: String,
}

struct Proposal {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
    origin: usize,
}

/// Non-maximum suppression over candidate records.
///
/// Class-aware by default: candidates are grouped by predicted label
/// and suppression never crosses groups.
pub struct NmsProcessor {
    scope: ProcessorScope,
    record: BoxRecordLayout,
    num_classes: usize,
    iou_threshold: f32,
    class_agnostic: bool,
}

impl NmsProcessor {
    pub fn from_params(desc: &ModelOutputDesc, params: &Value) -> Result<Self, PostProcError> {
        let params: NmsParams = serde_json::from_value(params.clone())?;
        let format = desc.require_detection()?;
        let record = format.record.clone();
        if record.confidence_index.is_none() && record.first_class_prob_index.is_none() {
            return Err(PostProcError::InvalidDescription(
                "NMS needs confidence_index or first_class_prob_index".to_string(),
            ));
        }
        Ok(Self {
            scope: ProcessorScope::parse(&params.apply_to_layer),
            record,
            num_classes: desc.num_classes(),
            iou_threshold: params.iou_threshold,
            class_agnostic: params.class_agnostic,
        })
    }

    fn proposal(&self, view: &[f32], origin: usize, confidence: f32) -> Proposal {
        let [ix, iy, iw, ih] = self.record.location_index;
        Proposal {
            x: view[ix],
            y: view[iy],
            width: view[iw],
            height: view[ih],
            confidence,
            origin,
        }
    }

    fn suppress_agnostic(&self, candidates: &[&mut [f32]]) -> Vec<usize> {
        let record = &self.record;
        let mut proposals = Vec::with_capacity(candidates.len());
        for (origin, view) in candidates.iter().enumerate() {
            let mut confidence = record.confidence_index.map_or(1.0, |index| view[index]);
            if let Some(first) = record.first_class_prob_index {
                let probs = &view[first..first + self.num_classes];
                confidence *= probs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            }
            proposals.push(self.proposal(view, origin, confidence));
        }
        run_nms(proposals, self.iou_threshold)
    }

    fn suppress_by_class(&self, candidates: &[&mut [f32]]) -> Result<Vec<usize>, PostProcError> {
        let record = &self.record;
        let mut groups: BTreeMap<i32, Vec<Proposal>> = BTreeMap::new();
        if let Some(label_index) = record.predict_label_index {
            for (origin, view) in candidates.iter().enumerate() {
                let label = view[label_index] as i32;
                let confidence = match record.confidence_index {
                    Some(index) => view[index],
                    None => {
                        let first = record
                            .first_class_prob_index
                            .ok_or_else(missing_class_info)?;
                        let index = first + label_index;
                        *view.get(index).ok_or(PostProcError::IndexOutOfBounds {
                            index,
                            len: view.len(),
                        })?
                    }
                };
                groups
                    .entry(label)
                    .or_default()
                    .push(self.proposal(view, origin, confidence));
            }
        } else if let Some(first) = record.first_class_prob_index {
            for (origin, view) in candidates.iter().enumerate() {
                let probs = &view[first..first + self.num_classes];
                let label = argmax(probs);
                let base = record.confidence_index.map_or(1.0, |index| view[index]);
                groups
                    .entry(label as i32)
                    .or_default()
                    .push(self.proposal(view, origin, base * probs[label]));
            }
        } else {
            return Err(missing_class_info());
        }
        let mut keep = Vec::new();
        for proposals in groups.into_values() {
            keep.extend(run_nms(proposals, self.iou_threshold));
        }
        Ok(keep)
    }
}

fn missing_class_info() -> PostProcError {
    PostProcError::InvalidDescription(
        "class-aware NMS requires predict_label_index or first_class_prob_index".to_string(),
    )
}

impl BoxProcessor for NmsProcessor {
    fn name(&self) -> &str {
        "NMS"
    }

    fn scope(&self) -> &ProcessorScope {
        &self.scope
    }

    fn apply<'a>(&self, candidates: &mut Vec<&'a mut [f32]>) -> Result<(), PostProcError> {
        if candidates.len() <= 1 {
            return Ok(());
        }
        let keep = if self.class_agnostic {
            self.suppress_agnostic(candidates)
        } else {
            self.suppress_by_class(candidates)?
        };
        let views = std::mem::take(candidates);
        let mut slots: Vec<Option<&'a mut [f32]>> = views.into_iter().map(Some).collect();
        for index in keep {
            if let Some(view) = slots[index].take() {
                candidates.push(view);
            }
        }
        Ok(())
    }
}

/// Greedy suppression; returns surviving origin indices ordered by
/// descending confidence.
fn run_nms(mut proposals: Vec<Proposal>, iou_threshold: f32) -> Vec<usize> {
    proposals.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut index = 0;
    while index < proposals.len() {
        let mut probe = index + 1;
        while probe < proposals.len() {
            let suppressed = overlap(&proposals[index], &proposals[probe])
                .is_some_and(|value| value > iou_threshold);
            if suppressed {
                proposals.remove(probe);
            } else {
                probe += 1;
            }
        }
        index += 1;
    }
    proposals.into_iter().map(|proposal| proposal.origin).collect()
}

/// Intersection over union, or `None` when the boxes do not intersect.
fn overlap(a: &Proposal, b: &Proposal) -> Option<f32> {
    let inter_w = (a.x + a.width).min(b.x + b.width) - a.x.max(b.x);
    let inter_h = (a.y + a.height).min(b.y + b.height) - a.y.max(b.y);
    if inter_w <= 0.0 || inter_h <= 0.0 {
        return None;
    }
    let inter = inter_w * inter_h;
    Some(inter / (a.width * a.height + b.width * b.height - inter))
}
