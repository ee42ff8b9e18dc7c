//! Geometric rectification of parsed detections.
//!
//! Detections leave the post-processing chain normalized to the model
//! input. This module scales them to frame pixels, undoes the recorded
//! resize/crop/pad chain, clips everything to the frame bounds and
//! applies the label, filter-region and top-K selections.

use det_post::{DetectedObject, LabelTable};
use infer_data::{Rect, RoiRecord, TransformInfo};
use tracing::debug;

/// Turns normalized detections into frame-space ROI records.
pub struct GeometryRectifier {
    conf_thresh: f32,
    filter_labels: Vec<String>,
    filter_region_thresh: f32,
    max_roi: usize,
}

impl GeometryRectifier {
    pub fn new(
        conf_thresh: f32,
        filter_labels: Vec<String>,
        filter_region_thresh: f32,
        max_roi: usize,
    ) -> Self {
        Self { conf_thresh, filter_labels, filter_region_thresh, max_roi }
    }

    /// Rectifies one batch entry's detections into ROI records.
    ///
    /// `width` and `height` are the source frame dimensions; the
    /// transform record, when present, maps coordinates back from the
    /// model input onto that frame. A missing or default transform is
    /// treated as identity.
    pub fn rectify(
        &self,
        objects: Vec<DetectedObject>,
        labels: &LabelTable,
        width: i32,
        height: i32,
        transform: Option<&TransformInfo>,
        filter_region: Option<Rect>,
    ) -> Vec<RoiRecord> {
        if width <= 0 || height <= 0 {
            return Vec::new();
        }

        let mut rois = Vec::with_capacity(objects.len());
        for object in objects {
            let x = object.x * width as f32;
            let y = object.y * height as f32;
            let w = object.w * width as f32;
            let h = object.h * height as f32;

            if object.confidence < self.conf_thresh {
                continue;
            }

            let label = labels.label_name(object.class_id);
            if !self.keeps_label(label) {
                debug!("box ({x:.1}, {y:.1}, {w:.1}, {h:.1}) label {label} excluded by label filter");
                continue;
            }

            let mut rect = Rect::new(
                (x + 0.5) as i32,
                (y + 0.5) as i32,
                (w + 0.5) as i32,
                (h + 0.5) as i32,
            );
            clip_rect(&mut rect, width, height);

            if let Some(info) = transform
                && info.was_transformation()
            {
                rect = untransform(rect, info, width, height);
                clip_rect(&mut rect, width, height);
            }

            rois.push(RoiRecord {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
                label: label.to_string(),
                label_id: object.class_id,
                confidence: object.confidence,
                feature: None,
            });
        }

        if rois.is_empty() {
            return rois;
        }
        if let Some(filter) = filter_region {
            self.apply_region_filter(filter, &mut rois);
        }
        if self.max_roi > 0 {
            rois.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            rois.truncate(self.max_roi);
        }
        rois
    }

    fn keeps_label(&self, label: &str) -> bool {
        self.filter_labels.is_empty() || self.filter_labels.iter().any(|kept| kept == label)
    }

    /// Drops boxes whose overlap with the filter region stays below
    /// the threshold on both ratios. The two ratios are intersection
    /// over filter area and intersection over box area, not a
    /// symmetric IoU.
    fn apply_region_filter(&self, filter: Rect, rois: &mut Vec<RoiRecord>) {
        if filter.is_zero() || self.filter_region_thresh == 0.0 {
            return;
        }

        let filter_area = (filter.width * filter.height) as f32;
        rois.retain(|roi| {
            let area = (roi.width * roi.height) as f32;
            let x1 = filter.x.max(roi.x) as f32;
            let y1 = filter.y.max(roi.y) as f32;
            let x2 = (filter.x + filter.width).min(roi.x + roi.width) as f32;
            let y2 = (filter.y + filter.height).min(roi.y + roi.height) as f32;
            let intersect = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);

            // degenerate shapes, keep the box
            if area + filter_area - intersect <= 0.0 {
                return true;
            }
            let keep = intersect / filter_area >= self.filter_region_thresh
                || intersect / area >= self.filter_region_thresh;
            if !keep {
                debug!(
                    "box ({}, {}, {}, {}) outside the filter region, dropped",
                    roi.x, roi.y, roi.width, roi.height
                );
            }
            keep
        });
    }
}

/// Clamps the rectangle into the frame with at least one pixel of
/// width and height.
fn clip_rect(rect: &mut Rect, width: i32, height: i32) {
    rect.x = rect.x.clamp(0, width - 1);
    rect.y = rect.y.clamp(0, height - 1);
    rect.width = rect.width.max(1);
    rect.height = rect.height.max(1);
    if rect.x + rect.width > width {
        rect.width = width - rect.x;
    }
    if rect.y + rect.height > height {
        rect.height = height - rect.y;
    }
}

/// Maps a frame-scaled rectangle back onto the source frame by
/// undoing the recorded pre-processing chain: padding first, then
/// crop, then resize. The transform offsets are expressed in model
/// input coordinates, so the rectangle is first rescaled into that
/// space through the recorded pre-transform dimensions.
fn untransform(rect: Rect, info: &TransformInfo, width: i32, height: i32) -> Rect {
    let mut x = rect.x as f32;
    let mut y = rect.y as f32;
    let mut w = rect.width as f32;
    let mut h = rect.height as f32;

    if info.before_width > 0.0 && info.before_height > 0.0 {
        x = x / width as f32 * info.before_width;
        y = y / height as f32 * info.before_height;
        w = w / width as f32 * info.before_width;
        h = h / height as f32 * info.before_height;
    }
    if info.padded {
        x -= info.padding_x;
        y -= info.padding_y;
    }
    if info.cropped {
        x += info.crop_x;
        y += info.crop_y;
    }
    if info.resized {
        // a zero scale means the axis was never scaled
        if info.resize_scale_x != 0.0 {
            x /= info.resize_scale_x;
            w /= info.resize_scale_x;
        }
        if info.resize_scale_y != 0.0 {
            y /= info.resize_scale_y;
            h /= info.resize_scale_y;
        }
    }

    Rect::new(x as i32, y as i32, w as i32, h as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(x: f32, y: f32, w: f32, h: f32, class_id: i32, confidence: f32) -> DetectedObject {
        DetectedObject { x, y, w, h, class_id, confidence }
    }

    fn labels() -> LabelTable {
        LabelTable::new(vec!["person".to_string(), "car".to_string()])
    }

    fn assert_within_frame(rois: &[RoiRecord], width: i32, height: i32) {
        for roi in rois {
            assert!(roi.x >= 0 && roi.x < width, "x out of range: {roi:?}");
            assert!(roi.y >= 0 && roi.y < height, "y out of range: {roi:?}");
            assert!(roi.width >= 1 && roi.height >= 1, "degenerate size: {roi:?}");
            assert!(roi.x + roi.width <= width, "right edge out of range: {roi:?}");
            assert!(roi.y + roi.height <= height, "bottom edge out of range: {roi:?}");
        }
    }

    #[test]
    fn denormalizes_and_clips_to_the_frame() {
        let rectifier = GeometryRectifier::new(0.5, Vec::new(), 0.5, 0);
        let objects = vec![
            object(0.1, 0.2, 0.5, 0.25, 0, 0.9),
            // runs past the right and bottom edges
            object(0.9, 0.9, 0.4, 0.4, 1, 0.8),
            // collapses below one pixel
            object(0.5, 0.5, 0.0001, 0.0001, 0, 0.7),
        ];
        let rois = rectifier.rectify(objects, &labels(), 640, 480, None, None);

        assert_eq!(rois.len(), 3);
        assert_within_frame(&rois, 640, 480);
        assert_eq!((rois[0].x, rois[0].y, rois[0].width, rois[0].height), (64, 96, 320, 120));
        assert_eq!(rois[0].label, "person");
        assert_eq!(rois[1].x + rois[1].width, 640);
        assert_eq!(rois[1].y + rois[1].height, 480);
        assert_eq!((rois[2].width, rois[2].height), (1, 1));
    }

    #[test]
    fn confidence_below_threshold_is_dropped() {
        let rectifier = GeometryRectifier::new(0.6, Vec::new(), 0.5, 0);
        let objects =
            vec![object(0.1, 0.1, 0.2, 0.2, 0, 0.59), object(0.1, 0.1, 0.2, 0.2, 0, 0.61)];
        let rois = rectifier.rectify(objects, &labels(), 100, 100, None, None);
        assert_eq!(rois.len(), 1);
        assert!(rois[0].confidence > 0.6);
    }

    #[test]
    fn label_allow_list_keeps_only_named_labels() {
        let rectifier = GeometryRectifier::new(0.5, vec!["person".to_string()], 0.5, 0);
        let objects =
            vec![object(0.1, 0.1, 0.2, 0.2, 0, 0.9), object(0.4, 0.4, 0.2, 0.2, 1, 0.9)];
        let rois = rectifier.rectify(objects, &labels(), 100, 100, None, None);
        assert_eq!(rois.len(), 1);
        assert_eq!(rois[0].label, "person");
    }

    #[test]
    fn undoes_a_letterbox_transform() {
        // 1280x720 frame, halved to 640x360 and padded to 640x640
        let info = TransformInfo {
            resized: true,
            resize_scale_x: 0.5,
            resize_scale_y: 0.5,
            padded: true,
            padding_x: 0.0,
            padding_y: 140.0,
            before_width: 640.0,
            before_height: 640.0,
            ..TransformInfo::default()
        };
        let rectifier = GeometryRectifier::new(0.5, Vec::new(), 0.5, 0);
        let objects = vec![object(0.25, 0.25, 0.5, 0.25, 0, 0.9)];
        let rois = rectifier.rectify(objects, &labels(), 1280, 720, Some(&info), None);

        assert_eq!(rois.len(), 1);
        assert_eq!((rois[0].x, rois[0].y, rois[0].width, rois[0].height), (320, 40, 640, 320));
        assert_within_frame(&rois, 1280, 720);
    }

    #[test]
    fn zero_resize_scale_skips_that_axis() {
        let info = TransformInfo {
            resized: true,
            resize_scale_x: 0.0,
            resize_scale_y: 2.0,
            before_width: 100.0,
            before_height: 100.0,
            ..TransformInfo::default()
        };
        let rectifier = GeometryRectifier::new(0.5, Vec::new(), 0.5, 0);
        let objects = vec![object(0.1, 0.1, 0.2, 0.2, 0, 0.9)];
        let rois = rectifier.rectify(objects, &labels(), 100, 100, Some(&info), None);

        assert_eq!(rois.len(), 1);
        assert_eq!((rois[0].x, rois[0].width), (10, 20));
        assert_eq!((rois[0].y, rois[0].height), (5, 10));
    }

    #[test]
    fn crop_offsets_shift_boxes_back() {
        let info = TransformInfo {
            cropped: true,
            crop_x: 30.0,
            crop_y: 20.0,
            before_width: 200.0,
            before_height: 200.0,
            ..TransformInfo::default()
        };
        let rectifier = GeometryRectifier::new(0.5, Vec::new(), 0.5, 0);
        let objects = vec![object(0.25, 0.25, 0.25, 0.25, 0, 0.9)];
        let rois = rectifier.rectify(objects, &labels(), 200, 200, Some(&info), None);

        assert_eq!(rois.len(), 1);
        assert_eq!((rois[0].x, rois[0].y, rois[0].width, rois[0].height), (80, 70, 50, 50));
    }

    #[test]
    fn filter_region_drops_disjoint_boxes() {
        let rectifier = GeometryRectifier::new(0.5, Vec::new(), 0.5, 0);
        let objects = vec![
            // no overlap with the filter region
            object(0.2, 0.2, 0.05, 0.05, 0, 0.9),
            // heavy overlap
            object(0.01, 0.01, 0.09, 0.09, 1, 0.8),
        ];
        let filter = Rect::new(0, 0, 100, 100);
        let rois = rectifier.rectify(objects, &labels(), 1000, 1000, None, Some(filter));

        assert_eq!(rois.len(), 1);
        assert_eq!((rois[0].x, rois[0].y), (10, 10));
    }

    #[test]
    fn all_zero_filter_region_keeps_everything() {
        let rectifier = GeometryRectifier::new(0.5, Vec::new(), 0.5, 0);
        let objects = vec![object(0.2, 0.2, 0.05, 0.05, 0, 0.9)];
        let rois =
            rectifier.rectify(objects, &labels(), 1000, 1000, None, Some(Rect::default()));
        assert_eq!(rois.len(), 1);
    }

    #[test]
    fn zero_filter_threshold_disables_the_region_filter() {
        let rectifier = GeometryRectifier::new(0.5, Vec::new(), 0.0, 0);
        let objects = vec![object(0.2, 0.2, 0.05, 0.05, 0, 0.9)];
        let filter = Rect::new(0, 0, 100, 100);
        let rois = rectifier.rectify(objects, &labels(), 1000, 1000, None, Some(filter));
        assert_eq!(rois.len(), 1);
    }

    #[test]
    fn top_k_keeps_the_highest_confidences_in_stable_order() {
        let rectifier = GeometryRectifier::new(0.1, Vec::new(), 0.5, 2);
        let objects = vec![
            object(0.1, 0.1, 0.1, 0.1, 0, 0.5),
            object(0.2, 0.2, 0.1, 0.1, 1, 0.9),
            object(0.3, 0.3, 0.1, 0.1, 0, 0.5),
            object(0.4, 0.4, 0.1, 0.1, 1, 0.3),
        ];
        let rois = rectifier.rectify(objects, &labels(), 100, 100, None, None);

        assert_eq!(rois.len(), 2);
        assert_eq!(rois[0].confidence, 0.9);
        // the tie at 0.5 resolves to the earlier box
        assert_eq!(rois[1].confidence, 0.5);
        assert_eq!((rois[1].x, rois[1].y), (10, 10));
    }

    #[test]
    fn max_roi_zero_keeps_the_original_order() {
        let rectifier = GeometryRectifier::new(0.1, Vec::new(), 0.5, 0);
        let objects = vec![
            object(0.1, 0.1, 0.1, 0.1, 0, 0.2),
            object(0.2, 0.2, 0.1, 0.1, 1, 0.9),
        ];
        let rois = rectifier.rectify(objects, &labels(), 100, 100, None, None);
        assert_eq!(rois.len(), 2);
        assert_eq!(rois[0].confidence, 0.2);
    }

    #[test]
    fn degenerate_frame_produces_nothing() {
        let rectifier = GeometryRectifier::new(0.1, Vec::new(), 0.5, 0);
        let objects = vec![object(0.1, 0.1, 0.1, 0.1, 0, 0.9)];
        assert!(rectifier.rectify(objects.clone(), &labels(), 0, 100, None, None).is_empty());
        assert!(rectifier.rectify(objects, &labels(), 100, 0, None, None).is_empty());
    }
}
