// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Post-processing of raw model candidates: combined non-max suppression and
//! conversion to pixel coordinates.

use crate::detect::{Candidate, Detection};
use base::{bail, Error};
use db::Dimensions;
use serde::Deserialize;

/// Non-max-suppression policy.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct NmsConfig {
    /// Maximum boxes kept per class.
    pub max_output_size_per_class: usize,

    /// Maximum boxes kept over all classes.
    pub max_total_size: usize,

    /// A box is suppressed if its IoU with an already-kept box of the same class exceeds this.
    pub iou_threshold: f32,

    /// Boxes must score above this to be considered at all.
    pub score_threshold: f32,
}

impl Default for NmsConfig {
    fn default() -> Self {
        NmsConfig {
            max_output_size_per_class: 50,
            max_total_size: 50,
            iou_threshold: 0.5,
            score_threshold: 0.3,
        }
    }
}

impl NmsConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for (name, v) in [
            ("iouThreshold", self.iou_threshold),
            ("scoreThreshold", self.score_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                bail!(InvalidArgument, msg("{name} {v} is outside [0, 1]"));
            }
        }
        Ok(())
    }
}

/// The surviving boxes, best first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NmsOutput {
    /// Normalized `(ymin, xmin, ymax, xmax)`, clipped to `[0, 1]`.
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub classes: Vec<usize>,
    pub valid_count: usize,
}

/// A box in pixel coordinates of the source frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PixelBox {
    pub xmin: u32,
    pub ymin: u32,
    pub xmax: u32,
    pub ymax: u32,
}

fn area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.) * (b[3] - b[1]).max(0.)
}

/// Intersection over union of two `(ymin, xmin, ymax, xmax)` boxes; corners may be given in
/// either order.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let norm = |b: &[f32; 4]| [b[0].min(b[2]), b[1].min(b[3]), b[0].max(b[2]), b[1].max(b[3])];
    let (a, b) = (norm(a), norm(b));
    let (area_a, area_b) = (area(&a), area(&b));
    if area_a <= 0. || area_b <= 0. {
        return 0.;
    }
    let inter = [a[0].max(b[0]), a[1].max(b[1]), a[2].min(b[2]), a[3].min(b[3])];
    let inter = area(&inter);
    inter / (area_a + area_b - inter)
}

/// Greedy per-class suppression followed by a global score-ordered cap.
///
/// Each class is processed independently: its candidates scoring above the threshold are taken in
/// descending score order, skipping any that overlap an already-kept box of the class by more
/// than the IoU threshold, up to the per-class cap. The kept boxes of all classes are then merged
/// by score and truncated to the total cap.
pub fn combined_non_max_suppression(candidates: &[Candidate], cfg: &NmsConfig) -> NmsOutput {
    let num_classes = candidates.iter().map(|c| c.scores.len()).max().unwrap_or(0);
    let mut kept: Vec<(f32, usize, usize)> = Vec::new(); // (score, class, candidate index)
    let mut order: Vec<(f32, usize)> = Vec::new();
    let mut selected: Vec<usize> = Vec::new();
    for class in 0..num_classes {
        order.clear();
        order.extend(candidates.iter().enumerate().filter_map(|(i, c)| {
            let s = *c.scores.get(class)?;
            (s > cfg.score_threshold).then_some((s, i))
        }));
        order.sort_by(|a, b| b.0.total_cmp(&a.0));
        selected.clear();
        for &(score, i) in &order {
            if selected.len() >= cfg.max_output_size_per_class {
                break;
            }
            let bbox = &candidates[i].bbox;
            if selected
                .iter()
                .all(|&j| iou(&candidates[j].bbox, bbox) <= cfg.iou_threshold)
            {
                selected.push(i);
                kept.push((score, class, i));
            }
        }
    }
    kept.sort_by(|a, b| b.0.total_cmp(&a.0));
    kept.truncate(cfg.max_total_size);
    let mut out = NmsOutput {
        valid_count: kept.len(),
        ..Default::default()
    };
    for (score, class, i) in kept {
        out.boxes.push(candidates[i].bbox.map(|v| v.clamp(0., 1.)));
        out.scores.push(score);
        out.classes.push(class);
    }
    out
}

/// Converts normalized `(ymin, xmin, ymax, xmax)` boxes to pixel `(xmin, ymin, xmax, ymax)`,
/// truncating toward zero.
pub fn format_boxes(boxes: &[[f32; 4]], height: u32, width: u32) -> Vec<PixelBox> {
    let (h, w) = (height as f32, width as f32);
    boxes
        .iter()
        .map(|b| PixelBox {
            xmin: (b[1] * w) as u32,
            ymin: (b[0] * h) as u32,
            xmax: (b[3] * w) as u32,
            ymax: (b[2] * h) as u32,
        })
        .collect()
}

/// Runs the full post-processing on one frame's candidates.
pub fn process(
    candidates: &[Candidate],
    cfg: &NmsConfig,
    dims: Dimensions,
) -> Result<Detection, Error> {
    let out = combined_non_max_suppression(candidates, cfg);
    let boxes = format_boxes(&out.boxes[..out.valid_count], dims.height, dims.width);
    Detection::new(boxes, out.scores, out.classes)
}
