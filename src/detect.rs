// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The detection model interface and the built-in detectors.
//!
//! The model itself runs elsewhere. A [`Detector`] hands back the model's raw
//! candidates for a frame; [`crate::nms`] turns those into a [`Detection`].

use crate::nms::PixelBox;
use base::{bail, err, Error};
use db::Frame;
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, info};

/// One raw candidate box from the model.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Candidate {
    /// Normalized `(ymin, xmin, ymax, xmax)`, each nominally in `[0, 1]`.
    #[serde(rename = "box")]
    pub bbox: [f32; 4],

    /// One confidence per class, indexed by class id.
    pub scores: Vec<f32>,
}

/// Runs the weapon-detection model on a frame. A trait for test injection.
pub trait Detector: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Candidate>, Error>;
}

/// Never detects anything; for sessions driven by the operator keys.
pub struct NullDetector;

impl Detector for NullDetector {
    fn infer(&mut self, _frame: &Frame) -> Result<Vec<Candidate>, Error> {
        Ok(Vec::new())
    }
}

/// Replays model output recorded by an external process.
///
/// The file has one line per frame, each a JSON array of candidates such as
/// `[{"box": [0.1, 0.2, 0.5, 0.6], "scores": [0.9, 0.01, 0.02]}]`. Frames past
/// the end of the file have no candidates.
pub struct ReplayDetector<R> {
    lines: std::io::Lines<R>,
    line_number: usize,
    exhausted: bool,
}

impl ReplayDetector<std::io::BufReader<std::fs::File>> {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let f = std::fs::File::open(path)
            .map_err(|e| err!(e, msg("unable to open detections file {}", path.display())))?;
        info!(path = %path.display(), "replaying detections");
        Ok(Self::new(std::io::BufReader::new(f)))
    }
}

impl<R: BufRead> ReplayDetector<R> {
    pub fn new(r: R) -> Self {
        ReplayDetector {
            lines: r.lines(),
            line_number: 0,
            exhausted: false,
        }
    }
}

impl<R: BufRead + Send> Detector for ReplayDetector<R> {
    fn infer(&mut self, _frame: &Frame) -> Result<Vec<Candidate>, Error> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let line = match self.lines.next() {
            None => {
                debug!("detections file exhausted after {} frames", self.line_number);
                self.exhausted = true;
                return Ok(Vec::new());
            }
            Some(l) => l?,
        };
        self.line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let candidates: Vec<Candidate> = serde_json::from_str(line).map_err(|e| {
            err!(
                InvalidArgument,
                msg("bad detections on line {}", self.line_number),
                source(e)
            )
        })?;
        Ok(candidates)
    }
}

/// One frame's final detections, in pixel coordinates of the source frame.
///
/// `boxes`, `scores`, and `classes` always have the same length.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Detection {
    pub boxes: Vec<PixelBox>,
    pub scores: Vec<f32>,
    pub classes: Vec<usize>,
}

impl Detection {
    pub fn new(boxes: Vec<PixelBox>, scores: Vec<f32>, classes: Vec<usize>) -> Result<Self, Error> {
        if boxes.len() != scores.len() || boxes.len() != classes.len() {
            bail!(
                Internal,
                msg(
                    "mismatched detection lengths: {} boxes, {} scores, {} classes",
                    boxes.len(),
                    scores.len(),
                    classes.len()
                )
            );
        }
        Ok(Detection {
            boxes,
            scores,
            classes,
        })
    }

    /// A stand-in detection for the operator's force-notify key.
    pub fn synthetic() -> Self {
        Detection {
            boxes: vec![PixelBox::default()],
            scores: vec![1.0],
            classes: vec![0],
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn max_score(&self) -> Option<f32> {
        self.scores.iter().copied().reduce(f32::max)
    }

    /// Drops detections whose class isn't in a table of `num_classes` names.
    pub fn retain_known_classes(&mut self, num_classes: usize) {
        let old = std::mem::take(self);
        for ((b, s), c) in old.boxes.into_iter().zip(old.scores).zip(old.classes) {
            if c < num_classes {
                self.boxes.push(b);
                self.scores.push(s);
                self.classes.push(c);
            }
        }
    }

    /// Summarizes for logging, e.g. `Gun 0.91 at (12,40)-(80,200)`.
    pub fn describe(&self, class_names: &[String]) -> String {
        let mut out = String::new();
        for i in 0..self.len() {
            if i > 0 {
                out.push_str(", ");
            }
            let b = &self.boxes[i];
            out.push_str(&format!(
                "{} {:.2} at ({},{})-({},{})",
                label(class_names, self.classes[i]),
                self.scores[i],
                b.xmin,
                b.ymin,
                b.xmax,
                b.ymax
            ));
        }
        out
    }
}

/// Returns the display label for a class id. Rifles are reported as guns.
pub fn label(class_names: &[String], class: usize) -> &str {
    match class_names.get(class).map(String::as_str) {
        Some("Rifle") => "Gun",
        Some(name) => name,
        None => "unknown",
    }
}
