// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing involving weaponwatch's persistence library.
//! Used for tests of both the `weaponwatch_db` crate itself and the `weaponwatch` crate.

use crate::frame::{Dimensions, Frame};
use crate::y4m::Y4mWriter;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests.
///    * set up logging. (Note the output can be confusing unless `RUST_TEST_THREADS=1` is set in
///      the program's environment prior to running.)
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

/// Creates a scratch directory which is removed on drop.
pub fn tempdir() -> TempDir {
    tempfile::Builder::new()
        .prefix("weaponwatch-test")
        .tempdir()
        .unwrap()
}

/// Returns a frame of the given (non-empty) dimensions filled with one color.
pub fn filled_frame(dims: Dimensions, bgr: [u8; 3]) -> Frame {
    let mut data = Vec::with_capacity(dims.bgr_len());
    for _ in 0..dims.pixels() {
        data.extend_from_slice(&bgr);
    }
    Frame::new(dims, data.into()).unwrap()
}

/// Writes `frames` as a YUV4MPEG2 file at `path`, for tests which need a source.
pub fn write_y4m(path: &Path, frames: &[Frame]) {
    let dims = frames.first().map(Frame::dims).unwrap_or(Dimensions::new(1, 1));
    let f = std::fs::File::create(path).unwrap();
    let mut w = Y4mWriter::new(std::io::BufWriter::new(f), dims, 10).unwrap();
    for f in frames {
        w.write_frame(f).unwrap();
    }
    w.into_inner().flush().unwrap();
}
