// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Decoded video frames.

use base::{bail, Error};
use bytes::Bytes;
use std::fmt;

/// Bytes per pixel of a packed BGR24 frame.
pub const BGR_BYTES_PER_PIXEL: usize = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Dimensions { width, height }
    }

    pub fn pixels(self) -> usize {
        self.width as usize * self.height as usize
    }

    /// The length of a packed BGR24 buffer of these dimensions.
    pub fn bgr_len(self) -> usize {
        self.pixels() * BGR_BYTES_PER_PIXEL
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A decoded frame, packed BGR24, rows top to bottom with no padding.
///
/// Cloning is cheap; the pixel buffer is reference-counted, so the same frame
/// can go to the detector and the recorder queue without a copy.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    dims: Dimensions,
    data: Bytes,
}

impl Frame {
    pub fn new(dims: Dimensions, data: Bytes) -> Result<Self, Error> {
        if dims.width == 0 || dims.height == 0 {
            bail!(InvalidArgument, msg("frame dimensions {dims} are empty"));
        }
        if data.len() != dims.bgr_len() {
            bail!(
                InvalidArgument,
                msg(
                    "{dims} BGR frame should be {} bytes; got {}",
                    dims.bgr_len(),
                    data.len()
                ),
            );
        }
        Ok(Frame { dims, data })
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Frame").field("dims", &self.dims).finish()
    }
}
