// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Video sinks: where the recorder writes frames.

use crate::frame::{Dimensions, Frame};
use crate::y4m::Y4mWriter;
use base::{err, Error};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

/// An open output video file of fixed dimensions.
pub trait VideoSink: Send {
    fn dims(&self) -> Dimensions;

    /// Appends a frame, which must match [`VideoSink::dims`].
    fn write_frame(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Flushes and syncs the file, returning the number of frames written.
    ///
    /// When this returns `Ok`, the file is complete on disk and safe to copy.
    fn finish(self: Box<Self>) -> Result<u64, Error>;
}

/// Opens sinks. A trait for testability.
pub trait SinkOpener: Send + Sync {
    fn open(&self, path: &Path, dims: Dimensions) -> Result<Box<dyn VideoSink>, Error>;
}

/// Opens YUV4MPEG2 sinks at a fixed frame rate.
#[derive(Copy, Clone, Debug)]
pub struct Y4mSinkOpener {
    fps: u32,
}

impl Y4mSinkOpener {
    pub fn new(fps: u32) -> Self {
        Y4mSinkOpener { fps }
    }
}

impl SinkOpener for Y4mSinkOpener {
    fn open(&self, path: &Path, dims: Dimensions) -> Result<Box<dyn VideoSink>, Error> {
        let f = File::create(path).map_err(|e| {
            err!(e, msg("unable to create {}", path.display()))
        })?;
        let writer = Y4mWriter::new(BufWriter::new(f), dims, self.fps)
            .map_err(|e| e.with_msg(format!("unable to start {}", path.display())))?;
        debug!(path = %path.display(), %dims, fps = self.fps, "opened sink");
        Ok(Box::new(Y4mSink {
            path: path.to_owned(),
            writer,
        }))
    }
}

struct Y4mSink {
    path: PathBuf,
    writer: Y4mWriter<BufWriter<File>>,
}

impl VideoSink for Y4mSink {
    fn dims(&self) -> Dimensions {
        self.writer.header().dims
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        self.writer.write_frame(frame)
    }

    fn finish(self: Box<Self>) -> Result<u64, Error> {
        let frames = self.writer.frames();
        let f = self
            .writer
            .into_inner()
            .into_inner()
            .map_err(|e| err!(e.into_error(), msg("unable to flush {}", self.path.display())))?;
        f.sync_all()
            .map_err(|e| err!(e, msg("unable to sync {}", self.path.display())))?;
        debug!(path = %self.path.display(), frames, "closed sink");
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::y4m::Y4mReader;

    #[test]
    fn y4m_sink() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        let path = tmpdir.path().join("out.y4m");
        let dims = Dimensions::new(8, 6);
        let mut sink = Y4mSinkOpener::new(10).open(&path, dims).unwrap();
        assert_eq!(sink.dims(), dims);
        sink.write_frame(&testutil::filled_frame(dims, [0, 0, 255])).unwrap();
        sink.write_frame(&testutil::filled_frame(dims, [0, 0, 255])).unwrap();
        assert_eq!(
            sink.write_frame(&testutil::filled_frame(Dimensions::new(6, 8), [0, 0, 0]))
                .unwrap_err()
                .kind(),
            base::ErrorKind::InvalidArgument
        );
        assert_eq!(sink.finish().unwrap(), 2);

        let mut r = Y4mReader::new(std::io::BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(r.header().dims, dims);
        assert_eq!(r.header().fps, (10, 1));
        assert!(r.next_frame().unwrap().is_some());
        assert!(r.next_frame().unwrap().is_some());
        assert!(r.next_frame().unwrap().is_none());
    }

    #[test]
    fn open_in_missing_dir_fails() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        let e = Y4mSinkOpener::new(10)
            .open(&tmpdir.path().join("nope/out.y4m"), Dimensions::new(2, 2))
            .err()
            .unwrap();
        assert_eq!(e.kind(), base::ErrorKind::NotFound);
    }
}
