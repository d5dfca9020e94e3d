// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Frame sources.

use base::{bail, err, Error};
use db::y4m::Y4mReader;
use db::Frame;
use std::fs::File;
use std::io::BufReader;
use tracing::info;
use url::Url;

/// Opens a video source. This is a trait for test injection.
pub trait Opener: Send + Sync {
    fn open(&self, url: &Url) -> Result<Box<dyn FrameSource>, Error>;
}

/// A source of decoded frames.
pub trait FrameSource: Send {
    /// Returns the next frame, blocking as needed, or `None` at the end of the stream.
    fn next(&mut self) -> Result<Option<Frame>, Error>;
}

/// Opens `file:` URLs naming YUV4MPEG2 files (or FIFOs, as written by `ffmpeg -f yuv4mpegpipe`).
pub struct RealOpener;

pub const OPENER: RealOpener = RealOpener;

impl Opener for RealOpener {
    fn open(&self, url: &Url) -> Result<Box<dyn FrameSource>, Error> {
        if url.scheme() != "file" {
            bail!(
                Unimplemented,
                msg("unsupported source scheme {:?}; only file: is supported", url.scheme())
            );
        }
        let path = url
            .to_file_path()
            .map_err(|()| err!(InvalidArgument, msg("bad file URL {url}")))?;
        let f = File::open(&path)
            .map_err(|e| err!(Unavailable, msg("unable to open {}", path.display()), source(e)))?;
        let reader = Y4mReader::new(BufReader::new(f))
            .map_err(|e| err!(e, msg("unable to read {}", path.display())))?;
        let h = reader.header();
        info!(
            %url,
            dims = %h.dims,
            fps = format_args!("{}/{}", h.fps.0, h.fps.1),
            "opened source",
        );
        Ok(Box::new(Y4mSource { reader }))
    }
}

struct Y4mSource {
    reader: Y4mReader<BufReader<File>>,
}

impl FrameSource for Y4mSource {
    fn next(&mut self) -> Result<Option<Frame>, Error> {
        self.reader
            .next_frame()
            .map_err(|e| err!(Unavailable, msg("unable to read frame"), source(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::{testutil, Dimensions};

    #[test]
    fn file_source() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        let path = tmpdir.path().join("in.y4m");
        let dims = Dimensions::new(4, 4);
        testutil::write_y4m(
            &path,
            &[
                testutil::filled_frame(dims, [0, 0, 0]),
                testutil::filled_frame(dims, [255, 255, 255]),
            ],
        );
        let url = Url::from_file_path(&path).unwrap();
        let mut s = OPENER.open(&url).unwrap();
        assert_eq!(s.next().unwrap().unwrap().dims(), dims);
        assert_eq!(s.next().unwrap().unwrap().dims(), dims);
        assert!(s.next().unwrap().is_none());
    }

    #[test]
    fn missing_file_is_unavailable() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        let url = Url::from_file_path(tmpdir.path().join("nope.y4m")).unwrap();
        let e = OPENER.open(&url).err().unwrap();
        assert_eq!(e.kind(), base::ErrorKind::Unavailable);
    }

    #[test]
    fn other_schemes() {
        let url = Url::parse("rtsp://camera/main").unwrap();
        let e = OPENER.open(&url).err().unwrap();
        assert_eq!(e.kind(), base::ErrorKind::Unimplemented);
    }
}
