// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Reading and writing YUV4MPEG2 (`.y4m`) streams.
//!
//! This is the simplest container `ffmpeg`, `ffplay`, and friends understand: a one-line text
//! header, then for each frame a `FRAME` line followed by raw planar YCbCr. We write full-range
//! BT.601 `C444`, which round-trips BGR without chroma subsampling, and read `C444` or any of the
//! 4:2:0 variants.

use crate::frame::{Dimensions, Frame, BGR_BYTES_PER_PIXEL};
use base::{bail, err, Error};
use std::io::{BufRead, Write};

const MAGIC: &str = "YUV4MPEG2";
const FRAME_MAGIC: &[u8] = b"FRAME";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Chroma {
    C444,

    /// 4:2:0 in any siting (`420`, `420jpeg`, `420paldv`, `420mpeg2`).
    C420,
}

impl Chroma {
    fn plane_dims(self, dims: Dimensions) -> (usize, usize) {
        match self {
            Chroma::C444 => (dims.width as usize, dims.height as usize),
            Chroma::C420 => (
                (dims.width as usize).div_ceil(2),
                (dims.height as usize).div_ceil(2),
            ),
        }
    }

    /// The length of one frame's planar data (Y, Cb, Cr).
    pub fn frame_len(self, dims: Dimensions) -> usize {
        let (cw, ch) = self.plane_dims(dims);
        dims.pixels() + 2 * cw * ch
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub dims: Dimensions,

    /// Frame rate as a `(numerator, denominator)` ratio.
    pub fps: (u32, u32),
    pub chroma: Chroma,
}

impl Header {
    pub fn new_444(dims: Dimensions, fps: u32) -> Self {
        Header {
            dims,
            fps: (fps, 1),
            chroma: Chroma::C444,
        }
    }

    /// Parses a header line, without its trailing newline.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let mut tokens = line.split(' ');
        if tokens.next() != Some(MAGIC) {
            bail!(InvalidArgument, msg("not a YUV4MPEG2 stream"));
        }
        let mut width = None;
        let mut height = None;
        let mut fps = (25, 1);
        let mut chroma = Chroma::C420;
        for t in tokens.filter(|t| !t.is_empty()) {
            let Some(value) = t.get(1..) else {
                bail!(InvalidArgument, msg("bad header token {t:?}"));
            };
            let tag = &t[..1];
            match tag {
                "W" => width = Some(parse_u32(value, "width")?),
                "H" => height = Some(parse_u32(value, "height")?),
                "F" => {
                    let (n, d) = value
                        .split_once(':')
                        .ok_or_else(|| err!(InvalidArgument, msg("bad frame rate {value:?}")))?;
                    fps = (parse_u32(n, "frame rate")?, parse_u32(d, "frame rate")?);
                }
                "C" => {
                    chroma = match value {
                        "444" => Chroma::C444,
                        "420" | "420jpeg" | "420paldv" | "420mpeg2" => Chroma::C420,
                        _ => bail!(Unimplemented, msg("unsupported chroma {value:?}")),
                    }
                }
                "I" if value != "p" && value != "?" => {
                    bail!(Unimplemented, msg("unsupported interlacing {value:?}"))
                }
                _ => {} // aspect, color range, and other extensions don't matter here.
            }
        }
        let (Some(width), Some(height)) = (width, height) else {
            bail!(InvalidArgument, msg("header lacks dimensions: {line:?}"));
        };
        if width == 0 || height == 0 || fps.1 == 0 {
            bail!(InvalidArgument, msg("bad header {line:?}"));
        }
        Ok(Header {
            dims: Dimensions::new(width, height),
            fps,
            chroma,
        })
    }

    /// Formats the header line, including its trailing newline.
    pub fn format(&self) -> String {
        let chroma = match self.chroma {
            Chroma::C444 => "444",
            Chroma::C420 => "420jpeg",
        };
        format!(
            "{MAGIC} W{} H{} F{}:{} Ip A1:1 C{chroma} XCOLORRANGE=FULL\n",
            self.dims.width, self.dims.height, self.fps.0, self.fps.1,
        )
    }
}

fn parse_u32(s: &str, what: &str) -> Result<u32, Error> {
    s.parse()
        .map_err(|e| err!(InvalidArgument, msg("bad {what} {s:?}"), source(e)))
}

fn clamp(v: f32) -> u8 {
    v.round().clamp(0., 255.) as u8
}

/// Converts one BGR pixel to full-range BT.601 `(Y, Cb, Cr)`.
pub fn bgr_to_ycbcr(bgr: [u8; 3]) -> [u8; 3] {
    let [b, g, r] = bgr.map(f32::from);
    [
        clamp(0.299 * r + 0.587 * g + 0.114 * b),
        clamp(128. - 0.168736 * r - 0.331264 * g + 0.5 * b),
        clamp(128. + 0.5 * r - 0.418688 * g - 0.081312 * b),
    ]
}

/// Inverse of [`bgr_to_ycbcr`].
pub fn ycbcr_to_bgr(ycbcr: [u8; 3]) -> [u8; 3] {
    let y = f32::from(ycbcr[0]);
    let cb = f32::from(ycbcr[1]) - 128.;
    let cr = f32::from(ycbcr[2]) - 128.;
    [
        clamp(y + 1.772 * cb),
        clamp(y - 0.344136 * cb - 0.714136 * cr),
        clamp(y + 1.402 * cr),
    ]
}

/// Writes frames of fixed dimensions as a `C444` stream.
pub struct Y4mWriter<W: Write> {
    inner: W,
    header: Header,
    planes: Vec<u8>,
    frames: u64,
}

impl<W: Write> Y4mWriter<W> {
    /// Writes the stream header.
    pub fn new(mut inner: W, dims: Dimensions, fps: u32) -> Result<Self, Error> {
        if dims.width == 0 || dims.height == 0 || fps == 0 {
            bail!(InvalidArgument, msg("can't write {dims} stream at {fps} fps"));
        }
        let header = Header::new_444(dims, fps);
        inner.write_all(header.format().as_bytes())?;
        Ok(Y4mWriter {
            inner,
            header,
            planes: Vec::with_capacity(Chroma::C444.frame_len(dims)),
            frames: 0,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let dims = self.header.dims;
        if frame.dims() != dims {
            bail!(
                InvalidArgument,
                msg("frame is {}; stream is {dims}", frame.dims())
            );
        }
        let n = dims.pixels();
        self.planes.clear();
        self.planes.resize(3 * n, 0);
        let (y, chroma) = self.planes.split_at_mut(n);
        let (cb, cr) = chroma.split_at_mut(n);
        for (i, px) in frame.data().chunks_exact(BGR_BYTES_PER_PIXEL).enumerate() {
            let [py, pcb, pcr] = bgr_to_ycbcr([px[0], px[1], px[2]]);
            y[i] = py;
            cb[i] = pcb;
            cr[i] = pcr;
        }
        self.inner.write_all(FRAME_MAGIC)?;
        self.inner.write_all(b"\n")?;
        self.inner.write_all(&self.planes)?;
        self.frames += 1;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads a stream, converting each frame to BGR.
pub struct Y4mReader<R: BufRead> {
    inner: R,
    header: Header,
    planes: Vec<u8>,
}

impl<R: BufRead> Y4mReader<R> {
    /// Reads and parses the stream header.
    pub fn new(mut inner: R) -> Result<Self, Error> {
        let mut line = Vec::new();
        inner.read_until(b'\n', &mut line)?;
        if line.last() != Some(&b'\n') {
            bail!(InvalidArgument, msg("truncated YUV4MPEG2 header"));
        }
        line.pop();
        let line = std::str::from_utf8(&line)
            .map_err(|e| err!(InvalidArgument, msg("header isn't UTF-8"), source(e)))?;
        let header = Header::parse(line)?;
        Ok(Y4mReader {
            inner,
            planes: vec![0; header.chroma.frame_len(header.dims)],
            header,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the next frame, or `None` at a clean end of stream.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let mut line = Vec::new();
        if self.inner.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if !line.starts_with(FRAME_MAGIC) || line.last() != Some(&b'\n') {
            bail!(DataLoss, msg("expected FRAME marker"));
        }
        self.inner.read_exact(&mut self.planes).map_err(|e| {
            err!(DataLoss, msg("truncated frame"), source(e))
        })?;
        let dims = self.header.dims;
        let (w, h) = (dims.width as usize, dims.height as usize);
        let (cw, ch) = self.header.chroma.plane_dims(dims);
        let (y, chroma) = self.planes.split_at(w * h);
        let (cb, cr) = chroma.split_at(cw * ch);
        let shift = match self.header.chroma {
            Chroma::C444 => 0,
            Chroma::C420 => 1,
        };
        let mut bgr = Vec::with_capacity(dims.bgr_len());
        for row in 0..h {
            for col in 0..w {
                let c = (row >> shift) * cw + (col >> shift);
                bgr.extend_from_slice(&ycbcr_to_bgr([y[row * w + col], cb[c], cr[c]]));
            }
        }
        Frame::new(dims, bgr.into()).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_round_trip() {
        let h = Header::new_444(Dimensions::new(640, 480), 10);
        let line = h.format();
        assert_eq!(
            line,
            "YUV4MPEG2 W640 H480 F10:1 Ip A1:1 C444 XCOLORRANGE=FULL\n"
        );
        assert_eq!(Header::parse(line.trim_end()).unwrap(), h);
    }

    #[test]
    fn header_defaults_to_420() {
        let h = Header::parse("YUV4MPEG2 W3 H3 F30000:1001").unwrap();
        assert_eq!(h.chroma, Chroma::C420);
        assert_eq!(h.fps, (30000, 1001));
        assert_eq!(h.chroma.frame_len(h.dims), 9 + 2 * 4);
    }

    #[test]
    fn header_errors() {
        assert_eq!(
            Header::parse("MPEG W1 H1").unwrap_err().kind(),
            base::ErrorKind::InvalidArgument
        );
        assert_eq!(
            Header::parse("YUV4MPEG2 W1").unwrap_err().kind(),
            base::ErrorKind::InvalidArgument
        );
        assert_eq!(
            Header::parse("YUV4MPEG2 W2 H2 C422").unwrap_err().kind(),
            base::ErrorKind::Unimplemented
        );
    }

    #[test]
    fn primaries_survive_conversion() {
        for bgr in [[0, 0, 0], [255, 255, 255], [0, 0, 255], [0, 255, 0], [255, 0, 0]] {
            let back = ycbcr_to_bgr(bgr_to_ycbcr(bgr));
            for (a, b) in bgr.iter().zip(back.iter()) {
                assert!(a.abs_diff(*b) <= 2, "{bgr:?} came back as {back:?}");
            }
        }
    }

    #[test]
    fn write_then_read() {
        let dims = Dimensions::new(4, 2);
        let mut w = Y4mWriter::new(Vec::new(), dims, 5).unwrap();
        w.write_frame(&crate::testutil::filled_frame(dims, [255, 255, 255])).unwrap();
        w.write_frame(&crate::testutil::filled_frame(dims, [0, 0, 0])).unwrap();
        assert_eq!(w.frames(), 2);
        let e = w
            .write_frame(&crate::testutil::filled_frame(Dimensions::new(2, 2), [0, 0, 0]))
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
        let buf = w.into_inner();
        let header_len = "YUV4MPEG2 W4 H2 F5:1 Ip A1:1 C444 XCOLORRANGE=FULL\n".len();
        assert_eq!(buf.len(), header_len + 2 * (6 + 3 * 8));

        let mut r = Y4mReader::new(Cursor::new(buf)).unwrap();
        assert_eq!(r.header().dims, dims);
        let f = r.next_frame().unwrap().unwrap();
        assert_eq!(f.dims(), dims);
        assert!(f.data().iter().all(|&b| b == 255));
        let f = r.next_frame().unwrap().unwrap();
        assert!(f.data().iter().all(|&b| b == 0));
        assert!(r.next_frame().unwrap().is_none());
    }

    #[test]
    fn read_420() {
        // 2x2 luma, one chroma sample each; neutral chroma means gray.
        let mut buf = b"YUV4MPEG2 W2 H2 F25:1 C420jpeg\nFRAME\n".to_vec();
        buf.extend_from_slice(&[10, 20, 30, 40, 128, 128]);
        let mut r = Y4mReader::new(Cursor::new(buf)).unwrap();
        let f = r.next_frame().unwrap().unwrap();
        assert_eq!(
            f.data(),
            &[10, 10, 10, 20, 20, 20, 30, 30, 30, 40, 40, 40]
        );
        assert!(r.next_frame().unwrap().is_none());
    }

    #[test]
    fn truncated_frame() {
        let mut buf = b"YUV4MPEG2 W2 H2 C444\nFRAME\n".to_vec();
        buf.extend_from_slice(&[0; 5]);
        let mut r = Y4mReader::new(Cursor::new(buf)).unwrap();
        assert_eq!(
            r.next_frame().unwrap_err().kind(),
            base::ErrorKind::DataLoss
        );
    }
}
