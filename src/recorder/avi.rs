//! MJPEG-in-AVI clip writer.
//!
//! Layout (single video stream, fixed header size):
//!
//! ```text
//! RIFF <size> AVI
//!   LIST <size> hdrl
//!     avih (56)
//!     LIST <size> strl
//!       strh (56)
//!       strf (40, BITMAPINFOHEADER, MJPG)
//!   LIST <size> movi
//!     00dc <size> <jpeg> ...
//!   idx1 <size> <16 bytes per frame>
//! ```
//!
//! Frame counts and chunk sizes are unknown until the clip ends, so `finish`
//! patches them in place.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::Frame;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
const VIDEO_CHUNK_ID: &[u8; 4] = b"00dc";

const RIFF_SIZE_OFFSET: u64 = 4;
const AVIH_TOTAL_FRAMES_OFFSET: u64 = 48;
const AVIH_SUGGESTED_BUFFER_OFFSET: u64 = 60;
const STRH_LENGTH_OFFSET: u64 = 140;
const STRH_SUGGESTED_BUFFER_OFFSET: u64 = 144;
const MOVI_SIZE_OFFSET: u64 = 216;
/// Offset of the `movi` fourcc; idx1 offsets are relative to it.
const MOVI_FOURCC_OFFSET: u64 = 220;
const HEADER_LEN: u64 = 224;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Opens clip writers. Separate from the writer so tests can swap the format.
pub trait ClipSink: Send {
    fn create(&mut self, path: &Path, width: u32, height: u32, fps: u32)
        -> Result<Box<dyn ClipWriter>>;
}

/// An open clip.
pub trait ClipWriter: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close the clip. Returns the number of frames written.
    fn finish(self: Box<Self>) -> Result<u64>;
}

/// Writes `.avi` clips with JPEG-compressed frames.
pub struct AviClipSink {
    jpeg_quality: u8,
}

impl AviClipSink {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }
}

impl Default for AviClipSink {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl ClipSink for AviClipSink {
    fn create(
        &mut self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn ClipWriter>> {
        Ok(Box::new(AviWriter::create(
            path,
            width,
            height,
            fps,
            self.jpeg_quality,
        )?))
    }
}

pub struct AviWriter {
    out: BufWriter<File>,
    width: u32,
    height: u32,
    jpeg_quality: u8,
    /// (offset relative to movi fourcc, chunk size)
    index: Vec<(u32, u32)>,
    position: u64,
    max_chunk: u32,
    jpeg_buf: Vec<u8>,
}

impl AviWriter {
    pub fn create(path: &Path, width: u32, height: u32, fps: u32, jpeg_quality: u8) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("invalid clip dimensions {}x{}", width, height));
        }
        if fps == 0 {
            return Err(anyhow!("clip fps must be positive"));
        }
        let file = File::create(path).with_context(|| format!("create clip {}", path.display()))?;
        let mut out = BufWriter::new(file);
        out.write_all(&header(width, height, fps))
            .context("write avi header")?;
        Ok(Self {
            out,
            width,
            height,
            jpeg_quality,
            index: Vec::new(),
            position: HEADER_LEN,
            max_chunk: 0,
            jpeg_buf: Vec::new(),
        })
    }

    fn patch_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.out.seek(SeekFrom::Start(offset))?;
        self.out.write_all(&value.to_le_bytes())?;
        Ok(())
    }
}

impl ClipWriter for AviWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame {} is {}x{}, clip is {}x{}",
                frame.seq,
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        self.jpeg_buf.clear();
        JpegEncoder::new_with_quality(&mut self.jpeg_buf, self.jpeg_quality)
            .encode(frame.pixels(), frame.width, frame.height, ExtendedColorType::Rgb8)
            .context("encode frame as jpeg")?;

        let size = u32::try_from(self.jpeg_buf.len()).context("jpeg frame too large")?;
        let offset = u32::try_from(self.position - MOVI_FOURCC_OFFSET)
            .context("clip exceeds avi size limit")?;
        self.out.write_all(VIDEO_CHUNK_ID)?;
        self.out.write_all(&size.to_le_bytes())?;
        self.out.write_all(&self.jpeg_buf)?;
        let mut written = 8 + size as u64;
        if size % 2 == 1 {
            self.out.write_all(&[0])?;
            written += 1;
        }
        self.position += written;
        self.index.push((offset, size));
        self.max_chunk = self.max_chunk.max(size);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<u64> {
        let movi_end = self.position;
        let index_len = u32::try_from(self.index.len() * 16).context("avi index too large")?;
        self.out.write_all(b"idx1")?;
        self.out.write_all(&index_len.to_le_bytes())?;
        for &(offset, size) in &self.index {
            self.out.write_all(VIDEO_CHUNK_ID)?;
            self.out.write_all(&AVIIF_KEYFRAME.to_le_bytes())?;
            self.out.write_all(&offset.to_le_bytes())?;
            self.out.write_all(&size.to_le_bytes())?;
        }
        let file_len = movi_end + 8 + index_len as u64;

        let frames = self.index.len() as u32;
        let max_chunk = self.max_chunk;
        let riff_size = u32::try_from(file_len - 8).context("clip exceeds avi size limit")?;
        let movi_size = u32::try_from(movi_end - MOVI_FOURCC_OFFSET)
            .context("clip exceeds avi size limit")?;
        self.patch_u32(RIFF_SIZE_OFFSET, riff_size)?;
        self.patch_u32(AVIH_TOTAL_FRAMES_OFFSET, frames)?;
        self.patch_u32(AVIH_SUGGESTED_BUFFER_OFFSET, max_chunk)?;
        self.patch_u32(STRH_LENGTH_OFFSET, frames)?;
        self.patch_u32(STRH_SUGGESTED_BUFFER_OFFSET, max_chunk)?;
        self.patch_u32(MOVI_SIZE_OFFSET, movi_size)?;
        self.out.flush().context("flush clip")?;
        self.out
            .get_ref()
            .sync_all()
            .context("sync clip to disk")?;
        Ok(frames as u64)
    }
}

fn header(width: u32, height: u32, fps: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(HEADER_LEN as usize);
    let u32le = |h: &mut Vec<u8>, v: u32| h.extend_from_slice(&v.to_le_bytes());

    h.extend_from_slice(b"RIFF");
    u32le(&mut h, 0); // patched
    h.extend_from_slice(b"AVI ");

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 192);
    h.extend_from_slice(b"hdrl");

    h.extend_from_slice(b"avih");
    u32le(&mut h, 56);
    u32le(&mut h, 1_000_000 / fps); // microseconds per frame
    u32le(&mut h, 0); // max bytes per second
    u32le(&mut h, 0); // padding granularity
    u32le(&mut h, AVIF_HASINDEX);
    u32le(&mut h, 0); // total frames, patched
    u32le(&mut h, 0); // initial frames
    u32le(&mut h, 1); // streams
    u32le(&mut h, 0); // suggested buffer size, patched
    u32le(&mut h, width);
    u32le(&mut h, height);
    for _ in 0..4 {
        u32le(&mut h, 0);
    }

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 116);
    h.extend_from_slice(b"strl");

    h.extend_from_slice(b"strh");
    u32le(&mut h, 56);
    h.extend_from_slice(b"vids");
    h.extend_from_slice(b"MJPG");
    u32le(&mut h, 0); // flags
    u32le(&mut h, 0); // priority + language
    u32le(&mut h, 0); // initial frames
    u32le(&mut h, 1); // scale
    u32le(&mut h, fps); // rate
    u32le(&mut h, 0); // start
    u32le(&mut h, 0); // length, patched
    u32le(&mut h, 0); // suggested buffer size, patched
    u32le(&mut h, u32::MAX); // quality: default
    u32le(&mut h, 0); // sample size
    h.extend_from_slice(&0u16.to_le_bytes());
    h.extend_from_slice(&0u16.to_le_bytes());
    h.extend_from_slice(&(width.min(u16::MAX as u32) as u16).to_le_bytes());
    h.extend_from_slice(&(height.min(u16::MAX as u32) as u16).to_le_bytes());

    h.extend_from_slice(b"strf");
    u32le(&mut h, 40);
    u32le(&mut h, 40); // biSize
    u32le(&mut h, width);
    u32le(&mut h, height);
    h.extend_from_slice(&1u16.to_le_bytes()); // planes
    h.extend_from_slice(&24u16.to_le_bytes()); // bit count
    h.extend_from_slice(b"MJPG");
    u32le(&mut h, width.saturating_mul(height).saturating_mul(3));
    for _ in 0..4 {
        u32le(&mut h, 0);
    }

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 0); // patched
    h.extend_from_slice(b"movi");
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    fn frame(seq: u64, shade: u8) -> Frame {
        Frame::new(seq, vec![shade; 16 * 8 * 3], 16, 8)
    }

    #[test]
    fn header_has_fixed_layout() {
        let h = header(640, 480, 10);
        assert_eq!(h.len() as u64, HEADER_LEN);
        assert_eq!(&h[212..216], b"LIST");
        assert_eq!(&h[MOVI_FOURCC_OFFSET as usize..], b"movi");
        assert_eq!(&h[100..104], b"strh");
        assert_eq!(read_u32(&h, 32), 100_000);
        assert_eq!(read_u32(&h, 64), 640);
    }

    #[test]
    fn finished_clip_has_consistent_sizes_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut writer: Box<dyn ClipWriter> =
            Box::new(AviWriter::create(&path, 16, 8, 10, 80).unwrap());
        for seq in 0..3 {
            writer.write_frame(&frame(seq, seq as u8 * 60)).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 3);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(read_u32(&bytes, AVIH_TOTAL_FRAMES_OFFSET as usize), 3);
        assert_eq!(read_u32(&bytes, STRH_LENGTH_OFFSET as usize), 3);

        let movi_size = read_u32(&bytes, MOVI_SIZE_OFFSET as usize) as usize;
        let idx_start = MOVI_FOURCC_OFFSET as usize + movi_size;
        assert_eq!(&bytes[idx_start..idx_start + 4], b"idx1");
        assert_eq!(read_u32(&bytes, idx_start + 4), 3 * 16);

        // Each index entry points at a 00dc chunk holding a JPEG.
        for i in 0..3 {
            let entry = idx_start + 8 + i * 16;
            let offset = read_u32(&bytes, entry + 8) as usize;
            let size = read_u32(&bytes, entry + 12) as usize;
            let chunk = MOVI_FOURCC_OFFSET as usize + offset;
            assert_eq!(&bytes[chunk..chunk + 4], VIDEO_CHUNK_ID);
            assert_eq!(read_u32(&bytes, chunk + 4) as usize, size);
            assert_eq!(&bytes[chunk + 8..chunk + 10], &[0xFF, 0xD8]);
        }
    }

    #[test]
    fn frame_size_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = AviWriter::create(&dir.path().join("clip.avi"), 32, 32, 10, 80).unwrap();
        assert!(writer.write_frame(&frame(0, 1)).is_err());
    }

    #[test]
    fn zero_fps_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AviWriter::create(&dir.path().join("clip.avi"), 16, 8, 0, 80).is_err());
    }
}
