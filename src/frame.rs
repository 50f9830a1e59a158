//! Captured frames and the pre-motion ring buffer.
//!
//! - `Frame`: immutable RGB24 image plus capture metadata. Pixels sit behind an
//!   `Arc`, so handing a frame to several consumers never copies pixel data.
//! - `PreMotionBuffer`: bounded ring buffer holding the last N frames so a clip
//!   can start before the motion trigger.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Hard cap on pre-motion buffering regardless of configuration.
pub const MAX_PRE_MOTION_SECS: u32 = 60;

/// Bytes per pixel for the RGB24 layout every source produces.
pub const RGB_CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A decoded video frame.
///
/// Frames are never mutated after capture. `Clone` copies the handle, not the
/// pixel buffer.
#[derive(Clone)]
pub struct Frame {
    /// Monotonic sequence number assigned by the stream reader.
    pub seq: u64,
    /// Wall-clock capture time (used for clip naming and event timestamps).
    pub captured_at: SystemTime,
    /// Monotonic capture instant (used for all interval arithmetic).
    pub captured_instant: Instant,
    pub width: u32,
    pub height: u32,
    pixels: Arc<[u8]>,
}

impl Frame {
    pub fn new(seq: u64, pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            seq,
            captured_at: SystemTime::now(),
            captured_instant: Instant::now(),
            width,
            height,
            pixels: pixels.into(),
        }
    }

    /// Row-major RGB24 pixel data.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Expected buffer length for the frame dimensions.
    pub fn expected_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * RGB_CHANNELS
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("seq", &self.seq)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// PreMotionBuffer
// ----------------------------------------------------------------------------

/// Fixed-capacity ring buffer of the most recent frames.
///
/// Capacity is `pre_motion_secs * fps`; once full, each push evicts the oldest
/// frame. Draining yields frames oldest-first.
pub struct PreMotionBuffer {
    buffer: VecDeque<Frame>,
    capacity: usize,
}

impl PreMotionBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Buffer sized for `secs` of footage at `fps`, capped at `MAX_PRE_MOTION_SECS`.
    pub fn for_duration(secs: u32, fps: u32) -> Self {
        let secs = secs.min(MAX_PRE_MOTION_SECS);
        Self::new(secs as usize * fps as usize)
    }

    /// Push a frame, evicting the oldest one when at capacity.
    pub fn push(&mut self, frame: Frame) {
        if self.capacity == 0 {
            return;
        }
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(frame);
    }

    /// Take every buffered frame in capture order, leaving the buffer empty.
    pub fn drain(&mut self) -> impl Iterator<Item = Frame> + '_ {
        self.buffer.drain(..)
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame(seq: u64) -> Frame {
        Frame::new(seq, vec![seq as u8; 12], 2, 2)
    }

    #[test]
    fn clone_shares_pixels() {
        let frame = make_frame(1);
        let copy = frame.clone();
        assert_eq!(frame.pixels().as_ptr(), copy.pixels().as_ptr());
        assert_eq!(Frame::expected_len(2, 2), frame.pixels().len());
    }

    #[test]
    fn buffer_holds_exactly_capacity_frames() {
        let mut buf = PreMotionBuffer::for_duration(1, 10);
        assert_eq!(buf.capacity(), 10);

        for seq in 0..25 {
            buf.push(make_frame(seq));
        }

        assert_eq!(buf.len(), 10);
        assert_eq!(buf.latest().map(|f| f.seq), Some(24));
    }

    #[test]
    fn drain_is_oldest_first_and_empties() {
        let mut buf = PreMotionBuffer::new(3);
        for seq in 0..5 {
            buf.push(make_frame(seq));
        }

        let seqs: Vec<u64> = buf.drain().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_capacity_buffers_nothing() {
        let mut buf = PreMotionBuffer::for_duration(0, 10);
        buf.push(make_frame(1));
        assert!(buf.is_empty());
    }

    #[test]
    fn duration_is_capped() {
        let buf = PreMotionBuffer::for_duration(600, 10);
        assert_eq!(buf.capacity(), MAX_PRE_MOTION_SECS as usize * 10);
    }
}
