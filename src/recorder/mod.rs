//! Motion-triggered clip recorder.
//!
//! While idle, every frame goes into a pre-motion ring buffer. When motion
//! becomes active a clip is opened, the buffer is flushed into it oldest-first,
//! and live frames follow. The clip stays open while motion is active or until
//! `post_motion` has passed since the last trigger. Closing a clip runs
//! storage eviction.

mod avi;
mod retention;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

pub use avi::{AviClipSink, AviWriter, ClipSink, ClipWriter, DEFAULT_JPEG_QUALITY};
pub use retention::{enforce_storage_budget, list_clips, ClipInfo, EvictionReport, CLIP_EXTENSION};

use crate::distribute::FrameReceiver;
use crate::frame::{Frame, PreMotionBuffer};
use crate::motion::MotionState;
use crate::shutdown::CancelToken;

/// How long the recorder thread waits for a frame before re-checking timers.
const FRAME_WAIT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecorderConfig {
    pub dir: PathBuf,
    /// Nominal clip frame rate; also sizes the pre-motion buffer.
    pub fps: u32,
    pub pre_motion_secs: u32,
    pub post_motion: Duration,
    pub max_storage_bytes: u64,
    pub jpeg_quality: u8,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("recordings"),
            fps: 10,
            pre_motion_secs: 5,
            post_motion: Duration::from_secs(10),
            max_storage_bytes: 10 * 1024 * 1024 * 1024,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

/// Metadata of the open clip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingSession {
    pub file_path: PathBuf,
    pub start_time: SystemTime,
    pub frame_count: u64,
    pub pre_buffered_count: usize,
}

/// Counters shared with the health reporter.
#[derive(Debug, Default)]
pub struct RecorderStatus {
    recording: AtomicBool,
    clips_written: AtomicU64,
    clips_failed: AtomicU64,
    clips_evicted: AtomicU64,
}

impl RecorderStatus {
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub fn clips_written(&self) -> u64 {
        self.clips_written.load(Ordering::Relaxed)
    }

    pub fn clips_failed(&self) -> u64 {
        self.clips_failed.load(Ordering::Relaxed)
    }

    pub fn clips_evicted(&self) -> u64 {
        self.clips_evicted.load(Ordering::Relaxed)
    }
}

struct ActiveClip {
    session: RecordingSession,
    writer: Box<dyn ClipWriter>,
    last_trigger: Option<Instant>,
}

pub struct MotionRecorder {
    config: RecorderConfig,
    motion: MotionState,
    sink: Box<dyn ClipSink>,
    buffer: PreMotionBuffer,
    active: Option<ActiveClip>,
    /// Trigger whose clip could not be opened; not retried.
    failed_trigger: Option<Instant>,
    status: Arc<RecorderStatus>,
}

impl MotionRecorder {
    /// Create the recorder and its output directory.
    ///
    /// Failing to create the directory is an error for the recorder alone; the
    /// caller decides whether to run without recording.
    pub fn new(config: RecorderConfig, motion: MotionState, sink: Box<dyn ClipSink>) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("create recording directory {}", config.dir.display()))?;
        let buffer = PreMotionBuffer::for_duration(config.pre_motion_secs, config.fps);
        log::info!(
            "recorder ready: dir={} pre-motion={} frames post-motion={:?} budget={} bytes",
            config.dir.display(),
            buffer.capacity(),
            config.post_motion,
            config.max_storage_bytes
        );
        Ok(Self {
            config,
            motion,
            sink,
            buffer,
            active: None,
            failed_trigger: None,
            status: Arc::new(RecorderStatus::default()),
        })
    }

    pub fn status(&self) -> Arc<RecorderStatus> {
        self.status.clone()
    }

    pub fn state(&self) -> RecorderState {
        if self.active.is_some() {
            RecorderState::Recording
        } else {
            RecorderState::Idle
        }
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one frame observed at `now`.
    pub fn handle_frame(&mut self, frame: Frame, now: Instant) {
        let motion = self.motion.snapshot_at(now);

        if self.active.is_none() {
            let new_trigger = motion.active && motion.last_trigger != self.failed_trigger;
            if !new_trigger {
                self.buffer.push(frame);
                return;
            }
            if let Err(e) = self.start_clip(&frame) {
                log::error!("failed to start recording: {:#}", e);
                self.status.clips_failed.fetch_add(1, Ordering::Relaxed);
                self.failed_trigger = motion.last_trigger;
                self.buffer.push(frame);
                return;
            }
        }

        if let Some(active) = self.active.as_mut() {
            if motion.last_trigger.is_some() {
                active.last_trigger = motion.last_trigger;
            }
        }

        if self.should_keep_recording(motion.active, now) {
            self.append(&frame);
        } else {
            self.close_clip();
            self.buffer.push(frame);
        }
    }

    /// Close the clip if the post-motion window ran out without new frames.
    pub fn tick(&mut self, now: Instant) {
        if self.active.is_none() {
            return;
        }
        let motion = self.motion.snapshot_at(now);
        if let Some(active) = self.active.as_mut() {
            if motion.last_trigger.is_some() {
                active.last_trigger = motion.last_trigger;
            }
        }
        if !self.should_keep_recording(motion.active, now) {
            self.close_clip();
        }
    }

    /// Close any open clip. Used on shutdown.
    pub fn finish(&mut self) {
        self.close_clip();
    }

    /// Consume frames until cancelled or the distributor closes.
    pub fn run(mut self, frames: FrameReceiver, cancel: CancelToken) {
        log::info!("recorder started");
        while !cancel.is_cancelled() {
            match frames.recv_timeout(FRAME_WAIT) {
                Some(frame) => self.handle_frame(frame, Instant::now()),
                None if frames.is_closed() => break,
                None => self.tick(Instant::now()),
            }
        }
        self.finish();
        log::info!("recorder stopped");
    }

    fn should_keep_recording(&self, motion_active: bool, now: Instant) -> bool {
        if motion_active {
            return true;
        }
        self.active
            .as_ref()
            .and_then(|a| a.last_trigger)
            .is_some_and(|t| now.saturating_duration_since(t) <= self.config.post_motion)
    }

    fn start_clip(&mut self, trigger_frame: &Frame) -> Result<()> {
        let path = clip_path(&self.config.dir, trigger_frame.captured_at);
        let mut writer = self
            .sink
            .create(&path, trigger_frame.width, trigger_frame.height, self.config.fps)
            .with_context(|| format!("open clip {}", path.display()))?;

        let mut pre_buffered = 0;
        let mut flush_error = None;
        for frame in self.buffer.drain() {
            if frame.width != trigger_frame.width || frame.height != trigger_frame.height {
                log::debug!("skipping buffered frame {} with stale dimensions", frame.seq);
                continue;
            }
            if let Err(e) = writer.write_frame(&frame) {
                flush_error = Some(e);
                break;
            }
            pre_buffered += 1;
        }
        if let Some(e) = flush_error {
            drop(writer);
            discard_partial(&path);
            return Err(e.context("flush pre-motion buffer"));
        }

        log::info!(
            "recording started: {} ({} pre-motion frames)",
            path.display(),
            pre_buffered
        );
        self.status.recording.store(true, Ordering::Relaxed);
        self.failed_trigger = None;
        self.active = Some(ActiveClip {
            session: RecordingSession {
                file_path: path,
                start_time: trigger_frame.captured_at,
                frame_count: pre_buffered as u64,
                pre_buffered_count: pre_buffered,
            },
            writer,
            last_trigger: None,
        });
        Ok(())
    }

    fn append(&mut self, frame: &Frame) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.writer.write_frame(frame) {
            Ok(()) => active.session.frame_count += 1,
            Err(e) => {
                log::error!(
                    "recording failed mid-clip, discarding {}: {:#}",
                    active.session.file_path.display(),
                    e
                );
                self.abort_clip();
            }
        }
    }

    fn abort_clip(&mut self) {
        if let Some(active) = self.active.take() {
            self.failed_trigger = active.last_trigger;
            drop(active.writer);
            discard_partial(&active.session.file_path);
            self.status.clips_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.status.recording.store(false, Ordering::Relaxed);
    }

    fn close_clip(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.status.recording.store(false, Ordering::Relaxed);
        let path = active.session.file_path.clone();
        match active.writer.finish() {
            Ok(frames) => {
                log::info!("recording saved: {} ({} frames)", path.display(), frames);
                self.status.clips_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!("failed to finalize {}: {:#}", path.display(), e);
                discard_partial(&path);
                self.status.clips_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        match enforce_storage_budget(&self.config.dir, self.config.max_storage_bytes) {
            Ok(report) => {
                self.status
                    .clips_evicted
                    .fetch_add(report.deleted.len() as u64, Ordering::Relaxed);
            }
            Err(e) => log::warn!("storage eviction failed: {:#}", e),
        }
    }
}

/// `motion_YYYYmmdd_HHMMSS.avi`, suffixed when a clip with that name exists.
fn clip_path(dir: &Path, started: SystemTime) -> PathBuf {
    let stamp = DateTime::<Local>::from(started).format("%Y%m%d_%H%M%S");
    let base = format!("motion_{}", stamp);
    let mut path = dir.join(format!("{}.{}", base, CLIP_EXTENSION));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}_{}.{}", base, n, CLIP_EXTENSION));
        n += 1;
    }
    path
}

fn discard_partial(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("failed to remove partial clip {}: {}", path.display(), e);
        }
    }
}
