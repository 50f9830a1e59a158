//! Per-frame orchestration: detect, raise vision motion, match, publish.
//!
//! The orchestrator owns the face backends and the publish gate. It pulls
//! frames from its own distributor subscription, so a slow detection pass
//! only costs it frames and never stalls the reader or the recorder.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::detect::{FaceBox, FaceDetector, FaceEncoder};
use crate::distribute::{FrameDistributor, FrameReceiver};
use crate::frame::Frame;
use crate::identity::{IdentityMatcher, MatchOutcome};
use crate::ingest::StreamStatus;
use crate::motion::MotionState;
use crate::recorder::RecorderStatus;
use crate::shutdown::CancelToken;
use crate::transport::messages::DEFAULT_IDENTITY_TOPIC;
use crate::transport::{EventSink, IdentityDetection, PublishGate};

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    /// Faces narrower or shorter than this are ignored.
    pub min_face_px: u32,
    pub fast_upsample: u32,
    pub boost_upsample: u32,
    /// Minimum time between boost passes.
    pub boost_interval: Duration,
    pub frame_timeout: Duration,
    /// Consecutive empty waits before the stream is reported missing.
    pub empty_reads_before_waiting: u32,
    pub identity_topic: String,
    pub per_identity_gap: Duration,
    pub global_cooldown: Duration,
    pub health_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_face_px: 48,
            fast_upsample: 0,
            boost_upsample: 1,
            boost_interval: Duration::from_secs(2),
            frame_timeout: Duration::from_secs(2),
            empty_reads_before_waiting: 10,
            identity_topic: DEFAULT_IDENTITY_TOPIC.to_string(),
            per_identity_gap: crate::transport::DEFAULT_PER_IDENTITY_GAP,
            global_cooldown: crate::transport::DEFAULT_GLOBAL_COOLDOWN,
            health_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    WaitingForStream,
    Running,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WaitingForStream => write!(f, "waiting for stream"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Counters readable from other threads while the orchestrator runs.
#[derive(Clone, Debug)]
pub struct PipelineMonitor {
    waiting: Arc<AtomicBool>,
    frames_processed: Arc<AtomicU64>,
    faces_seen: Arc<AtomicU64>,
    identities_published: Arc<AtomicU64>,
}

impl Default for PipelineMonitor {
    fn default() -> Self {
        Self {
            waiting: Arc::new(AtomicBool::new(true)),
            frames_processed: Arc::default(),
            faces_seen: Arc::default(),
            identities_published: Arc::default(),
        }
    }
}

impl PipelineMonitor {
    pub fn status(&self) -> PipelineStatus {
        if self.waiting.load(Ordering::Relaxed) {
            PipelineStatus::WaitingForStream
        } else {
            PipelineStatus::Running
        }
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn faces_seen(&self) -> u64 {
        self.faces_seen.load(Ordering::Relaxed)
    }

    pub fn identities_published(&self) -> u64 {
        self.identities_published.load(Ordering::Relaxed)
    }
}

/// Outcome for one face in a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceResult {
    pub face: FaceBox,
    pub outcome: MatchOutcome,
    pub published: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameReport {
    pub seq: u64,
    /// The boost pass ran on this frame.
    pub boosted: bool,
    /// Vision motion was recorded (false when a recent sensor trigger won).
    pub vision_motion: bool,
    pub faces: Vec<FaceResult>,
}

/// Shared status handles included in the periodic health line.
#[derive(Clone, Default)]
pub struct HealthSources {
    pub stream: Option<Arc<StreamStatus>>,
    pub recorder: Option<Arc<RecorderStatus>>,
    pub distributor: Option<Arc<FrameDistributor>>,
}

pub struct Orchestrator {
    settings: PipelineSettings,
    detector: Box<dyn FaceDetector>,
    encoder: Box<dyn FaceEncoder>,
    matcher: IdentityMatcher,
    motion: MotionState,
    sink: Arc<dyn EventSink>,
    gate: PublishGate,
    monitor: PipelineMonitor,
    health: HealthSources,
    last_boost: Option<Instant>,
    last_frame_at: Option<Instant>,
    fps_ema: f32,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        detector: Box<dyn FaceDetector>,
        encoder: Box<dyn FaceEncoder>,
        matcher: IdentityMatcher,
        motion: MotionState,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let gate = PublishGate::new(settings.per_identity_gap, settings.global_cooldown);
        Self {
            settings,
            detector,
            encoder,
            matcher,
            motion,
            sink,
            gate,
            monitor: PipelineMonitor::default(),
            health: HealthSources::default(),
            last_boost: None,
            last_frame_at: None,
            fps_ema: 0.0,
        }
    }

    pub fn with_health(mut self, health: HealthSources) -> Self {
        self.health = health;
        self
    }

    pub fn monitor(&self) -> PipelineMonitor {
        self.monitor.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.monitor.status()
    }

    /// Smoothed processing rate in frames per second.
    pub fn fps(&self) -> f32 {
        self.fps_ema
    }

    /// Warm up the detector so the first real frame is not slow.
    pub fn warm_up(&mut self) -> Result<()> {
        self.detector
            .warm_up()
            .with_context(|| format!("{} detector warm-up failed", self.detector.name()))
    }

    /// Run detection, motion, matching and publishing for one frame.
    ///
    /// Errors come from the detector only; per-face encoding failures are
    /// logged and skipped.
    pub fn process_frame(&mut self, frame: &Frame, now: Instant) -> Result<FrameReport> {
        self.update_fps(now);
        self.monitor.waiting.store(false, Ordering::Relaxed);
        self.monitor.frames_processed.fetch_add(1, Ordering::Relaxed);

        let mut report = FrameReport {
            seq: frame.seq,
            ..FrameReport::default()
        };

        let (faces, boosted) = self.detect(frame, now)?;
        report.boosted = boosted;
        if faces.is_empty() {
            return Ok(report);
        }

        self.monitor
            .faces_seen
            .fetch_add(faces.len() as u64, Ordering::Relaxed);
        report.vision_motion = self.motion.report_vision_motion_at(now);

        for face in faces {
            let encoded = self
                .encoder
                .encode(frame.pixels(), frame.width, frame.height, &face);
            let embedding = match encoded {
                Ok(embedding) => embedding,
                Err(e) => {
                    log::warn!("frame {}: encoding face {:?} failed: {:#}", frame.seq, face, e);
                    continue;
                }
            };
            let outcome = self.matcher.match_embedding(&embedding);
            let published = self.maybe_publish(&outcome, now);
            log::debug!(
                "frame {}: {} ({:.2}){}",
                frame.seq,
                outcome.label,
                outcome.confidence,
                if published { " published" } else { "" }
            );
            report.faces.push(FaceResult {
                face,
                outcome,
                published,
            });
        }
        Ok(report)
    }

    /// Pull frames until `cancel` fires or the distributor closes.
    pub fn run(&mut self, frames: &FrameReceiver, cancel: &CancelToken) {
        log::info!(
            "orchestrator started (detector: {}, encoder: {})",
            self.detector.name(),
            self.encoder.name()
        );
        let mut empty_reads = 0u32;
        let mut last_health = Instant::now();

        while !cancel.is_cancelled() {
            match frames.recv_timeout(self.settings.frame_timeout) {
                Some(frame) => {
                    empty_reads = 0;
                    if let Err(e) = self.process_frame(&frame, Instant::now()) {
                        log::warn!("frame {}: detection failed: {:#}", frame.seq, e);
                    }
                }
                None if frames.is_closed() => {
                    log::info!("frame source closed");
                    break;
                }
                None => {
                    empty_reads += 1;
                    if empty_reads >= self.settings.empty_reads_before_waiting {
                        log::warn!("no frames received, waiting for stream");
                        self.monitor.waiting.store(true, Ordering::Relaxed);
                        empty_reads = 0;
                    }
                }
            }

            if last_health.elapsed() >= self.settings.health_interval {
                self.log_health(frames);
                last_health = Instant::now();
            }
        }
        log::info!(
            "orchestrator stopped after {} frames, {} identities published",
            self.monitor.frames_processed(),
            self.monitor.identities_published()
        );
    }

    /// Fast pass, then a rate-limited boost pass when the fast pass finds
    /// nothing usable.
    fn detect(&mut self, frame: &Frame, now: Instant) -> Result<(Vec<FaceBox>, bool)> {
        let faces = self.detect_pass(frame, self.settings.fast_upsample)?;
        if !faces.is_empty() {
            return Ok((faces, false));
        }
        let boost_due = self
            .last_boost
            .map_or(true, |t| now.saturating_duration_since(t) >= self.settings.boost_interval);
        if !boost_due {
            return Ok((faces, false));
        }
        self.last_boost = Some(now);
        let faces = self.detect_pass(frame, self.settings.boost_upsample)?;
        Ok((faces, true))
    }

    fn detect_pass(&mut self, frame: &Frame, upsample: u32) -> Result<Vec<FaceBox>> {
        let mut faces = self
            .detector
            .detect(frame.pixels(), frame.width, frame.height, upsample)?;
        faces.retain(|f| f.passes_min_size(self.settings.min_face_px));
        Ok(faces)
    }

    fn maybe_publish(&mut self, outcome: &MatchOutcome, now: Instant) -> bool {
        let Some(identity_id) = outcome.identity_id.as_deref() else {
            return false;
        };
        if !self.gate.try_acquire(identity_id, now) {
            return false;
        }
        let Some(detection) = IdentityDetection::from_outcome(outcome, chrono::Local::now())
        else {
            return false;
        };
        let payload = match detection.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("{:#}", e);
                return false;
            }
        };
        let sent = self.sink.publish(&self.settings.identity_topic, payload);
        if sent {
            self.monitor
                .identities_published
                .fetch_add(1, Ordering::Relaxed);
            log::info!(
                "identity detected: {} (conf: {:.2})",
                detection.user_name,
                detection.confidence
            );
        } else {
            log::debug!("identity {} not published: bus unavailable", identity_id);
        }
        sent
    }

    fn update_fps(&mut self, now: Instant) {
        if let Some(prev) = self.last_frame_at {
            let dt = now.saturating_duration_since(prev).as_secs_f32();
            if dt > 0.0 {
                self.fps_ema = 0.9 * self.fps_ema + 0.1 * (1.0 / dt);
            }
        }
        self.last_frame_at = Some(now);
    }

    fn log_health(&self, frames: &FrameReceiver) {
        let motion = self.motion.snapshot();
        let stream = self
            .health
            .stream
            .as_ref()
            .map(|s| s.snapshot())
            .unwrap_or_default();
        let recording = self
            .health
            .recorder
            .as_ref()
            .map(|r| if r.is_recording() { "recording" } else { "idle" })
            .unwrap_or("disabled");
        let dropped = match &self.health.distributor {
            Some(dist) => dist
                .drop_counts()
                .iter()
                .map(|(name, n)| format!("{}={}", name, n))
                .collect::<Vec<_>>()
                .join(","),
            None => format!("{}={}", frames.name(), frames.dropped()),
        };
        log::info!(
            "health status={} stream={} frames={} reconnects={} fps={:.1} motion={}({}) mqtt={} recorder={} dropped[{}]",
            self.status(),
            stream.connected,
            stream.frames_captured,
            stream.reconnects,
            self.fps_ema,
            motion.active,
            motion.source,
            self.sink.is_connected(),
            recording,
            dropped
        );
    }
}
