//! Stream reader: keeps a source connected and feeds the frame distributor.
//!
//! Reconnect behaviour is a pure state machine (`ReaderState::on`) so it can be
//! tested without I/O. The thread in `StreamReader` only performs the I/O and
//! executes the action each transition asks for.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};

use super::FrameSource;
use crate::distribute::FrameDistributor;
use crate::frame::Frame;
use crate::shutdown::CancelToken;

/// Reconnect and failure thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait after a failed open before retrying.
    pub reconnect_delay: Duration,
    /// Give up after this many failed opens in a row. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Consecutive failed reads that force a reconnect.
    pub max_consecutive_failures: u32,
    /// Pause after each failed read.
    pub failed_read_pause: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            max_retries: None,
            max_consecutive_failures: 30,
            failed_read_pause: Duration::from_millis(20),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    /// Trying to open the source. `attempts` counts failed opens so far.
    Connecting { attempts: u32 },
    Streaming { consecutive_failures: u32 },
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderEvent {
    OpenSucceeded,
    OpenFailed,
    ReadSucceeded,
    ReadFailed,
    StopRequested,
}

/// What the reader thread must do after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderAction {
    Continue,
    /// Sleep `reconnect_delay`, then try to open again.
    WaitReconnect,
    /// Pause briefly, then read again.
    PauseAfterFailedRead,
    /// Close the source; the next step reopens it.
    CloseAndReconnect,
    /// Close the source and exit.
    Shutdown,
}

impl ReaderState {
    pub fn initial() -> Self {
        Self::Connecting { attempts: 0 }
    }

    /// Next state and the action that goes with it.
    pub fn on(self, event: ReaderEvent, policy: &ReconnectPolicy) -> (ReaderState, ReaderAction) {
        use ReaderAction as A;
        use ReaderEvent as E;
        use ReaderState as S;

        match (self, event) {
            (S::Stopped, _) => (S::Stopped, A::Continue),
            (_, E::StopRequested) => (S::Stopped, A::Shutdown),

            (S::Connecting { .. }, E::OpenSucceeded) => (
                S::Streaming {
                    consecutive_failures: 0,
                },
                A::Continue,
            ),
            (S::Connecting { attempts }, E::OpenFailed) => {
                let attempts = attempts.saturating_add(1);
                match policy.max_retries {
                    Some(max) if attempts > max => (S::Stopped, A::Shutdown),
                    _ => (S::Connecting { attempts }, A::WaitReconnect),
                }
            }

            (S::Streaming { .. }, E::ReadSucceeded) => (
                S::Streaming {
                    consecutive_failures: 0,
                },
                A::Continue,
            ),
            (
                S::Streaming {
                    consecutive_failures,
                },
                E::ReadFailed,
            ) => {
                let failures = consecutive_failures.saturating_add(1);
                if failures >= policy.max_consecutive_failures {
                    (S::Connecting { attempts: 0 }, A::CloseAndReconnect)
                } else {
                    (
                        S::Streaming {
                            consecutive_failures: failures,
                        },
                        A::PauseAfterFailedRead,
                    )
                }
            }

            // Events that cannot happen in this state leave it unchanged.
            (state, _) => (state, A::Continue),
        }
    }
}

/// Counters shared with the health reporter.
#[derive(Default)]
pub struct StreamStatus {
    connected: AtomicBool,
    frames_captured: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStatusSnapshot {
    pub connected: bool,
    pub frames_captured: u64,
    pub reconnects: u64,
}

impl StreamStatus {
    pub fn snapshot(&self) -> StreamStatusSnapshot {
        StreamStatusSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// Owns the capture thread.
pub struct StreamReader {
    cancel: CancelToken,
    status: Arc<StreamStatus>,
    handle: Option<JoinHandle<()>>,
}

impl StreamReader {
    /// Spawn the capture thread.
    ///
    /// `cancel` stops the reader; it is usually the process-wide token. On
    /// exit the source is closed and `distributor` is closed so consumers wake.
    pub fn start(
        source: Box<dyn FrameSource>,
        policy: ReconnectPolicy,
        distributor: Arc<FrameDistributor>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let status = Arc::new(StreamStatus::default());
        let worker = ReaderWorker {
            source,
            policy,
            distributor,
            cancel: cancel.clone(),
            status: status.clone(),
            next_seq: 0,
        };
        let handle = std::thread::Builder::new()
            .name("stream-reader".to_string())
            .spawn(move || worker.run())
            .context("spawn stream reader thread")?;
        Ok(Self {
            cancel,
            status,
            handle: Some(handle),
        })
    }

    pub fn status(&self) -> Arc<StreamStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal cancellation and wait for the thread to release the source.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("stream reader thread panicked");
            }
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReaderWorker {
    source: Box<dyn FrameSource>,
    policy: ReconnectPolicy,
    distributor: Arc<FrameDistributor>,
    cancel: CancelToken,
    status: Arc<StreamStatus>,
    next_seq: u64,
}

impl ReaderWorker {
    fn run(mut self) {
        let mut state = ReaderState::initial();
        log::info!("stream reader started for {}", self.source.describe());

        while state != ReaderState::Stopped {
            let event = if self.cancel.is_cancelled() {
                ReaderEvent::StopRequested
            } else {
                self.step(state)
            };
            let (next, action) = state.on(event, &self.policy);
            state = next;
            self.apply(action, state);
        }

        self.source.disconnect();
        self.status.connected.store(false, Ordering::Relaxed);
        self.distributor.close();
        log::info!("stream reader stopped");
    }

    /// Perform the I/O the current state calls for.
    fn step(&mut self, state: ReaderState) -> ReaderEvent {
        match state {
            ReaderState::Connecting { attempts } => {
                if attempts > 0 {
                    log::warn!("attempting reconnect #{}", attempts);
                }
                match self.source.connect() {
                    Ok(()) => {
                        log::info!("stream connected: {}", self.source.describe());
                        self.status.connected.store(true, Ordering::Relaxed);
                        ReaderEvent::OpenSucceeded
                    }
                    Err(e) => {
                        log::warn!("failed to open stream: {:#}", e);
                        ReaderEvent::OpenFailed
                    }
                }
            }
            ReaderState::Streaming { .. } => match self.source.next_frame() {
                Ok(image) => {
                    if image.pixels.len() != Frame::expected_len(image.width, image.height) {
                        log::warn!(
                            "discarding frame with {} bytes for {}x{}",
                            image.pixels.len(),
                            image.width,
                            image.height
                        );
                        return ReaderEvent::ReadFailed;
                    }
                    let frame = Frame::new(self.next_seq, image.pixels, image.width, image.height);
                    self.next_seq += 1;
                    self.status.frames_captured.fetch_add(1, Ordering::Relaxed);
                    self.distributor.publish(frame);
                    ReaderEvent::ReadSucceeded
                }
                Err(e) => {
                    log::debug!("frame read failed: {:#}", e);
                    ReaderEvent::ReadFailed
                }
            },
            ReaderState::Stopped => ReaderEvent::StopRequested,
        }
    }

    fn apply(&mut self, action: ReaderAction, state: ReaderState) {
        match action {
            ReaderAction::Continue => {}
            ReaderAction::WaitReconnect => {
                if let ReaderState::Connecting { attempts } = state {
                    log::warn!(
                        "reconnect failed ({} so far), retrying in {:?}",
                        attempts,
                        self.policy.reconnect_delay
                    );
                }
                self.cancel.wait_timeout(self.policy.reconnect_delay);
            }
            ReaderAction::PauseAfterFailedRead => {
                self.cancel.wait_timeout(self.policy.failed_read_pause);
            }
            ReaderAction::CloseAndReconnect => {
                log::warn!(
                    "{} consecutive read failures, reconnecting",
                    self.policy.max_consecutive_failures
                );
                self.source.disconnect();
                self.status.connected.store(false, Ordering::Relaxed);
                self.status.reconnects.fetch_add(1, Ordering::Relaxed);
            }
            ReaderAction::Shutdown => {
                if !self.cancel.is_cancelled() {
                    log::error!("max reconnect attempts reached, stopping reader");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::CapturedImage;
    use anyhow::anyhow;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            reconnect_delay: Duration::from_millis(1),
            max_retries: None,
            max_consecutive_failures: 3,
            failed_read_pause: Duration::from_millis(1),
        }
    }

    #[test]
    fn open_failure_waits_and_counts_attempts() {
        let (state, action) = ReaderState::initial().on(ReaderEvent::OpenFailed, &policy());
        assert_eq!(state, ReaderState::Connecting { attempts: 1 });
        assert_eq!(action, ReaderAction::WaitReconnect);

        let (state, action) = state.on(ReaderEvent::OpenSucceeded, &policy());
        assert_eq!(
            state,
            ReaderState::Streaming {
                consecutive_failures: 0
            }
        );
        assert_eq!(action, ReaderAction::Continue);
    }

    #[test]
    fn bounded_retries_stop_the_reader() {
        let policy = ReconnectPolicy {
            max_retries: Some(2),
            ..policy()
        };
        let mut state = ReaderState::initial();
        let mut actions = Vec::new();
        for _ in 0..3 {
            let (next, action) = state.on(ReaderEvent::OpenFailed, &policy);
            state = next;
            actions.push(action);
        }
        assert_eq!(state, ReaderState::Stopped);
        assert_eq!(
            actions,
            vec![
                ReaderAction::WaitReconnect,
                ReaderAction::WaitReconnect,
                ReaderAction::Shutdown
            ]
        );
    }

    #[test]
    fn consecutive_read_failures_force_reconnect() {
        let mut state = ReaderState::Streaming {
            consecutive_failures: 0,
        };
        let (next, action) = state.on(ReaderEvent::ReadFailed, &policy());
        assert_eq!(action, ReaderAction::PauseAfterFailedRead);
        state = next;
        let (next, _) = state.on(ReaderEvent::ReadFailed, &policy());
        state = next;
        let (next, action) = state.on(ReaderEvent::ReadFailed, &policy());
        assert_eq!(next, ReaderState::Connecting { attempts: 0 });
        assert_eq!(action, ReaderAction::CloseAndReconnect);
    }

    #[test]
    fn successful_read_resets_failure_count() {
        let state = ReaderState::Streaming {
            consecutive_failures: 2,
        };
        let (state, _) = state.on(ReaderEvent::ReadSucceeded, &policy());
        assert_eq!(
            state,
            ReaderState::Streaming {
                consecutive_failures: 0
            }
        );
    }

    #[test]
    fn stop_is_terminal_from_every_state() {
        for state in [
            ReaderState::initial(),
            ReaderState::Streaming {
                consecutive_failures: 1,
            },
        ] {
            let (next, action) = state.on(ReaderEvent::StopRequested, &policy());
            assert_eq!(next, ReaderState::Stopped);
            assert_eq!(action, ReaderAction::Shutdown);
        }
        let (next, _) = ReaderState::Stopped.on(ReaderEvent::OpenSucceeded, &policy());
        assert_eq!(next, ReaderState::Stopped);
    }

    /// Source that replays a script of results and records calls.
    struct ScriptedSource {
        opens: VecDeque<bool>,
        reads: VecDeque<bool>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl FrameSource for ScriptedSource {
        fn connect(&mut self) -> Result<()> {
            self.log.lock().unwrap().push("connect");
            if self.opens.pop_front().unwrap_or(true) {
                Ok(())
            } else {
                Err(anyhow!("refused"))
            }
        }

        fn next_frame(&mut self) -> Result<CapturedImage> {
            std::thread::sleep(Duration::from_millis(1));
            if self.reads.pop_front().unwrap_or(true) {
                Ok(CapturedImage {
                    pixels: vec![0; 3 * 2 * 2],
                    width: 2,
                    height: 2,
                })
            } else {
                Err(anyhow!("timeout"))
            }
        }

        fn disconnect(&mut self) {
            self.log.lock().unwrap().push("disconnect");
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[test]
    fn reader_recovers_and_releases_source_on_stop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedSource {
            opens: VecDeque::from([false, true, true]),
            reads: VecDeque::from([true, false, false, false]),
            log: log.clone(),
        };
        let distributor = Arc::new(FrameDistributor::new());
        let rx = distributor.subscribe("test");
        let cancel = CancelToken::new();
        let mut reader =
            StreamReader::start(Box::new(source), policy(), distributor, cancel).unwrap();

        let mut last_seq = None;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if let Some(frame) = rx.recv_timeout(Duration::from_millis(50)) {
                if let Some(prev) = last_seq {
                    assert!(frame.seq > prev);
                }
                last_seq = Some(frame.seq);
                if reader.status().snapshot().reconnects >= 1 && frame.seq >= 3 {
                    break;
                }
            }
        }
        let status = reader.status().snapshot();
        reader.stop();

        assert!(status.reconnects >= 1);
        assert!(status.frames_captured >= 2);
        assert!(rx.is_closed());
        assert!(!reader.status().is_connected());

        let calls = log.lock().unwrap().clone();
        assert_eq!(&calls[..2], &["connect", "connect"]);
        assert_eq!(calls.last(), Some(&"disconnect"));
    }

    #[test]
    fn giving_up_closes_distributor() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedSource {
            opens: VecDeque::from([false, false]),
            reads: VecDeque::new(),
            log: log.clone(),
        };
        let distributor = Arc::new(FrameDistributor::new());
        let rx = distributor.subscribe("test");
        let policy = ReconnectPolicy {
            max_retries: Some(1),
            ..policy()
        };
        let mut reader =
            StreamReader::start(Box::new(source), policy, distributor, CancelToken::new())
                .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_none());
        assert!(rx.is_closed());
        reader.stop();
        assert!(reader.is_finished());
        assert_eq!(log.lock().unwrap().iter().filter(|c| **c == "connect").count(), 2);
    }
}
