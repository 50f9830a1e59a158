//! facewatch: edge gateway for a home security camera.
//!
//! The gateway pulls frames from an IP camera, recognises enrolled household
//! members, records motion clips with pre-motion context, and exchanges
//! events with the rest of the system over MQTT.
//!
//! # Architecture
//!
//! ```text
//!   camera ──> StreamReader ──> FrameDistributor ──┬──> Orchestrator ──> MQTT (identities)
//!                                                   └──> MotionRecorder ──> *.avi clips
//!   MQTT (sensor motion) ──> MotionState <── Orchestrator (vision motion)
//! ```
//!
//! Threads: the reader, the recorder, the MQTT listener and the orchestrator.
//! They share only the distributor, the motion state, the identity snapshot
//! handle and the publisher. Every blocking wait observes a [`CancelToken`].
//!
//! # Module Structure
//!
//! - `ingest`: frame sources and the reconnecting stream reader
//! - `distribute`: latest-wins fan-out to consumers
//! - `motion`: fused sensor/vision motion state
//! - `identity`: identity store, immutable snapshot, nearest-identity matcher
//! - `detect`: face detector and encoder backends
//! - `recorder`: motion-triggered MJPEG/AVI clips with storage budget
//! - `transport`: MQTT bus, payloads and publish rate limiting
//! - `pipeline`: per-frame orchestration and health reporting
//! - `config`: file + environment configuration

pub mod config;
pub mod detect;
pub mod distribute;
pub mod frame;
pub mod identity;
pub mod ingest;
pub mod motion;
pub mod pipeline;
pub mod recorder;
pub mod shutdown;
pub mod transport;

pub use config::GatewayConfig;
pub use detect::{FaceBox, FaceDetector, FaceEncoder};
pub use distribute::{FrameDistributor, FrameReceiver};
pub use frame::{Frame, PreMotionBuffer};
pub use identity::{
    IdentityMatcher, IdentitySnapshot, IdentityStore, MatchOutcome, MatcherThresholds,
    SnapshotHandle,
};
pub use ingest::{open_source, FrameSource, SourceConfig, StreamReader};
pub use motion::{MotionSnapshot, MotionSource, MotionState};
pub use pipeline::{Orchestrator, PipelineSettings, PipelineStatus};
pub use recorder::{MotionRecorder, RecorderConfig, RecorderState};
pub use shutdown::CancelToken;
pub use transport::{EventSink, MqttBus, PublishGate};
