//! facewatchd - edge gateway daemon
//!
//! This daemon:
//! 1. Reads frames from the configured camera, reconnecting as needed
//! 2. Fans frames out to the face pipeline and the motion recorder
//! 3. Detects and matches faces against the enrolled identities
//! 4. Publishes accepted identities over MQTT, rate limited per identity
//! 5. Records motion clips (sensor or vision triggered) with pre-motion frames
//! 6. Keeps the recording directory under its storage budget

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use facewatch::config::{DetectorBackend, GatewayConfig};
use facewatch::detect::{FaceDetector, FaceEncoder, StubFaceDetector, StubFaceEncoder};
use facewatch::identity::{IdentitySnapshot, IdentityStore, SqliteIdentityStore};
use facewatch::pipeline::HealthSources;
use facewatch::recorder::AviClipSink;
use facewatch::transport::{InboundHandler, InboundMessage, MqttBus, MqttPublisher};
use facewatch::{
    open_source, CancelToken, EventSink, FrameDistributor, IdentityMatcher, MotionRecorder,
    MotionState, Orchestrator, SnapshotHandle, StreamReader,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Face recognition and motion recording gateway")]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "FACEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Run without the motion recorder.
    #[arg(long)]
    no_recording: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = GatewayConfig::load_from(args.config.as_deref())?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown signal received");
            cancel.cancel();
        })
        .context("error setting Ctrl-C handler")?;
    }

    // Identities. A missing or broken store leaves the matcher empty; faces
    // are then reported as Unknown until a reload succeeds.
    let store: Option<Arc<SqliteIdentityStore>> =
        match SqliteIdentityStore::open(&cfg.identity.db_path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                log::error!("identity store unavailable: {:#}", e);
                None
            }
        };
    let snapshot = match &store {
        Some(store) => IdentitySnapshot::load(store.as_ref()).unwrap_or_else(|e| {
            log::error!("failed to load identities: {:#}", e);
            IdentitySnapshot::empty()
        }),
        None => IdentitySnapshot::empty(),
    };
    log::info!(
        "loaded {} identities ({} samples) from {}",
        snapshot.identity_count(),
        snapshot.sample_count(),
        cfg.identity.db_path
    );
    let snapshots = SnapshotHandle::new(snapshot);
    let motion = cfg.motion_state();

    // Message bus
    let mut bus = if cfg.mqtt.enabled {
        let handler = inbound_handler(motion.clone(), snapshots.clone(), store.clone());
        Some(MqttBus::start(
            cfg.mqtt_settings()?,
            cfg.inbound_router(),
            handler,
        )?)
    } else {
        log::warn!("MQTT disabled; identities will not be published");
        None
    };
    let sink: Arc<dyn EventSink> = match &bus {
        Some(bus) => bus.publisher(),
        None => Arc::new(MqttPublisher::default()),
    };

    // Frame fan-out
    let distributor = Arc::new(FrameDistributor::new());
    let pipeline_rx = distributor.subscribe("pipeline");

    let mut recorder_status = None;
    let recorder_handle = if cfg.recording.enabled && !args.no_recording {
        let sink = Box::new(AviClipSink::new(cfg.recording.jpeg_quality));
        match MotionRecorder::new(cfg.recorder_config(), motion.clone(), sink) {
            Ok(recorder) => {
                recorder_status = Some(recorder.status());
                let rx = distributor.subscribe("recorder");
                let cancel = cancel.clone();
                log::info!(
                    "recording to {} (budget {} bytes, {} s pre-motion)",
                    cfg.recording.dir.display(),
                    cfg.recording.max_bytes,
                    cfg.recording.pre_motion_secs
                );
                Some(
                    std::thread::Builder::new()
                        .name("recorder".to_string())
                        .spawn(move || recorder.run(rx, cancel))
                        .context("failed to spawn recorder thread")?,
                )
            }
            Err(e) => {
                log::error!("recorder disabled: {:#}", e);
                None
            }
        }
    } else {
        log::info!("recording disabled");
        None
    };

    // Capture
    let source = open_source(&cfg.source_config())?;
    log::info!("stream source: {}", source.describe());
    let mut reader = StreamReader::start(
        source,
        cfg.reconnect_policy(),
        distributor.clone(),
        cancel.clone(),
    )?;

    // Face pipeline
    let (detector, encoder) = build_backends(&cfg)?;
    let matcher = IdentityMatcher::new(snapshots, cfg.matcher);
    let mut orchestrator = Orchestrator::new(
        cfg.pipeline_settings(),
        detector,
        encoder,
        matcher,
        motion,
        sink,
    )
    .with_health(HealthSources {
        stream: Some(reader.status()),
        recorder: recorder_status,
        distributor: Some(distributor.clone()),
    });
    if let Err(e) = orchestrator.warm_up() {
        log::warn!("{:#}", e);
    }

    log::info!(
        "facewatchd running (tolerance {:.2}, margin {:.2})",
        cfg.matcher.tolerance,
        cfg.matcher.margin
    );
    orchestrator.run(&pipeline_rx, &cancel);

    log::info!("stopping all threads...");
    cancel.cancel();
    reader.stop();
    if let Some(handle) = recorder_handle {
        if handle.join().is_err() {
            log::error!("recorder thread panicked");
        }
    }
    if let Some(bus) = bus.as_mut() {
        bus.stop();
    }
    log::info!("all threads stopped");
    Ok(())
}

fn inbound_handler(
    motion: MotionState,
    snapshots: SnapshotHandle,
    store: Option<Arc<SqliteIdentityStore>>,
) -> InboundHandler {
    Arc::new(move |message| match message {
        InboundMessage::Motion => {
            log::info!("motion from sensor");
            motion.report_sensor_motion();
        }
        InboundMessage::Status(report) => {
            log::info!(
                "sensor status: device={} status={}",
                report.device.as_deref().unwrap_or("?"),
                report.status.as_deref().unwrap_or("?")
            );
        }
        InboundMessage::Reload => match &store {
            Some(store) => {
                let store: &dyn IdentityStore = store.as_ref();
                match snapshots.reload(store) {
                    Ok(()) => log::info!(
                        "identities reloaded: {}",
                        snapshots.load().identity_count()
                    ),
                    Err(e) => log::error!("identity reload failed, keeping previous: {:#}", e),
                }
            }
            None => log::warn!("reload requested but identity store is unavailable"),
        },
        InboundMessage::Ignored => {}
    })
}

fn build_backends(cfg: &GatewayConfig) -> Result<(Box<dyn FaceDetector>, Box<dyn FaceEncoder>)> {
    match cfg.detection.backend {
        DetectorBackend::Stub => {
            log::warn!("using stub face backend; no faces will be detected");
            Ok((
                Box::new(StubFaceDetector::empty()),
                Box::new(StubFaceEncoder::default()),
            ))
        }
        DetectorBackend::Tract => build_tract_backends(cfg),
    }
}

#[cfg(feature = "backend-tract")]
fn build_tract_backends(
    cfg: &GatewayConfig,
) -> Result<(Box<dyn FaceDetector>, Box<dyn FaceEncoder>)> {
    use facewatch::detect::{TractFaceDetector, TractFaceEncoder};

    let detection = &cfg.detection;
    let detector_model = detection
        .detector_model
        .as_ref()
        .ok_or_else(|| anyhow!("detection.detector_model is required for the tract backend"))?;
    let encoder_model = detection
        .encoder_model
        .as_ref()
        .ok_or_else(|| anyhow!("detection.encoder_model is required for the tract backend"))?;
    let (w, h) = detection.detector_input;
    let detector = TractFaceDetector::new(detector_model, w, h)?;
    let encoder = TractFaceEncoder::new(encoder_model, detection.encoder_input_size)?;
    Ok((Box::new(detector), Box::new(encoder)))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract_backends(
    _cfg: &GatewayConfig,
) -> Result<(Box<dyn FaceDetector>, Box<dyn FaceEncoder>)> {
    Err(anyhow!(
        "detection backend 'tract' requires the 'backend-tract' feature.\n\
         Recompile with: cargo build --features backend-tract"
    ))
}
