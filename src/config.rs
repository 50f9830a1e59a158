//! Gateway configuration: optional file, environment overrides, validation.
//!
//! The file is JSON, or TOML when its extension is `.toml`. Every field is
//! optional; missing values fall back to the defaults below.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::frame::MAX_PRE_MOTION_SECS;
use crate::identity::MatcherThresholds;
use crate::ingest::{ReconnectPolicy, SourceConfig};
use crate::motion::MotionState;
use crate::pipeline::PipelineSettings;
use crate::recorder::RecorderConfig;
use crate::transport::messages::{
    DEFAULT_IDENTITY_TOPIC, DEFAULT_MOTION_TOPIC, DEFAULT_RELOAD_TOPIC, DEFAULT_STATUS_TOPIC,
};
use crate::transport::{parse_mqtt_endpoint, InboundRouter, MqttSettings, TlsMaterials};

pub const CONFIG_ENV: &str = "FACEWATCH_CONFIG";

const DEFAULT_STREAM_URL: &str = "stub://front_door";
const DEFAULT_STREAM_FPS: u32 = 10;
const DEFAULT_STREAM_WIDTH: u32 = 640;
const DEFAULT_STREAM_HEIGHT: u32 = 480;
const DEFAULT_STREAM_RECONNECT_SECS: f64 = 3.0;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 30;
const DEFAULT_MQTT_BROKER: &str = "localhost:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "facewatch";
const DEFAULT_MQTT_RECONNECT_SECS: f64 = 5.0;
const DEFAULT_MOTION_EXPIRY_SECS: f64 = 10.0;
const DEFAULT_SENSOR_PRIORITY_SECS: f64 = 5.0;
const DEFAULT_MIN_FACE_PX: u32 = 48;
const DEFAULT_BOOST_INTERVAL_SECS: f64 = 2.0;
const DEFAULT_FRAME_TIMEOUT_SECS: f64 = 2.0;
const DEFAULT_DETECTOR_INPUT: (u32, u32) = (320, 240);
const DEFAULT_ENCODER_INPUT: u32 = 112;
const DEFAULT_RECORDING_DIR: &str = "recordings";
const DEFAULT_PRE_MOTION_SECS: u32 = 5;
const DEFAULT_POST_MOTION_SECS: f64 = 10.0;
const DEFAULT_RECORDING_MAX_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_PER_IDENTITY_GAP_SECS: f64 = 5.0;
const DEFAULT_GLOBAL_COOLDOWN_SECS: f64 = 1.0;
const DEFAULT_IDENTITY_DB: &str = "facewatch.db";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct GatewayConfigFile {
    stream: Option<StreamConfigFile>,
    mqtt: Option<MqttConfigFile>,
    motion: Option<MotionConfigFile>,
    matcher: Option<MatcherConfigFile>,
    detection: Option<DetectionConfigFile>,
    recording: Option<RecordingConfigFile>,
    publish: Option<PublishConfigFile>,
    identity: Option<IdentityConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    reconnect_delay_secs: Option<f64>,
    max_retries: Option<u32>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    enabled: Option<bool>,
    broker: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
    motion_topic: Option<String>,
    status_topic: Option<String>,
    reload_topic: Option<String>,
    identity_topic: Option<String>,
    reconnect_delay_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    expiry_secs: Option<f64>,
    sensor_priority_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct MatcherConfigFile {
    tolerance: Option<f32>,
    margin: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    detector_model: Option<PathBuf>,
    encoder_model: Option<PathBuf>,
    detector_input_width: Option<u32>,
    detector_input_height: Option<u32>,
    encoder_input_size: Option<u32>,
    min_face_px: Option<u32>,
    fast_upsample: Option<u32>,
    boost_upsample: Option<u32>,
    boost_interval_secs: Option<f64>,
    frame_timeout_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    enabled: Option<bool>,
    dir: Option<PathBuf>,
    fps: Option<u32>,
    pre_motion_secs: Option<u32>,
    post_motion_secs: Option<f64>,
    max_bytes: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct PublishConfigFile {
    per_identity_gap_secs: Option<f64>,
    global_cooldown_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct IdentityConfigFile {
    db_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub stream: StreamSettings,
    pub mqtt: MqttConfig,
    pub motion: MotionSettings,
    pub matcher: MatcherThresholds,
    pub detection: DetectionSettings,
    pub recording: RecordingSettings,
    pub publish: PublishSettings,
    pub identity: IdentitySettings,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub reconnect_delay: Duration,
    pub max_retries: Option<u32>,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
    pub motion_topic: String,
    /// Empty string in the file disables the topic.
    pub status_topic: Option<String>,
    pub reload_topic: Option<String>,
    pub identity_topic: String,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct MotionSettings {
    pub expiry: Duration,
    pub sensor_priority: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorBackend {
    Stub,
    Tract,
}

impl FromStr for DetectorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "stub" => Ok(Self::Stub),
            "tract" | "onnx" => Ok(Self::Tract),
            other => Err(anyhow!(
                "unknown detection backend '{}': expected 'stub' or 'tract'",
                other
            )),
        }
    }
}

impl std::fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stub => write!(f, "stub"),
            Self::Tract => write!(f, "tract"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: DetectorBackend,
    pub detector_model: Option<PathBuf>,
    pub encoder_model: Option<PathBuf>,
    pub detector_input: (u32, u32),
    pub encoder_input_size: u32,
    pub min_face_px: u32,
    pub fast_upsample: u32,
    pub boost_upsample: u32,
    pub boost_interval: Duration,
    pub frame_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub fps: u32,
    pub pre_motion_secs: u32,
    pub post_motion: Duration,
    pub max_bytes: u64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub per_identity_gap: Duration,
    pub global_cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub db_path: String,
}

impl GatewayConfig {
    /// Load from the file named by `FACEWATCH_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Like [`GatewayConfig::load`] with an explicit file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => GatewayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GatewayConfigFile) -> Result<Self> {
        let stream = file.stream.unwrap_or_default();
        let mqtt = file.mqtt.unwrap_or_default();
        let motion = file.motion.unwrap_or_default();
        let matcher = file.matcher.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let publish = file.publish.unwrap_or_default();
        let identity = file.identity.unwrap_or_default();
        let thresholds = MatcherThresholds::default();
        let target_fps = stream.target_fps.unwrap_or(DEFAULT_STREAM_FPS);

        Ok(Self {
            stream: StreamSettings {
                url: stream.url.unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
                target_fps,
                width: stream.width.unwrap_or(DEFAULT_STREAM_WIDTH),
                height: stream.height.unwrap_or(DEFAULT_STREAM_HEIGHT),
                reconnect_delay: secs(
                    "stream.reconnect_delay_secs",
                    stream
                        .reconnect_delay_secs
                        .unwrap_or(DEFAULT_STREAM_RECONNECT_SECS),
                )?,
                max_retries: stream.max_retries,
                max_consecutive_failures: stream
                    .max_consecutive_failures
                    .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            },
            mqtt: MqttConfig {
                enabled: mqtt.enabled.unwrap_or(true),
                broker: mqtt
                    .broker
                    .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
                tls_ca_path: mqtt.tls_ca_path,
                tls_client_cert_path: mqtt.tls_client_cert_path,
                tls_client_key_path: mqtt.tls_client_key_path,
                motion_topic: mqtt
                    .motion_topic
                    .unwrap_or_else(|| DEFAULT_MOTION_TOPIC.to_string()),
                status_topic: optional_topic(mqtt.status_topic, DEFAULT_STATUS_TOPIC),
                reload_topic: optional_topic(mqtt.reload_topic, DEFAULT_RELOAD_TOPIC),
                identity_topic: mqtt
                    .identity_topic
                    .unwrap_or_else(|| DEFAULT_IDENTITY_TOPIC.to_string()),
                reconnect_delay: secs(
                    "mqtt.reconnect_delay_secs",
                    mqtt.reconnect_delay_secs
                        .unwrap_or(DEFAULT_MQTT_RECONNECT_SECS),
                )?,
            },
            motion: MotionSettings {
                expiry: secs(
                    "motion.expiry_secs",
                    motion.expiry_secs.unwrap_or(DEFAULT_MOTION_EXPIRY_SECS),
                )?,
                sensor_priority: secs(
                    "motion.sensor_priority_secs",
                    motion
                        .sensor_priority_secs
                        .unwrap_or(DEFAULT_SENSOR_PRIORITY_SECS),
                )?,
            },
            matcher: MatcherThresholds {
                tolerance: matcher.tolerance.unwrap_or(thresholds.tolerance),
                margin: matcher.margin.unwrap_or(thresholds.margin),
            },
            detection: DetectionSettings {
                backend: match detection.backend.as_deref() {
                    Some(name) => name.parse()?,
                    None => DetectorBackend::Stub,
                },
                detector_model: detection.detector_model,
                encoder_model: detection.encoder_model,
                detector_input: (
                    detection
                        .detector_input_width
                        .unwrap_or(DEFAULT_DETECTOR_INPUT.0),
                    detection
                        .detector_input_height
                        .unwrap_or(DEFAULT_DETECTOR_INPUT.1),
                ),
                encoder_input_size: detection
                    .encoder_input_size
                    .unwrap_or(DEFAULT_ENCODER_INPUT),
                min_face_px: detection.min_face_px.unwrap_or(DEFAULT_MIN_FACE_PX),
                fast_upsample: detection.fast_upsample.unwrap_or(0),
                boost_upsample: detection.boost_upsample.unwrap_or(1),
                boost_interval: secs(
                    "detection.boost_interval_secs",
                    detection
                        .boost_interval_secs
                        .unwrap_or(DEFAULT_BOOST_INTERVAL_SECS),
                )?,
                frame_timeout: secs(
                    "detection.frame_timeout_secs",
                    detection
                        .frame_timeout_secs
                        .unwrap_or(DEFAULT_FRAME_TIMEOUT_SECS),
                )?,
            },
            recording: RecordingSettings {
                enabled: recording.enabled.unwrap_or(true),
                dir: recording
                    .dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDING_DIR)),
                // Clips play back at the capture rate unless overridden.
                fps: recording.fps.unwrap_or(target_fps),
                pre_motion_secs: recording
                    .pre_motion_secs
                    .unwrap_or(DEFAULT_PRE_MOTION_SECS),
                post_motion: secs(
                    "recording.post_motion_secs",
                    recording
                        .post_motion_secs
                        .unwrap_or(DEFAULT_POST_MOTION_SECS),
                )?,
                max_bytes: recording.max_bytes.unwrap_or(DEFAULT_RECORDING_MAX_BYTES),
                jpeg_quality: recording.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            publish: PublishSettings {
                per_identity_gap: secs(
                    "publish.per_identity_gap_secs",
                    publish
                        .per_identity_gap_secs
                        .unwrap_or(DEFAULT_PER_IDENTITY_GAP_SECS),
                )?,
                global_cooldown: secs(
                    "publish.global_cooldown_secs",
                    publish
                        .global_cooldown_secs
                        .unwrap_or(DEFAULT_GLOBAL_COOLDOWN_SECS),
                )?,
            },
            identity: IdentitySettings {
                db_path: identity
                    .db_path
                    .unwrap_or_else(|| DEFAULT_IDENTITY_DB.to_string()),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_value("FACEWATCH_STREAM_URL") {
            self.stream.url = url;
        }
        if let Some(broker) = env_value("FACEWATCH_MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(username) = env_value("FACEWATCH_MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("FACEWATCH_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(dir) = env_value("FACEWATCH_RECORDING_DIR") {
            self.recording.dir = PathBuf::from(dir);
        }
        if let Some(max_bytes) = env_value("FACEWATCH_RECORDING_MAX_BYTES") {
            self.recording.max_bytes = max_bytes.parse().map_err(|_| {
                anyhow!("FACEWATCH_RECORDING_MAX_BYTES must be an integer number of bytes")
            })?;
        }
        if let Some(db_path) = env_value("FACEWATCH_IDENTITY_DB") {
            self.identity.db_path = db_path;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.stream.url.trim().is_empty() {
            bail!("stream.url must not be empty");
        }
        if self.stream.target_fps == 0 {
            bail!("stream.target_fps must be greater than zero");
        }
        if self.stream.width == 0 || self.stream.height == 0 {
            bail!("stream.width and stream.height must be greater than zero");
        }
        if self.stream.max_consecutive_failures == 0 {
            bail!("stream.max_consecutive_failures must be greater than zero");
        }
        if self.recording.fps == 0 {
            bail!("recording.fps must be greater than zero");
        }
        if self.recording.fps != self.stream.target_fps {
            log::warn!(
                "recording.fps {} differs from stream.target_fps {}; playback speed will be off",
                self.recording.fps,
                self.stream.target_fps
            );
        }
        let tolerance = self.matcher.tolerance;
        if tolerance.is_nan() || tolerance <= 0.0 || tolerance >= 2.0 {
            bail!("matcher.tolerance must be in (0, 2), got {}", tolerance);
        }
        if self.matcher.margin.is_nan() || self.matcher.margin < 0.0 {
            bail!("matcher.margin must be non-negative, got {}", self.matcher.margin);
        }
        if self.recording.max_bytes == 0 {
            bail!("recording.max_bytes must be greater than zero");
        }
        if self.recording.pre_motion_secs > MAX_PRE_MOTION_SECS {
            bail!(
                "recording.pre_motion_secs must be at most {}, got {}",
                MAX_PRE_MOTION_SECS,
                self.recording.pre_motion_secs
            );
        }
        if !(1..=100).contains(&self.recording.jpeg_quality) {
            bail!("recording.jpeg_quality must be between 1 and 100");
        }
        if self.detection.min_face_px == 0 {
            bail!("detection.min_face_px must be greater than zero");
        }
        if self.detection.frame_timeout.is_zero() {
            bail!("detection.frame_timeout_secs must be greater than zero");
        }
        if self.detection.backend == DetectorBackend::Tract
            && (self.detection.detector_model.is_none() || self.detection.encoder_model.is_none())
        {
            bail!("detection backend 'tract' requires detector_model and encoder_model");
        }
        if self.mqtt.enabled {
            parse_mqtt_endpoint(&self.mqtt.broker, false)
                .with_context(|| format!("invalid mqtt.broker '{}'", self.mqtt.broker))?;
            if self.mqtt.client_id.trim().is_empty() {
                bail!("mqtt.client_id must not be empty");
            }
            if self.mqtt.motion_topic.trim().is_empty() || self.mqtt.identity_topic.trim().is_empty()
            {
                bail!("mqtt motion and identity topics must not be empty");
            }
        }
        Ok(())
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            url: self.stream.url.clone(),
            target_fps: self.stream.target_fps,
            width: self.stream.width,
            height: self.stream.height,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            reconnect_delay: self.stream.reconnect_delay,
            max_retries: self.stream.max_retries,
            max_consecutive_failures: self.stream.max_consecutive_failures,
            ..ReconnectPolicy::default()
        }
    }

    pub fn motion_state(&self) -> MotionState {
        MotionState::new(self.motion.expiry, self.motion.sensor_priority)
    }

    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            dir: self.recording.dir.clone(),
            fps: self.recording.fps,
            pre_motion_secs: self.recording.pre_motion_secs,
            post_motion: self.recording.post_motion,
            max_storage_bytes: self.recording.max_bytes,
            jpeg_quality: self.recording.jpeg_quality,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            min_face_px: self.detection.min_face_px,
            fast_upsample: self.detection.fast_upsample,
            boost_upsample: self.detection.boost_upsample,
            boost_interval: self.detection.boost_interval,
            frame_timeout: self.detection.frame_timeout,
            identity_topic: self.mqtt.identity_topic.clone(),
            per_identity_gap: self.publish.per_identity_gap,
            global_cooldown: self.publish.global_cooldown,
            ..PipelineSettings::default()
        }
    }

    pub fn inbound_router(&self) -> InboundRouter {
        InboundRouter {
            motion_topic: self.mqtt.motion_topic.clone(),
            status_topic: self.mqtt.status_topic.clone(),
            reload_topic: self.mqtt.reload_topic.clone(),
        }
    }

    /// Broker connection settings, reading TLS files from disk.
    pub fn mqtt_settings(&self) -> Result<MqttSettings> {
        let endpoint = parse_mqtt_endpoint(&self.mqtt.broker, false)?;
        let tls = TlsMaterials::load(
            self.mqtt.tls_ca_path.as_deref(),
            self.mqtt.tls_client_cert_path.as_deref(),
            self.mqtt.tls_client_key_path.as_deref(),
        )?;
        let mut settings = MqttSettings::new(endpoint, self.mqtt.client_id.clone());
        settings.username = self.mqtt.username.clone();
        settings.password = self.mqtt.password.clone();
        settings.tls = tls;
        settings.reconnect_delay = self.mqtt.reconnect_delay;
        Ok(settings)
    }
}

fn read_config_file(path: &Path) -> Result<GatewayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn optional_topic(value: Option<String>, default: &str) -> Option<String> {
    match value {
        Some(topic) if topic.trim().is_empty() => None,
        Some(topic) => Some(topic),
        None => Some(default.to_string()),
    }
}

fn secs(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds, got {}", name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PreMotionBuffer;

    fn defaults() -> GatewayConfig {
        GatewayConfig::from_file(GatewayConfigFile::default()).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = defaults();
        cfg.validate().unwrap();
        assert_eq!(cfg.stream.target_fps, 10);
        assert_eq!(cfg.stream.reconnect_delay, Duration::from_secs(3));
        assert_eq!(cfg.matcher, MatcherThresholds::default());
        assert_eq!(cfg.detection.min_face_px, 48);
        assert_eq!(cfg.recording.pre_motion_secs, 5);
        assert_eq!(cfg.mqtt.motion_topic, DEFAULT_MOTION_TOPIC);
        assert_eq!(cfg.mqtt.status_topic.as_deref(), Some(DEFAULT_STATUS_TOPIC));
        assert_eq!(cfg.publish.per_identity_gap, Duration::from_secs(5));
    }

    #[test]
    fn recording_fps_defaults_to_stream_rate() {
        let file: GatewayConfigFile =
            serde_json::from_str(r#"{"stream": {"target_fps": 20}}"#).unwrap();
        let cfg = GatewayConfig::from_file(file).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.recording.fps, 20);
        let recorder = cfg.recorder_config();
        assert_eq!(recorder.fps, 20);
        // Five seconds of pre-motion footage at the capture rate.
        assert_eq!(
            PreMotionBuffer::for_duration(recorder.pre_motion_secs, recorder.fps).capacity(),
            100
        );
    }

    #[test]
    fn empty_optional_topic_disables_it() {
        assert_eq!(optional_topic(Some(String::new()), "x"), None);
        assert_eq!(optional_topic(None, "x").as_deref(), Some("x"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut cfg = defaults();
        cfg.matcher.tolerance = 2.5;
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.matcher.margin = -0.1;
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.recording.pre_motion_secs = 61;
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.stream.target_fps = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.recording.max_bytes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = defaults();
        cfg.detection.backend = DetectorBackend::Tract;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_durations_are_rejected() {
        assert!(secs("x", -1.0).is_err());
        assert!(secs("x", f64::NAN).is_err());
        assert_eq!(secs("x", 0.5).unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn backend_parses_case_insensitively() {
        assert_eq!("STUB".parse::<DetectorBackend>().unwrap(), DetectorBackend::Stub);
        assert_eq!("onnx".parse::<DetectorBackend>().unwrap(), DetectorBackend::Tract);
        assert!("dlib".parse::<DetectorBackend>().is_err());
    }

    #[test]
    fn derived_settings_follow_config() {
        let mut cfg = defaults();
        cfg.detection.min_face_px = 64;
        cfg.mqtt.identity_topic = "home/faces".to_string();
        cfg.recording.fps = 15;
        let pipeline = cfg.pipeline_settings();
        assert_eq!(pipeline.min_face_px, 64);
        assert_eq!(pipeline.identity_topic, "home/faces");
        assert_eq!(cfg.recorder_config().fps, 15);
        assert_eq!(cfg.reconnect_policy().max_consecutive_failures, 30);
        let settings = cfg.mqtt_settings().unwrap();
        assert_eq!(settings.endpoint.port, 1883);
        assert_eq!(settings.client_id, "facewatch");
    }
}
