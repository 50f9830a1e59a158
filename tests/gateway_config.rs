use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use facewatch::config::{DetectorBackend, GatewayConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FACEWATCH_CONFIG",
        "FACEWATCH_STREAM_URL",
        "FACEWATCH_MQTT_BROKER",
        "FACEWATCH_MQTT_USERNAME",
        "FACEWATCH_MQTT_PASSWORD",
        "FACEWATCH_RECORDING_DIR",
        "FACEWATCH_RECORDING_MAX_BYTES",
        "FACEWATCH_IDENTITY_DB",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "stream": {
            "url": "rtsp://camera-1/stream",
            "target_fps": 12,
            "width": 800,
            "height": 600,
            "reconnect_delay_secs": 1.5
        },
        "mqtt": {
            "broker": "mqtt://broker.lan:1884",
            "client_id": "gateway-porch",
            "status_topic": ""
        },
        "matcher": { "tolerance": 0.45, "margin": 0.05 },
        "detection": { "min_face_px": 64, "boost_interval_secs": 3 },
        "recording": { "dir": "/var/lib/facewatch/clips", "pre_motion_secs": 3 },
        "identity": { "db_path": "faces.db" }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("FACEWATCH_CONFIG", file.path());
    std::env::set_var("FACEWATCH_MQTT_BROKER", "mqtts://secure.lan:8883");
    std::env::set_var("FACEWATCH_RECORDING_MAX_BYTES", "1048576");
    std::env::set_var("FACEWATCH_IDENTITY_DB", "/data/identities.db");

    let cfg = GatewayConfig::load().expect("load config");

    assert_eq!(cfg.stream.url, "rtsp://camera-1/stream");
    assert_eq!(cfg.stream.target_fps, 12);
    assert_eq!(cfg.stream.width, 800);
    assert_eq!(cfg.stream.height, 600);
    assert_eq!(cfg.stream.reconnect_delay, Duration::from_millis(1500));
    assert_eq!(cfg.mqtt.broker, "mqtts://secure.lan:8883");
    assert_eq!(cfg.mqtt.client_id, "gateway-porch");
    assert_eq!(cfg.mqtt.status_topic, None);
    assert_eq!(cfg.mqtt.reload_topic.as_deref(), Some("security/camera/reload"));
    assert!((cfg.matcher.tolerance - 0.45).abs() < 1e-6);
    assert!((cfg.matcher.margin - 0.05).abs() < 1e-6);
    assert_eq!(cfg.detection.min_face_px, 64);
    assert_eq!(cfg.detection.boost_interval, Duration::from_secs(3));
    assert_eq!(cfg.detection.backend, DetectorBackend::Stub);
    assert_eq!(cfg.recording.dir, PathBuf::from("/var/lib/facewatch/clips"));
    assert_eq!(cfg.recording.pre_motion_secs, 3);
    assert_eq!(cfg.recording.max_bytes, 1_048_576);
    assert_eq!(cfg.identity.db_path, "/data/identities.db");

    let settings = cfg.mqtt_settings().unwrap();
    assert!(settings.endpoint.use_tls);
    assert_eq!(settings.endpoint.port, 8883);
    assert_eq!(settings.availability_topic(), "gateway-porch/availability");

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("facewatch.toml");
    std::fs::write(
        &path,
        r#"
[stream]
url = "http://esp32-cam.local:81/stream"

[recording]
enabled = false
post_motion_secs = 20

[publish]
per_identity_gap_secs = 30
"#,
    )
    .unwrap();

    let cfg = GatewayConfig::load_from(Some(&path)).expect("load toml");
    assert_eq!(cfg.stream.url, "http://esp32-cam.local:81/stream");
    assert!(!cfg.recording.enabled);
    assert_eq!(cfg.recording.post_motion, Duration::from_secs(20));
    assert_eq!(cfg.publish.per_identity_gap, Duration::from_secs(30));
    assert_eq!(cfg.publish.global_cooldown, Duration::from_secs(1));
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = GatewayConfig::load().expect("defaults");
    assert!(cfg.stream.url.starts_with("stub://"));
    assert_eq!(cfg.mqtt.broker, "localhost:1883");
    assert_eq!(cfg.mqtt.identity_topic, "security/camera/family_detected");
    assert_eq!(cfg.motion.expiry, Duration::from_secs(10));
    assert_eq!(cfg.motion.sensor_priority, Duration::from_secs(5));
    assert_eq!(cfg.recording.post_motion, Duration::from_secs(10));
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for json in [
        r#"{"matcher": {"tolerance": 0}}"#,
        r#"{"matcher": {"tolerance": 2.0}}"#,
        r#"{"matcher": {"margin": -0.5}}"#,
        r#"{"stream": {"target_fps": 0}}"#,
        r#"{"recording": {"max_bytes": 0}}"#,
        r#"{"recording": {"pre_motion_secs": 120}}"#,
        r#"{"detection": {"backend": "dlib"}}"#,
        r#"{"motion": {"expiry_secs": -1}}"#,
        r#"{"unknown_section": {}}"#,
    ] {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        assert!(
            GatewayConfig::load_from(Some(file.path())).is_err(),
            "accepted {}",
            json
        );
    }
}

#[test]
fn non_numeric_budget_env_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FACEWATCH_RECORDING_MAX_BYTES", "lots");
    let err = GatewayConfig::load().unwrap_err();
    assert!(err.to_string().contains("FACEWATCH_RECORDING_MAX_BYTES"));

    clear_env();
}
