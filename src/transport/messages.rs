//! Payloads exchanged with the broker.
//!
//! Inbound, the motion sensor publishes `{"state": "detected"}` or
//! `{"event": "motion"}` on the motion topic; a boolean `true` is accepted in
//! either field. Outbound, accepted identities are published as
//! [`IdentityDetection`].

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::MatchOutcome;

pub const DEFAULT_MOTION_TOPIC: &str = "security/esp32/motion";
pub const DEFAULT_STATUS_TOPIC: &str = "security/esp32/status";
pub const DEFAULT_RELOAD_TOPIC: &str = "security/camera/reload";
pub const DEFAULT_IDENTITY_TOPIC: &str = "security/camera/family_detected";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

const MOTION_WORDS: &[&str] = &["detected", "motion"];

/// Whether a motion-topic payload reports motion.
///
/// Well-formed payloads that do not report motion (for example
/// `{"state": "clear"}`) return `Ok(false)`. Payloads that are not a JSON
/// object are an error.
pub fn parse_motion_payload(payload: &[u8]) -> Result<bool> {
    let value: Value = serde_json::from_slice(payload).context("motion payload is not JSON")?;
    let object = value
        .as_object()
        .ok_or_else(|| anyhow!("motion payload is not a JSON object"))?;

    let triggered = ["state", "event"]
        .iter()
        .filter_map(|key| object.get(*key))
        .any(|field| match field {
            Value::String(s) => MOTION_WORDS.iter().any(|w| s.trim().eq_ignore_ascii_case(w)),
            Value::Bool(b) => *b,
            _ => false,
        });
    Ok(triggered)
}

/// Device heartbeat from the sensor node.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub fn parse_status_payload(payload: &[u8]) -> Result<StatusReport> {
    serde_json::from_slice(payload).context("status payload is not a JSON object")
}

/// A routed inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    Motion,
    Status(StatusReport),
    Reload,
    /// Known topic, nothing to do (e.g. motion cleared) or an unknown topic.
    Ignored,
}

/// Maps topics to [`InboundMessage`]s.
#[derive(Clone, Debug)]
pub struct InboundRouter {
    pub motion_topic: String,
    pub status_topic: Option<String>,
    pub reload_topic: Option<String>,
}

impl Default for InboundRouter {
    fn default() -> Self {
        Self {
            motion_topic: DEFAULT_MOTION_TOPIC.to_string(),
            status_topic: Some(DEFAULT_STATUS_TOPIC.to_string()),
            reload_topic: Some(DEFAULT_RELOAD_TOPIC.to_string()),
        }
    }
}

impl InboundRouter {
    /// Topics the listener subscribes to.
    pub fn topics(&self) -> Vec<&str> {
        let mut topics = vec![self.motion_topic.as_str()];
        topics.extend(self.status_topic.as_deref());
        topics.extend(self.reload_topic.as_deref());
        topics
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<InboundMessage> {
        if topic == self.motion_topic {
            return Ok(if parse_motion_payload(payload)? {
                InboundMessage::Motion
            } else {
                InboundMessage::Ignored
            });
        }
        if self.status_topic.as_deref() == Some(topic) {
            return parse_status_payload(payload).map(InboundMessage::Status);
        }
        if self.reload_topic.as_deref() == Some(topic) {
            return Ok(InboundMessage::Reload);
        }
        Ok(InboundMessage::Ignored)
    }
}

/// Outbound notification for an accepted identity.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct IdentityDetection {
    pub user_id: String,
    pub user_name: String,
    pub confidence: f32,
    /// RFC 3339, local time.
    pub timestamp: String,
}

impl IdentityDetection {
    /// `None` unless the outcome was accepted.
    pub fn from_outcome(outcome: &MatchOutcome, at: DateTime<Local>) -> Option<Self> {
        let user_id = outcome.identity_id.clone()?;
        Some(Self {
            user_id,
            user_name: outcome.label.clone(),
            confidence: outcome.confidence,
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, false),
        })
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to serialize identity detection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_payload_variants() {
        assert!(parse_motion_payload(br#"{"state":"detected"}"#).unwrap());
        assert!(parse_motion_payload(br#"{"state":"DETECTED"}"#).unwrap());
        assert!(parse_motion_payload(br#"{"event":"motion"}"#).unwrap());
        assert!(parse_motion_payload(br#"{"event":"Detected","distance":120}"#).unwrap());
        assert!(parse_motion_payload(br#"{"state":true}"#).unwrap());
        assert!(!parse_motion_payload(br#"{"state":"clear"}"#).unwrap());
        assert!(!parse_motion_payload(br#"{"state":false}"#).unwrap());
        assert!(!parse_motion_payload(br#"{"other":"detected"}"#).unwrap());
    }

    #[test]
    fn malformed_motion_payload_is_an_error() {
        assert!(parse_motion_payload(b"detected").is_err());
        assert!(parse_motion_payload(b"[1,2]").is_err());
        assert!(parse_motion_payload(b"").is_err());
    }

    #[test]
    fn router_dispatches_by_topic() {
        let router = InboundRouter::default();
        assert_eq!(
            router
                .route(DEFAULT_MOTION_TOPIC, br#"{"state":"detected"}"#)
                .unwrap(),
            InboundMessage::Motion
        );
        assert_eq!(
            router.route(DEFAULT_MOTION_TOPIC, br#"{"state":"clear"}"#).unwrap(),
            InboundMessage::Ignored
        );
        assert_eq!(
            router
                .route(DEFAULT_STATUS_TOPIC, br#"{"device":"esp32-radar","status":"online"}"#)
                .unwrap(),
            InboundMessage::Status(StatusReport {
                device: Some("esp32-radar".to_string()),
                status: Some("online".to_string()),
            })
        );
        assert_eq!(
            router.route(DEFAULT_RELOAD_TOPIC, b"").unwrap(),
            InboundMessage::Reload
        );
        assert_eq!(
            router.route("some/other/topic", b"{}").unwrap(),
            InboundMessage::Ignored
        );
        assert!(router.route(DEFAULT_MOTION_TOPIC, b"not json").is_err());
    }

    #[test]
    fn router_without_optional_topics() {
        let router = InboundRouter {
            status_topic: None,
            reload_topic: None,
            ..InboundRouter::default()
        };
        assert_eq!(router.topics(), vec![DEFAULT_MOTION_TOPIC]);
        assert_eq!(
            router.route(DEFAULT_RELOAD_TOPIC, b"").unwrap(),
            InboundMessage::Ignored
        );
    }

    #[test]
    fn detection_only_for_accepted_outcomes() {
        let rejected = MatchOutcome {
            identity_id: None,
            label: "Ambiguous".to_string(),
            confidence: 0.4,
        };
        assert!(IdentityDetection::from_outcome(&rejected, Local::now()).is_none());

        let accepted = MatchOutcome {
            identity_id: Some("u1".to_string()),
            label: "Alice".to_string(),
            confidence: 0.8,
        };
        let detection = IdentityDetection::from_outcome(&accepted, Local::now()).unwrap();
        let json: Value = serde_json::from_slice(&detection.to_payload().unwrap()).unwrap();
        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["user_name"], "Alice");
        assert!((json["confidence"].as_f64().unwrap() - 0.8).abs() < 1e-6);
        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
