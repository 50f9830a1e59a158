//! Message bus: MQTT connection, inbound motion routing and outbound
//! identity notifications.

mod endpoint;
mod gate;
pub mod messages;
mod mqtt;

pub use endpoint::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};
pub use gate::{PublishGate, DEFAULT_GLOBAL_COOLDOWN, DEFAULT_PER_IDENTITY_GAP};
pub use messages::{
    parse_motion_payload, IdentityDetection, InboundMessage, InboundRouter, StatusReport,
};
pub use mqtt::{InboundHandler, MqttBus, MqttPublisher, MqttSettings};

/// Outbound side of the bus.
///
/// `publish` must not block; it reports whether the message was handed to
/// the transport.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> bool;
    fn is_connected(&self) -> bool;
}
