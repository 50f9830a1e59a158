//! MQTT connection management.
//!
//! A listener thread owns the event loop. It subscribes to the inbound
//! topics, routes messages to a handler, and reconnects with a fresh client
//! after a cancellable delay whenever the connection drops. The shared
//! [`MqttPublisher`] sends through whichever client is currently attached.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};

use super::endpoint::{MqttEndpoint, TlsMaterials};
use super::messages::{InboundMessage, InboundRouter, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use super::EventSink;
use crate::shutdown::CancelToken;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 10;

/// Callback for routed inbound messages. Runs on the listener thread.
pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: TlsMaterials,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl MqttSettings {
    pub fn new(endpoint: MqttEndpoint, client_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            client_id: client_id.into(),
            username: None,
            password: None,
            tls: TlsMaterials::default(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Retained `online`/`offline` topic; `offline` is also the last will.
    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.client_id)
    }

    fn options(&self) -> Result<MqttOptions> {
        let mut options =
            MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_start(true);
        if let Some(user) = &self.username {
            options.set_credentials(user, self.password.clone().unwrap_or_default());
        }
        let will = LastWill::new(
            self.availability_topic(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        );
        options.set_last_will(will);
        options.set_transport(self.tls.build_transport(&self.endpoint)?);
        Ok(options)
    }

    fn connect(&self) -> Result<(Client, Connection)> {
        let options = self.options()?;
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        log::info!(
            "connecting to MQTT broker {}:{} (TLS: {}, auth: {})",
            self.endpoint.host,
            self.endpoint.port,
            self.endpoint.use_tls,
            self.username.is_some()
        );
        Ok((client, connection))
    }
}

/// Best-effort publisher shared by every component that sends events.
///
/// Publishing never blocks: when no connection is up, or the request queue
/// is full, the message is dropped and counted.
#[derive(Default)]
pub struct MqttPublisher {
    client: Mutex<Option<Client>>,
    connected: AtomicBool,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl MqttPublisher {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn attach(&self, client: Client) {
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    fn detach(&self) -> Option<Client> {
        self.connected.store(false, Ordering::SeqCst);
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn send(&self, topic: &str, payload: Vec<u8>, retain: bool) -> bool {
        if !self.is_connected() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(client) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match client.try_publish(topic, QoS::AtLeastOnce, retain, payload) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                log::debug!("MQTT -> {}", topic);
                true
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("MQTT publish to {} failed: {}", topic, e);
                false
            }
        }
    }
}

impl EventSink for MqttPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> bool {
        self.send(topic, payload, false)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Running MQTT session: listener thread plus shared publisher.
pub struct MqttBus {
    publisher: Arc<MqttPublisher>,
    availability_topic: String,
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl MqttBus {
    /// Spawn the listener. Fails only on configuration errors (bad TLS
    /// material); broker outages are retried in the background.
    pub fn start(
        settings: MqttSettings,
        router: InboundRouter,
        handler: InboundHandler,
    ) -> Result<Self> {
        settings
            .options()
            .context("invalid MQTT connection settings")?;

        let publisher = Arc::new(MqttPublisher::default());
        let stop = CancelToken::new();
        let availability_topic = settings.availability_topic();

        let handle = {
            let publisher = publisher.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("mqtt-listener".to_string())
                .spawn(move || listen(settings, router, handler, publisher, stop))
                .context("failed to spawn MQTT listener thread")?
        };

        Ok(Self {
            publisher,
            availability_topic,
            stop,
            handle: Some(handle),
        })
    }

    pub fn publisher(&self) -> Arc<MqttPublisher> {
        self.publisher.clone()
    }

    /// Announce `offline`, disconnect and join the listener.
    pub fn stop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        self.publisher
            .send(&self.availability_topic, PAYLOAD_OFFLINE.as_bytes().to_vec(), true);
        self.stop.cancel();
        if let Some(client) = self.publisher.detach() {
            if let Err(e) = client.try_disconnect() {
                log::debug!("MQTT disconnect request failed: {}", e);
            }
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("MQTT listener thread panicked");
            }
        }
        log::info!("MQTT bus stopped");
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch(router: &InboundRouter, handler: &InboundHandler, topic: &str, payload: &[u8]) {
    log::debug!("MQTT <- {}", topic);
    match router.route(topic, payload) {
        Ok(InboundMessage::Ignored) => {}
        Ok(message) => handler(message),
        Err(e) => log::warn!("discarding malformed message on {}: {:#}", topic, e),
    }
}

fn listen(
    settings: MqttSettings,
    router: InboundRouter,
    handler: InboundHandler,
    publisher: Arc<MqttPublisher>,
    stop: CancelToken,
) {
    let availability_topic = settings.availability_topic();

    while !stop.is_cancelled() {
        let (client, mut connection) = match settings.connect() {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("MQTT setup failed: {:#}", e);
                if stop.wait_timeout(settings.reconnect_delay) {
                    break;
                }
                continue;
            }
        };
        for topic in router.topics() {
            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce) {
                log::warn!("failed to queue subscription to {}: {}", topic, e);
            }
        }
        publisher.attach(client.clone());

        for event in connection.iter() {
            if stop.is_cancelled() {
                break;
            }
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    publisher.set_connected(true);
                    log::info!("MQTT connected, subscribed to {:?}", router.topics());
                    if let Err(e) = client.try_publish(
                        availability_topic.as_str(),
                        QoS::AtLeastOnce,
                        true,
                        PAYLOAD_ONLINE.as_bytes().to_vec(),
                    ) {
                        log::warn!("failed to publish availability: {}", e);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => dispatch(&router, &handler, topic, &publish.payload),
                        Err(e) => log::warn!("skipping publish with invalid topic: {}", e),
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect(_))) => {
                    log::warn!("MQTT broker sent disconnect");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if !stop.is_cancelled() {
                        log::error!("MQTT connection error: {}. Reconnecting...", e);
                    }
                    break;
                }
            }
        }

        publisher.detach();
        if stop.wait_timeout(settings.reconnect_delay) {
            break;
        }
        log::info!("reconnecting to MQTT broker");
    }
    publisher.detach();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::endpoint::parse_mqtt_endpoint;
    use crate::transport::messages::DEFAULT_MOTION_TOPIC;
    use std::time::Instant;

    #[test]
    fn disconnected_publisher_drops_silently() {
        let publisher = MqttPublisher::default();
        assert!(!publisher.is_connected());
        assert!(!publisher.publish("security/camera/family_detected", b"{}".to_vec()));
        assert_eq!(publisher.dropped(), 1);
        assert_eq!(publisher.published(), 0);
    }

    #[test]
    fn availability_topic_uses_client_id() {
        let endpoint = parse_mqtt_endpoint("localhost:1883", false).unwrap();
        let settings = MqttSettings::new(endpoint, "facewatch-gw");
        assert_eq!(settings.availability_topic(), "facewatch-gw/availability");
    }

    #[test]
    fn dispatch_skips_ignored_and_malformed() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: InboundHandler = {
            let seen = seen.clone();
            Arc::new(move |m| seen.lock().unwrap().push(m))
        };
        let router = InboundRouter::default();

        dispatch(&router, &handler, DEFAULT_MOTION_TOPIC, br#"{"state":"detected"}"#);
        dispatch(&router, &handler, DEFAULT_MOTION_TOPIC, br#"{"state":"clear"}"#);
        dispatch(&router, &handler, DEFAULT_MOTION_TOPIC, b"garbage");

        assert_eq!(*seen.lock().unwrap(), vec![InboundMessage::Motion]);
    }

    #[test]
    fn stop_is_prompt_while_broker_is_unreachable() {
        let endpoint = parse_mqtt_endpoint("127.0.0.1:1", false).unwrap();
        let mut settings = MqttSettings::new(endpoint, "facewatch-test");
        settings.reconnect_delay = Duration::from_secs(30);
        let handler: InboundHandler = Arc::new(|_| {});
        let mut bus = MqttBus::start(settings, InboundRouter::default(), handler).unwrap();
        let publisher = bus.publisher();

        std::thread::sleep(Duration::from_millis(200));
        assert!(!publisher.is_connected());

        let started = Instant::now();
        bus.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn tls_material_without_tls_fails_start() {
        let endpoint = parse_mqtt_endpoint("127.0.0.1:1883", false).unwrap();
        let mut settings = MqttSettings::new(endpoint, "facewatch-test");
        settings.tls.ca = Some(b"pem".to_vec());
        let handler: InboundHandler = Arc::new(|_| {});
        assert!(MqttBus::start(settings, InboundRouter::default(), handler).is_err());
    }
}
