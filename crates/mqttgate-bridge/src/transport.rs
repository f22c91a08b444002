use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{BridgeError, Endpoint, Qos};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const INBOUND_CHANNEL_CAPACITY: usize = 16;
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Opens one broker session per exchange.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        client_id: &str,
    ) -> Result<Box<dyn Session>, BridgeError>;
}

/// A connected broker session owned by a single exchange.
#[async_trait]
pub trait Session: Send {
    async fn publish(&mut self, topic: &str, qos: Qos, payload: Vec<u8>) -> Result<(), BridgeError>;

    async fn subscribe(&mut self, filter: &str, qos: Qos) -> Result<(), BridgeError>;

    /// Waits for the next message delivered on the session's subscriptions.
    async fn recv(&mut self) -> Result<Vec<u8>, BridgeError>;

    /// Closes the session. Must be safe to call more than once.
    async fn disconnect(&mut self);
}

/// `rumqttc` backed connector.
#[derive(Debug, Default, Clone)]
pub struct MqttConnector;

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        client_id: &str,
    ) -> Result<Box<dyn Session>, BridgeError> {
        let mut options = MqttOptions::new(client_id, endpoint.host.as_str(), endpoint.port);
        options.set_keep_alive(endpoint.keepalive);
        options.set_clean_session(true);
        options.set_max_packet_size(endpoint.max_packet_size, endpoint.max_packet_size);
        if let Some(username) = &endpoint.username {
            options.set_credentials(username, endpoint.password.as_deref().unwrap_or(""));
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!(client_id, code = ?ack.code, "broker accepted connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(BridgeError::Connect(format!(
                        "{}:{}: {e}",
                        endpoint.host, endpoint.port
                    )))
                }
            }
        }

        let (tx, inbound) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump_events(eventloop, tx));
        Ok(Box::new(MqttSession {
            client,
            inbound,
            pump,
            max_packet_size: endpoint.max_packet_size,
            published: None,
            closed: false,
        }))
    }
}

/// How far the session's publish got before the event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishStage {
    Pending,
    Sent,
    Acked,
}

#[derive(Debug)]
struct Fault {
    stage: PublishStage,
    message: String,
}

struct MqttSession {
    client: AsyncClient,
    inbound: mpsc::Receiver<Result<Vec<u8>, Fault>>,
    pump: JoinHandle<()>,
    max_packet_size: usize,
    published: Option<Qos>,
    closed: bool,
}

impl MqttSession {
    /// A transport failure counts against the publish until the broker has
    /// confirmed it as far as its QoS requires.
    fn classify(&self, fault: Fault) -> BridgeError {
        let unconfirmed = match self.published {
            Some(Qos::AtMostOnce) => fault.stage == PublishStage::Pending,
            Some(_) => fault.stage != PublishStage::Acked,
            None => false,
        };
        if unconfirmed {
            BridgeError::Publish(format!("publish not delivered: {}", fault.message))
        } else {
            BridgeError::Connect(format!("connection lost: {}", fault.message))
        }
    }

    /// A fault the event loop already reported, if any. Used when a request
    /// could not be queued because the event loop has stopped.
    fn reported_fault(&mut self) -> Option<BridgeError> {
        loop {
            match self.inbound.try_recv() {
                Ok(Ok(_)) => continue,
                Ok(Err(fault)) => return Some(self.classify(fault)),
                Err(_) => return None,
            }
        }
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn publish(&mut self, topic: &str, qos: Qos, payload: Vec<u8>) -> Result<(), BridgeError> {
        let size = publish_packet_size(topic, qos, payload.len());
        if size > self.max_packet_size {
            return Err(BridgeError::Publish(format!(
                "packet of {size} bytes exceeds the {} byte limit",
                self.max_packet_size
            )));
        }
        self.client
            .publish(topic, qos.into(), false, payload)
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))?;
        self.published = Some(qos);
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, qos: Qos) -> Result<(), BridgeError> {
        if let Err(e) = self.client.subscribe(filter, qos.into()).await {
            return Err(self
                .reported_fault()
                .unwrap_or_else(|| BridgeError::Subscribe(e.to_string())));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, BridgeError> {
        match self.inbound.recv().await {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(fault)) => Err(self.classify(fault)),
            None => Err(BridgeError::Connect("connection closed".to_string())),
        }
    }

    async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect request not delivered");
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut self.pump)
            .await
            .is_err()
        {
            warn!("event loop did not stop after disconnect; aborting it");
            self.pump.abort();
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Drives the event loop and forwards inbound publishes. Stops on the first
/// transport error instead of letting `rumqttc` reconnect.
async fn pump_events(mut eventloop: EventLoop, tx: mpsc::Sender<Result<Vec<u8>, Fault>>) {
    let mut stage = PublishStage::Pending;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "message received");
                if tx.send(Ok(publish.payload.to_vec())).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(_) | Packet::PubComp(_))) => {
                stage = PublishStage::Acked;
            }
            Ok(Event::Outgoing(Outgoing::Publish(_))) if stage == PublishStage::Pending => {
                stage = PublishStage::Sent;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = tx
                    .send(Err(Fault {
                        stage,
                        message: e.to_string(),
                    }))
                    .await;
                break;
            }
        }
    }
}

/// Size on the wire of an MQTT 3.1.1 PUBLISH packet.
fn publish_packet_size(topic: &str, qos: Qos, payload_len: usize) -> usize {
    let packet_id = if qos == Qos::AtMostOnce { 0 } else { 2 };
    let remaining = 2 + topic.len() + packet_id + payload_len;
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const LARGE: usize = 20 * 1024;
    const PATIENCE: Duration = Duration::from_secs(5);

    #[derive(Debug, Default)]
    struct Seen {
        publishes: Vec<(String, usize)>,
        subscriptions: Vec<String>,
        disconnected: bool,
    }

    /// Single-connection broker speaking raw MQTT 3.1.1 frames.
    #[derive(Default)]
    struct FakeBroker {
        reply: Option<(String, Vec<u8>)>,
        /// Packet type after which the broker hangs up without answering.
        close_on: Option<u8>,
    }

    impl FakeBroker {
        fn replying(topic: &str, payload: Vec<u8>) -> Self {
            Self {
                reply: Some((topic.to_string(), payload)),
                close_on: None,
            }
        }

        fn closing_on(packet_type: u8) -> Self {
            Self {
                reply: None,
                close_on: Some(packet_type),
            }
        }

        async fn start(self) -> (Endpoint, JoinHandle<Seen>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let task = tokio::spawn(async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                self.serve(&mut stream).await
            });
            let endpoint = Endpoint {
                host: "127.0.0.1".to_string(),
                port,
                ..Endpoint::default()
            };
            (endpoint, task)
        }

        async fn serve(self, stream: &mut TcpStream) -> Seen {
            let mut seen = Seen::default();
            while let Some((header, body)) = read_packet(stream).await {
                let packet_type = header >> 4;
                match packet_type {
                    1 => write_packet(stream, 0x20, &[0, 0]).await,
                    3 => {
                        let qos = (header >> 1) & 0x03;
                        let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                        let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
                        let mut at = 2 + topic_len;
                        let packet_id = (qos > 0).then(|| [body[at], body[at + 1]]);
                        if packet_id.is_some() {
                            at += 2;
                        }
                        seen.publishes.push((topic, body.len() - at));
                        if self.close_on == Some(packet_type) {
                            break;
                        }
                        if let Some(id) = packet_id {
                            write_packet(stream, 0x40, &id).await;
                        }
                    }
                    8 => {
                        let filter_len = usize::from(u16::from_be_bytes([body[2], body[3]]));
                        let filter = String::from_utf8(body[4..4 + filter_len].to_vec()).unwrap();
                        seen.subscriptions.push(filter);
                        if self.close_on == Some(packet_type) {
                            break;
                        }
                        let granted = body[4 + filter_len] & 0x03;
                        write_packet(stream, 0x90, &[body[0], body[1], granted]).await;
                        if let Some((topic, payload)) = &self.reply {
                            let mut frame = Vec::with_capacity(2 + topic.len() + payload.len());
                            frame.extend_from_slice(&(topic.len() as u16).to_be_bytes());
                            frame.extend_from_slice(topic.as_bytes());
                            frame.extend_from_slice(payload);
                            write_packet(stream, 0x30, &frame).await;
                        }
                    }
                    12 => write_packet(stream, 0xD0, &[]).await,
                    14 => {
                        seen.disconnected = true;
                        break;
                    }
                    _ => {}
                }
            }
            seen
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    async fn write_packet(stream: &mut TcpStream, header: u8, body: &[u8]) {
        let mut frame = vec![header];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            frame.push(byte);
            if len == 0 {
                break;
            }
        }
        frame.extend_from_slice(body);
        let _ = stream.write_all(&frame).await;
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port,
            ..Endpoint::default()
        };
        let result = MqttConnector.connect(&endpoint, "mqttgate-test").await;
        assert!(matches!(result, Err(BridgeError::Connect(_))));
    }

    #[tokio::test]
    async fn large_request_and_reply_pass_through() {
        let (endpoint, broker) = FakeBroker::replying("r", vec![b'y'; LARGE]).start().await;
        let mut session = MqttConnector.connect(&endpoint, "mqttgate-test").await.unwrap();

        session
            .publish("q", Qos::AtLeastOnce, vec![b'x'; LARGE])
            .await
            .unwrap();
        session.subscribe("r", Qos::AtLeastOnce).await.unwrap();
        let reply = tokio::time::timeout(PATIENCE, session.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.len(), LARGE);
        session.disconnect().await;

        let seen = tokio::time::timeout(PATIENCE, broker).await.unwrap().unwrap();
        assert_eq!(seen.publishes, vec![("q".to_string(), LARGE)]);
        assert_eq!(seen.subscriptions, vec!["r".to_string()]);
        assert!(seen.disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_clean_and_repeatable() {
        let (endpoint, broker) = FakeBroker::default().start().await;
        let mut session = MqttConnector.connect(&endpoint, "mqttgate-test").await.unwrap();
        session.disconnect().await;
        session.disconnect().await;

        let seen = tokio::time::timeout(PATIENCE, broker).await.unwrap().unwrap();
        assert!(seen.disconnected);
        assert!(seen.publishes.is_empty());
    }

    #[tokio::test]
    async fn dropping_a_session_closes_the_connection() {
        let (endpoint, broker) = FakeBroker::default().start().await;
        let session = MqttConnector.connect(&endpoint, "mqttgate-test").await.unwrap();
        drop(session);

        let seen = tokio::time::timeout(PATIENCE, broker).await.unwrap().unwrap();
        assert!(!seen.disconnected);
    }

    #[tokio::test]
    async fn request_over_the_packet_limit_is_a_publish_error() {
        let (mut endpoint, broker) = FakeBroker::default().start().await;
        endpoint.max_packet_size = 1024;
        let mut session = MqttConnector.connect(&endpoint, "mqttgate-test").await.unwrap();

        let result = session
            .publish("q", Qos::AtLeastOnce, vec![b'x'; 2000])
            .await;
        assert!(matches!(result, Err(BridgeError::Publish(_))));
        session.disconnect().await;

        let seen = tokio::time::timeout(PATIENCE, broker).await.unwrap().unwrap();
        assert!(seen.publishes.is_empty());
    }

    #[tokio::test]
    async fn hangup_before_publish_ack_is_a_publish_error() {
        let (endpoint, broker) = FakeBroker::closing_on(3).start().await;
        let mut session = MqttConnector.connect(&endpoint, "mqttgate-test").await.unwrap();

        session
            .publish("q", Qos::AtLeastOnce, b"{}".to_vec())
            .await
            .unwrap();
        let result = tokio::time::timeout(PATIENCE, session.recv()).await.unwrap();
        assert!(matches!(result, Err(BridgeError::Publish(_))));

        let seen = tokio::time::timeout(PATIENCE, broker).await.unwrap().unwrap();
        assert_eq!(seen.publishes, vec![("q".to_string(), 2)]);
    }

    #[tokio::test]
    async fn hangup_after_publish_ack_is_a_connect_error() {
        let (endpoint, broker) = FakeBroker::closing_on(8).start().await;
        let mut session = MqttConnector.connect(&endpoint, "mqttgate-test").await.unwrap();

        session
            .publish("q", Qos::AtLeastOnce, b"{}".to_vec())
            .await
            .unwrap();
        let subscribed = session.subscribe("r", Qos::AtLeastOnce).await;
        let result = match subscribed {
            Ok(()) => tokio::time::timeout(PATIENCE, session.recv()).await.unwrap(),
            Err(e) => Err(e),
        };
        assert!(matches!(result, Err(BridgeError::Connect(_))));

        let seen = tokio::time::timeout(PATIENCE, broker).await.unwrap().unwrap();
        assert_eq!(seen.subscriptions, vec!["r".to_string()]);
    }

    #[test]
    fn packet_size_counts_header_topic_and_packet_id() {
        assert_eq!(publish_packet_size("q", Qos::AtMostOnce, 10), 1 + 1 + 2 + 1 + 10);
        assert_eq!(publish_packet_size("q", Qos::AtLeastOnce, 10), 1 + 1 + 2 + 1 + 2 + 10);
        assert_eq!(publish_packet_size("q", Qos::AtLeastOnce, LARGE), 1 + 3 + 5 + LARGE);
    }
}
