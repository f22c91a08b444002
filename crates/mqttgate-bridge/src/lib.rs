//! Synchronous HTTP to MQTT request/response bridge.
//!
//! One [`Bridge::request`] call validates the request parameters, fills the
//! route's topic templates, publishes the parameters as a JSON object, waits
//! for the first non-empty reply on the subscribe topic and decodes it. Each
//! call uses its own broker session, which is closed before the call returns.

pub mod loopback;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use mqttgate_contracts::Params;
use mqttgate_kernel::{
    check_publish_topic, check_subscribe_filter, decode, encode, substitute_all, CodecError,
    Policy, TemplateError, ValidationError,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use transport::{Connector, MqttConnector, Session};

/// Longest client identifier MQTT 3.1 brokers must accept.
pub const MAX_CLIENT_ID_LEN: usize = 23;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Largest packet the MQTT remaining-length field can describe.
pub const MAX_PACKET_SIZE: usize = 268_435_455;

const CONTENT_TYPE_KEYS: [&str; 2] = ["content-type", "content_type"];
const BODY_KEYS: [&str; 2] = ["data", "body"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("template failed: {0}")]
    Template(#[from] TemplateError),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("no reply within {0:?}")]
    TimedOut(Duration),
}

impl From<CodecError> for BridgeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Encode(msg) => BridgeError::Encode(msg),
            CodecError::Decode(msg) => BridgeError::Decode(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid qos level {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Limit for packets in both directions, fixed header included.
    pub max_packet_size: usize,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            keepalive: Duration::from_secs(60),
            username: None,
            password: None,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

/// Everything an exchange needs to know about one configured route.
#[derive(Debug, Clone)]
pub struct Route {
    pub endpoint: Endpoint,
    pub pub_topic: String,
    pub sub_topic: String,
    pub policy: Policy,
    pub qos: Qos,
    pub timeout: Duration,
}

/// The decoded reply, ready to be written as an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub content_type: String,
    pub body: String,
}

impl Reply {
    pub fn from_params(params: &Params) -> Result<Self, BridgeError> {
        let content_type = first_of(params, &CONTENT_TYPE_KEYS).ok_or_else(|| {
            BridgeError::Decode("reply has no content-type member".to_string())
        })?;
        let body = first_of(params, &BODY_KEYS)
            .ok_or_else(|| BridgeError::Decode("reply has no data member".to_string()))?;
        Ok(Self {
            content_type: content_type.to_string(),
            body: body.to_string(),
        })
    }
}

fn first_of<'a>(params: &'a Params, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| params.lookup(k))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Connecting,
    Publishing,
    AwaitingReply,
    Completed,
    TimedOut,
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeState::Completed | ExchangeState::TimedOut | ExchangeState::Failed
        )
    }
}

/// One publish, subscribe and wait unit of work. Lives for a single request.
#[derive(Debug)]
pub struct Exchange {
    client_id: String,
    pub_topic: String,
    sub_topic: String,
    payload: String,
    inbound: Vec<u8>,
    qos: Qos,
    timeout: Duration,
    deadline: Option<Instant>,
    state: ExchangeState,
}

impl Exchange {
    /// Resolves topics and encodes the payload. Nothing touches the network
    /// here, so every error returned is a request or configuration problem.
    pub fn prepare(route: &Route, params: &Params, client_id: String) -> Result<Self, BridgeError> {
        route.policy.validate(params)?;

        let pub_topic = substitute_all(params, &route.pub_topic)?;
        let sub_topic = substitute_all(params, &route.sub_topic)?;
        check_publish_topic(&pub_topic).map_err(|e| BridgeError::Publish(e.to_string()))?;
        check_subscribe_filter(&sub_topic).map_err(|e| BridgeError::Subscribe(e.to_string()))?;

        Ok(Self {
            client_id,
            pub_topic,
            sub_topic,
            payload: encode(params)?,
            inbound: Vec::new(),
            qos: route.qos,
            timeout: route.timeout,
            deadline: None,
            state: ExchangeState::Idle,
        })
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn pub_topic(&self) -> &str {
        &self.pub_topic
    }

    pub fn sub_topic(&self) -> &str {
        &self.sub_topic
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// When the wait for a reply ends. Set once the subscription is made.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Connects, exchanges messages and closes the session in every outcome.
    /// Returns the raw reply payload.
    pub async fn run(
        &mut self,
        connector: &dyn Connector,
        endpoint: &Endpoint,
    ) -> Result<Vec<u8>, BridgeError> {
        self.transition(ExchangeState::Connecting);
        let connected =
            tokio::time::timeout(self.timeout, connector.connect(endpoint, &self.client_id)).await;
        let mut session = match connected {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_) => {
                return Err(self.fail(BridgeError::Connect(format!(
                    "{}:{}: no connection within {:?}",
                    endpoint.host, endpoint.port, self.timeout
                ))))
            }
        };

        let outcome = self.converse(session.as_mut()).await;
        session.disconnect().await;

        match outcome {
            Ok(()) => {
                self.transition(ExchangeState::Completed);
                Ok(std::mem::take(&mut self.inbound))
            }
            Err(e @ BridgeError::TimedOut(_)) => {
                self.transition(ExchangeState::TimedOut);
                Err(e)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn converse(&mut self, session: &mut dyn Session) -> Result<(), BridgeError> {
        self.transition(ExchangeState::Publishing);
        session
            .publish(&self.pub_topic, self.qos, self.payload.clone().into_bytes())
            .await?;
        session.subscribe(&self.sub_topic, self.qos).await?;

        self.transition(ExchangeState::AwaitingReply);
        let deadline = Instant::now() + self.timeout;
        self.deadline = Some(deadline);

        let wait = async {
            loop {
                let payload = session.recv().await?;
                if !payload.is_empty() {
                    return Ok::<_, BridgeError>(payload);
                }
                debug!(client_id = %self.client_id, "ignoring empty message");
            }
        };
        match tokio::time::timeout_at(deadline, wait).await {
            Ok(Ok(payload)) => {
                self.inbound = payload;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BridgeError::TimedOut(self.timeout)),
        }
    }

    fn fail(&mut self, e: BridgeError) -> BridgeError {
        self.transition(ExchangeState::Failed);
        e
    }

    fn transition(&mut self, next: ExchangeState) {
        debug!(
            client_id = %self.client_id,
            from = ?self.state,
            to = ?next,
            "exchange state"
        );
        self.state = next;
    }
}

/// Runs exchanges against a broker through a [`Connector`].
#[derive(Clone)]
pub struct Bridge {
    connector: Arc<dyn Connector>,
    client_id_prefix: String,
}

impl Bridge {
    pub fn new(connector: Arc<dyn Connector>, client_id_prefix: impl Into<String>) -> Self {
        Self {
            connector,
            client_id_prefix: client_id_prefix.into(),
        }
    }

    pub fn mqtt(client_id_prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(MqttConnector), client_id_prefix)
    }

    pub async fn request(&self, route: &Route, params: &Params) -> Result<Reply, BridgeError> {
        let started = Instant::now();
        let mut exchange = Exchange::prepare(route, params, client_id(&self.client_id_prefix))?;
        let payload = exchange
            .run(self.connector.as_ref(), &route.endpoint)
            .await
            .inspect_err(|e| {
                warn!(
                    pub_topic = %exchange.pub_topic,
                    sub_topic = %exchange.sub_topic,
                    error = %e,
                    "exchange did not complete"
                )
            })?;

        let text = String::from_utf8(payload)
            .map_err(|e| BridgeError::Decode(format!("reply is not UTF-8: {e}")))?;
        let reply = Reply::from_params(&decode(&text)?)?;
        info!(
            pub_topic = %exchange.pub_topic,
            sub_topic = %exchange.sub_topic,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exchange completed"
        );
        Ok(reply)
    }
}

/// Builds a client identifier from the prefix, a per-exchange nonce, the
/// process id and the host name, cut to [`MAX_CLIENT_ID_LEN`] bytes.
pub fn client_id(prefix: &str) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let id = format!(
        "{}-{}|{}-{}",
        truncate(prefix, 10),
        &nonce[..8],
        std::process::id(),
        host
    );
    truncate(&id, MAX_CLIENT_ID_LEN).to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
