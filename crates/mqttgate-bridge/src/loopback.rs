//! In-process stand-in for a broker plus a responding peer.
//!
//! Every publish is handed to a responder closure; whatever it returns is
//! delivered to the session once a matching subscription exists. Used by
//! the test suites of this crate and of the HTTP server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mqttgate_kernel::topic_matches;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::{Connector, Session};
use crate::{BridgeError, Endpoint, Qos};

/// Maps `(topic, payload)` of a request to the messages the peer sends back.
pub type Responder = Arc<dyn Fn(&str, &[u8]) -> Vec<(String, Vec<u8>)> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Failure {
    #[default]
    None,
    RefuseConnect,
    RejectPublish,
    DropAfterSubscribe,
}

/// What the loopback broker saw, shared between the connector and tests.
#[derive(Debug, Default)]
pub struct Observed {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub client_ids: Mutex<Vec<String>>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
    pub subscribed: Mutex<Vec<String>>,
}

impl Observed {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct LoopbackConnector {
    responder: Responder,
    failure: Failure,
    delay: Duration,
    observed: Arc<Observed>,
}

impl LoopbackConnector {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &[u8]) -> Vec<(String, Vec<u8>)> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            failure: Failure::None,
            delay: Duration::ZERO,
            observed: Arc::new(Observed::default()),
        }
    }

    /// A peer that never answers.
    pub fn silent() -> Self {
        Self::new(|_, _| Vec::new())
    }

    pub fn failing(failure: Failure) -> Self {
        Self::silent().with_failure(failure)
    }

    pub fn with_failure(mut self, failure: Failure) -> Self {
        self.failure = failure;
        self
    }

    /// Holds every reply back for `delay` after the subscription is made.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn observed(&self) -> Arc<Observed> {
        self.observed.clone()
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        client_id: &str,
    ) -> Result<Box<dyn Session>, BridgeError> {
        if self.failure == Failure::RefuseConnect {
            return Err(BridgeError::Connect(format!(
                "{}:{}: connection refused",
                endpoint.host, endpoint.port
            )));
        }
        self.observed.connects.fetch_add(1, Ordering::SeqCst);
        self.observed.client_ids.lock().push(client_id.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(LoopbackSession {
            responder: self.responder.clone(),
            failure: self.failure,
            delay: self.delay,
            observed: self.observed.clone(),
            pending: VecDeque::new(),
            tx,
            rx,
            closed: false,
        }))
    }
}

struct LoopbackSession {
    responder: Responder,
    failure: Failure,
    delay: Duration,
    observed: Arc<Observed>,
    pending: VecDeque<(String, Vec<u8>)>,
    tx: mpsc::UnboundedSender<Result<Vec<u8>, String>>,
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>, String>>,
    closed: bool,
}

#[async_trait]
impl Session for LoopbackSession {
    async fn publish(&mut self, topic: &str, _qos: Qos, payload: Vec<u8>) -> Result<(), BridgeError> {
        if self.failure == Failure::RejectPublish {
            return Err(BridgeError::Publish("broker rejected publish".to_string()));
        }
        let replies = (self.responder)(topic, &payload);
        self.observed
            .published
            .lock()
            .push((topic.to_string(), payload));
        self.pending.extend(replies);
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, _qos: Qos) -> Result<(), BridgeError> {
        self.observed.subscribed.lock().push(filter.to_string());
        if self.failure == Failure::DropAfterSubscribe {
            let _ = self.tx.send(Err("peer closed the connection".to_string()));
            return Ok(());
        }

        let matching: Vec<Vec<u8>> = self
            .pending
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(_, payload)| payload.clone())
            .collect();
        self.pending.retain(|(topic, _)| !topic_matches(filter, topic));

        let tx = self.tx.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for payload in matching {
                if tx.send(Ok(payload)).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, BridgeError> {
        match self.rx.recv().await {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(e)) => Err(BridgeError::Connect(format!("connection lost: {e}"))),
            None => Err(BridgeError::Connect("connection closed".to_string())),
        }
    }

    async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.observed.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
