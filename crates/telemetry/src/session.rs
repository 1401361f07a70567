//! Upstream session abstraction
//!
//! The telemetry core does not own the connection to the cloud. It only needs
//! to know whether a session is up and to hand over finished payloads. Every
//! delivery is a single attempt; a `false` result means "try again next period".

use async_trait::async_trait;
use parking_lot::Mutex;

/// Delivery capabilities consumed by the publication tasks
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Whether a session with the cloud is currently established
    async fn is_connected(&self) -> bool;

    /// Deliver one formatted notification message on `channel`
    async fn publish_event(&self, channel: &str, message: &str) -> bool;

    /// Deliver one JSON object with property values
    async fn publish_state(&self, json: &str) -> bool;
}

/// A payload accepted by a [`MemorySession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Event { channel: String, message: String },
    State(String),
}

#[derive(Debug)]
struct MemorySessionState {
    connected: bool,
    accept: bool,
    attempts: usize,
    delivered: Vec<Delivery>,
}

/// In-memory session that records what it accepts.
///
/// Connectivity and acceptance can be toggled to simulate an outage.
#[derive(Debug)]
pub struct MemorySession {
    state: Mutex<MemorySessionState>,
}

impl MemorySession {
    /// A connected session that accepts every delivery
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemorySessionState {
                connected: true,
                accept: true,
                attempts: 0,
                delivered: Vec::new(),
            }),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// When false, deliveries are attempted but rejected
    pub fn set_accepting(&self, accept: bool) {
        self.state.lock().accept = accept;
    }

    /// Number of delivery attempts, accepted or not
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    pub fn delivered(&self) -> Vec<Delivery> {
        self.state.lock().delivered.clone()
    }

    /// Accepted state payloads, oldest first
    pub fn states(&self) -> Vec<String> {
        self.state
            .lock()
            .delivered
            .iter()
            .filter_map(|d| match d {
                Delivery::State(json) => Some(json.clone()),
                Delivery::Event { .. } => None,
            })
            .collect()
    }

    /// Accepted events as `(channel, message)`, oldest first
    pub fn events(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .delivered
            .iter()
            .filter_map(|d| match d {
                Delivery::Event { channel, message } => Some((channel.clone(), message.clone())),
                Delivery::State(_) => None,
            })
            .collect()
    }

    fn record(&self, delivery: Delivery) -> bool {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.accept {
            state.delivered.push(delivery);
        }
        state.accept
    }
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn publish_event(&self, channel: &str, message: &str) -> bool {
        self.record(Delivery::Event {
            channel: channel.to_string(),
            message: message.to_string(),
        })
    }

    async fn publish_state(&self, json: &str) -> bool {
        self.record(Delivery::State(json.to_string()))
    }
}
