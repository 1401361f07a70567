//! Console session
//!
//! Stands in for the cloud connection: every accepted delivery is written to
//! stdout as one JSON line. A fraction of deliveries can be rejected at random
//! to watch the retry path at work.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rand::Rng;
use serde_json::json;

use telemetry::Session;

pub struct ConsoleSession {
    connected: AtomicBool,
    failure_rate: f64,
}

impl ConsoleSession {
    /// `failure_rate` is clamped to `0.0..=1.0`
    pub fn new(connected: bool, failure_rate: f64) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        tracing::info!(connected, "Session state changed");
    }

    fn rejects(&self) -> bool {
        self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate)
    }
}

/// One output line for an accepted state batch. The batch is embedded as
/// parsed JSON when possible, as a string otherwise.
pub fn state_line(at: DateTime<Local>, payload: &str) -> String {
    let state = serde_json::from_str::<serde_json::Value>(payload)
        .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));
    json!({
        "at": at.to_rfc3339(),
        "kind": "state",
        "state": state,
    })
    .to_string()
}

/// One output line for an accepted event
pub fn event_line(at: DateTime<Local>, channel: &str, message: &str) -> String {
    json!({
        "at": at.to_rfc3339(),
        "kind": "event",
        "channel": channel,
        "message": message,
    })
    .to_string()
}

#[async_trait]
impl Session for ConsoleSession {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish_event(&self, channel: &str, message: &str) -> bool {
        if self.rejects() {
            tracing::warn!(channel, "Simulated event delivery failure");
            return false;
        }
        println!("{}", event_line(Local::now(), channel, message));
        true
    }

    async fn publish_state(&self, json: &str) -> bool {
        if self.rejects() {
            tracing::warn!("Simulated state delivery failure");
            return false;
        }
        println!("{}", state_line(Local::now(), json));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_state_line_embeds_batch() {
        let line = state_line(at(), r#"{"temp":21.5}"#);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["kind"], "state");
        assert_eq!(value["state"]["temp"], 21.5);
        assert_eq!(value["at"], at().to_rfc3339());
    }

    #[test]
    fn test_state_line_keeps_unparseable_batch() {
        let line = state_line(at(), r#"{"note":"say "hi""}"#);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["state"], r#"{"note":"say "hi""}"#);
    }

    #[test]
    fn test_event_line() {
        let line = event_line(at(), "alarms", "door:1:\"open\"");
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["channel"], "alarms");
        assert_eq!(value["message"], "door:1:\"open\"");
    }

    #[tokio::test]
    async fn test_failure_rate_bounds() {
        let always = ConsoleSession::new(true, 5.0);
        assert!(!always.publish_state("{}").await);
        assert!(!always.publish_event("c", "m").await);

        let never = ConsoleSession::new(false, -1.0);
        assert!(!never.is_connected().await);
        never.set_connected(true);
        assert!(never.is_connected().await);
        assert!(never.publish_state("{}").await);
    }
}
