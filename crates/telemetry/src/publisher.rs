//! Publication Tasks
//!
//! Two independent periodic tasks push state upstream:
//! - [`PropertiesTask`]: batches due groups into one JSON object per tick
//! - [`NotificationsTask`]: sends every changed notification on its own channel
//!
//! Delivery is at-least-once. A failed delivery leaves the dirty flags set and
//! the same data goes out again on the next due tick; nothing is dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::clock::{Clock, PeriodicTicker};
use crate::format::StateBatch;
use crate::group::GroupRegistry;
use crate::ids::PropertyId;
use crate::notification::NotificationRegistry;
use crate::property::PropertyRegistry;
use crate::session::Session;

// ─────────────────────────────────────────────────────────────────────────────
// Properties Task
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one properties tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertiesTick {
    /// No session; nothing was evaluated
    Offline,
    /// Nothing was due or eligible
    Idle,
    /// A batch with this many properties was accepted
    Published(usize),
    /// A batch with this many properties was rejected; it will be retried
    Failed(usize),
}

/// Evaluates due groups and publishes their eligible properties as one batch
pub struct PropertiesTask {
    properties: Arc<PropertyRegistry>,
    groups: Arc<GroupRegistry>,
    session: Arc<dyn Session>,
    clock: Arc<dyn Clock>,
    state_buffer_len: usize,
    /// Set until the first batch is accepted; every group is due while it holds.
    first_tick: bool,
    pending: Vec<PropertyId>,
}

impl PropertiesTask {
    /// The current time becomes the start of every group's period.
    pub fn new(
        properties: Arc<PropertyRegistry>,
        groups: Arc<GroupRegistry>,
        session: Arc<dyn Session>,
        clock: Arc<dyn Clock>,
        state_buffer_len: usize,
    ) -> Self {
        groups.rebase(clock.now_ms());
        Self {
            pending: Vec::with_capacity(properties.capacity()),
            properties,
            groups,
            session,
            clock,
            state_buffer_len,
            first_tick: true,
        }
    }

    /// Whether no batch has been accepted yet
    pub fn is_first_tick(&self) -> bool {
        self.first_tick
    }

    /// Evaluate at the clock's current time
    pub async fn tick(&mut self) -> PropertiesTick {
        let now_ms = self.clock.now_ms();
        self.tick_at(now_ms).await
    }

    /// Evaluate at `now_ms`
    pub async fn tick_at(&mut self, now_ms: u32) -> PropertiesTick {
        if !self.session.is_connected().await {
            tracing::trace!("No session, skipping properties tick");
            return PropertiesTick::Offline;
        }

        self.properties
            .for_each_entry(|entry| entry.resolve_debounce(now_ms));

        let first_tick = self.first_tick;
        let properties = &self.properties;
        let pending = &mut self.pending;
        let mut batch = StateBatch::new(self.state_buffer_len);
        let mut deferred = 0usize;

        self.groups.for_each_due(now_ms, first_tick, |members, only_if_changed| {
            for &id in members {
                properties.with_entry(id, |entry| {
                    if entry.is_pending() || !entry.is_eligible(only_if_changed) {
                        return;
                    }
                    if entry.append_to(&mut batch) {
                        pending.push(id);
                    } else {
                        deferred += 1;
                    }
                });
            }
        });

        if deferred > 0 {
            tracing::warn!(
                deferred,
                capacity = self.state_buffer_len,
                "State buffer full, properties deferred to a later tick"
            );
        }

        let Some(json) = batch.finish() else {
            return PropertiesTick::Idle;
        };

        let delivered = self.session.publish_state(&json).await;
        let count = self.pending.len();

        // The pending marker never outlives the attempt.
        for id in self.pending.drain(..) {
            self.properties.with_entry(id, |entry| {
                if delivered {
                    entry.commit_pending();
                } else {
                    entry.discard_pending();
                }
            });
        }

        if delivered {
            self.first_tick = false;
            tracing::debug!(properties = count, payload = %json, "Published properties");
            PropertiesTick::Published(count)
        } else {
            tracing::warn!(properties = count, "Properties delivery failed, retrying next period");
            PropertiesTick::Failed(count)
        }
    }

    /// Tick forever at a fixed rate
    pub async fn run(mut self, period: Duration) {
        tracing::info!(period_ms = period.as_millis() as u64, "Properties task running");
        let mut ticker = PeriodicTicker::new(period);
        loop {
            ticker.wait().await;
            self.tick().await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications Task
// ─────────────────────────────────────────────────────────────────────────────

/// Result of one notifications tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationsTick {
    pub delivered: usize,
    pub failed: usize,
}

/// Publishes each changed notification individually
pub struct NotificationsTask {
    notifications: Arc<NotificationRegistry>,
    session: Arc<dyn Session>,
}

impl NotificationsTask {
    pub fn new(notifications: Arc<NotificationRegistry>, session: Arc<dyn Session>) -> Self {
        Self {
            notifications,
            session,
        }
    }

    pub async fn tick(&mut self) -> NotificationsTick {
        let mut outcome = NotificationsTick::default();

        for event in self.notifications.collect_changed() {
            if self.session.publish_event(&event.channel, &event.message).await {
                self.notifications.acknowledge(event.id, event.revision);
                tracing::debug!(
                    channel = %event.channel,
                    message = %event.message,
                    "Published notification"
                );
                outcome.delivered += 1;
            } else {
                tracing::warn!(
                    channel = %event.channel,
                    id = %event.id,
                    "Notification delivery failed, retrying next period"
                );
                outcome.failed += 1;
            }
        }

        outcome
    }

    /// Tick forever at a fixed rate
    pub async fn run(mut self, period: Duration) {
        tracing::info!(period_ms = period.as_millis() as u64, "Notifications task running");
        let mut ticker = PeriodicTicker::new(period);
        loop {
            ticker.wait().await;
            self.tick().await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a spawned publication task
#[derive(Debug)]
pub struct PublisherHandle {
    name: &'static str,
    join_handle: JoinHandle<()>,
}

impl PublisherHandle {
    pub(crate) fn new(name: &'static str, join_handle: JoinHandle<()>) -> Self {
        Self { name, join_handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True only if the task died; publication tasks never return on their own
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Stop the task at its next await point.
    ///
    /// Meant for process shutdown and tests only. An aborted task cannot be
    /// started again on the same [`crate::Telemetry`].
    pub fn abort(&self) {
        self.join_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notification::NotificationLimits;
    use crate::session::MemorySession;

    struct Fixture {
        clock: Arc<ManualClock>,
        properties: Arc<PropertyRegistry>,
        groups: Arc<GroupRegistry>,
        session: Arc<MemorySession>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(0));
            let properties = Arc::new(PropertyRegistry::new(8, 16, 0, true, clock.clone()));
            let groups = Arc::new(GroupRegistry::new(4, 8, properties.clone()));
            Self {
                clock,
                properties,
                groups,
                session: Arc::new(MemorySession::new()),
            }
        }

        fn task(&self, buffer: usize) -> PropertiesTask {
            PropertiesTask::new(
                self.properties.clone(),
                self.groups.clone(),
                self.session.clone(),
                self.clock.clone(),
                buffer,
            )
        }
    }

    #[tokio::test]
    async fn test_first_tick_publishes_everything() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let b = fx.properties.create_string("b", 8).unwrap();
        let g = fx.groups.create(1000, true).unwrap();
        fx.groups.add(a, g);
        fx.groups.add(b, g);

        let mut task = fx.task(256);
        fx.clock.set(100);
        assert_eq!(task.tick().await, PropertiesTick::Published(2));
        assert_eq!(fx.session.states(), vec![r#"{"a":0,"b":""}"#.to_string()]);
        assert!(!task.is_first_tick());

        // Group not due again before its period
        fx.clock.set(200);
        assert_eq!(task.tick().await, PropertiesTick::Idle);
    }

    #[tokio::test]
    async fn test_only_if_changed_policy() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let b = fx.properties.create("b", 1, 0, true).unwrap();
        let g = fx.groups.create(100, true).unwrap();
        fx.groups.add(a, g);
        fx.groups.add(b, g);

        let mut task = fx.task(256);
        assert_eq!(task.tick_at(100).await, PropertiesTick::Published(2));

        // Unchanged properties are left out
        assert_eq!(task.tick_at(200).await, PropertiesTick::Idle);

        fx.clock.set(250);
        fx.properties.update(b, 7);
        assert_eq!(task.tick_at(300).await, PropertiesTick::Published(1));
        assert_eq!(fx.session.states().last().unwrap(), r#"{"b":7}"#);
    }

    #[tokio::test]
    async fn test_unconditional_group_always_publishes() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 100, 2, true).unwrap();
        let g = fx.groups.create(100, false).unwrap();
        fx.groups.add(a, g);
        fx.properties.update(a, 12345);

        let mut task = fx.task(256);
        for now in [100, 200, 300] {
            assert_eq!(task.tick_at(now).await, PropertiesTick::Published(1));
        }
        assert_eq!(fx.session.states(), vec![r#"{"a":123.45}"#.to_string(); 3]);
    }

    #[tokio::test]
    async fn test_offline_tick_has_no_side_effects() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let g = fx.groups.create(1000, true).unwrap();
        fx.groups.add(a, g);

        let mut task = fx.task(256);
        fx.session.set_connected(false);
        fx.properties.update(a, 1);

        assert_eq!(task.tick_at(1000).await, PropertiesTick::Offline);
        let snap = fx.properties.snapshot(a).unwrap();
        assert!(snap.debouncing, "debounce not resolved while offline");
        assert_eq!(fx.session.attempts(), 0);

        // Group stayed due
        fx.session.set_connected(true);
        assert_eq!(task.tick_at(1000).await, PropertiesTick::Published(1));
        assert_eq!(fx.session.states(), vec![r#"{"a":1}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_in_full() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let b = fx.properties.create("b", 1, 0, true).unwrap();
        let c = fx.properties.create("c", 1, 0, true).unwrap();
        let g = fx.groups.create(100, true).unwrap();
        for id in [a, b, c] {
            fx.groups.add(id, g);
        }

        let mut task = fx.task(256);
        assert_eq!(task.tick_at(100).await, PropertiesTick::Published(3));

        fx.properties.update(a, 1);
        fx.properties.update(b, 2);
        fx.session.set_accepting(false);
        assert_eq!(task.tick_at(200).await, PropertiesTick::Failed(2));

        for id in [a, b] {
            let snap = fx.properties.snapshot(id).unwrap();
            assert!(snap.changed);
            assert_eq!(snap.last_published, crate::PropertyValue::Number(0));
        }

        // Next due tick retries the same batch plus the newly changed property
        fx.properties.update(c, 3);
        fx.session.set_accepting(true);
        assert_eq!(task.tick_at(300).await, PropertiesTick::Published(3));
        assert_eq!(fx.session.states().last().unwrap(), r#"{"a":1,"b":2,"c":3}"#);

        assert_eq!(task.tick_at(400).await, PropertiesTick::Idle);
    }

    #[tokio::test]
    async fn test_failed_first_tick_stays_first() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let g = fx.groups.create(1000, true).unwrap();
        fx.groups.add(a, g);

        let mut task = fx.task(256);
        fx.session.set_accepting(false);
        assert_eq!(task.tick_at(100).await, PropertiesTick::Failed(1));
        assert!(task.is_first_tick());

        // Still first tick: due regardless of the group period
        fx.session.set_accepting(true);
        assert_eq!(task.tick_at(200).await, PropertiesTick::Published(1));
    }

    #[tokio::test]
    async fn test_debounce_gates_publication() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        fx.properties.set_debounce_delay(a, 300);
        let g = fx.groups.create(100, true).unwrap();
        fx.groups.add(a, g);

        let mut task = fx.task(256);
        assert_eq!(task.tick_at(100).await, PropertiesTick::Published(1));

        fx.clock.set(150);
        fx.properties.update(a, 5);
        assert_eq!(task.tick_at(200).await, PropertiesTick::Idle);
        assert_eq!(task.tick_at(449).await, PropertiesTick::Idle);
        assert_eq!(task.tick_at(550).await, PropertiesTick::Published(1));
    }

    #[tokio::test]
    async fn test_value_reverted_before_publish_is_skipped() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let g = fx.groups.create(100, true).unwrap();
        fx.groups.add(a, g);

        let mut task = fx.task(256);
        assert_eq!(task.tick_at(100).await, PropertiesTick::Published(1));

        fx.properties.update(a, 9);
        fx.properties.update(a, 0);
        assert_eq!(task.tick_at(200).await, PropertiesTick::Idle);
    }

    #[tokio::test]
    async fn test_shared_property_published_once_per_batch() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let g1 = fx.groups.create(100, false).unwrap();
        let g2 = fx.groups.create(100, false).unwrap();
        fx.groups.add(a, g1);
        fx.groups.add(a, g2);

        let mut task = fx.task(256);
        assert_eq!(task.tick_at(100).await, PropertiesTick::Published(1));
        assert_eq!(fx.session.states(), vec![r#"{"a":0}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_disabled_members_skipped() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let b = fx.properties.create("b", 1, 0, true).unwrap();
        let g = fx.groups.create(100, false).unwrap();
        fx.groups.add(a, g);
        fx.groups.add(b, g);
        fx.properties.set_disabled(a, true);

        let mut task = fx.task(256);
        assert_eq!(task.tick_at(100).await, PropertiesTick::Published(1));
        assert_eq!(fx.session.states(), vec![r#"{"b":0}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_overflow_defers_members() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let b = fx.properties.create("b", 1, 0, true).unwrap();
        let g = fx.groups.create(100, true).unwrap();
        fx.groups.add(a, g);
        fx.groups.add(b, g);

        // Room for {"a":0} only
        let mut task = fx.task(8);
        assert_eq!(task.tick_at(100).await, PropertiesTick::Published(1));
        assert_eq!(fx.session.states(), vec![r#"{"a":0}"#.to_string()]);

        fx.properties.update(b, 1);
        assert_eq!(task.tick_at(200).await, PropertiesTick::Published(1));
        assert_eq!(fx.session.states().last().unwrap(), r#"{"b":1}"#);
    }

    #[tokio::test]
    async fn test_overflowed_baseline_sent_without_updates() {
        let fx = Fixture::new();
        let a = fx.properties.create("a", 1, 0, true).unwrap();
        let b = fx.properties.create("b", 1, 0, true).unwrap();
        let g = fx.groups.create(100, true).unwrap();
        fx.groups.add(a, g);
        fx.groups.add(b, g);

        let mut task = fx.task(8);
        let mut outcomes = Vec::new();
        for now in (100..=1000).step_by(100) {
            outcomes.push(task.tick_at(now).await);
        }

        assert_eq!(outcomes[0], PropertiesTick::Published(1));
        assert_eq!(outcomes[1], PropertiesTick::Published(1));
        assert!(outcomes[2..].iter().all(|o| *o == PropertiesTick::Idle));
        assert_eq!(
            fx.session.states(),
            vec![r#"{"a":0}"#.to_string(), r#"{"b":0}"#.to_string()]
        );
        let snap = fx.properties.snapshot(b).unwrap();
        assert!(!snap.changed);
        assert_eq!(snap.last_published, crate::PropertyValue::Number(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_never_tear() {
        const LAST: i32 = 2_000;

        let fx = Fixture::new();
        let n = fx.properties.create("n", 1, 0, true).unwrap();
        let s = fx.properties.create_string("s", 8).unwrap();
        let g = fx.groups.create(0, false).unwrap();
        fx.groups.add(n, g);
        fx.groups.add(s, g);

        let numbers = {
            let properties = fx.properties.clone();
            tokio::spawn(async move {
                for value in 1..=LAST {
                    properties.update(n, value);
                    if value % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        let strings = {
            let properties = fx.properties.clone();
            tokio::spawn(async move {
                for value in 1..=LAST {
                    properties.update_string(s, &format!("v{}", value));
                    if value % 64 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let mut task = fx.task(256);
        let mut now = 0u32;
        while !(numbers.is_finished() && strings.is_finished()) {
            now += 1;
            task.tick_at(now).await;
            tokio::task::yield_now().await;
        }
        numbers.await.unwrap();
        strings.await.unwrap();

        // Writers are done: one more tick carries the final values
        task.tick_at(now + 1).await;

        let states = fx.session.states();
        assert!(!states.is_empty());
        for state in &states {
            let value: serde_json::Value = serde_json::from_str(state).unwrap();
            let number = value["n"].as_i64().unwrap();
            assert!((0..=i64::from(LAST)).contains(&number), "unexpected n in {}", state);

            let text = value["s"].as_str().unwrap();
            let written = text
                .strip_prefix('v')
                .and_then(|digits| digits.parse::<i32>().ok())
                .is_some_and(|v| (1..=LAST).contains(&v));
            assert!(text.is_empty() || written, "unexpected s in {}", state);
        }

        let last: serde_json::Value = serde_json::from_str(states.last().unwrap()).unwrap();
        assert_eq!(last["n"], LAST);
        assert_eq!(last["s"], format!("v{}", LAST));

        let snap = fx.properties.snapshot(n).unwrap();
        assert_eq!(snap.last_published, crate::PropertyValue::Number(LAST));
        let snap = fx.properties.snapshot(s).unwrap();
        assert_eq!(snap.last_published, crate::PropertyValue::Text(format!("v{}", LAST)));
    }

    #[tokio::test]
    async fn test_notifications_tick() {
        let registry = Arc::new(NotificationRegistry::new(NotificationLimits {
            capacity: 4,
            max_name_len: 16,
            max_channel_len: 16,
            max_template_len: 64,
            max_message_len: 128,
        }));
        let session = Arc::new(MemorySession::new());
        let mut task = NotificationsTask::new(registry.clone(), session.clone());

        let a = registry.create("a", "alarms/a", "%s:%u:%s", 1, 0, true).unwrap();
        let b = registry.create("b", "alarms/b", "%s:%u:%s", 1, 0, true).unwrap();
        assert_eq!(task.tick().await, NotificationsTick::default());

        registry.update(a, 1, 10);
        registry.update(b, 2, 20);
        session.set_accepting(false);
        assert_eq!(task.tick().await, NotificationsTick { delivered: 0, failed: 2 });

        session.set_accepting(true);
        assert_eq!(task.tick().await, NotificationsTick { delivered: 2, failed: 0 });
        assert_eq!(
            session.events(),
            vec![
                ("alarms/a".to_string(), "a:1:10".to_string()),
                ("alarms/b".to_string(), "b:2:20".to_string()),
            ]
        );

        // Notifications do not wait for a session
        session.set_connected(false);
        registry.update(a, 0, 0);
        assert_eq!(task.tick().await.delivered, 1);
        assert_eq!(task.tick().await, NotificationsTick::default());
    }
}
