//! Telemetry Facade
//!
//! [`Telemetry`] owns the three registries and starts the publication tasks.
//! It is cheap to clone; every clone addresses the same state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::{Clock, MonotonicClock};
use crate::config::TelemetryConfig;
use crate::error::{Result, TelemetryError};
use crate::group::{GroupRegistry, GroupSnapshot};
use crate::ids::{GroupId, NotificationId, PropertyId};
use crate::notification::{NotificationLimits, NotificationRegistry, NotificationSnapshot};
use crate::property::{PropertyRegistry, PropertySnapshot};
use crate::publisher::{NotificationsTask, PropertiesTask, PublisherHandle};
use crate::session::Session;

const PROPERTIES_TASK: &str = "properties";
const NOTIFICATIONS_TASK: &str = "notifications";

struct Inner {
    config: TelemetryConfig,
    clock: Arc<dyn Clock>,
    properties: Arc<PropertyRegistry>,
    groups: Arc<GroupRegistry>,
    notifications: Arc<NotificationRegistry>,
    properties_started: AtomicBool,
    notifications_started: AtomicBool,
}

/// Shared entry point of the telemetry core
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl Telemetry {
    /// Build the registries on the process monotonic clock
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Build the registries on a caller-provided clock
    pub fn with_clock(config: TelemetryConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let properties = Arc::new(PropertyRegistry::new(
            config.max_properties,
            config.max_property_name_len,
            config.default_property_value,
            config.default_property_changed,
            clock.clone(),
        ));
        let groups = Arc::new(GroupRegistry::new(
            config.max_groups,
            config.max_group_members,
            properties.clone(),
        ));
        let notifications = Arc::new(NotificationRegistry::new(NotificationLimits {
            capacity: config.max_notifications,
            max_name_len: config.max_notification_name_len,
            max_channel_len: config.max_channel_name_len,
            max_template_len: config.max_template_len,
            max_message_len: config.max_message_len,
        }));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                clock,
                properties,
                groups,
                notifications,
                properties_started: AtomicBool::new(false),
                notifications_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }

    pub fn properties(&self) -> &Arc<PropertyRegistry> {
        &self.inner.properties
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.inner.groups
    }

    pub fn notifications(&self) -> &Arc<NotificationRegistry> {
        &self.inner.notifications
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Properties
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_property_defaults(&self, value: i32, changed: bool) {
        self.inner.properties.set_defaults(value, changed);
    }

    pub fn create_property(&self, name: &str, scale: u16, decimals: u8, signed: bool) -> Result<PropertyId> {
        self.inner.properties.create(name, scale, decimals, signed)
    }

    pub fn create_string_property(&self, name: &str, max_len: usize) -> Result<PropertyId> {
        self.inner.properties.create_string(name, max_len)
    }

    pub fn update_property(&self, id: PropertyId, value: i32) -> bool {
        self.inner.properties.update(id, value)
    }

    pub fn update_string_property(&self, id: PropertyId, value: &str) -> bool {
        self.inner.properties.update_string(id, value)
    }

    pub fn set_property_disabled(&self, id: PropertyId, disabled: bool) -> bool {
        self.inner.properties.set_disabled(id, disabled)
    }

    pub fn set_property_debounce(&self, id: PropertyId, delay_ms: u32) -> bool {
        self.inner.properties.set_debounce_delay(id, delay_ms)
    }

    pub fn property_key(&self, id: PropertyId) -> String {
        self.inner.properties.key(id)
    }

    pub fn property_value(&self, id: PropertyId) -> i32 {
        self.inner.properties.value(id)
    }

    pub fn property_string_value(&self, id: PropertyId) -> Option<String> {
        self.inner.properties.string_value(id)
    }

    pub fn property_scale(&self, id: PropertyId) -> u16 {
        self.inner.properties.scale(id)
    }

    pub fn property_decimals(&self, id: PropertyId) -> u8 {
        self.inner.properties.decimals(id)
    }

    pub fn is_property_signed(&self, id: PropertyId) -> bool {
        self.inner.properties.is_signed(id)
    }

    pub fn is_property_disabled(&self, id: PropertyId) -> bool {
        self.inner.properties.is_disabled(id)
    }

    pub fn property_snapshot(&self, id: PropertyId) -> Option<PropertySnapshot> {
        self.inner.properties.snapshot(id)
    }

    pub fn find_property(&self, name: &str) -> Option<PropertyId> {
        self.inner.properties.find(name)
    }

    pub fn property_count(&self) -> usize {
        self.inner.properties.count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_group(&self, period_ms: u32, only_if_changed: bool) -> Result<GroupId> {
        self.inner.groups.create(period_ms, only_if_changed)
    }

    pub fn add_to_group(&self, property: PropertyId, group: GroupId) -> bool {
        self.inner.groups.add(property, group)
    }

    pub fn group_snapshot(&self, id: GroupId) -> Option<GroupSnapshot> {
        self.inner.groups.snapshot(id)
    }

    pub fn group_count(&self) -> usize {
        self.inner.groups.count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_notification(
        &self,
        name: &str,
        channel: &str,
        template: &str,
        scale: u16,
        decimals: u8,
        signed: bool,
    ) -> Result<NotificationId> {
        self.inner
            .notifications
            .create(name, channel, template, scale, decimals, signed)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_notification_with_value_map(
        &self,
        name: &str,
        channel: &str,
        template: &str,
        scale: u16,
        decimals: u8,
        signed: bool,
        value_map: Vec<String>,
    ) -> Result<NotificationId> {
        self.inner.notifications.create_with_value_map(
            name, channel, template, scale, decimals, signed, value_map,
        )
    }

    pub fn update_notification(&self, id: NotificationId, level: u8, value: i32) -> bool {
        self.inner.notifications.update(id, level, value)
    }

    pub fn notification_key(&self, id: NotificationId) -> String {
        self.inner.notifications.key(id)
    }

    pub fn notification_level(&self, id: NotificationId) -> i32 {
        self.inner.notifications.level(id)
    }

    pub fn notification_value(&self, id: NotificationId) -> i32 {
        self.inner.notifications.value(id)
    }

    pub fn notification_snapshot(&self, id: NotificationId) -> Option<NotificationSnapshot> {
        self.inner.notifications.snapshot(id)
    }

    pub fn find_notification(&self, name: &str) -> Option<NotificationId> {
        self.inner.notifications.find(name)
    }

    pub fn notification_count(&self) -> usize {
        self.inner.notifications.count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publication
    // ─────────────────────────────────────────────────────────────────────────

    /// Build a properties task without spawning it, to drive ticks by hand
    pub fn properties_task(&self, session: Arc<dyn Session>) -> PropertiesTask {
        PropertiesTask::new(
            self.inner.properties.clone(),
            self.inner.groups.clone(),
            session,
            self.inner.clock.clone(),
            self.inner.config.state_buffer_len,
        )
    }

    /// Build a notifications task without spawning it, to drive ticks by hand
    pub fn notifications_task(&self, session: Arc<dyn Session>) -> NotificationsTask {
        NotificationsTask::new(self.inner.notifications.clone(), session)
    }

    /// Spawn the properties task on the current tokio runtime. Only one may ever run.
    pub fn start_properties_task(&self, session: Arc<dyn Session>) -> Result<PublisherHandle> {
        let runtime = claim(&self.inner.properties_started, PROPERTIES_TASK)?;
        let task = self.properties_task(session);
        let period = self.inner.config.properties_period();
        tracing::info!(
            properties = self.property_count(),
            groups = self.group_count(),
            "Starting properties task"
        );
        Ok(PublisherHandle::new(PROPERTIES_TASK, runtime.spawn(task.run(period))))
    }

    /// Spawn the notifications task on the current tokio runtime. Only one may ever run.
    pub fn start_notifications_task(&self, session: Arc<dyn Session>) -> Result<PublisherHandle> {
        let runtime = claim(&self.inner.notifications_started, NOTIFICATIONS_TASK)?;
        let task = self.notifications_task(session);
        let period = self.inner.config.notifications_period();
        tracing::info!(
            notifications = self.notification_count(),
            "Starting notifications task"
        );
        Ok(PublisherHandle::new(NOTIFICATIONS_TASK, runtime.spawn(task.run(period))))
    }
}

/// Mark a task as started, releasing the claim again if no runtime is available
fn claim(started: &AtomicBool, name: &'static str) -> Result<tokio::runtime::Handle> {
    if started.swap(true, Ordering::AcqRel) {
        return Err(TelemetryError::AlreadyRunning(name));
    }
    tokio::runtime::Handle::try_current().map_err(|_| {
        started.store(false, Ordering::Release);
        TelemetryError::NoRuntime(name)
    })
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("properties", &self.inner.properties)
            .field("groups", &self.inner.groups)
            .field("notifications", &self.inner.notifications)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::MemorySession;

    fn telemetry() -> (Telemetry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let telemetry = Telemetry::with_clock(TelemetryConfig::default(), clock.clone()).unwrap();
        (telemetry, clock)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TelemetryConfig {
            max_properties: 0,
            ..TelemetryConfig::default()
        };
        assert!(matches!(Telemetry::new(config), Err(TelemetryError::Config(_))));
    }

    #[test]
    fn test_clones_share_state() {
        let (telemetry, _) = telemetry();
        let other = telemetry.clone();
        let id = telemetry.create_property("rpm", 1, 0, false).unwrap();
        assert!(other.update_property(id, 1500));
        assert_eq!(telemetry.property_value(id), 1500);
        assert_eq!(other.find_property("rpm"), Some(id));
    }

    #[test]
    fn test_start_requires_runtime() {
        let (telemetry, _) = telemetry();
        let session = Arc::new(MemorySession::new());
        assert!(matches!(
            telemetry.start_properties_task(session.clone()),
            Err(TelemetryError::NoRuntime(_))
        ));
        // The failed attempt does not count as a start
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let handle = telemetry.start_properties_task(session).unwrap();
        handle.abort();
    }

    #[tokio::test]
    async fn test_tasks_start_once() {
        let (telemetry, _) = telemetry();
        let session: Arc<dyn Session> = Arc::new(MemorySession::new());

        let props = telemetry.start_properties_task(session.clone()).unwrap();
        let notifs = telemetry.start_notifications_task(session.clone()).unwrap();
        assert_eq!(props.name(), "properties");
        assert_eq!(notifs.name(), "notifications");

        assert!(matches!(
            telemetry.clone().start_properties_task(session.clone()),
            Err(TelemetryError::AlreadyRunning("properties"))
        ));
        assert!(matches!(
            telemetry.start_notifications_task(session.clone()),
            Err(TelemetryError::AlreadyRunning("notifications"))
        ));

        props.abort();
        notifs.abort();
        while !(props.is_finished() && notifs.is_finished()) {
            tokio::task::yield_now().await;
        }

        // Aborting does not release the single start
        assert!(matches!(
            telemetry.start_properties_task(session),
            Err(TelemetryError::AlreadyRunning("properties"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_tasks_publish() {
        let (telemetry, clock) = telemetry();
        let session = Arc::new(MemorySession::new());

        let speed = telemetry.create_property("speed", 10, 1, true).unwrap();
        let group = telemetry.create_group(1000, true).unwrap();
        assert!(telemetry.add_to_group(speed, group));
        let alarm = telemetry
            .create_notification("alarm", "alarms", "%s:%u:%s", 1, 0, true)
            .unwrap();

        let props = telemetry.start_properties_task(session.clone()).unwrap();
        let notifs = telemetry.start_notifications_task(session.clone()).unwrap();

        telemetry.update_property(speed, 123);
        telemetry.update_notification(alarm, 2, 40);
        clock.set(100);

        tokio::time::sleep(std::time::Duration::from_millis(1050)).await;

        assert_eq!(session.states().first().map(String::as_str), Some(r#"{"speed":12.3}"#));
        assert_eq!(session.events(), vec![("alarms".to_string(), "alarm:2:40".to_string())]);

        props.abort();
        notifs.abort();
    }
}
