//! Notification Registry
//!
//! Notifications are level-triggered events. A notification is published, on
//! its own channel, each time an update moves it to a different level. The
//! value that accompanies the level gives context about what caused the change.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, TelemetryError};
use crate::format::{MessageTemplate, NumericFormat};
use crate::ids::NotificationId;
use crate::property::validate_name;

const KIND: &str = "Notification";

/// Value a notification holds before its first update
pub const INITIAL_VALUE: i32 = -1;

/// Limits applied when notifications are created and rendered
#[derive(Debug, Clone, Copy)]
pub struct NotificationLimits {
    pub capacity: usize,
    pub max_name_len: usize,
    pub max_channel_len: usize,
    pub max_template_len: usize,
    pub max_message_len: usize,
}

/// Consistent copy of a notification's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSnapshot {
    pub id: NotificationId,
    pub key: String,
    pub channel: String,
    pub template: String,
    pub format: NumericFormat,
    pub level: u8,
    pub value: i32,
    pub changed: bool,
    pub value_map: Option<Vec<String>>,
}

/// A rendered notification waiting for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OutgoingEvent {
    pub id: NotificationId,
    pub channel: String,
    pub message: String,
    /// Revision the message was rendered from
    pub revision: u64,
}

#[derive(Debug)]
struct NotificationEntry {
    key: String,
    channel: String,
    template: MessageTemplate,
    format: NumericFormat,
    level: u8,
    value: i32,
    changed: bool,
    /// Bumped by every level change
    revision: u64,
    value_map: Option<Vec<String>>,
}

impl NotificationEntry {
    /// Mapped string (quoted) when the value indexes the map, numeric rendering otherwise
    fn value_string(&self) -> String {
        let mapped = self
            .value_map
            .as_ref()
            .and_then(|map| usize::try_from(self.value).ok().and_then(|i| map.get(i)));
        match mapped {
            Some(text) => format!("\"{}\"", text),
            None => self.format.render(self.value),
        }
    }

    fn render(&self, max_len: usize) -> String {
        self.template
            .render(&self.key, self.level, &self.value_string(), max_len)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notification Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-capacity, append-only arena of notifications
pub struct NotificationRegistry {
    entries: RwLock<Vec<Mutex<NotificationEntry>>>,
    names: DashMap<String, NotificationId>,
    limits: NotificationLimits,
}

impl NotificationRegistry {
    pub fn new(limits: NotificationLimits) -> Self {
        Self {
            entries: RwLock::new(Vec::with_capacity(limits.capacity)),
            names: DashMap::new(),
            limits,
        }
    }

    /// Create a notification.
    ///
    /// `template` must contain, in order, `%s` for the name, `%u` for the
    /// level and `%s` for the value.
    pub fn create(
        &self,
        name: &str,
        channel: &str,
        template: &str,
        scale: u16,
        decimals: u8,
        signed: bool,
    ) -> Result<NotificationId> {
        self.create_with_value_map(name, channel, template, scale, decimals, signed, Vec::new())
    }

    /// Create a notification whose values are published as strings from
    /// `value_map` whenever the value is a valid index into it.
    #[allow(clippy::too_many_arguments)]
    pub fn create_with_value_map(
        &self,
        name: &str,
        channel: &str,
        template: &str,
        scale: u16,
        decimals: u8,
        signed: bool,
        value_map: Vec<String>,
    ) -> Result<NotificationId> {
        let mut entries = self.entries.write();

        if entries.len() >= self.limits.capacity {
            return Err(TelemetryError::CapacityExceeded {
                kind: KIND,
                capacity: self.limits.capacity,
            });
        }
        if self.names.contains_key(name) {
            return Err(TelemetryError::DuplicateName {
                kind: KIND,
                name: name.to_string(),
            });
        }
        validate_name(KIND, name, self.limits.max_name_len)?;
        validate_name("Channel", channel, self.limits.max_channel_len)?;
        if template.len() >= self.limits.max_template_len {
            return Err(TelemetryError::NameTooLong {
                what: "Template",
                value: template.to_string(),
                limit: self.limits.max_template_len,
            });
        }
        let template = MessageTemplate::parse(template)?;
        let format = NumericFormat::new(scale, decimals, signed)?;

        let id = NotificationId::from_index(entries.len());
        entries.push(Mutex::new(NotificationEntry {
            key: name.to_string(),
            channel: channel.to_string(),
            template,
            format,
            level: 0,
            value: INITIAL_VALUE,
            changed: false,
            revision: 0,
            value_map: (!value_map.is_empty()).then_some(value_map),
        }));
        self.names.insert(name.to_string(), id);

        tracing::debug!(notification = name, channel, %id, "Notification created");
        Ok(id)
    }

    fn with_entry<R>(&self, id: NotificationId, f: impl FnOnce(&mut NotificationEntry) -> R) -> Option<R> {
        let index = id.index()?;
        let entries = self.entries.read();
        let mut entry = entries.get(index)?.lock();
        Some(f(&mut entry))
    }

    /// Record a new level and value. The notification becomes publishable only
    /// if the level differs from the stored one. Returns false for an invalid id.
    pub fn update(&self, id: NotificationId, level: u8, value: i32) -> bool {
        self.with_entry(id, |entry| {
            if entry.level != level {
                tracing::debug!(
                    notification = %entry.key,
                    old_level = entry.level,
                    new_level = level,
                    value,
                    "Notification level changed"
                );
                entry.level = level;
                entry.value = value;
                entry.changed = true;
                entry.revision = entry.revision.wrapping_add(1);
            }
        })
        .is_some()
    }

    /// Name of the notification, or "" for an invalid id
    pub fn key(&self, id: NotificationId) -> String {
        self.with_entry(id, |entry| entry.key.clone())
            .unwrap_or_default()
    }

    /// Channel of the notification, or "" for an invalid id
    pub fn channel(&self, id: NotificationId) -> String {
        self.with_entry(id, |entry| entry.channel.clone())
            .unwrap_or_default()
    }

    /// Current level, or -1 for an invalid id
    pub fn level(&self, id: NotificationId) -> i32 {
        self.with_entry(id, |entry| i32::from(entry.level))
            .unwrap_or(-1)
    }

    /// Current value, or -1 for an invalid id
    pub fn value(&self, id: NotificationId) -> i32 {
        self.with_entry(id, |entry| entry.value).unwrap_or(-1)
    }

    pub fn snapshot(&self, id: NotificationId) -> Option<NotificationSnapshot> {
        self.with_entry(id, |entry| NotificationSnapshot {
            id,
            key: entry.key.clone(),
            channel: entry.channel.clone(),
            template: entry.template.as_str().to_string(),
            format: entry.format,
            level: entry.level,
            value: entry.value,
            changed: entry.changed,
            value_map: entry.value_map.clone(),
        })
    }

    /// Render the message the notification would publish right now
    pub fn render(&self, id: NotificationId) -> Option<String> {
        let max_len = self.limits.max_message_len;
        self.with_entry(id, |entry| entry.render(max_len))
    }

    pub fn find(&self, name: &str) -> Option<NotificationId> {
        self.names.get(name).map(|id| *id)
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.limits.capacity
    }

    /// Render every changed notification, in id order
    pub(crate) fn collect_changed(&self) -> Vec<OutgoingEvent> {
        let max_len = self.limits.max_message_len;
        self.entries
            .read()
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let entry = entry.lock();
                entry.changed.then(|| OutgoingEvent {
                    id: NotificationId::from_index(index),
                    channel: entry.channel.clone(),
                    message: entry.render(max_len),
                    revision: entry.revision,
                })
            })
            .collect()
    }

    /// Delivery of the message rendered at `revision` succeeded. The flag
    /// stays set if the level moved again in the meantime.
    pub(crate) fn acknowledge(&self, id: NotificationId, revision: u64) {
        self.with_entry(id, |entry| {
            if entry.revision == revision {
                entry.changed = false;
            }
        });
    }
}

impl std::fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("count", &self.count())
            .field("capacity", &self.limits.capacity)
            .finish()
    }
}
