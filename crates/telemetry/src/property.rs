//! Property Registry
//!
//! Properties are continuously tracked values published in JSON batches by the
//! properties task. Each entry sits behind its own lock; the arena lock is taken
//! for writing only while a property is being created.
//!
//! Field ownership between callers and the scheduler:
//! - callers set `set_value`, `debouncing`, `latest_set_ms`, `disabled`, `debounce_delay_ms`
//! - the scheduler sets `changed`, clears `debouncing`, and owns `last_published` and `pending`

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::clock::{has_elapsed, Clock};
use crate::error::{Result, TelemetryError};
use crate::format::{MemberValue, NumericFormat, StateBatch};
use crate::ids::PropertyId;

const KIND: &str = "Property";

/// Kind of a property, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Numeric(NumericFormat),
    Text { max_len: usize },
}

/// Value held by a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Number(i32),
    Text(String),
}

/// Consistent copy of a property's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertySnapshot {
    pub id: PropertyId,
    pub key: String,
    pub kind: PropertyKind,
    pub value: PropertyValue,
    pub last_published: PropertyValue,
    pub disabled: bool,
    pub changed: bool,
    pub debouncing: bool,
    pub debounce_delay_ms: u32,
}

/// Values given to properties when they are created
#[derive(Debug, Clone, Copy)]
struct PropertyDefaults {
    value: i32,
    changed: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Property Entry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct PropertyEntry {
    key: String,
    kind: PropertyKind,
    set_value: PropertyValue,
    last_published: PropertyValue,
    disabled: bool,
    changed: bool,
    debouncing: bool,
    latest_set_ms: u32,
    debounce_delay_ms: u32,
    /// Set once a batch carrying this property has been accepted
    baseline_sent: bool,
    /// Value serialized into the batch currently being delivered
    pending: Option<PropertyValue>,
}

impl PropertyEntry {
    fn snapshot(&self, id: PropertyId) -> PropertySnapshot {
        PropertySnapshot {
            id,
            key: self.key.clone(),
            kind: self.kind,
            value: self.set_value.clone(),
            last_published: self.last_published.clone(),
            disabled: self.disabled,
            changed: self.changed,
            debouncing: self.debouncing,
            debounce_delay_ms: self.debounce_delay_ms,
        }
    }

    /// End the debounce window once the value has been stable long enough
    pub(crate) fn resolve_debounce(&mut self, now_ms: u32) {
        if self.debouncing && has_elapsed(now_ms, self.latest_set_ms, self.debounce_delay_ms) {
            self.debouncing = false;
            self.changed = true;
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether the property belongs in the batch for a group with the given policy.
    /// A property whose first value has not been delivered yet always does.
    pub(crate) fn is_eligible(&self, only_if_changed: bool) -> bool {
        if self.disabled {
            return false;
        }
        !self.baseline_sent
            || (self.changed && self.set_value != self.last_published)
            || !only_if_changed
    }

    /// Serialize into the batch and remember what was sent
    pub(crate) fn append_to(&mut self, batch: &mut StateBatch) -> bool {
        let value = match (&self.kind, &self.set_value) {
            (PropertyKind::Numeric(format), PropertyValue::Number(raw)) => {
                MemberValue::Number(*raw, *format)
            }
            (_, PropertyValue::Text(text)) => MemberValue::Text(text),
            // Numeric value on a text property cannot happen; render it plainly.
            (PropertyKind::Text { .. }, PropertyValue::Number(raw)) => {
                MemberValue::Number(*raw, NumericFormat::integer())
            }
        };
        if !batch.push(&self.key, value) {
            return false;
        }
        self.pending = Some(self.set_value.clone());
        true
    }

    /// Delivery succeeded
    pub(crate) fn commit_pending(&mut self) {
        if let Some(sent) = self.pending.take() {
            self.last_published = sent;
            self.changed = false;
            self.baseline_sent = true;
        }
    }

    /// Delivery failed or was not attempted
    pub(crate) fn discard_pending(&mut self) {
        self.pending = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Property Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-capacity, append-only arena of properties
pub struct PropertyRegistry {
    entries: RwLock<Vec<Mutex<PropertyEntry>>>,
    names: DashMap<String, PropertyId>,
    capacity: usize,
    max_name_len: usize,
    defaults: Mutex<PropertyDefaults>,
    clock: Arc<dyn Clock>,
}

impl PropertyRegistry {
    pub fn new(
        capacity: usize,
        max_name_len: usize,
        default_value: i32,
        default_changed: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: RwLock::new(Vec::with_capacity(capacity)),
            names: DashMap::new(),
            capacity,
            max_name_len,
            defaults: Mutex::new(PropertyDefaults {
                value: default_value,
                changed: default_changed,
            }),
            clock,
        }
    }

    /// Change the initial value and `changed` flag of properties created from now on
    pub fn set_defaults(&self, value: i32, changed: bool) {
        *self.defaults.lock() = PropertyDefaults { value, changed };
    }

    /// Create a numeric property
    pub fn create(&self, name: &str, scale: u16, decimals: u8, signed: bool) -> Result<PropertyId> {
        let format = NumericFormat::new(scale, decimals, signed)?;
        let defaults = *self.defaults.lock();
        self.insert(name, |key| {
            Ok(PropertyEntry {
                key,
                kind: PropertyKind::Numeric(format),
                set_value: PropertyValue::Number(defaults.value),
                last_published: PropertyValue::Number(defaults.value),
                disabled: false,
                changed: defaults.changed,
                debouncing: false,
                latest_set_ms: 0,
                debounce_delay_ms: 0,
                baseline_sent: false,
                pending: None,
            })
        })
    }

    /// Create a string property holding at most `max_len` bytes
    pub fn create_string(&self, name: &str, max_len: usize) -> Result<PropertyId> {
        let defaults = *self.defaults.lock();
        self.insert(name, |key| {
            Ok(PropertyEntry {
                key,
                kind: PropertyKind::Text { max_len },
                set_value: PropertyValue::Text(reserve_text(max_len)?),
                last_published: PropertyValue::Text(reserve_text(max_len)?),
                disabled: false,
                changed: defaults.changed,
                debouncing: false,
                latest_set_ms: 0,
                debounce_delay_ms: 0,
                baseline_sent: false,
                pending: None,
            })
        })
    }

    /// Validate and append. Nothing is stored unless every check passes.
    fn insert(
        &self,
        name: &str,
        build: impl FnOnce(String) -> Result<PropertyEntry>,
    ) -> Result<PropertyId> {
        let mut entries = self.entries.write();

        if entries.len() >= self.capacity {
            return Err(TelemetryError::CapacityExceeded {
                kind: KIND,
                capacity: self.capacity,
            });
        }
        validate_name(KIND, name, self.max_name_len)?;
        if self.names.contains_key(name) {
            return Err(TelemetryError::DuplicateName {
                kind: KIND,
                name: name.to_string(),
            });
        }

        let entry = build(name.to_string())?;
        let id = PropertyId::from_index(entries.len());
        entries.push(Mutex::new(entry));
        self.names.insert(name.to_string(), id);

        tracing::debug!(property = name, %id, "Property created");
        Ok(id)
    }

    /// Run `f` on the entry behind `id`
    pub(crate) fn with_entry<R>(&self, id: PropertyId, f: impl FnOnce(&mut PropertyEntry) -> R) -> Option<R> {
        let index = id.index()?;
        let entries = self.entries.read();
        let mut entry = entries.get(index)?.lock();
        Some(f(&mut entry))
    }

    /// Run `f` on every entry, one lock at a time
    pub(crate) fn for_each_entry(&self, mut f: impl FnMut(&mut PropertyEntry)) {
        let entries = self.entries.read();
        for entry in entries.iter() {
            f(&mut entry.lock());
        }
    }

    /// Set a new numeric value. Returns true if the value differed and a
    /// debounce window was started.
    pub fn update(&self, id: PropertyId, new_value: i32) -> bool {
        let now = self.clock.now_ms();
        self.with_entry(id, |entry| {
            let current = match entry.set_value {
                PropertyValue::Number(v) => v,
                PropertyValue::Text(_) => return false,
            };
            if current == new_value {
                return false;
            }
            tracing::debug!(property = %entry.key, old = current, new = new_value, "Property changed");
            entry.set_value = PropertyValue::Number(new_value);
            entry.debouncing = true;
            entry.latest_set_ms = now;
            true
        })
        .unwrap_or(false)
    }

    /// Set a new string value, silently truncated to the property's maximum length.
    /// Returns true if the stored value changed.
    pub fn update_string(&self, id: PropertyId, new_value: &str) -> bool {
        let now = self.clock.now_ms();
        self.with_entry(id, |entry| {
            let PropertyKind::Text { max_len } = entry.kind else {
                return false;
            };
            let PropertyValue::Text(current) = &mut entry.set_value else {
                return false;
            };

            let mut end = new_value.len().min(max_len);
            while !new_value.is_char_boundary(end) {
                end -= 1;
            }
            let truncated = &new_value[..end];
            if truncated.len() < new_value.len() {
                tracing::warn!(property = %entry.key, max_len, "String value truncated");
            }
            if current.as_str() == truncated {
                return false;
            }

            tracing::debug!(property = %entry.key, old = %current, new = truncated, "Property changed");
            // Reuses the buffer reserved at creation.
            current.clear();
            current.push_str(truncated);
            entry.debouncing = true;
            entry.latest_set_ms = now;
            true
        })
        .unwrap_or(false)
    }

    pub fn set_disabled(&self, id: PropertyId, disabled: bool) -> bool {
        self.with_entry(id, |entry| entry.disabled = disabled).is_some()
    }

    pub fn set_debounce_delay(&self, id: PropertyId, delay_ms: u32) -> bool {
        self.with_entry(id, |entry| entry.debounce_delay_ms = delay_ms)
            .is_some()
    }

    pub fn is_disabled(&self, id: PropertyId) -> bool {
        self.with_entry(id, |entry| entry.disabled).unwrap_or(false)
    }

    /// Name of the property, or "" for an invalid id
    pub fn key(&self, id: PropertyId) -> String {
        self.with_entry(id, |entry| entry.key.clone())
            .unwrap_or_default()
    }

    /// Current numeric value, or -1 for an invalid id or a string property
    pub fn value(&self, id: PropertyId) -> i32 {
        self.with_entry(id, |entry| match entry.set_value {
            PropertyValue::Number(v) => v,
            PropertyValue::Text(_) => -1,
        })
        .unwrap_or(-1)
    }

    /// Current string value, or `None` for an invalid id or a numeric property
    pub fn string_value(&self, id: PropertyId) -> Option<String> {
        self.with_entry(id, |entry| match &entry.set_value {
            PropertyValue::Text(text) => Some(text.clone()),
            PropertyValue::Number(_) => None,
        })
        .flatten()
    }

    /// Scale divider, or 0 for an invalid id
    pub fn scale(&self, id: PropertyId) -> u16 {
        self.with_entry(id, |entry| match entry.kind {
            PropertyKind::Numeric(format) => format.scale,
            PropertyKind::Text { .. } => 1,
        })
        .unwrap_or(0)
    }

    /// Number of decimals, or 0 for an invalid id
    pub fn decimals(&self, id: PropertyId) -> u8 {
        self.with_entry(id, |entry| match entry.kind {
            PropertyKind::Numeric(format) => format.decimals,
            PropertyKind::Text { .. } => 0,
        })
        .unwrap_or(0)
    }

    pub fn is_signed(&self, id: PropertyId) -> bool {
        self.with_entry(id, |entry| match entry.kind {
            PropertyKind::Numeric(format) => format.signed,
            PropertyKind::Text { .. } => false,
        })
        .unwrap_or(false)
    }

    pub fn snapshot(&self, id: PropertyId) -> Option<PropertySnapshot> {
        self.with_entry(id, |entry| entry.snapshot(id))
    }

    /// Look a property up by name
    pub fn find(&self, name: &str) -> Option<PropertyId> {
        self.names.get(name).map(|id| *id)
    }

    /// Identifiers of all properties in creation order
    pub fn ids(&self) -> Vec<PropertyId> {
        (0..self.count()).map(PropertyId::from_index).collect()
    }

    /// Number of properties created
    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `id` addresses an existing property
    pub fn contains(&self, id: PropertyId) -> bool {
        id.index().is_some_and(|i| i < self.count())
    }
}

impl std::fmt::Debug for PropertyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyRegistry")
            .field("count", &self.count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

pub(crate) fn validate_name(kind: &'static str, name: &str, max_len: usize) -> Result<()> {
    if name.is_empty() {
        return Err(TelemetryError::EmptyName { kind });
    }
    if name.len() >= max_len {
        return Err(TelemetryError::NameTooLong {
            what: kind,
            value: name.to_string(),
            limit: max_len,
        });
    }
    Ok(())
}

fn reserve_text(max_len: usize) -> Result<String> {
    let mut text = String::new();
    text.try_reserve_exact(max_len)
        .map_err(|_| TelemetryError::AllocationFailed(max_len))?;
    Ok(text)
}
