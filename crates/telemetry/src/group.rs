//! Group Registry
//!
//! A group is an ordered set of properties sharing one publication period and
//! one change policy. Membership is populated at startup; afterwards only the
//! properties task touches a group, to advance its wake time.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::clock::has_elapsed;
use crate::error::{Result, TelemetryError};
use crate::ids::{GroupId, PropertyId};
use crate::property::PropertyRegistry;

/// Consistent copy of a group's configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub id: GroupId,
    pub period_ms: u32,
    pub only_if_changed: bool,
    pub members: Vec<PropertyId>,
}

#[derive(Debug)]
struct GroupEntry {
    period_ms: u32,
    only_if_changed: bool,
    /// Publication order is insertion order
    members: Vec<PropertyId>,
    latest_wake_ms: u32,
}

/// Fixed-capacity collection of property groups
pub struct GroupRegistry {
    entries: RwLock<Vec<Mutex<GroupEntry>>>,
    capacity: usize,
    max_members: usize,
    properties: Arc<PropertyRegistry>,
}

impl GroupRegistry {
    pub fn new(capacity: usize, max_members: usize, properties: Arc<PropertyRegistry>) -> Self {
        Self {
            entries: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
            max_members,
            properties,
        }
    }

    /// Create an empty group
    pub fn create(&self, period_ms: u32, only_if_changed: bool) -> Result<GroupId> {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            return Err(TelemetryError::CapacityExceeded {
                kind: "Group",
                capacity: self.capacity,
            });
        }

        let id = GroupId::from_index(entries.len());
        entries.push(Mutex::new(GroupEntry {
            period_ms,
            only_if_changed,
            members: Vec::with_capacity(self.max_members),
            // Rebased on the current time when the properties task starts
            latest_wake_ms: 0,
        }));

        tracing::debug!(%id, period_ms, only_if_changed, "Property group created");
        Ok(id)
    }

    /// Add a property to a group.
    ///
    /// Fails if either id is invalid, the group is full, or the property is
    /// already a member of this group.
    pub fn add(&self, property: PropertyId, group: GroupId) -> bool {
        if !self.properties.contains(property) {
            return false;
        }
        let Some(index) = group.index() else {
            return false;
        };

        let entries = self.entries.read();
        let Some(entry) = entries.get(index) else {
            return false;
        };
        let mut entry = entry.lock();

        if entry.members.len() >= self.max_members || entry.members.contains(&property) {
            return false;
        }
        entry.members.push(property);
        true
    }

    pub fn snapshot(&self, group: GroupId) -> Option<GroupSnapshot> {
        let index = group.index()?;
        let entries = self.entries.read();
        let entry = entries.get(index)?.lock();
        Some(GroupSnapshot {
            id: group,
            period_ms: entry.period_ms,
            only_if_changed: entry.only_if_changed,
            members: entry.members.clone(),
        })
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Treat `now_ms` as the start of every group's period
    pub(crate) fn rebase(&self, now_ms: u32) {
        for entry in self.entries.read().iter() {
            entry.lock().latest_wake_ms = now_ms;
        }
    }

    /// Visit every group whose period has elapsed (all of them when
    /// `force` is set), advancing its wake time to `now_ms`.
    ///
    /// The visitor receives the members in publication order and the
    /// group's `only_if_changed` policy.
    pub(crate) fn for_each_due(
        &self,
        now_ms: u32,
        force: bool,
        mut visit: impl FnMut(&[PropertyId], bool),
    ) {
        for entry in self.entries.read().iter() {
            let mut entry = entry.lock();
            if !force && !has_elapsed(now_ms, entry.latest_wake_ms, entry.period_ms) {
                continue;
            }
            entry.latest_wake_ms = now_ms;
            visit(&entry.members, entry.only_if_changed);
        }
    }
}

impl std::fmt::Debug for GroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRegistry")
            .field("count", &self.count())
            .field("capacity", &self.capacity)
            .field("max_members", &self.max_members)
            .finish()
    }
}
