//! Device Telemetry Core
//!
//! Tracks device state and hands it to an upstream session:
//! - **Properties** are continuously tracked values, debounced and published
//!   in JSON batches by period groups
//! - **Notifications** are level-triggered events published individually
//!   on their own channel
//!
//! Two periodic tasks drive publication. Delivery is at-least-once: anything
//! the session rejects is retried on the next due tick.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use telemetry::{MemorySession, Telemetry, TelemetryConfig};
//!
//! # async fn run() -> telemetry::Result<()> {
//! let telemetry = Telemetry::new(TelemetryConfig::default())?;
//! let speed = telemetry.create_property("speed", 10, 1, true)?;
//! let group = telemetry.create_group(1000, true)?;
//! telemetry.add_to_group(speed, group);
//!
//! let session = Arc::new(MemorySession::new());
//! telemetry.start_properties_task(session.clone())?;
//! telemetry.start_notifications_task(session)?;
//!
//! telemetry.update_property(speed, 215);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod format;
pub mod group;
pub mod ids;
pub mod notification;
pub mod property;
pub mod publisher;
pub mod session;
mod telemetry;

pub use clock::{has_elapsed, Clock, ManualClock, MonotonicClock, PeriodicTicker};
pub use config::TelemetryConfig;
pub use error::{Result, TelemetryError};
pub use format::{MessageTemplate, NumericFormat, TemplateSlot};
pub use group::{GroupRegistry, GroupSnapshot};
pub use ids::{GroupId, NotificationId, PropertyId};
pub use notification::{NotificationLimits, NotificationRegistry, NotificationSnapshot};
pub use property::{PropertyKind, PropertyRegistry, PropertySnapshot, PropertyValue};
pub use publisher::{NotificationsTask, NotificationsTick, PropertiesTask, PropertiesTick, PublisherHandle};
pub use session::{Delivery, MemorySession, Session};
pub use telemetry::Telemetry;
