//! `listingsync-events`: job change notifications (mechanics only).
//!
//! Notifications only wake workers. They carry just enough to decide whether a
//! worker cares (`job_id`, `tenant`); the job store stays the source of truth
//! and consumers always re-query it.

pub mod bus;
pub mod in_memory_bus;
pub mod notification;
pub mod tenant;

pub use bus::{NotificationBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryNotificationBus};
pub use notification::{JobNotification, NotificationError};
pub use tenant::{TenantScope, TenantScoped};
