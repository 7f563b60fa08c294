//! Notification bus over Postgres LISTEN/NOTIFY.

pub mod pg_listener;

pub use pg_listener::{NotifyError, PgNotificationBus};
