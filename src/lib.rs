//! The certwatch binary's support library: the filesystem state
//! provider and the notification sinks.
//!
//! The monitoring core lives in `certwatch-monitor` and talks to
//! storage and notification through its `StateProvider` trait;
//! [`FilesystemState`] is the standard implementation, backed by a
//! state directory and the configured notification methods.

pub mod fsstate;
pub mod notify;

pub use fsstate::FilesystemState;
pub use notify::{Notification, Notifier};
