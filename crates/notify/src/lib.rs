//! Anomaly alert delivery.
//!
//! This crate provides:
//! - `AlertSink` trait for pluggable delivery channels
//! - SMTP e-mail sink, configured from the current `ConfigSnapshot`
//! - Minijinja template rendering for alert subject and body
//! - `AlertDispatcher`, which composes an alert and hands it to the sink once

pub mod dispatcher;
pub mod email;
pub mod templating;
pub mod traits;

pub use dispatcher::{AlertDispatcher, ANOMALY_MESSAGE, DEFAULT_MAX_CONCURRENT};
pub use email::EmailNotifier;
pub use traits::{Alert, AlertSink, DispatchResult, Notification, NotifyError};
