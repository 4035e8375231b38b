//! Receipt printer connection lifecycle: remembers paired printers across
//! restarts, restores their sessions automatically, and sends raw printer
//! bytes over Bluetooth LE, USB or a network relay.

pub mod api;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod errors;
pub mod link;
pub mod metrics;
pub mod notifier;
pub mod record;
pub mod registry;
pub mod retry;
pub mod store;
pub mod transport;

pub use errors::{LinkError, Result};
pub use link::PrinterLink;
