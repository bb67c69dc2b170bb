//! Event Monitor
//!
//! Long-lived task that turns raw chain notifications into confirmed,
//! reorg-safe transfer events for the deposit reconciler.

pub mod state;
pub mod watch;

pub use state::{MonitorError, MonitorState};
pub use watch::{EventMonitor, MonitorConfig, MonitorHandle, TransferSink};
