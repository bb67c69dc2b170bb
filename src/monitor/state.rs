use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::chain::ChainError;

/// Lifecycle of the event monitor task.
///
/// ```text
/// Stopped -> Starting -> Running <-> Reconnecting
///                \___________\____________\-> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    Reconnecting,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Stopped => "STOPPED",
            MonitorState::Starting => "STARTING",
            MonitorState::Running => "RUNNING",
            MonitorState::Reconnecting => "RECONNECTING",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, MonitorState::Stopped)
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Chain access error: {0}")]
    Chain(#[from] ChainError),

    #[error("Transfer sink rejected event: {0}")]
    Sink(String),

    #[error("Monitor is not running")]
    NotRunning,
}

impl MonitorError {
    pub fn code(&self) -> &'static str {
        match self {
            MonitorError::Chain(e) => e.code(),
            MonitorError::Sink(_) => "SINK_ERROR",
            MonitorError::NotRunning => "MONITOR_NOT_RUNNING",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(MonitorState::Reconnecting.to_string(), "RECONNECTING");
        assert!(MonitorState::Running.is_active());
        assert!(!MonitorState::Stopped.is_active());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MonitorError::from(ChainError::Drained).code(), "DRAINED");
        assert_eq!(MonitorError::NotRunning.code(), "MONITOR_NOT_RUNNING");
    }
}
