//! Lifecycle states of the session's parts.
//!
//! All of them are owned by the session task and mutated only from its event
//! loop, so none of them needs locking.

use serde::Serialize;
use std::fmt;

/// State of the socket the engine talks over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Listener bound, waiting for the engine to connect back
    Listening,
    Connected,
}

impl ConnectionState {
    /// Successful bind
    pub fn on_bound(self) -> Self {
        match self {
            ConnectionState::Disconnected => ConnectionState::Listening,
            other => other,
        }
    }

    /// Engine connection accepted
    pub fn on_accepted(self) -> Self {
        ConnectionState::Connected
    }

    /// Socket closed or process exited
    pub fn on_lost(self) -> Self {
        ConnectionState::Disconnected
    }
}

/// State of the engine subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    NotStarted,
    /// Spawned, no prompt seen yet
    Starting,
    Running,
    Crashed,
}

/// Where the scheduler stands with respect to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Ready to transmit the next command
    Idle,
    /// Engine not ready: starting up, disconnected, or finishing work that was
    /// cleared from the queue
    #[default]
    WaitingForEngine,
    /// A command was transmitted and awaits its main prompt
    Working,
    /// The engine asked a question and waits for an answer
    WaitingForAnswer,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Listening => "listening",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::NotStarted => "not started",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_transitions() {
        let state = ConnectionState::default();
        let state = state.on_bound();
        assert_eq!(state, ConnectionState::Listening);
        let state = state.on_accepted();
        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(state.on_bound(), ConnectionState::Connected);
        assert_eq!(state.on_lost(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessState::Crashed.to_string(), "crashed");
        assert_eq!(ConnectionState::Listening.to_string(), "listening");
    }
}
