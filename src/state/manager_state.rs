//! Lifecycle states of a site manager
//!
//! This module defines the states a manager moves through from construction to stop.

use std::fmt;

/// Represents the current lifecycle state of a site manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerState {
    /// Constructed, `init()` not yet run
    Uninitialized,

    /// `init()` is running or has finished; not yet serving
    Initializing,

    /// Control server accepting, daemons scheduled
    Running,

    /// `shutdown()` in progress
    ShuttingDown,

    /// Everything closed
    Stopped,
}

impl ManagerState {
    /// Returns true if moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: ManagerState) -> bool {
        matches!(
            (self, next),
            (Self::Uninitialized, Self::Initializing)
                | (Self::Initializing, Self::Running)
                | (Self::Initializing, Self::ShuttingDown)
                | (Self::Running, Self::ShuttingDown)
                | (Self::ShuttingDown, Self::Stopped)
                // failed init
                | (Self::Initializing, Self::Stopped)
        )
    }

    /// Returns true once shutdown has begun
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopped)
    }

    /// Short lowercase name, used in logs and the `status` command
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Returns all possible states
    #[cfg(test)]
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Uninitialized,
            Self::Initializing,
            Self::Running,
            Self::ShuttingDown,
            Self::Stopped,
        ]
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
