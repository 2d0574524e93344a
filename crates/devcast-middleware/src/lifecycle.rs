//! Lifecycle of a background channel task.

use std::fmt;

/// `Idle → Running → Stopped`. A stopped channel never runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    #[default]
    Idle,
    Running,
    Stopped,
}

impl Lifecycle {
    pub fn is_running(self) -> bool {
        self == Lifecycle::Running
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Idle => write!(f, "idle"),
            Lifecycle::Running => write!(f, "running"),
            Lifecycle::Stopped => write!(f, "stopped"),
        }
    }
}
