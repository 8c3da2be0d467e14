use std::fmt;

use serde::Serialize;

/// Lifecycle of a [`Server`](super::Server).
///
/// `Stopped` and `Error` are terminal: a server that reached either one
/// is discarded and, if needed, replaced by a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Starting,
    Running,
    StopRequested,
    Stopped,
    Error,
}

impl ServerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::StopRequested => "stop_requested",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
