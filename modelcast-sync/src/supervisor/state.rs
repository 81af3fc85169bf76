use std::fmt;

/// Lifecycle of the supervised backend.
///
/// ```text
/// NotStarted ──▸ Starting ──ready──▸ Running ──stop/change──▸ ShuttingDown
///                   │  ▲               │                          │
///        early exit │  │ respawn       │ crash                    │ exit
///                   ▼  │               ▼                          ▼
///                  Dead ◂──────────────┴──────────────────────── Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendState {
    NotStarted,
    Starting,
    Running,
    ShuttingDown,
    Dead,
}

impl BackendState {
    pub fn can_transition_to(self, next: BackendState) -> bool {
        use BackendState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Starting, ShuttingDown)
                | (Starting, Dead)
                | (Running, ShuttingDown)
                | (Running, Dead)
                | (ShuttingDown, Dead)
                | (Dead, Starting)
        )
    }

    /// A child process exists in this state.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            BackendState::Starting | BackendState::Running | BackendState::ShuttingDown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendState::NotStarted => "not_started",
            BackendState::Starting => "starting",
            BackendState::Running => "running",
            BackendState::ShuttingDown => "shutting_down",
            BackendState::Dead => "dead",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
