//! Cell Status
//!
//! Lifecycle states a cell moves through. Transitions are published on
//! a watch channel, so waiting for a state is subscribing and calling
//! `wait_for`; there is no separate event stream.
//!
//! The forward order is `NotStarted` to `StartingWaitingForInputs` to
//! `Running` to `Stopping` to `Stopped`. A force stop jumps straight to
//! `Stopped` from anywhere, and a cell that shuts down before its
//! inputs arrive skips `Running` entirely.

/// Where a cell is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// Spawned but not yet ordered to start.
    NotStarted,
    /// Start order received; the worker is waiting for every signal
    /// input to hold a value.
    StartingWaitingForInputs,
    /// All inputs arrived and the run future is being driven.
    Running,
    /// A finish was requested or run returned; teardown is under way.
    Stopping,
    /// The worker has exited. Terminal.
    Stopped,
}

impl CellStatus {
    /// True once the cell has reached its terminal state.
    pub fn is_stopped(self) -> bool {
        self == CellStatus::Stopped
    }

    /// True while the run future may still be making progress.
    pub fn is_active(self) -> bool {
        matches!(self, CellStatus::Running | CellStatus::Stopping)
    }
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CellStatus::NotStarted => "not-started",
            CellStatus::StartingWaitingForInputs => "starting-waiting-for-inputs",
            CellStatus::Running => "running",
            CellStatus::Stopping => "stopping",
            CellStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_partition_the_lifecycle() {
        assert!(!CellStatus::NotStarted.is_active());
        assert!(!CellStatus::StartingWaitingForInputs.is_active());
        assert!(CellStatus::Running.is_active());
        assert!(CellStatus::Stopping.is_active());
        assert!(!CellStatus::Stopped.is_active());
        assert!(CellStatus::Stopped.is_stopped());
    }

    #[test]
    fn display_is_kebab_case() {
        assert_eq!(CellStatus::StartingWaitingForInputs.to_string(), "starting-waiting-for-inputs");
    }
}
