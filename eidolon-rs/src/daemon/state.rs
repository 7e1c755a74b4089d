use serde::Serialize;
use std::fmt;

use crate::error::{EidolonError, Result};

/// Lifecycle of the supervised VPN process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Process exited without a stop request
    Crashed,
}

impl DaemonState {
    pub fn can_transition_to(&self, next: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Crashed, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: DaemonState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(EidolonError::InvalidState(format!(
                "cannot go from {} to {}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        *self == DaemonState::Running
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Stopping => "stopping",
            DaemonState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_lifecycle() {
        let mut state = DaemonState::Stopped;
        state.transition(DaemonState::Starting).unwrap();
        state.transition(DaemonState::Running).unwrap();
        state.transition(DaemonState::Stopping).unwrap();
        state.transition(DaemonState::Stopped).unwrap();
        assert_eq!(state, DaemonState::Stopped);
    }

    #[test]
    fn test_crash_and_restart() {
        let mut state = DaemonState::Running;
        state.transition(DaemonState::Crashed).unwrap();
        state.transition(DaemonState::Starting).unwrap();
        assert_eq!(state, DaemonState::Starting);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut state = DaemonState::Running;
        assert!(state.transition(DaemonState::Starting).is_err());
        assert_eq!(state, DaemonState::Running);

        let mut state = DaemonState::Stopping;
        assert!(state.transition(DaemonState::Crashed).is_err());

        let mut state = DaemonState::Stopped;
        assert!(state.transition(DaemonState::Running).is_err());
    }
}
