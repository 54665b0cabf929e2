use crate::error::BenchError;

/// Lifecycle of a worker.
///
/// ```text
/// Idle -> Registered -> AwaitingCase -> ConfiguringCase -> Running -> Reporting
///                            ^               |                           |
///                            +---------------+---------------------------+
/// ```
///
/// `ConfiguringCase` may also loop onto itself when a newer `CASE_CONFIG`
/// supersedes the pending one. Any live state may end in `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Registered,
    AwaitingCase,
    ConfiguringCase,
    Running,
    Reporting,
    Terminated,
}

impl WorkerState {
    pub fn name(self) -> &'static str {
        match self {
            WorkerState::Idle => "Idle",
            WorkerState::Registered => "Registered",
            WorkerState::AwaitingCase => "AwaitingCase",
            WorkerState::ConfiguringCase => "ConfiguringCase",
            WorkerState::Running => "Running",
            WorkerState::Reporting => "Reporting",
            WorkerState::Terminated => "Terminated",
        }
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Idle, Registered) => true,
            (Registered, AwaitingCase) => true,
            (AwaitingCase, ConfiguringCase) => true,
            (ConfiguringCase, ConfiguringCase | Running | AwaitingCase) => true,
            (Running, Reporting) => true,
            (Reporting, AwaitingCase) => true,
            _ => false,
        }
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn advance(&mut self, next: WorkerState) -> Result<(), BenchError> {
        if !self.can_transition_to(next) {
            return Err(BenchError::InvalidTransition {
                from: self.name(),
                to: next.name(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_case_cycle() {
        let mut state = WorkerState::Idle;
        for next in [
            WorkerState::Registered,
            WorkerState::AwaitingCase,
            WorkerState::ConfiguringCase,
            WorkerState::Running,
            WorkerState::Reporting,
            WorkerState::AwaitingCase,
            WorkerState::Terminated,
        ] {
            state.advance(next).unwrap();
        }
        assert_eq!(state, WorkerState::Terminated);
    }

    #[test]
    fn test_superseding_config_and_setup_failure() {
        let mut state = WorkerState::ConfiguringCase;
        state.advance(WorkerState::ConfiguringCase).unwrap();
        state.advance(WorkerState::AwaitingCase).unwrap();
    }

    #[test]
    fn test_rejects_skipped_steps() {
        let mut state = WorkerState::AwaitingCase;
        let err = state.advance(WorkerState::Running).unwrap_err();
        assert!(matches!(
            err,
            BenchError::InvalidTransition {
                from: "AwaitingCase",
                to: "Running"
            }
        ));
        assert_eq!(state, WorkerState::AwaitingCase);
    }

    #[test]
    fn test_terminated_is_final() {
        let mut state = WorkerState::Terminated;
        assert!(state.advance(WorkerState::Idle).is_err());
        assert!(state.advance(WorkerState::Terminated).is_err());
    }
}
