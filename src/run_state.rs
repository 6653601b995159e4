use log::info;
use std::time::Duration;

use crate::config::TimingConfig;
use crate::error::ControlError;
use crate::types::RunState;

/// Lifecycle of the control session.
///
/// `Initializing` only exists inside a commit: it marks the first commit since
/// standby, where empty fields leave quantities at their defaults.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    commit_allowed: bool,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Standby,
            commit_allowed: true,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn commit_allowed(&self) -> bool {
        self.commit_allowed
    }

    /// Enter a commit. Returns true when this is the first commit since standby.
    pub fn begin_commit(&mut self) -> Result<bool, ControlError> {
        if !self.commit_allowed {
            return Err(ControlError::CommitNotAllowed(self.state));
        }
        match self.state {
            RunState::Standby => {
                self.transition(RunState::Initializing);
                Ok(true)
            }
            RunState::Initializing => Ok(true),
            RunState::Running => Ok(false),
            RunState::Terminating => Err(ControlError::CommitNotAllowed(self.state)),
        }
    }

    /// All quantities were attempted.
    pub fn finish_commit(&mut self) {
        if self.state != RunState::Running {
            self.transition(RunState::Running);
        }
    }

    pub fn begin_terminate(&mut self) {
        self.commit_allowed = false;
        self.transition(RunState::Terminating);
    }

    pub fn finish_terminate(&mut self) {
        self.transition(RunState::Standby);
        self.commit_allowed = true;
    }

    /// Data-log period for the current state.
    pub fn log_interval(&self, timing: &TimingConfig) -> Duration {
        match self.state {
            RunState::Initializing | RunState::Running => timing.running_log_interval(),
            RunState::Standby | RunState::Terminating => timing.standby_log_interval(),
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            info!("Run state {} -> {}", self.state, next);
            self.state = next;
        }
    }
}
