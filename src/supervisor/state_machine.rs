use thiserror::Error;

/// Lifecycle of the shutdown sequence. It runs at most once per supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle,
    Stopping,
    Stopped,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

pub struct StateMachine {
    pub state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: State::Idle }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_transition(&self, to: &State) -> bool {
        matches!(
            (&self.state, to),
            (State::Idle, State::Stopping) | (State::Stopping, State::Stopped)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::debug!("Shutdown state: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state.clone(), to))
        }
    }
}
