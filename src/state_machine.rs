//! Tailer lifecycle: Resolving → Open → ReadingLine → (DecodeError | Rotated) → ... → Closed
//! Transitions are validated; observers subscribe through a watch channel.

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

/// All states a log tailer can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TailerState {
    Resolving,
    Open,
    ReadingLine,
    DecodeError,
    Rotated,
    Closed,
}

impl std::fmt::Display for TailerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TailerState::Resolving => write!(f, "Resolving"),
            TailerState::Open => write!(f, "Open"),
            TailerState::ReadingLine => write!(f, "ReadingLine"),
            TailerState::DecodeError => write!(f, "DecodeError"),
            TailerState::Rotated => write!(f, "Rotated"),
            TailerState::Closed => write!(f, "Closed"),
        }
    }
}

impl TailerState {
    /// Returns whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(self, next: TailerState) -> bool {
        matches!(
            (self, next),
            (TailerState::Resolving, TailerState::Open)
                | (TailerState::Open, TailerState::ReadingLine)
                | (TailerState::Open, TailerState::Resolving) // file vanished
                | (TailerState::Open, TailerState::Rotated)
                | (TailerState::ReadingLine, TailerState::Open) // drained to EOF
                | (TailerState::ReadingLine, TailerState::DecodeError)
                | (TailerState::ReadingLine, TailerState::Rotated)
                | (TailerState::ReadingLine, TailerState::Resolving) // read failed
                | (TailerState::DecodeError, TailerState::Resolving)
                | (TailerState::DecodeError, TailerState::Open) // reopened at EOF
                | (TailerState::Rotated, TailerState::Resolving)
                | (TailerState::Rotated, TailerState::Open)
                | (_, TailerState::Closed)
        )
    }
}

/// Thread-safe tailer state with a watch channel for observers.
pub struct TailerStateMachine {
    state: RwLock<TailerState>,
    state_tx: watch::Sender<TailerState>,
    state_rx: watch::Receiver<TailerState>,
}

impl Default for TailerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TailerStateMachine {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(TailerState::Resolving);
        Self {
            state: RwLock::new(TailerState::Resolving),
            state_tx,
            state_rx,
        }
    }

    pub fn current(&self) -> TailerState {
        *self.state.read()
    }

    /// Attempt a state transition. Returns Ok(new_state) or Err with reason.
    /// Re-entering the current state is a no-op.
    pub fn transition(&self, next: TailerState) -> Result<TailerState, String> {
        let mut state = self.state.write();
        let current = *state;
        if current == next {
            return Ok(next);
        }
        if !current.can_transition_to(next) {
            let msg = format!("invalid transition: {} -> {}", current, next);
            warn!("{}", msg);
            return Err(msg);
        }
        *state = next;
        let _ = self.state_tx.send(next);
        debug!(from = %current, to = %next, "tailer_transition");
        Ok(next)
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<TailerState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_and_recovery() {
        let sm = TailerStateMachine::new();
        assert_eq!(sm.current(), TailerState::Resolving);
        sm.transition(TailerState::Open).unwrap();
        sm.transition(TailerState::ReadingLine).unwrap();
        sm.transition(TailerState::DecodeError).unwrap();
        sm.transition(TailerState::Open).unwrap();
        sm.transition(TailerState::Rotated).unwrap();
        sm.transition(TailerState::Open).unwrap();
        sm.transition(TailerState::Closed).unwrap();
        assert_eq!(*sm.subscribe().borrow(), TailerState::Closed);
    }

    #[test]
    fn rejects_invalid_transition() {
        let sm = TailerStateMachine::new();
        assert!(sm.transition(TailerState::ReadingLine).is_err());
        assert_eq!(sm.current(), TailerState::Resolving);

        sm.transition(TailerState::Closed).unwrap();
        assert!(sm.transition(TailerState::Open).is_err());
    }

    #[test]
    fn same_state_is_noop() {
        let sm = TailerStateMachine::new();
        sm.transition(TailerState::Open).unwrap();
        assert!(sm.transition(TailerState::Open).is_ok());
    }
}
