//! Cooperative run control for a single research execution.
//!
//! The dispatcher holds one [`ExecutionControl`] per live execution and the
//! engine observes it through its progress sink. Cancellation is sticky: once
//! set it is never replaced by pause or resume.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use ts_rs::TS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutionControlError {
    #[error("Execution was cancelled")]
    Cancelled,
    #[error("Execution already paused")]
    AlreadyPaused,
    #[error("Execution not paused")]
    NotPaused,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Running,
    Paused,
    Cancelled,
}

impl std::fmt::Display for ControlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlState::Running => write!(f, "running"),
            ControlState::Paused => write!(f, "paused"),
            ControlState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionControl {
    state: Arc<watch::Sender<ControlState>>,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlState::Running);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn state(&self) -> ControlState {
        *self.state.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ControlState::Cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.state() == ControlState::Paused
    }

    /// Returns false if the execution was already cancelled.
    pub fn cancel(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ControlState::Cancelled {
                false
            } else {
                *state = ControlState::Cancelled;
                true
            }
        })
    }

    pub fn pause(&self) -> Result<(), ExecutionControlError> {
        self.swap(ControlState::Running, ControlState::Paused)
    }

    pub fn resume(&self) -> Result<(), ExecutionControlError> {
        self.swap(ControlState::Paused, ControlState::Running)
    }

    fn swap(&self, from: ControlState, to: ControlState) -> Result<(), ExecutionControlError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| match *state {
            ControlState::Cancelled => {
                result = Err(ExecutionControlError::Cancelled);
                false
            }
            current if current == from => {
                *state = to;
                true
            }
            _ => {
                result = Err(match to {
                    ControlState::Paused => ExecutionControlError::AlreadyPaused,
                    _ => ExecutionControlError::NotPaused,
                });
                false
            }
        });
        result
    }

    /// Yield point for the engine: waits while paused, errors once cancelled.
    pub async fn checkpoint(&self) -> Result<(), ExecutionControlError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| *state != ControlState::Paused)
            .await
            .map(|state| *state)
            .unwrap_or(ControlState::Cancelled);
        match state {
            ControlState::Cancelled => Err(ExecutionControlError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Resolves once the execution is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ControlState::Cancelled).await;
    }

    pub fn same_as(&self, other: &ExecutionControl) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancel_is_sticky() {
        let control = ExecutionControl::new();
        assert!(control.cancel());
        assert!(!control.cancel());
        assert_eq!(control.pause(), Err(ExecutionControlError::Cancelled));
        assert_eq!(control.resume(), Err(ExecutionControlError::Cancelled));
        assert!(control.is_cancelled());
        assert_eq!(control.checkpoint().await, Err(ExecutionControlError::Cancelled));
    }

    #[test]
    fn pause_and_resume_reject_repeats() {
        let control = ExecutionControl::new();
        assert_eq!(control.resume(), Err(ExecutionControlError::NotPaused));
        control.pause().unwrap();
        assert_eq!(control.pause(), Err(ExecutionControlError::AlreadyPaused));
        control.resume().unwrap();
        assert_eq!(control.state(), ControlState::Running);
    }

    #[tokio::test]
    async fn checkpoint_waits_while_paused() {
        let control = ExecutionControl::new();
        control.pause().unwrap();

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.checkpoint().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        control.resume().unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn cancel_releases_paused_checkpoint() {
        let control = ExecutionControl::new();
        control.pause().unwrap();

        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.checkpoint().await });
        control.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ExecutionControlError::Cancelled));
    }

    #[test]
    fn clones_share_state() {
        let control = ExecutionControl::new();
        let other = control.clone();
        assert!(control.same_as(&other));
        assert!(!control.same_as(&ExecutionControl::new()));
        other.cancel();
        assert!(control.is_cancelled());
    }
}
