//! Observable lifecycle of a lease stage.

use std::fmt;
use std::mem;

use crate::utils::FleaseError;

use tokio::sync::watch;

/// Lifecycle state of a lease stage. Moves forward only:
/// `Created -> Starting -> Running -> Stopping -> Stopped`, or to `Crashed`
/// from anywhere once the coordinator hits an unexpected error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed(String),
}

impl StageState {
    /// True if the stage will never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Stopped | StageState::Crashed(_))
    }

    /// Same state, ignoring the crash reason.
    fn same_phase(&self, other: &StageState) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StageState::Crashed(reason) => write!(f, "Crashed({})", reason),
            state => write!(f, "{:?}", state),
        }
    }
}

/// Waits until the observed state reaches `target`. A `Crashed` target
/// matches any crash reason. Fails if the stage ends in a different
/// terminal state.
pub(crate) async fn wait_for_state(
    rx_state: &mut watch::Receiver<StageState>,
    target: &StageState,
) -> Result<(), FleaseError> {
    loop {
        {
            let state = rx_state.borrow_and_update();
            if state.same_phase(target) {
                return Ok(());
            }
            if state.is_terminal() {
                return Err(FleaseError::msg(format!(
                    "stage is {} while waiting for {}",
                    *state, target
                )));
            }
        }
        rx_state.changed().await.map_err(|e| {
            FleaseError::msg(format!("stage state channel closed: {}", e))
        })?;
    }
}
