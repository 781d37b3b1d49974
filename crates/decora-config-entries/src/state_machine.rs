//! Config entry lifecycle
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                            ↘ SetupError → SetupInProgress
//!                            ↘ SetupRetry → SetupInProgress
//!
//! Loaded/SetupError/SetupRetry → UnloadInProgress → NotLoaded
//!                                                 ↘ FailedUnload (terminal)
//! ```

use crate::entry::ConfigEntryState;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    pub fn try_transition(self, to: ConfigEntryState) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = matches!(
            (self, to),
            (NotLoaded, SetupInProgress)
                | (SetupInProgress, Loaded)
                | (SetupInProgress, SetupError)
                | (SetupInProgress, SetupRetry)
                | (SetupError, SetupInProgress)
                | (SetupError, UnloadInProgress)
                | (SetupRetry, SetupInProgress)
                | (SetupRetry, UnloadInProgress)
                | (Loaded, UnloadInProgress)
                | (UnloadInProgress, NotLoaded)
                | (UnloadInProgress, FailedUnload)
        );

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: rejection_reason(self, to),
            })
        }
    }

    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }
}

fn rejection_reason(from: ConfigEntryState, to: ConfigEntryState) -> &'static str {
    use ConfigEntryState::*;

    match (from, to) {
        (FailedUnload, _) => "FailedUnload is terminal",
        (Loaded, SetupInProgress) => "already loaded, unload first",
        (Loaded, NotLoaded) => "must go through UnloadInProgress",
        (NotLoaded, Loaded) | (NotLoaded, SetupError) | (NotLoaded, SetupRetry) => {
            "must go through SetupInProgress"
        }
        (SetupInProgress, _) => "setup in progress",
        (UnloadInProgress, _) => "unload in progress",
        _ => "invalid state transition",
    }
}

/// Seconds to wait before setup retry number `tries`
///
/// `5 * 2^min(tries, 4)` plus up to 100ms of jitter: 5, 10, 20, 40, 80, 80, ...
pub fn calculate_retry_delay(tries: u32) -> f64 {
    let base = 5 * 2_u32.pow(tries.min(4));
    base as f64 + rand::random::<f64>() * 0.1
}
