// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The administrative state machine shared by the depot and every block allocator.  States are a
//! flat enum with an explicit transition table; an operation that is not legal from the current
//! state fails with `BadState` rather than corrupting the lifecycle.

use {crate::errors::FxDedupError, anyhow::Error};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdminStateCode {
    Normal,
    Loading,
    LoadingForRecovery,
    LoadingForRebuild,
    Saving,
    Flushing,
    Rebuilding,
    Suspending,
    Suspended,
    Resuming,
    ReadOnly,
}

impl AdminStateCode {
    /// True for the transient states entered by `start_operation` and left by
    /// `finish_operation`.
    pub fn is_operating(&self) -> bool {
        !matches!(
            self,
            AdminStateCode::Normal | AdminStateCode::Suspended | AdminStateCode::ReadOnly
        )
    }

    /// True for drain-family states.
    pub fn is_draining(&self) -> bool {
        matches!(
            self,
            AdminStateCode::Saving
                | AdminStateCode::Flushing
                | AdminStateCode::Suspending
                | AdminStateCode::Rebuilding
        )
    }

    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            AdminStateCode::Loading
                | AdminStateCode::LoadingForRecovery
                | AdminStateCode::LoadingForRebuild
        )
    }

    /// Whether a drain of this kind writes out dirty metadata (as opposed to merely quiescing
    /// in-flight I/O).
    pub fn should_write_dirty(&self) -> bool {
        matches!(
            self,
            AdminStateCode::Saving | AdminStateCode::Flushing | AdminStateCode::Rebuilding
        )
    }

    /// The state reached when the operation completes successfully.
    fn terminal_code(&self) -> AdminStateCode {
        match self {
            AdminStateCode::Loading
            | AdminStateCode::LoadingForRecovery
            | AdminStateCode::LoadingForRebuild
            | AdminStateCode::Flushing
            | AdminStateCode::Rebuilding
            | AdminStateCode::Resuming => AdminStateCode::Normal,
            AdminStateCode::Saving | AdminStateCode::Suspending => AdminStateCode::Suspended,
            _ => *self,
        }
    }

    /// The transition table: which operations may begin from which resting states.
    fn may_start_from(&self, current: AdminStateCode) -> bool {
        match self {
            AdminStateCode::Loading
            | AdminStateCode::LoadingForRecovery
            | AdminStateCode::LoadingForRebuild
            | AdminStateCode::Resuming => current == AdminStateCode::Suspended,
            AdminStateCode::Saving
            | AdminStateCode::Flushing
            | AdminStateCode::Suspending
            | AdminStateCode::Rebuilding => current == AdminStateCode::Normal,
            _ => false,
        }
    }
}

pub struct AdminState {
    code: AdminStateCode,

    // The worst error recorded while the current operation ran.  Zone actions record errors here
    // and continue so that drain and resume always reach a terminal state.
    operation_result: Option<FxDedupError>,
}

impl AdminState {
    /// A newly constructed component is quiescent until it is loaded.
    pub fn new() -> Self {
        AdminState { code: AdminStateCode::Suspended, operation_result: None }
    }

    pub fn code(&self) -> AdminStateCode {
        self.code
    }

    pub fn is_read_only(&self) -> bool {
        self.code == AdminStateCode::ReadOnly
    }

    /// Whether new data-path operations (allocation, reference mutation) are admissible.
    pub fn may_operate(&self) -> bool {
        self.code == AdminStateCode::Normal
    }

    /// Begins |operation|.  Fails with `BadState` if it is not legal from the current state.
    pub fn start_operation(&mut self, operation: AdminStateCode) -> Result<(), Error> {
        if self.code == AdminStateCode::ReadOnly || !operation.may_start_from(self.code) {
            return Err(FxDedupError::BadState.into());
        }
        self.code = operation;
        self.operation_result = None;
        Ok(())
    }

    /// Completes the in-flight operation, returning the worst error recorded while it ran.
    /// Read-only mode is absorbing: finishing an operation after the notifier fired leaves the
    /// state read-only.
    pub fn finish_operation(&mut self) -> Result<(), FxDedupError> {
        if self.code != AdminStateCode::ReadOnly {
            assert!(self.code.is_operating(), "no operation in flight");
            self.code = self.code.terminal_code();
        }
        match self.operation_result.take() {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Records a failure from one step of the in-flight operation.  The first error wins; later
    /// steps still run.
    pub fn set_operation_result(&mut self, error: FxDedupError) {
        self.operation_result.get_or_insert(error);
    }

    /// Enters read-only mode.  Legal from every state and permanent.
    pub fn set_read_only(&mut self) {
        self.code = AdminStateCode::ReadOnly;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{AdminState, AdminStateCode},
        crate::errors::FxDedupError,
    };

    #[test]
    fn test_load_then_drain_then_resume() {
        let mut state = AdminState::new();
        state.start_operation(AdminStateCode::Loading).expect("load should start");
        assert!(!state.may_operate());
        state.finish_operation().expect("load should finish");
        assert_eq!(state.code(), AdminStateCode::Normal);

        state.start_operation(AdminStateCode::Saving).expect("save should start");
        state.finish_operation().expect("save should finish");
        assert_eq!(state.code(), AdminStateCode::Suspended);

        state.start_operation(AdminStateCode::Resuming).expect("resume should start");
        state.finish_operation().expect("resume should finish");
        assert_eq!(state.code(), AdminStateCode::Normal);
    }

    #[test]
    fn test_flush_returns_to_normal() {
        let mut state = AdminState::new();
        state.start_operation(AdminStateCode::Loading).expect("load should start");
        state.finish_operation().expect("load should finish");
        state.start_operation(AdminStateCode::Flushing).expect("flush should start");
        state.finish_operation().expect("flush should finish");
        assert_eq!(state.code(), AdminStateCode::Normal);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut state = AdminState::new();
        // Can't drain or resume before loading.
        assert!(FxDedupError::BadState
            .matches(&state.start_operation(AdminStateCode::Saving).unwrap_err()));
        state.start_operation(AdminStateCode::LoadingForRecovery).expect("load should start");
        // Can't start something else while an operation is in flight.
        assert!(FxDedupError::BadState
            .matches(&state.start_operation(AdminStateCode::Suspending).unwrap_err()));
    }

    #[test]
    fn test_operation_result_preserved() {
        let mut state = AdminState::new();
        state.start_operation(AdminStateCode::Loading).expect("load should start");
        state.finish_operation().expect("load should finish");
        state.start_operation(AdminStateCode::Suspending).expect("suspend should start");
        state.set_operation_result(FxDedupError::Io);
        state.set_operation_result(FxDedupError::NoSpace);
        // The drain still reaches its terminal state, and the first error wins.
        assert_eq!(state.finish_operation(), Err(FxDedupError::Io));
        assert_eq!(state.code(), AdminStateCode::Suspended);
    }

    #[test]
    fn test_read_only_is_absorbing() {
        let mut state = AdminState::new();
        state.start_operation(AdminStateCode::Loading).expect("load should start");
        state.set_read_only();
        // Finishing the in-flight operation doesn't leave read-only.
        let _ = state.finish_operation();
        assert_eq!(state.code(), AdminStateCode::ReadOnly);
        assert!(FxDedupError::BadState
            .matches(&state.start_operation(AdminStateCode::Resuming).unwrap_err()));
    }
}
