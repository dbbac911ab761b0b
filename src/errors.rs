// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

/// The common error type used throughout the allocator core.  These are wrapped in, and can be
/// extracted from, `anyhow::Error`.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum FxDedupError {
    /// An allocation could not be satisfied.  Surfaced to the caller; not a failure of the
    /// system.
    #[error("No space")]
    NoSpace,

    /// A PBN lock invariant was violated (e.g. a freshly allocated block was found already
    /// locked).  Fatal; forces read-only mode.
    #[error("PBN lock invariant violated")]
    LockInvariant,

    /// On-disk state failed validation.  Fatal; forces read-only mode.
    #[error("Inconsistent on-disk state")]
    Inconsistent,

    /// An illegal admin state transition was requested.  This is a programming error.
    #[error("Illegal admin state transition")]
    BadState,

    /// An underlying metadata read or write failed.
    #[error("I/O error")]
    Io,

    /// The operation was issued to a draining or suspended allocator.
    #[error("Allocator is quiescent")]
    Quiescent,

    /// The system is in read-only mode and mutations are refused.
    #[error("Read-only")]
    ReadOnly,

    /// A transient allocation failure; the caller may retry.
    #[error("Out of memory")]
    OutOfMemory,
}

impl FxDedupError {
    /// Returns whether |error| is equivalent to this FxDedupError.
    pub fn matches(&self, error: &anyhow::Error) -> bool {
        match error.downcast_ref::<FxDedupError>() {
            Some(e) => e == self,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::FxDedupError, anyhow::{anyhow, Context, Error}};

    #[test]
    fn test_matches_through_context() {
        let error: Error =
            Err::<(), Error>(FxDedupError::NoSpace.into()).context("allocating").unwrap_err();
        assert!(FxDedupError::NoSpace.matches(&error));
        assert!(!FxDedupError::Io.matches(&error));
        assert!(!FxDedupError::NoSpace.matches(&anyhow!("some other error")));
    }
}
