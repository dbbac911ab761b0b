// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Provides the logging macros for the crate so that the implementation can be swapped out without
//! touching every call site.

pub use tracing::{debug, error, info, warn};
