// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        errors::FxDedupError,
        log::*,
        slab_depot::allocator::{AllocatorHandle, ZoneAction},
    },
    std::sync::atomic::{AtomicUsize, Ordering},
};

/// Sequences depot-wide administrative actions.  One action runs at a time; it is applied to
/// zone 0 first and chains through the zones in order.  A zone's failure is recorded but does not
/// stop the remaining zones, so a drain or resume always runs everywhere and the caller sees the
/// first error once the whole fan-out finishes.
pub(super) struct ActionManager {
    zones: Vec<AllocatorHandle>,

    // Serializes actions; admin operations never overlap.
    serializer: futures::lock::Mutex<()>,

    // The zone the in-flight action is currently on; zones.len() when idle.  Diagnostic only.
    current_zone: AtomicUsize,
}

impl ActionManager {
    pub fn new(zones: Vec<AllocatorHandle>) -> Self {
        let idle = zones.len();
        ActionManager {
            zones,
            serializer: futures::lock::Mutex::new(()),
            current_zone: AtomicUsize::new(idle),
        }
    }

    /// Applies |action| to every zone in order, preserving the first failure.
    pub async fn apply_to_zones(&self, action: ZoneAction) -> Result<(), FxDedupError> {
        let _guard = self.serializer.lock().await;
        let mut first_error = None;
        for (zone_number, zone) in self.zones.iter().enumerate() {
            self.current_zone.store(zone_number, Ordering::Relaxed);
            if let Err(e) = zone.admin(action).await {
                warn!(zone = zone_number as u64, error = ?e, ?action, "Zone action failed");
                first_error.get_or_insert(e);
            }
        }
        self.current_zone.store(self.zones.len(), Ordering::Relaxed);
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
