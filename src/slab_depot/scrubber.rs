// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Queues for the background slab scrubber.  Scrubbing itself (journal replay) runs on the zone's
//! message loop one slab at a time; this module tracks which slabs need it, in what order, and
//! who is parked waiting for a clean slab to appear.

use {
    crate::errors::FxDedupError,
    futures::channel::oneshot,
    std::collections::{HashSet, VecDeque},
};

pub struct SlabScrubber {
    // Slabs whose scrubbing gates allocation; drained before normal-priority ones.
    high_priority: VecDeque<u64>,

    normal_priority: VecDeque<u64>,

    // Membership across both queues.
    queued: HashSet<u64>,

    // Allocation requests parked until any slab comes clean; one is woken per slab scrubbed.
    waiters: VecDeque<oneshot::Sender<Result<(), FxDedupError>>>,

    stopped: bool,
}

impl SlabScrubber {
    pub fn new() -> Self {
        SlabScrubber {
            high_priority: VecDeque::new(),
            normal_priority: VecDeque::new(),
            queued: HashSet::new(),
            waiters: VecDeque::new(),
            stopped: false,
        }
    }

    /// Registers a slab for scrubbing.  Re-registering at high priority promotes a slab that is
    /// already queued at normal priority.
    pub fn register(&mut self, slab_number: u64, high_priority: bool) {
        if !self.queued.insert(slab_number) {
            if high_priority {
                if let Some(index) =
                    self.normal_priority.iter().position(|&s| s == slab_number)
                {
                    self.normal_priority.remove(index);
                    self.high_priority.push_back(slab_number);
                }
            }
            return;
        }
        if high_priority {
            self.high_priority.push_back(slab_number);
        } else {
            self.normal_priority.push_back(slab_number);
        }
    }

    /// Takes the next slab to scrub, high priority first.
    pub fn next(&mut self) -> Option<u64> {
        if self.stopped {
            return None;
        }
        let slab_number =
            self.high_priority.pop_front().or_else(|| self.normal_priority.pop_front())?;
        self.queued.remove(&slab_number);
        Some(slab_number)
    }

    pub fn slab_count(&self) -> u64 {
        self.queued.len() as u64
    }

    pub fn has_slabs(&self) -> bool {
        !self.queued.is_empty()
    }

    pub fn has_high_priority_slabs(&self) -> bool {
        !self.high_priority.is_empty()
    }

    /// Parks an allocation request until a slab comes clean.  When there is nothing left to
    /// scrub no wake-up would ever come, so the waiter is immediately failed with `NoSpace`.
    /// Returns whether the waiter was parked.
    pub fn enqueue_clean_slab_waiter(
        &mut self,
        waiter: oneshot::Sender<Result<(), FxDedupError>>,
    ) -> bool {
        if !self.has_slabs() {
            let _ = waiter.send(Err(FxDedupError::NoSpace));
            return false;
        }
        self.waiters.push_back(waiter);
        true
    }

    /// Wakes the oldest waiter; called once per slab scrubbed.  The wake is best effort: the
    /// waiter may still find no space and park again.
    pub fn notify_one_waiter(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(Ok(())).is_ok() {
                return;
            }
        }
    }

    /// Fails every parked waiter; used when the system goes read-only.
    pub fn abort_waiters(&mut self, error: FxDedupError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error));
        }
    }

    /// Stops handing out slabs; queued slabs stay queued for a later resume.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn resume(&mut self) {
        self.stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
