// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        device::Device,
        errors::FxDedupError,
        slab_depot::{
            format::SlabConfig,
            journal::SlabJournal,
            ref_counts::RefCounts,
        },
    },
    anyhow::{ensure, Error},
};

/// The lifecycle of a slab.  Slabs exist for the depot's lifetime; only the state changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlabState {
    /// The slab journal may contain entries not reflected in the on-disk ref-counts; the slab
    /// must be scrubbed before it can serve allocations.
    Unrecovered,

    /// Loaded and available for allocation, with nothing dirty.
    Clean,

    /// The zone's current allocation target.
    Open,

    /// Has journal entries (in memory or on disk) not yet reflected in saved ref-counts.
    Dirty,

    /// Being re-queued as part of a resume; its free count is already accounted for.
    Resuming,

    /// Drained.  No further mutations until resume.
    Quiescent,
}

pub struct Slab {
    slab_number: u64,
    zone: u8,

    // First data block.  All other positions derive from here and the config; nothing about
    // placement is ever stored.
    origin: u64,

    data_blocks: u64,
    state: SlabState,

    // The priority this slab was last enqueued with in the allocator's table.
    priority: u32,

    // None only while the slab is unrecovered and not yet scrubbed.
    ref_counts: Option<RefCounts>,

    pub journal: SlabJournal,
}

impl Slab {
    /// Creates the in-memory slab.  |fresh| slabs (never written, per the summary) get resident
    /// all-free counters immediately; others attach counters at load or scrub time.
    pub fn new(
        slab_number: u64,
        zone: u8,
        config: &SlabConfig,
        first_block: u64,
        nonce: u64,
        fresh: bool,
    ) -> Self {
        let origin = first_block + slab_number * config.slab_blocks;
        let journal_origin = origin + config.data_blocks + config.ref_count_blocks;
        Slab {
            slab_number,
            zone,
            origin,
            data_blocks: config.data_blocks,
            state: if fresh { SlabState::Clean } else { SlabState::Unrecovered },
            priority: 0,
            ref_counts: fresh.then(|| RefCounts::new(config.data_blocks)),
            journal: SlabJournal::new(journal_origin, config.slab_journal_blocks, nonce),
        }
    }

    pub fn slab_number(&self) -> u64 {
        self.slab_number
    }

    pub fn zone(&self) -> u8 {
        self.zone
    }

    pub fn state(&self) -> SlabState {
        self.state
    }

    pub fn set_state(&mut self, state: SlabState) {
        self.state = state;
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    pub fn ref_counts(&self) -> &RefCounts {
        self.ref_counts.as_ref().expect("ref counts not resident")
    }

    pub fn ref_counts_mut(&mut self) -> &mut RefCounts {
        self.ref_counts.as_mut().expect("ref counts not resident")
    }

    pub fn has_resident_ref_counts(&self) -> bool {
        self.ref_counts.is_some()
    }

    pub fn attach_ref_counts(&mut self, ref_counts: RefCounts) {
        self.ref_counts = Some(ref_counts);
    }

    pub fn free_block_count(&self) -> u64 {
        self.ref_counts.as_ref().map(|r| r.free_count()).unwrap_or(0)
    }

    pub fn data_blocks(&self) -> u64 {
        self.data_blocks
    }

    /// First block of the slab's on-disk ref-count region.
    pub fn ref_counts_origin(&self) -> u64 {
        self.origin + self.data_blocks
    }

    /// Translates a data-block index within the slab to a device PBN.
    pub fn index_to_pbn(&self, index: usize) -> u64 {
        self.origin + index as u64
    }

    /// Translates a device PBN to a data-block index, validating that it lands in the slab's
    /// data region (a PBN in the slab's metadata region is a reference-counting bug).
    pub fn pbn_to_index(&self, pbn: u64) -> Result<usize, Error> {
        ensure!(
            pbn >= self.origin && pbn < self.origin + self.data_blocks,
            FxDedupError::Inconsistent
        );
        Ok((pbn - self.origin) as usize)
    }

    /// Whether the slab has journal state the on-disk ref-counts do not reflect.
    pub fn is_dirty(&self) -> bool {
        self.journal.is_dirty() || self.journal.head() < self.journal.tail()
    }

    /// Writes everything dirty: the journal tail if it has entries, then the ref-counts stamped
    /// with the journal tail so the whole journal is reclaimed.  Returns (journal blocks written,
    /// ref-count blocks written).
    pub async fn save(&mut self, device: &dyn Device, buf: &mut [u8]) -> Result<(u64, u64), Error> {
        let mut journal_blocks = 0;
        if self.journal.is_dirty() {
            self.journal.commit_tail(device, buf).await?;
            self.journal.release_recovery_lock();
            journal_blocks += 1;
        }
        let journal_point = self.journal.tail();
        let ref_blocks =
            self.ref_counts().save(device, self.ref_counts_origin(), journal_point, buf).await?;
        self.journal.reclaim(journal_point);
        Ok((journal_blocks, ref_blocks))
    }
}
