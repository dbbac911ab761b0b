// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The slab depot: the physical block allocator for the whole device.
//!
//! The depot owns the complete ordered array of slabs and partitions them among Z physical
//! zones; slab S belongs to zone S mod Z, and each zone is served by one `allocator` thread
//! owning all of its mutable state.  The depot routes operations to the right zone, walks zones
//! round-robin to satisfy allocations, fans administrative actions out through the action
//! manager, and holds the read-only notifier that every zone aborts through when the on-disk
//! state turns out to be broken.
//!
//! Slab positions are computed from the depot state alone; nothing about placement is stored
//! per-slab.  The summary lives in its own partition supplied at construction.

pub mod admin;
pub mod format;
pub mod journal;
pub mod pbn_lock;
pub mod priority_table;
pub mod ref_counts;
pub mod scrubber;
pub mod slab;
pub mod summary;
pub mod vio_pool;

mod action_manager;
mod allocator;

pub use allocator::{BlockAllocatorStatistics, DrainKind, ReadOnlyNotifier};
pub use format::{SlabConfig, SlabDepotState};
pub use journal::JournalOp;
pub use pbn_lock::PbnLockType;

use {
    crate::{device::Device, errors::FxDedupError, log::*},
    action_manager::ActionManager,
    admin::{AdminState, AdminStateCode},
    allocator::{spawn_zone, AllocatorHandle, ZoneAction, ZoneConfig},
    anyhow::{ensure, Context, Error},
    std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    summary::{SlabSummaryZone, MAX_SLABS, SUMMARY_BLOCKS_PER_ZONE},
};

/// How a depot comes back from disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadType {
    /// The device was shut down cleanly.
    Normal,

    /// The device crashed; dirty slabs are scrubbed in the background.
    Recovery,

    /// Reference counts are being reconstructed from the block map; slab journals are erased.
    Rebuild,
}

impl LoadType {
    pub(crate) fn state_code(&self) -> AdminStateCode {
        match self {
            LoadType::Normal => AdminStateCode::Loading,
            LoadType::Recovery => AdminStateCode::LoadingForRecovery,
            LoadType::Rebuild => AdminStateCode::LoadingForRebuild,
        }
    }
}

/// Rotates allocation attempts across zones.  Each logical zone constructs its selector with a
/// different starting offset so writes from different logical zones spread over the physical
/// zones instead of convoying.
pub struct ZoneSelector {
    zone_count: u8,
    next: AtomicU64,
}

impl ZoneSelector {
    pub fn new(zone_count: u8, logical_zone: u8) -> Self {
        ZoneSelector {
            zone_count,
            next: AtomicU64::new(logical_zone as u64 % zone_count as u64),
        }
    }

    pub fn next_zone(&self) -> u8 {
        (self.next.fetch_add(1, Ordering::Relaxed) % self.zone_count as u64) as u8
    }
}

// State for an in-flight resize.
struct ResizeState {
    new_slab_count: u64,
    new_last_block: u64,
}

pub struct SlabDepot {
    state: Mutex<SlabDepotState>,
    summary_origin: u64,
    device: Arc<dyn Device>,
    zones: Vec<AllocatorHandle>,
    action_manager: ActionManager,
    read_only_notifier: Arc<ReadOnlyNotifier>,
    admin_state: Mutex<AdminState>,
    resize: Mutex<Option<ResizeState>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SlabDepot {
    /// The size of the summary partition for a depot with |zone_count| zones.
    pub fn summary_partition_blocks(zone_count: u8) -> u64 {
        zone_count as u64 * SUMMARY_BLOCKS_PER_ZONE
    }

    /// Formats the summary partition for a new depot: every slab fresh, clean, and fully free.
    /// Must run before the first `decode` of a new device.
    pub async fn format(
        device: &dyn Device,
        state: &SlabDepotState,
        summary_origin: u64,
    ) -> Result<(), Error> {
        state.validate()?;
        let slab_count = state.slab_count();
        let data_blocks = state.slab_config.data_blocks;
        let mut buf = vec![0u8; crate::device::BLOCK_SIZE];
        for zone_number in 0..state.zone_count {
            let mut zone_summary = SlabSummaryZone::new(
                zone_number,
                state.zone_count,
                summary_origin,
                data_blocks,
            );
            let mut slab_number = zone_number as u64;
            while slab_number < slab_count {
                zone_summary.update(slab_number, 0, false, true, data_blocks);
                slab_number += state.zone_count as u64;
            }
            zone_summary.flush(device, &mut buf).await.context("Failed to format summary")?;
        }
        Ok(())
    }

    /// Constructs a depot from its super-block component state and spawns the zone threads.  The
    /// result is quiescent; apply a load operation before allocating.
    pub fn decode(
        state: SlabDepotState,
        device: Arc<dyn Device>,
        summary_origin: u64,
        nonce: u64,
    ) -> Result<Arc<SlabDepot>, Error> {
        state.validate()?;
        let slab_count = state.slab_count();
        ensure!(slab_count <= MAX_SLABS, FxDedupError::Inconsistent);
        ensure!(state.last_block <= device.block_count(), FxDedupError::Inconsistent);
        ensure!(
            summary_origin + Self::summary_partition_blocks(state.zone_count)
                <= device.block_count(),
            FxDedupError::Inconsistent
        );
        // The summary partition must not sit inside the slab range.
        ensure!(
            summary_origin >= state.last_block || summary_origin < state.first_block,
            FxDedupError::Inconsistent
        );

        let read_only_notifier = Arc::new(ReadOnlyNotifier::new());
        let mut zones = Vec::new();
        let mut threads = Vec::new();
        for zone_number in 0..state.zone_count {
            let slab_numbers: Vec<u64> = (zone_number as u64..slab_count)
                .step_by(state.zone_count as usize)
                .collect();
            let (handle, thread) = spawn_zone(
                ZoneConfig {
                    zone_number,
                    zone_count: state.zone_count,
                    slab_config: state.slab_config,
                    first_block: state.first_block,
                    nonce,
                    summary_origin,
                    slab_numbers,
                },
                device.clone(),
                read_only_notifier.clone(),
            );
            zones.push(handle);
            threads.push(thread);
        }

        Ok(Arc::new(SlabDepot {
            state: Mutex::new(state),
            summary_origin,
            device,
            action_manager: ActionManager::new(zones.clone()),
            zones,
            read_only_notifier,
            admin_state: Mutex::new(AdminState::new()),
            resize: Mutex::new(None),
            threads: Mutex::new(threads),
            closed: AtomicBool::new(false),
        }))
    }

    /// The component state to store in the super block.
    pub fn record(&self) -> SlabDepotState {
        *self.state.lock().unwrap()
    }

    pub fn zone_count(&self) -> u8 {
        self.state.lock().unwrap().zone_count
    }

    pub fn read_only_notifier(&self) -> &Arc<ReadOnlyNotifier> {
        &self.read_only_notifier
    }

    // --- Admin surface ---

    /// Applies one of the administrative operations the outer device layer drives the depot
    /// with.  Unknown strings are a programming error.
    pub async fn apply_admin_operation(&self, operation: &str) -> Result<(), Error> {
        match operation {
            "load-normal" => self.load(LoadType::Normal).await,
            "load-recovery" => self.load(LoadType::Recovery).await,
            "load-rebuild" => self.load(LoadType::Rebuild).await,
            "suspend" => self.drain(DrainKind::Suspend).await,
            "save" => self.drain(DrainKind::Save).await,
            "flush" => self.drain(DrainKind::Flush).await,
            "resume" => self.resume().await,
            _ => Err(FxDedupError::BadState)
                .with_context(|| format!("Unknown admin operation {:?}", operation)),
        }
    }

    /// Loads the depot: reads each zone's summary, classifies and queues the slabs, and gates
    /// until high-priority scrubbing finishes.  Background scrubbing may continue afterwards.
    pub async fn load(&self, load_type: LoadType) -> Result<(), Error> {
        self.admin_state
            .lock()
            .unwrap()
            .start_operation(load_type.state_code())
            .context("Depot load not permitted")?;
        let result: Result<(), Error> = async {
            self.action_manager
                .apply_to_zones(ZoneAction::Load(load_type))
                .await
                .context("Zone load failed")?;
            self.action_manager
                .apply_to_zones(ZoneAction::PrepareToAllocate)
                .await
                .context("Prepare to allocate failed")?;
            Ok(())
        }
        .await;
        if let Err(e) = result.as_ref() {
            if let Some(e) = e.downcast_ref::<FxDedupError>() {
                self.admin_state.lock().unwrap().set_operation_result(*e);
            }
        }
        let _ = self.admin_state.lock().unwrap().finish_operation();
        result
    }

    /// Waits for every zone's scrubber to drain.  Used after a recovery load to bring every
    /// slab back before the device reports itself recovered.
    pub async fn scrub_all_slabs(&self) -> Result<(), Error> {
        self.action_manager
            .apply_to_zones(ZoneAction::ScrubAll)
            .await
            .context("Scrubbing failed")?;
        Ok(())
    }

    /// Drains all depot I/O.  Save and flush write out dirty metadata; save and suspend leave
    /// the depot suspended.
    pub async fn drain(&self, kind: DrainKind) -> Result<(), Error> {
        {
            let mut admin_state = self.admin_state.lock().unwrap();
            if !admin_state.is_read_only() {
                admin_state
                    .start_operation(match kind {
                        DrainKind::Flush => AdminStateCode::Flushing,
                        DrainKind::Save => AdminStateCode::Saving,
                        DrainKind::Suspend => AdminStateCode::Suspending,
                    })
                    .context("Depot drain not permitted")?;
            }
        }
        let result = self.action_manager.apply_to_zones(ZoneAction::Drain(kind)).await;
        if let Err(e) = result {
            self.admin_state.lock().unwrap().set_operation_result(e);
        }
        let _ = self.admin_state.lock().unwrap().finish_operation();
        result.map_err(|e| Error::from(e).context("Drain failed"))
    }

    /// Resumes a suspended depot.
    pub async fn resume(&self) -> Result<(), Error> {
        self.admin_state
            .lock()
            .unwrap()
            .start_operation(AdminStateCode::Resuming)
            .context("Depot resume not permitted")?;
        let result = self.action_manager.apply_to_zones(ZoneAction::Resume).await;
        if let Err(e) = result {
            self.admin_state.lock().unwrap().set_operation_result(e);
        }
        let _ = self.admin_state.lock().unwrap().finish_operation();
        result.map_err(|e| Error::from(e).context("Resume failed"))
    }

    /// Stops the zone threads.  This is not a save: anything not already committed is lost,
    /// exactly as in a crash.  Call the "save" admin operation first for a clean shutdown.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for zone in &self.zones {
            zone.shutdown();
        }
        for thread in self.threads.lock().unwrap().drain(..) {
            let _ = thread.join();
        }
    }

    // --- Allocation surface ---

    /// Allocates a physical block, walking the zones round-robin from the selector's starting
    /// zone.  The block comes back holding a PBN lock of |lock_type| with a provisional
    /// reference.  When every zone is exhausted the request parks until a scrubbed slab frees
    /// space and then makes one more full round; failure after that is final.
    pub async fn allocate(
        &self,
        selector: &ZoneSelector,
        lock_type: PbnLockType,
    ) -> Result<u64, Error> {
        let zone_count = self.zones.len();
        let start = selector.next_zone() as usize;
        for round in 0..2 {
            for i in 0..zone_count {
                let zone = &self.zones[(start + i) % zone_count];
                match zone.allocate(lock_type).await {
                    Ok(pbn) => return Ok(pbn),
                    Err(FxDedupError::NoSpace) => continue,
                    Err(e) => return Err(Error::from(e).context("Allocation failed")),
                }
            }
            if round > 0 {
                break;
            }
            // Out of space everywhere.  Park on a zone that still has scrubbing to do; any slab
            // coming clean is worth one more walk.  The wake is best effort: the retry may
            // still find nothing.
            let mut waited = false;
            for i in 0..zone_count {
                let zone = &self.zones[(start + i) % zone_count];
                match zone.wait_for_clean_slab().await {
                    Ok(()) => {
                        waited = true;
                        break;
                    }
                    Err(FxDedupError::NoSpace) => continue,
                    Err(e) => return Err(Error::from(e).context("Clean slab wait failed")),
                }
            }
            if !waited {
                break;
            }
        }
        Err(FxDedupError::NoSpace.into())
    }

    /// Releases the allocation lock on |pbn|.  If the provisional reference was never confirmed
    /// the allocation is rolled back.
    pub async fn release_allocation_lock(&self, pbn: u64) -> Result<(), Error> {
        if pbn == 0 {
            return Ok(());
        }
        let zone = self.zone_for_pbn(pbn).ok_or(FxDedupError::Inconsistent)?;
        zone.release_allocation_lock(pbn)
            .await
            .map_err(|e| Error::from(e).context("Release allocation lock failed"))
    }

    /// Applies a reference mutation to |pbn|, journaled in the owning slab.
    pub async fn modify_reference(
        &self,
        pbn: u64,
        op: JournalOp,
        recovery_sequence: u64,
    ) -> Result<(), Error> {
        if pbn == 0 {
            return Ok(());
        }
        let zone = match self.zone_for_pbn(pbn) {
            Some(zone) => zone,
            None => {
                self.report_invalid_pbn(pbn);
                return Err(FxDedupError::Inconsistent.into());
            }
        };
        zone.modify_reference(pbn, op, recovery_sequence)
            .await
            .map_err(|e| Error::from(e).context("Reference mutation failed"))
    }

    /// Releases one reference to |pbn|, logging rather than propagating failures; the caller is
    /// abandoning the block either way.
    pub async fn release_block_reference(&self, pbn: u64, recovery_sequence: u64) {
        if pbn == 0 {
            return;
        }
        if let Err(e) = self.modify_reference(pbn, JournalOp::Decrement, recovery_sequence).await {
            error!(error = ?e, pbn, "Failed to release block reference");
        }
    }

    /// How many more references |pbn| can take.
    pub async fn increment_limit(&self, pbn: u64) -> u8 {
        if pbn == 0 {
            return 0;
        }
        match self.zone_for_pbn(pbn) {
            None => 0,
            Some(zone) => zone.increment_limit(pbn).await.unwrap_or(0),
        }
    }

    /// The slab containing |pbn|, or None for the zero block.  A PBN that is neither the zero
    /// block nor inside a slab means the reference-count state is corrupt, which puts the
    /// system into read-only mode.
    pub fn get_slab(&self, pbn: u64) -> Option<u64> {
        if pbn == 0 {
            return None;
        }
        match self.slab_for_pbn(pbn) {
            Some(slab_number) => Some(slab_number),
            None => {
                self.report_invalid_pbn(pbn);
                None
            }
        }
    }

    /// Whether |pbn| is an allocatable data block (not the zero block and not slab metadata).
    pub fn is_data_block(&self, pbn: u64) -> bool {
        match self.slab_for_pbn(pbn) {
            None => false,
            Some(_) => {
                let state = self.state.lock().unwrap();
                (pbn - state.first_block) % state.slab_config.slab_blocks
                    < state.slab_config.data_blocks
            }
        }
    }

    /// The total allocated blocks across all zones.  Zone counters are read relaxed, so the
    /// total is eventually consistent under concurrent mutation.
    pub fn allocated_blocks(&self) -> u64 {
        self.zones.iter().map(|zone| zone.allocated_blocks()).sum()
    }

    /// The total data blocks managed by the depot.
    pub fn data_blocks(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.slab_count() * state.slab_config.data_blocks
    }

    pub fn statistics(&self, zone: u8) -> &BlockAllocatorStatistics {
        self.zones[zone as usize].statistics()
    }

    // --- Recovery journal interaction ---

    /// Commits all dirty slab journal tail blocks holding locks on recovery journal block
    /// |recovery_block| or older.  Called from the journal zone when the recovery journal needs
    /// to advance.
    pub async fn commit_oldest_slab_journal_tail_blocks(
        &self,
        recovery_block: u64,
    ) -> Result<(), Error> {
        let mut first_error = None;
        for zone in &self.zones {
            if let Err(e) = zone.commit_tail_blocks(recovery_block).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(Error::from(e).context("Tail block commit failed")),
        }
    }

    // --- Resize ---

    /// Allocates the bookkeeping for growing the depot to cover |new_size| blocks.  Nothing
    /// changes until `use_new_slabs`.
    pub fn prepare_to_grow(&self, new_size: u64) -> Result<(), Error> {
        let state = self.state.lock().unwrap();
        let slab_blocks = state.slab_config.slab_blocks;
        let new_slab_count = (new_size.saturating_sub(state.first_block)) / slab_blocks;
        ensure!(new_slab_count > state.slab_count(), FxDedupError::BadState);
        ensure!(new_slab_count <= MAX_SLABS, FxDedupError::OutOfMemory);
        let new_last_block = state.first_block + new_slab_count * slab_blocks;
        ensure!(new_last_block <= self.device.block_count(), FxDedupError::OutOfMemory);
        // Growth may not run into the summary partition.
        ensure!(
            self.summary_origin < state.first_block || new_last_block <= self.summary_origin,
            FxDedupError::OutOfMemory
        );
        *self.resize.lock().unwrap() = Some(ResizeState { new_slab_count, new_last_block });
        Ok(())
    }

    /// Registers the new slabs with each zone in turn and commits the new size.  Pre-existing
    /// slab state is untouched.
    pub async fn use_new_slabs(&self) -> Result<(), Error> {
        let (new_slab_count, new_last_block) = {
            let resize = self.resize.lock().unwrap();
            let resize = resize.as_ref().ok_or(FxDedupError::BadState)?;
            (resize.new_slab_count, resize.new_last_block)
        };
        let old_slab_count = self.state.lock().unwrap().slab_count();
        for (zone_number, zone) in self.zones.iter().enumerate() {
            let slab_numbers: Vec<u64> = (old_slab_count..new_slab_count)
                .filter(|slab_number| {
                    (slab_number % self.zones.len() as u64) as usize == zone_number
                })
                .collect();
            if slab_numbers.is_empty() {
                continue;
            }
            zone.register_new_slabs(slab_numbers)
                .await
                .map_err(|e| Error::from(e).context("Slab registration failed"))?;
        }
        self.state.lock().unwrap().last_block = new_last_block;
        *self.resize.lock().unwrap() = None;
        Ok(())
    }

    /// Discards a prepared resize without side effects.
    pub fn abandon_new_slabs(&self) {
        *self.resize.lock().unwrap() = None;
    }

    // --- Internal ---

    fn slab_for_pbn(&self, pbn: u64) -> Option<u64> {
        let state = self.state.lock().unwrap();
        if pbn < state.first_block || pbn >= state.last_block {
            return None;
        }
        let slab_number = (pbn - state.first_block) / state.slab_config.slab_blocks;
        (slab_number < state.slab_count()).then_some(slab_number)
    }

    fn zone_for_pbn(&self, pbn: u64) -> Option<&AllocatorHandle> {
        let slab_number = self.slab_for_pbn(pbn)?;
        Some(&self.zones[(slab_number % self.zones.len() as u64) as usize])
    }

    fn report_invalid_pbn(&self, pbn: u64) {
        error!(pbn, "PBN is not the zero block and not covered by any slab");
        self.admin_state.lock().unwrap().set_read_only();
        self.read_only_notifier.enter(&FxDedupError::Inconsistent);
    }
}

impl Drop for SlabDepot {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            error!("SlabDepot dropped without being closed; zone threads leaked");
        }
    }
}
