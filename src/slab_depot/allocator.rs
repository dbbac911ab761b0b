// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-zone block allocator.  All mutable state for a zone -- its slabs, ref-counts,
//! journals, summary region, PBN locks and scrubbing queues -- is owned by a single thread
//! running a message loop.  Cross-zone callers hold an `AllocatorHandle` and talk to the zone by
//! enqueueing typed requests with oneshot completions; nothing here is ever touched from two
//! threads.  Statistics are the one exception: they are relaxed atomics written by the owning
//! thread and readable from anywhere.
//!
//! Requests are handled to completion in arrival order; metadata I/O awaits inline on the zone
//! thread.  Long-running background work (scrubbing) processes one slab per message and re-posts
//! itself, so allocations interleave with it.

use {
    crate::{
        device::Device,
        errors::FxDedupError,
        log::*,
        slab_depot::{
            admin::{AdminState, AdminStateCode},
            format::SlabConfig,
            journal::{JournalOp, SlabJournal, SlabJournalEntry},
            pbn_lock::{LockRelease, PbnLockPool, PbnLockType},
            priority_table::PriorityTable,
            ref_counts::{FreeStatus, RefCounts, PROVISIONAL_REFERENCE},
            scrubber::SlabScrubber,
            slab::{Slab, SlabState},
            summary::{SlabStatus, SlabSummaryZone},
            vio_pool::{Vio, VioPool},
            LoadType,
        },
    },
    event_listener::Event,
    futures::{
        channel::{mpsc, oneshot},
        StreamExt,
    },
    std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex,
        },
    },
};

/// The number of metadata buffers each zone owns.
pub const VIO_POOL_SIZE: usize = 2;

/// Per-allocator counters, readable from any thread with relaxed loads.  Only the owning zone
/// thread stores to them, so totals observed across zones are eventually consistent.
#[derive(Default)]
pub struct BlockAllocatorStatistics {
    pub slab_count: AtomicU64,
    pub slabs_opened: AtomicU64,
    pub slabs_reopened: AtomicU64,

    // Slab journal counters, aggregated across the zone's slabs.
    pub journal_blocks_written: AtomicU64,
    pub journal_blocked_count: AtomicU64,
    pub journal_flush_count: AtomicU64,
    pub journal_disk_full_count: AtomicU64,
    pub journal_tail_busy_count: AtomicU64,

    // Ref-count block writes.
    pub ref_count_blocks_written: AtomicU64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DrainKind {
    Flush,
    Save,
    Suspend,
}

impl DrainKind {
    fn state_code(&self) -> AdminStateCode {
        match self {
            DrainKind::Flush => AdminStateCode::Flushing,
            DrainKind::Save => AdminStateCode::Saving,
            DrainKind::Suspend => AdminStateCode::Suspending,
        }
    }
}

/// The administrative zone actions fanned out by the depot's action manager.
#[derive(Clone, Copy, Debug)]
pub enum ZoneAction {
    Load(LoadType),
    PrepareToAllocate,
    Drain(DrainKind),
    Resume,
    ScrubAll,
}

/// The requests a zone's message loop services.
pub(super) enum ZoneRequest {
    Allocate {
        lock_type: PbnLockType,
        reply: oneshot::Sender<Result<u64, FxDedupError>>,
    },
    ReleaseAllocationLock {
        pbn: u64,
        reply: oneshot::Sender<Result<(), FxDedupError>>,
    },
    ModifyReference {
        pbn: u64,
        op: JournalOp,
        recovery_sequence: u64,
        reply: oneshot::Sender<Result<(), FxDedupError>>,
    },
    IncrementLimit {
        pbn: u64,
        reply: oneshot::Sender<u8>,
    },
    WaitForCleanSlab {
        reply: oneshot::Sender<Result<(), FxDedupError>>,
    },
    Admin {
        action: ZoneAction,
        reply: oneshot::Sender<Result<(), FxDedupError>>,
    },
    CommitTailBlocks {
        recovery_block: u64,
        reply: oneshot::Sender<Result<(), FxDedupError>>,
    },
    RegisterNewSlabs {
        slab_numbers: Vec<u64>,
        reply: oneshot::Sender<Result<(), FxDedupError>>,
    },
    ScrubNext,
    EnterReadOnly {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Broadcasts entry into read-only mode to every zone.  Read-only mode is absorbing: once any
/// zone (or the depot) trips it, all further mutations anywhere fail with `ReadOnly`.
pub struct ReadOnlyNotifier {
    read_only: AtomicBool,
    event: Event,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ZoneRequest>>>,
}

impl ReadOnlyNotifier {
    pub fn new() -> Self {
        ReadOnlyNotifier {
            read_only: AtomicBool::new(false),
            event: Event::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn register_listener(&self, sender: mpsc::UnboundedSender<ZoneRequest>) {
        self.listeners.lock().unwrap().push(sender);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Resolves once read-only mode has been entered.  The outer device layer uses this to fail
    /// its pending work when the allocator gives up.
    pub async fn wait_for_read_only(&self) {
        loop {
            if self.is_read_only() {
                return;
            }
            let listener = self.event.listen();
            // Check again after registering the listener; the notification may have fired in
            // between, in which case the listener would never wake.
            if self.is_read_only() {
                return;
            }
            listener.await;
        }
    }

    /// Enters read-only mode, notifying every registered allocator.  Notification is
    /// asynchronous; each zone aborts its waiting journal work when the message arrives.
    pub fn enter(&self, error: &FxDedupError) {
        if self.read_only.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(?error, "Entering read-only mode");
        for listener in self.listeners.lock().unwrap().iter() {
            let (reply, _) = oneshot::channel();
            let _ = listener.unbounded_send(ZoneRequest::EnterReadOnly { reply });
        }
        self.event.notify(usize::MAX);
    }
}

/// Construction parameters for one zone.
pub(super) struct ZoneConfig {
    pub zone_number: u8,
    pub zone_count: u8,
    pub slab_config: SlabConfig,
    pub first_block: u64,
    pub nonce: u64,
    pub summary_origin: u64,
    pub slab_numbers: Vec<u64>,
}

/// Cross-thread access to one zone.  Requests enqueue on the zone's work queue; the futures
/// returned here resolve when the zone thread replies.
#[derive(Clone)]
pub(super) struct AllocatorHandle {
    sender: mpsc::UnboundedSender<ZoneRequest>,
    allocated_blocks: Arc<AtomicU64>,
    stats: Arc<BlockAllocatorStatistics>,
}

impl AllocatorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ZoneRequest,
    ) -> Result<T, FxDedupError> {
        let (sender, receiver) = oneshot::channel();
        self.sender.unbounded_send(build(sender)).map_err(|_| FxDedupError::Quiescent)?;
        receiver.await.map_err(|_| FxDedupError::Quiescent)
    }

    /// Allocates a block in this zone.  On success the block holds a PBN lock of |lock_type|
    /// carrying a provisional reference.
    pub async fn allocate(&self, lock_type: PbnLockType) -> Result<u64, FxDedupError> {
        self.request(|reply| ZoneRequest::Allocate { lock_type, reply }).await?
    }

    /// Releases the allocation lock on |pbn|, rolling back the reservation if it was never
    /// confirmed.
    pub async fn release_allocation_lock(&self, pbn: u64) -> Result<(), FxDedupError> {
        self.request(|reply| ZoneRequest::ReleaseAllocationLock { pbn, reply }).await?
    }

    pub async fn modify_reference(
        &self,
        pbn: u64,
        op: JournalOp,
        recovery_sequence: u64,
    ) -> Result<(), FxDedupError> {
        self.request(|reply| ZoneRequest::ModifyReference { pbn, op, recovery_sequence, reply })
            .await?
    }

    pub async fn increment_limit(&self, pbn: u64) -> Result<u8, FxDedupError> {
        self.request(|reply| ZoneRequest::IncrementLimit { pbn, reply }).await
    }

    /// Parks until the zone's scrubber makes a slab clean.  Fails with `NoSpace` immediately if
    /// nothing is queued for scrubbing.
    pub async fn wait_for_clean_slab(&self) -> Result<(), FxDedupError> {
        self.request(|reply| ZoneRequest::WaitForCleanSlab { reply }).await?
    }

    pub async fn admin(&self, action: ZoneAction) -> Result<(), FxDedupError> {
        self.request(|reply| ZoneRequest::Admin { action, reply }).await?
    }

    pub async fn commit_tail_blocks(&self, recovery_block: u64) -> Result<(), FxDedupError> {
        self.request(|reply| ZoneRequest::CommitTailBlocks { recovery_block, reply }).await?
    }

    pub async fn register_new_slabs(&self, slab_numbers: Vec<u64>) -> Result<(), FxDedupError> {
        self.request(|reply| ZoneRequest::RegisterNewSlabs { slab_numbers, reply }).await?
    }

    pub fn shutdown(&self) {
        let _ = self.sender.unbounded_send(ZoneRequest::Shutdown);
    }

    /// Relaxed read of the zone's allocated-block count; may lag the owning thread.
    pub fn allocated_blocks(&self) -> u64 {
        self.allocated_blocks.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> &BlockAllocatorStatistics {
        &self.stats
    }
}

/// Spawns the zone's thread and returns the handle for talking to it.
pub(super) fn spawn_zone(
    config: ZoneConfig,
    device: Arc<dyn Device>,
    read_only_notifier: Arc<ReadOnlyNotifier>,
) -> (AllocatorHandle, std::thread::JoinHandle<()>) {
    let zone_number = config.zone_number;
    let (sender, receiver) = mpsc::unbounded();
    read_only_notifier.register_listener(sender.clone());
    let allocated_blocks = Arc::new(AtomicU64::new(0));
    let stats = Arc::new(BlockAllocatorStatistics::default());
    let zone = AllocatorZone::new(
        config,
        device,
        read_only_notifier,
        sender.clone(),
        allocated_blocks.clone(),
        stats.clone(),
    );
    let thread = std::thread::Builder::new()
        .name(format!("physical-zone-{}", zone_number))
        .spawn(move || futures::executor::block_on(zone.run(receiver)))
        .expect("failed to spawn zone thread");
    (AllocatorHandle { sender, allocated_blocks, stats }, thread)
}

/// The zone actor.  Owned by exactly one thread; see the module comment.
pub(super) struct AllocatorZone {
    zone_number: u8,
    slab_config: SlabConfig,
    first_block: u64,
    nonce: u64,
    device: Arc<dyn Device>,

    slabs: BTreeMap<u64, Slab>,
    prioritized_slabs: PriorityTable<u64>,
    open_slab: Option<u64>,
    unopened_slab_priority: u32,

    pbn_locks: PbnLockPool,
    vio_pool: VioPool,
    scrubber: SlabScrubber,
    summary: SlabSummaryZone,
    admin_state: AdminState,

    // Remembered between the load action and prepare-to-allocate.
    load_type: Option<LoadType>,

    // Completion for a prepare-to-allocate gated on the high-priority scrub queue emptying.
    prepare_gate: Option<oneshot::Sender<Result<(), FxDedupError>>>,

    // Completions waiting for the whole scrub queue to empty.
    scrub_all_gates: Vec<oneshot::Sender<Result<(), FxDedupError>>>,

    allocated_blocks: Arc<AtomicU64>,
    stats: Arc<BlockAllocatorStatistics>,
    read_only_notifier: Arc<ReadOnlyNotifier>,

    // For re-posting scrub work behind pending requests.
    self_sender: mpsc::UnboundedSender<ZoneRequest>,
}

fn log2(value: u64) -> u32 {
    assert!(value > 0);
    u64::BITS - 1 - value.leading_zeros()
}

impl AllocatorZone {
    pub fn new(
        config: ZoneConfig,
        device: Arc<dyn Device>,
        read_only_notifier: Arc<ReadOnlyNotifier>,
        self_sender: mpsc::UnboundedSender<ZoneRequest>,
        allocated_blocks: Arc<AtomicU64>,
        stats: Arc<BlockAllocatorStatistics>,
    ) -> Self {
        let data_blocks = config.slab_config.data_blocks;

        // Unopened slabs are preferred only once previously-opened slabs drop below three
        // quarters of a slab's worth of free blocks, so that thinly-provisioned backing stores
        // are not touched prematurely.
        let unopened_slab_priority = 1 + log2(std::cmp::max(1, data_blocks * 3 / 4));
        let max_priority = 2 + log2(data_blocks);

        // Locks persist from allocation until the write path releases them, so the pool must
        // cover every data block the zone owns, not one slab's worth.
        let pbn_lock_capacity = config.slab_numbers.len() * data_blocks as usize;

        let mut slabs = BTreeMap::new();
        for &slab_number in &config.slab_numbers {
            slabs.insert(
                slab_number,
                Slab::new(
                    slab_number,
                    config.zone_number,
                    &config.slab_config,
                    config.first_block,
                    config.nonce,
                    false,
                ),
            );
        }
        stats.slab_count.store(slabs.len() as u64, Ordering::Relaxed);

        AllocatorZone {
            zone_number: config.zone_number,
            slab_config: config.slab_config,
            first_block: config.first_block,
            nonce: config.nonce,
            device,
            slabs,
            prioritized_slabs: PriorityTable::new(max_priority),
            open_slab: None,
            unopened_slab_priority,
            pbn_locks: PbnLockPool::new(pbn_lock_capacity),
            vio_pool: VioPool::new(VIO_POOL_SIZE),
            scrubber: SlabScrubber::new(),
            summary: SlabSummaryZone::new(
                config.zone_number,
                config.zone_count,
                config.summary_origin,
                data_blocks,
            ),
            admin_state: AdminState::new(),
            load_type: None,
            prepare_gate: None,
            scrub_all_gates: Vec::new(),
            allocated_blocks,
            stats,
            read_only_notifier,
            self_sender,
        }
    }

    /// The zone thread's main loop.
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<ZoneRequest>) {
        while let Some(request) = requests.next().await {
            if matches!(request, ZoneRequest::Shutdown) {
                break;
            }
            self.handle(request).await;
        }
    }

    async fn handle(&mut self, request: ZoneRequest) {
        match request {
            ZoneRequest::Allocate { lock_type, reply } => {
                let _ = reply.send(self.allocate(lock_type));
            }
            ZoneRequest::ReleaseAllocationLock { pbn, reply } => {
                let _ = reply.send(self.release_allocation_lock(pbn));
            }
            ZoneRequest::ModifyReference { pbn, op, recovery_sequence, reply } => {
                let _ = reply.send(self.modify_reference(pbn, op, recovery_sequence).await);
            }
            ZoneRequest::IncrementLimit { pbn, reply } => {
                let _ = reply.send(self.increment_limit(pbn));
            }
            ZoneRequest::WaitForCleanSlab { reply } => self.wait_for_clean_slab(reply),
            ZoneRequest::Admin { action, reply } => self.handle_admin(action, reply).await,
            ZoneRequest::CommitTailBlocks { recovery_block, reply } => {
                let _ = reply.send(self.commit_tail_blocks(recovery_block).await);
            }
            ZoneRequest::RegisterNewSlabs { slab_numbers, reply } => {
                let _ = reply.send(self.register_new_slabs(slab_numbers));
            }
            ZoneRequest::ScrubNext => self.handle_scrub_next().await,
            ZoneRequest::EnterReadOnly { reply } => {
                self.enter_read_only();
                let _ = reply.send(());
            }
            ZoneRequest::Shutdown => {}
        }
    }

    // --- Allocation ---

    fn calculate_priority(&self, slab: &Slab) -> u32 {
        let free_blocks = slab.free_block_count();

        // Full slabs are the only slabs with priority zero.
        if free_blocks == 0 {
            return 0;
        }

        // Never-opened slabs sit at the reserved priority, below well-stocked opened slabs.
        if slab.journal.is_blank() {
            return self.unopened_slab_priority;
        }

        // Everything else sorts by the order of magnitude of its free count; the reserved
        // unopened priority splits the range and is skipped.
        let priority = 1 + log2(free_blocks);
        if priority < self.unopened_slab_priority {
            priority
        } else {
            priority + 1
        }
    }

    fn prioritize_slab(&mut self, slab_number: u64) {
        let priority = self.calculate_priority(self.slabs.get(&slab_number).unwrap());
        let slab = self.slabs.get_mut(&slab_number).unwrap();
        if slab.state() == SlabState::Open {
            slab.set_state(if slab.is_dirty() { SlabState::Dirty } else { SlabState::Clean });
        }
        slab.set_priority(priority);
        self.prioritized_slabs.enqueue(priority, slab_number);
    }

    /// Makes a slab available for allocation or scrubbing; the load, scrub, resume and grow
    /// paths all converge here.
    fn queue_slab(&mut self, slab_number: u64) {
        let slab = self.slabs.get(&slab_number).unwrap();
        let free_blocks = slab.free_block_count();
        if free_blocks > self.slab_config.data_blocks {
            error!(slab = slab_number, free_blocks, "Slab free count exceeds its data blocks");
            self.enter_read_only_and_broadcast(FxDedupError::Inconsistent);
            return;
        }
        if slab.state() == SlabState::Unrecovered {
            self.scrubber.register(slab_number, false);
            return;
        }
        if slab.state() != SlabState::Resuming {
            // A resuming slab's free blocks were already accounted before the drain.
            self.allocated_blocks.fetch_sub(free_blocks, Ordering::Relaxed);
            if !slab.journal.is_blank() {
                self.stats.slabs_opened.fetch_add(1, Ordering::Relaxed);
            }
        }
        let slab = self.slabs.get_mut(&slab_number).unwrap();
        slab.set_state(if slab.is_dirty() { SlabState::Dirty } else { SlabState::Clean });
        self.prioritize_slab(slab_number);
    }

    fn reserve_in_slab(&mut self, slab_number: u64) -> Option<u64> {
        let slab = self.slabs.get_mut(&slab_number).unwrap();
        let index = slab.ref_counts_mut().reserve_free()?;
        let pbn = slab.index_to_pbn(index);
        self.allocated_blocks.fetch_add(1, Ordering::Relaxed);
        Some(pbn)
    }

    /// The allocation path: the reserved block carries a PBN lock of the write's type holding a
    /// provisional reference, promoted on commit or returned on abort.
    fn allocate(&mut self, lock_type: PbnLockType) -> Result<u64, FxDedupError> {
        self.check_may_operate()?;
        let pbn = self.allocate_block()?;

        // Finding the new PBN already locked means reference counting is broken; the whole
        // system goes read-only.
        match self.pbn_locks.attempt_acquire(pbn, lock_type) {
            Ok(Some(true)) => {
                self.pbn_locks.assign_provisional_reference(pbn);
                Ok(pbn)
            }
            Ok(_) => {
                error!(pbn, "Newly allocated block is already locked");
                self.enter_read_only_and_broadcast(FxDedupError::LockInvariant);
                Err(FxDedupError::LockInvariant)
            }
            Err(e) => {
                warn!(error = ?e, "PBN lock pool exhausted");
                Err(FxDedupError::OutOfMemory)
            }
        }
    }

    fn allocate_block(&mut self) -> Result<u64, FxDedupError> {
        if let Some(open) = self.open_slab {
            if let Some(pbn) = self.reserve_in_slab(open) {
                return Ok(pbn);
            }
            // The open slab is exhausted; put it back at its new, lower priority.
            self.prioritize_slab(open);
            self.open_slab = None;
        }

        // Open the highest-priority slab.  A full slab's priority is zero, so if the best
        // candidate is full the zone is exhausted and nothing is opened.
        let best = self.prioritized_slabs.dequeue().ok_or(FxDedupError::NoSpace)?;
        if self.slabs.get(&best).unwrap().free_block_count() == 0 {
            self.prioritized_slabs.enqueue(0, best);
            return Err(FxDedupError::NoSpace);
        }
        self.open_slab_for_allocation(best);
        self.reserve_in_slab(best).ok_or(FxDedupError::NoSpace)
    }

    fn open_slab_for_allocation(&mut self, slab_number: u64) {
        let slab = self.slabs.get_mut(&slab_number).unwrap();
        if slab.journal.is_blank() {
            self.stats.slabs_opened.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.slabs_reopened.fetch_add(1, Ordering::Relaxed);
        }
        slab.set_state(SlabState::Open);
        self.open_slab = Some(slab_number);
    }

    /// Releases a write lock taken at allocation.  If the provisional reference was never
    /// confirmed the reservation is returned to the slab.
    fn release_allocation_lock(&mut self, pbn: u64) -> Result<(), FxDedupError> {
        if pbn == 0 {
            return Ok(());
        }
        if self.pbn_locks.get(pbn).is_none() {
            error!(pbn, "Releasing an allocation lock that is not held");
            return Err(FxDedupError::BadState);
        }
        match self.pbn_locks.release(pbn) {
            LockRelease::SharersRemain => Ok(()),
            LockRelease::Released { provisional_reference: false } => Ok(()),
            LockRelease::Released { provisional_reference: true } => {
                self.rollback_provisional_reference(pbn)
            }
        }
    }

    fn rollback_provisional_reference(&mut self, pbn: u64) -> Result<(), FxDedupError> {
        let slab_number = self.slab_for_pbn(pbn).ok_or(FxDedupError::Inconsistent)?;
        let slab = self.slabs.get_mut(&slab_number).unwrap();
        let index = slab.pbn_to_index(pbn).map_err(|_| FxDedupError::Inconsistent)?;
        assert_eq!(slab.ref_counts().get(index), PROVISIONAL_REFERENCE);
        // The reservation only ever existed in memory, so no journal entry is needed; the
        // counter simply reverts.
        slab.ref_counts_mut()
            .modify(index, JournalOp::Decrement)
            .expect("reverting a provisional reference cannot fail");
        self.adjust_free_block_count(slab_number, true);
        Ok(())
    }

    /// Reflects a free-count change in the allocated-block counter and the priority table.
    fn adjust_free_block_count(&mut self, slab_number: u64, freed: bool) {
        if freed {
            self.allocated_blocks.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.allocated_blocks.fetch_add(1, Ordering::Relaxed);
        }

        // The open slab is not re-prioritized until it closes, and the priority rarely moves
        // for anyone else; skip the requeue unless it actually changed.
        if self.open_slab == Some(slab_number) {
            return;
        }
        let slab = self.slabs.get(&slab_number).unwrap();
        if !matches!(slab.state(), SlabState::Clean | SlabState::Dirty) {
            return;
        }
        let old_priority = slab.priority();
        if old_priority == self.calculate_priority(slab) {
            return;
        }
        self.prioritized_slabs.remove(old_priority, slab_number);
        self.prioritize_slab(slab_number);
    }

    // --- Reference mutation ---

    fn slab_for_pbn(&self, pbn: u64) -> Option<u64> {
        if pbn < self.first_block {
            return None;
        }
        let slab_number = (pbn - self.first_block) / self.slab_config.slab_blocks;
        self.slabs.contains_key(&slab_number).then_some(slab_number)
    }

    async fn modify_reference(
        &mut self,
        pbn: u64,
        op: JournalOp,
        recovery_sequence: u64,
    ) -> Result<(), FxDedupError> {
        self.check_may_operate()?;
        if pbn == 0 {
            // The zero block is never referenced or freed.
            return Ok(());
        }
        let slab_number = match self.slab_for_pbn(pbn) {
            Some(slab_number) => slab_number,
            None => {
                error!(pbn, zone = self.zone_number, "Reference to a block outside any slab");
                self.enter_read_only_and_broadcast(FxDedupError::Inconsistent);
                return Err(FxDedupError::Inconsistent);
            }
        };
        if !self.slabs.get(&slab_number).unwrap().has_resident_ref_counts() {
            // The slab has not been scrubbed yet; make it urgent and have the caller retry once
            // recovery has caught up with it.
            self.scrubber.register(slab_number, true);
            self.kick_scrubber();
            return Err(FxDedupError::Quiescent);
        }
        let slab = self.slabs.get(&slab_number).unwrap();
        let index = match slab.pbn_to_index(pbn) {
            Ok(index) => index,
            Err(_) => {
                self.enter_read_only_and_broadcast(FxDedupError::Inconsistent);
                return Err(FxDedupError::Inconsistent);
            }
        };

        // Returning a reservation that was never committed is purely an in-memory affair; every
        // other mutation journals before the counter changes.
        let journaled = !(op == JournalOp::Decrement
            && slab.ref_counts().get(index) == PROVISIONAL_REFERENCE);
        if journaled {
            self.append_journal_entry(slab_number, SlabJournalEntry { op, pbn, recovery_sequence })
                .await?;

            // On commit the provisional reference becomes real and is no longer the write
            // lock's to roll back.
            if op != JournalOp::Decrement {
                self.pbn_locks.clear_provisional_reference(pbn);
            }
        }

        let slab = self.slabs.get_mut(&slab_number).unwrap();
        match slab.ref_counts_mut().modify(index, op) {
            Ok(status) => {
                if journaled && slab.state() != SlabState::Open {
                    slab.set_state(SlabState::Dirty);
                }
                match status {
                    FreeStatus::Unchanged => {}
                    FreeStatus::BecameFree => self.adjust_free_block_count(slab_number, true),
                    FreeStatus::BecameAllocated => {
                        self.adjust_free_block_count(slab_number, false)
                    }
                }
                Ok(())
            }
            Err(e) => {
                error!(error = ?e, pbn, "Invalid reference count mutation");
                self.enter_read_only_and_broadcast(FxDedupError::Inconsistent);
                Err(FxDedupError::Inconsistent)
            }
        }
    }

    /// Appends to the slab's journal, first making room if the tail is full or the journal has
    /// hit its thresholds.
    async fn append_journal_entry(
        &mut self,
        slab_number: u64,
        entry: SlabJournalEntry,
    ) -> Result<(), FxDedupError> {
        if self.slabs.get(&slab_number).unwrap().journal.tail_is_full() {
            // The entry has to wait for the tail block to commit before it can land.
            self.stats.journal_tail_busy_count.fetch_add(1, Ordering::Relaxed);
            self.commit_slab_tail(slab_number).await?;
        }
        let (at_blocking, at_flushing) = {
            let journal = &self.slabs.get(&slab_number).unwrap().journal;
            (
                journal.is_at_threshold(self.slab_config.slab_journal_blocking_threshold),
                journal.is_at_threshold(self.slab_config.slab_journal_flushing_threshold),
            )
        };
        if at_blocking {
            // The journal is out of space and the append would have parked; reclaim inline by
            // writing the ref-counts so the head can advance past the old blocks.
            self.stats.journal_disk_full_count.fetch_add(1, Ordering::Relaxed);
            self.stats.journal_blocked_count.fetch_add(1, Ordering::Relaxed);
            self.write_slab_ref_counts(slab_number).await?;
        } else if at_flushing {
            self.stats.journal_flush_count.fetch_add(1, Ordering::Relaxed);
            self.write_slab_ref_counts(slab_number).await?;
        }
        self.slabs.get_mut(&slab_number).unwrap().journal.append(entry);
        Ok(())
    }

    /// Ensures the summary knows the slab is dirty before any journal block lands on disk, so a
    /// crash cannot leave journal entries a later load would not scrub.
    async fn mark_slab_dirty_in_summary(&mut self, slab_number: u64) -> Result<(), FxDedupError> {
        let entry = self.summary.entry(slab_number);
        if !entry.is_clean && entry.load_ref_counts {
            return Ok(());
        }
        let slab = self.slabs.get(&slab_number).unwrap();
        let (tail_offset, free_blocks) =
            (slab.journal.tail_block_offset(), slab.free_block_count());
        self.summary.update(slab_number, tail_offset, true, false, free_blocks);
        self.flush_summary().await
    }

    async fn commit_slab_tail(&mut self, slab_number: u64) -> Result<(), FxDedupError> {
        self.mark_slab_dirty_in_summary(slab_number).await?;
        let mut vio = self.acquire_vio().await;
        let slab = self.slabs.get_mut(&slab_number).unwrap();
        let result = slab.journal.commit_tail(self.device.as_ref(), &mut vio).await;
        self.vio_pool.release(vio);
        if let Err(e) = result {
            error!(error = ?e, slab = slab_number, "Slab journal write failed");
            self.enter_read_only_and_broadcast(FxDedupError::Io);
            return Err(FxDedupError::Io);
        }
        self.stats.journal_blocks_written.fetch_add(1, Ordering::Relaxed);

        // Record the new tail so a later load starts its scrub at the right block, then let go
        // of the recovery journal.
        let slab = self.slabs.get(&slab_number).unwrap();
        let (tail_offset, free_blocks) =
            (slab.journal.tail_block_offset(), slab.free_block_count());
        self.summary.update(slab_number, tail_offset, true, false, free_blocks);
        self.flush_summary().await?;
        self.slabs.get_mut(&slab_number).unwrap().journal.release_recovery_lock();
        Ok(())
    }

    /// Writes a slab's ref-counts with the current journal point, reclaiming its journal.  The
    /// tail is committed first so the journal point covers everything appended so far.
    async fn write_slab_ref_counts(&mut self, slab_number: u64) -> Result<(), FxDedupError> {
        if self.slabs.get(&slab_number).unwrap().journal.is_dirty() {
            self.commit_slab_tail(slab_number).await?;
        }
        let mut vio = self.acquire_vio().await;
        let slab = self.slabs.get(&slab_number).unwrap();
        let journal_point = slab.journal.tail();
        let result = slab
            .ref_counts()
            .save(self.device.as_ref(), slab.ref_counts_origin(), journal_point, &mut vio)
            .await;
        self.vio_pool.release(vio);
        match result {
            Ok(blocks) => {
                self.stats.ref_count_blocks_written.fetch_add(blocks, Ordering::Relaxed);
                self.slabs.get_mut(&slab_number).unwrap().journal.reclaim(journal_point);
                Ok(())
            }
            Err(e) => {
                error!(error = ?e, slab = slab_number, "Ref count write failed");
                self.enter_read_only_and_broadcast(FxDedupError::Io);
                Err(FxDedupError::Io)
            }
        }
    }

    fn increment_limit(&self, pbn: u64) -> u8 {
        if pbn == 0 {
            return 0;
        }
        match self.slab_for_pbn(pbn) {
            None => 0,
            Some(slab_number) => {
                let slab = self.slabs.get(&slab_number).unwrap();
                if !slab.has_resident_ref_counts() {
                    return 0;
                }
                match slab.pbn_to_index(pbn) {
                    Ok(index) => slab.ref_counts().increment_limit(index),
                    Err(_) => 0,
                }
            }
        }
    }

    // --- Recovery journal interaction ---

    /// Commits every dirty tail block whose oldest entry locks recovery block |recovery_block|
    /// or older, letting the recovery journal advance past it.
    async fn commit_tail_blocks(&mut self, recovery_block: u64) -> Result<(), FxDedupError> {
        if self.admin_state.is_read_only() {
            return Err(FxDedupError::ReadOnly);
        }
        let locked: Vec<u64> = self
            .slabs
            .iter()
            .filter(|(_, slab)| {
                slab.journal.recovery_lock().map(|lock| lock <= recovery_block).unwrap_or(false)
            })
            .map(|(&slab_number, _)| slab_number)
            .collect();
        for slab_number in locked {
            self.commit_slab_tail(slab_number).await?;
        }
        Ok(())
    }

    // --- Clean-slab waiters ---

    fn wait_for_clean_slab(&mut self, reply: oneshot::Sender<Result<(), FxDedupError>>) {
        if self.scrubber.enqueue_clean_slab_waiter(reply) {
            self.kick_scrubber();
        }
    }

    fn kick_scrubber(&mut self) {
        if self.scrubber.has_slabs() && !self.scrubber.is_stopped() {
            let _ = self.self_sender.unbounded_send(ZoneRequest::ScrubNext);
        }
    }

    // --- Scrubbing ---

    async fn handle_scrub_next(&mut self) {
        if self.scrubber.is_stopped() || self.admin_state.is_read_only() {
            return;
        }
        let slab_number = match self.scrubber.next() {
            None => {
                self.fire_scrub_gates();
                return;
            }
            Some(slab_number) => slab_number,
        };
        match self.scrub_slab(slab_number).await {
            Ok(()) => {
                self.queue_slab(slab_number);
                self.scrubber.notify_one_waiter();
            }
            Err(e) => {
                error!(error = ?e, slab = slab_number, "Scrubbing failed");
                self.enter_read_only_and_broadcast(e);
                return;
            }
        }
        self.fire_scrub_gates();
        self.kick_scrubber();
    }

    /// Replays a slab's journal into its ref-counts and writes both back, making the slab clean
    /// and allocatable again.
    async fn scrub_slab(&mut self, slab_number: u64) -> Result<(), FxDedupError> {
        let tail_hint = self.summary.entry(slab_number).tail_block_offset;
        let mut vio = self.acquire_vio().await;
        let result = self.scrub_slab_inner(slab_number, tail_hint, &mut vio).await;
        self.vio_pool.release(vio);
        result?;

        // The slab is consistent again; say so before anyone allocates from it.
        let slab = self.slabs.get_mut(&slab_number).unwrap();
        slab.set_state(SlabState::Clean);
        let (tail_offset, load_ref_counts, free_blocks) = (
            slab.journal.tail_block_offset(),
            !slab.journal.is_blank(),
            slab.free_block_count(),
        );
        self.summary.update(slab_number, tail_offset, load_ref_counts, true, free_blocks);
        self.flush_summary().await
    }

    async fn scrub_slab_inner(
        &mut self,
        slab_number: u64,
        tail_hint: u16,
        vio: &mut Vio,
    ) -> Result<(), FxDedupError> {
        let device = self.device.clone();
        let config = self.slab_config;
        let nonce = self.nonce;
        let slab = self.slabs.get_mut(&slab_number).unwrap();

        let tail_block = slab
            .journal
            .find_tail_on_disk(device.as_ref(), tail_hint, vio)
            .await
            .map_err(|_| FxDedupError::Io)?;

        // Pull in the on-disk counters; an all-zero region means they were never written.
        let ref_counts_origin = slab.ref_counts_origin();
        let (mut ref_counts, journal_point) =
            match RefCounts::load(device.as_ref(), ref_counts_origin, config.data_blocks, vio)
                .await
            {
                Ok(loaded) => loaded,
                Err(e) if FxDedupError::Io.matches(&e) => return Err(FxDedupError::Io),
                Err(e) => {
                    error!(error = ?e, slab = slab_number, "Ref counts failed validation");
                    return Err(FxDedupError::Inconsistent);
                }
            };

        if let Some(tail_block) = tail_block {
            let tail_sequence = tail_block.sequence;
            let mut blocks = Vec::new();
            for sequence in tail_block.head..tail_sequence {
                match slab.journal.read_block(device.as_ref(), sequence, vio).await {
                    Ok(Some(block)) => blocks.push(block),
                    // Reclaimed before the crash; its entries are already in the counters.
                    Ok(None) => continue,
                    Err(_) => return Err(FxDedupError::Io),
                }
            }
            blocks.push(tail_block);
            for block in blocks {
                if block.sequence < journal_point {
                    continue;
                }
                for entry in &block.entries {
                    let index =
                        slab.pbn_to_index(entry.pbn).map_err(|_| FxDedupError::Inconsistent)?;
                    ref_counts.replay(index, entry.op).map_err(|_| FxDedupError::Inconsistent)?;
                }
            }
            slab.journal = SlabJournal::open_at(
                slab.ref_counts_origin() + config.ref_count_blocks,
                config.slab_journal_blocks,
                nonce,
                tail_sequence,
            );
        }

        slab.attach_ref_counts(ref_counts);

        // Persist the repaired counters so the whole journal is reclaimed.
        let journal_point = slab.journal.tail();
        let blocks = slab
            .ref_counts()
            .save(device.as_ref(), slab.ref_counts_origin(), journal_point, vio)
            .await
            .map_err(|_| FxDedupError::Io)?;
        self.stats.ref_count_blocks_written.fetch_add(blocks, Ordering::Relaxed);
        self.slabs.get_mut(&slab_number).unwrap().journal.reclaim(journal_point);
        Ok(())
    }

    fn fire_scrub_gates(&mut self) {
        if !self.scrubber.has_high_priority_slabs() {
            if let Some(gate) = self.prepare_gate.take() {
                let _ = gate.send(Ok(()));
            }
        }
        if !self.scrubber.has_slabs() {
            for gate in self.scrub_all_gates.drain(..) {
                let _ = gate.send(Ok(()));
            }
        }
    }

    // --- Admin actions ---

    async fn handle_admin(
        &mut self,
        action: ZoneAction,
        reply: oneshot::Sender<Result<(), FxDedupError>>,
    ) {
        match action {
            ZoneAction::Load(load_type) => {
                let _ = reply.send(self.load(load_type).await);
            }
            ZoneAction::PrepareToAllocate => self.prepare_to_allocate(reply).await,
            ZoneAction::Drain(kind) => {
                let _ = reply.send(self.drain(kind).await);
            }
            ZoneAction::Resume => {
                let _ = reply.send(self.resume());
            }
            ZoneAction::ScrubAll => {
                if !self.scrubber.has_slabs() {
                    let _ = reply.send(Ok(()));
                } else {
                    self.scrub_all_gates.push(reply);
                    self.kick_scrubber();
                }
            }
        }
    }

    async fn load(&mut self, load_type: LoadType) -> Result<(), FxDedupError> {
        self.admin_state
            .start_operation(load_type.state_code())
            .map_err(|_| FxDedupError::BadState)?;
        self.load_type = Some(load_type);

        let mut vio = self.acquire_vio().await;
        let mut result = Ok(());
        if load_type == LoadType::Rebuild {
            // Rebuild discards all journal history; the block map is the sole authority for the
            // counters, which are reconstructed by machinery outside this crate.
            let slab_numbers: Vec<u64> = self.slabs.keys().copied().collect();
            for slab_number in slab_numbers {
                let slab = self.slabs.get_mut(&slab_number).unwrap();
                if let Err(e) = slab.journal.erase(self.device.as_ref(), &mut vio).await {
                    error!(error = ?e, slab = slab_number, "Slab journal erase failed");
                    result = Err(FxDedupError::Io);
                    break;
                }
            }
        }
        if result.is_ok() {
            if let Err(e) = self.summary.load(self.device.as_ref(), &mut vio).await {
                error!(error = ?e, zone = self.zone_number, "Summary load failed");
                result = Err(FxDedupError::Io);
            }
        }
        self.vio_pool.release(vio);

        if let Err(e) = result {
            self.admin_state.set_operation_result(e);
        }
        self.admin_state.finish_operation().and(result)
    }

    /// Classifies every slab from its summary status and gets the zone ready to serve
    /// allocations.  The reply is withheld until the high-priority scrub queue is empty.
    async fn prepare_to_allocate(&mut self, reply: oneshot::Sender<Result<(), FxDedupError>>) {
        let load_type = self.load_type.unwrap_or(LoadType::Normal);

        // Until slabs queue and report their free blocks, every data block counts as allocated.
        self.allocated_blocks
            .store(self.slabs.len() as u64 * self.slab_config.data_blocks, Ordering::Relaxed);

        // Order the statuses so the cleanest, emptiest slabs queue (or scrub) first.
        let mut statuses = self.summary.statuses(self.slabs.len() as u64);
        statuses.sort_by(|a, b| {
            b.is_clean
                .cmp(&a.is_clean)
                .then(b.emptiness.cmp(&a.emptiness))
                .then(a.slab_number.cmp(&b.slab_number))
        });

        for status in statuses {
            if let Err(e) = self.prepare_slab(load_type, status).await {
                let _ = reply.send(Err(e));
                return;
            }
        }

        if self.scrubber.has_high_priority_slabs() {
            // Allocation cannot start until these slabs are usable; hold the completion.
            self.prepare_gate = Some(reply);
        } else {
            let _ = reply.send(Ok(()));
        }
        self.kick_scrubber();
    }

    async fn prepare_slab(
        &mut self,
        load_type: LoadType,
        status: SlabStatus,
    ) -> Result<(), FxDedupError> {
        let slab_number = status.slab_number;
        if load_type == LoadType::Rebuild {
            // Journals were erased during load; counters start empty pending reconstruction.
            let slab = self.slabs.get_mut(&slab_number).unwrap();
            if slab.has_resident_ref_counts() {
                slab.ref_counts_mut().reset_to_empty();
            } else {
                slab.attach_ref_counts(RefCounts::new(self.slab_config.data_blocks));
            }
            slab.set_state(SlabState::Clean);
            self.queue_slab(slab_number);
            return Ok(());
        }

        if status.is_clean {
            if status.load_ref_counts {
                let mut vio = self.acquire_vio().await;
                let origin = self.slabs.get(&slab_number).unwrap().ref_counts_origin();
                let loaded = RefCounts::load(
                    self.device.as_ref(),
                    origin,
                    self.slab_config.data_blocks,
                    &mut vio,
                )
                .await;
                self.vio_pool.release(vio);
                let (ref_counts, journal_point) = match loaded {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        error!(error = ?e, slab = slab_number, "Ref count load failed");
                        let e = if FxDedupError::Io.matches(&e) {
                            FxDedupError::Io
                        } else {
                            FxDedupError::Inconsistent
                        };
                        self.enter_read_only_and_broadcast(e);
                        return Err(e);
                    }
                };
                let slab = self.slabs.get_mut(&slab_number).unwrap();
                slab.attach_ref_counts(ref_counts);
                if journal_point > 1 {
                    // The journal has on-disk history; appends continue after it.
                    slab.journal = SlabJournal::open_at(
                        slab.ref_counts_origin() + self.slab_config.ref_count_blocks,
                        self.slab_config.slab_journal_blocks,
                        self.nonce,
                        journal_point - 1,
                    );
                }
            } else {
                // Never written: all free, blank journal, nothing to read.
                let slab = self.slabs.get_mut(&slab_number).unwrap();
                slab.attach_ref_counts(RefCounts::new(self.slab_config.data_blocks));
            }
            self.slabs.get_mut(&slab_number).unwrap().set_state(SlabState::Clean);
            self.queue_slab(slab_number);
            return Ok(());
        }

        // Dirty: the slab must scrub before serving allocations.  A dirty slab on a normal
        // (cleanly shut down) load is surprising, so it scrubs ahead of allocation.
        let high_priority = load_type == LoadType::Normal;
        self.slabs.get_mut(&slab_number).unwrap().set_state(SlabState::Unrecovered);
        self.scrubber.register(slab_number, high_priority);
        Ok(())
    }

    async fn drain(&mut self, kind: DrainKind) -> Result<(), FxDedupError> {
        if self.admin_state.is_read_only() {
            // A read-only zone still quiesces gracefully; it just writes nothing.
            self.scrubber.stop();
            self.open_slab = None;
            self.prioritized_slabs.reset();
            for slab in self.slabs.values_mut() {
                if slab.state() != SlabState::Unrecovered {
                    slab.set_state(SlabState::Quiescent);
                }
            }
            return Ok(());
        }
        let code = kind.state_code();
        self.admin_state.start_operation(code).map_err(|_| FxDedupError::BadState)?;

        // Step one: stop the scrubber.  Queued slabs stay queued for resume.
        self.scrubber.stop();

        // Step two: the slabs.  Dequeue everything, the open slab included, and write out
        // whatever the drain kind demands.
        self.open_slab = None;
        self.prioritized_slabs.reset();
        let slab_numbers: Vec<u64> = self.slabs.keys().copied().collect();
        for slab_number in slab_numbers {
            if self.slabs.get(&slab_number).unwrap().state() == SlabState::Unrecovered {
                continue;
            }
            let dirty = {
                let slab = self.slabs.get(&slab_number).unwrap();
                slab.has_resident_ref_counts() && slab.is_dirty()
            };
            if code.should_write_dirty() && dirty {
                // A failed save is recorded but the slab still quiesces; the drain must reach
                // its terminal state.
                if let Err(e) = self.save_slab(slab_number).await {
                    self.admin_state.set_operation_result(e);
                }
            }
            self.slabs.get_mut(&slab_number).unwrap().set_state(SlabState::Quiescent);
        }

        // Step three: the summary, then the device's write cache when this drain promised
        // durability.
        if let Err(e) = self.flush_summary().await {
            self.admin_state.set_operation_result(e);
        }
        if code.should_write_dirty() {
            if let Err(e) = self.device.flush().await {
                error!(error = ?e, zone = self.zone_number, "Device flush failed");
                self.admin_state.set_operation_result(FxDedupError::Io);
            }
        }

        // Step four: all metadata I/O has completed, so the pool must be idle.
        assert!(!self.vio_pool.is_busy(), "vio pool busy at end of drain");
        let result = self.admin_state.finish_operation();

        // A flush returns straight to normal operation; re-admit the slabs it dequeued.
        if self.admin_state.may_operate() {
            let slab_numbers: Vec<u64> = self.slabs.keys().copied().collect();
            for slab_number in slab_numbers {
                let slab = self.slabs.get_mut(&slab_number).unwrap();
                if slab.state() == SlabState::Quiescent {
                    slab.set_state(SlabState::Resuming);
                    self.queue_slab(slab_number);
                }
            }
            self.scrubber.resume();
            self.kick_scrubber();
        }
        result
    }

    /// Writes a slab's dirty journal and counters and marks it clean in the summary.
    async fn save_slab(&mut self, slab_number: u64) -> Result<(), FxDedupError> {
        self.mark_slab_dirty_in_summary(slab_number).await?;
        let mut vio = self.acquire_vio().await;
        let slab = self.slabs.get_mut(&slab_number).unwrap();
        let result = slab.save(self.device.as_ref(), &mut vio).await;
        self.vio_pool.release(vio);
        match result {
            Ok((journal_blocks, ref_blocks)) => {
                self.stats.journal_blocks_written.fetch_add(journal_blocks, Ordering::Relaxed);
                self.stats.ref_count_blocks_written.fetch_add(ref_blocks, Ordering::Relaxed);
                let slab = self.slabs.get(&slab_number).unwrap();
                let (tail_offset, free_blocks) =
                    (slab.journal.tail_block_offset(), slab.free_block_count());
                self.summary.update(slab_number, tail_offset, true, true, free_blocks);
                Ok(())
            }
            Err(e) => {
                error!(error = ?e, slab = slab_number, "Slab save failed");
                Err(FxDedupError::Io)
            }
        }
    }

    fn resume(&mut self) -> Result<(), FxDedupError> {
        self.admin_state
            .start_operation(AdminStateCode::Resuming)
            .map_err(|_| FxDedupError::BadState)?;

        // Reverse of drain: the summary has nothing pending, then the slabs re-queue, then the
        // scrubber restarts.
        let slab_numbers: Vec<u64> = self.slabs.keys().copied().collect();
        for slab_number in slab_numbers {
            let slab = self.slabs.get_mut(&slab_number).unwrap();
            match slab.state() {
                SlabState::Quiescent => {
                    slab.set_state(SlabState::Resuming);
                    self.queue_slab(slab_number);
                }
                SlabState::Unrecovered => self.scrubber.register(slab_number, false),
                _ => {}
            }
        }
        self.scrubber.resume();
        self.kick_scrubber();
        self.admin_state.finish_operation()
    }

    // --- Resize ---

    fn register_new_slabs(&mut self, slab_numbers: Vec<u64>) -> Result<(), FxDedupError> {
        for slab_number in slab_numbers {
            assert!(!self.slabs.contains_key(&slab_number));
            let slab = Slab::new(
                slab_number,
                self.zone_number,
                &self.slab_config,
                self.first_block,
                self.nonce,
                true,
            );
            self.slabs.insert(slab_number, slab);
            self.stats.slab_count.fetch_add(1, Ordering::Relaxed);

            // Extend the allocated baseline by the new slab before queueing subtracts its free
            // blocks back out.
            self.allocated_blocks.fetch_add(self.slab_config.data_blocks, Ordering::Relaxed);
            self.queue_slab(slab_number);
        }
        Ok(())
    }

    // --- Read-only handling ---

    fn check_may_operate(&self) -> Result<(), FxDedupError> {
        if self.admin_state.is_read_only() {
            return Err(FxDedupError::ReadOnly);
        }
        if !self.admin_state.may_operate() {
            return Err(FxDedupError::Quiescent);
        }
        Ok(())
    }

    fn enter_read_only(&mut self) {
        self.admin_state.set_read_only();
        self.scrubber.abort_waiters(FxDedupError::ReadOnly);
        if let Some(gate) = self.prepare_gate.take() {
            let _ = gate.send(Err(FxDedupError::ReadOnly));
        }
        for gate in self.scrub_all_gates.drain(..) {
            let _ = gate.send(Err(FxDedupError::ReadOnly));
        }
    }

    fn enter_read_only_and_broadcast(&mut self, error: FxDedupError) {
        self.enter_read_only();
        self.read_only_notifier.enter(&error);
    }

    // --- Helpers ---

    async fn acquire_vio(&mut self) -> Vio {
        match self.vio_pool.acquire() {
            Ok(vio) => vio,
            Err(waiter) => waiter.await.expect("vio pool dropped a waiter"),
        }
    }

    async fn flush_summary(&mut self) -> Result<(), FxDedupError> {
        let mut vio = self.acquire_vio().await;
        let result = self.summary.flush(self.device.as_ref(), &mut vio).await;
        self.vio_pool.release(vio);
        result.map_err(|e| {
            error!(error = ?e, zone = self.zone_number, "Summary write failed");
            FxDedupError::Io
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{AllocatorZone, ReadOnlyNotifier, ZoneConfig},
        crate::{
            errors::FxDedupError,
            slab_depot::{
                format::test_state,
                journal::JournalOp,
                pbn_lock::PbnLockType,
                slab::SlabState,
                LoadType,
            },
            testing::fake_device::FakeDevice,
        },
        futures::{channel::mpsc, executor::block_on},
        std::sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    };

    struct Fixture {
        zone: AllocatorZone,
        device: Arc<FakeDevice>,
        allocated: Arc<AtomicU64>,
        _receiver: mpsc::UnboundedReceiver<super::ZoneRequest>,
    }

    // A single-zone fixture with a formatted (all fresh) summary, loaded and prepared.
    fn make_prepared_zone(slabs_in_zone: u64, data_blocks: u64) -> Fixture {
        make_prepared_zone_with_state(test_state(1, slabs_in_zone, data_blocks))
    }

    fn make_prepared_zone_with_state(state: crate::slab_depot::format::SlabDepotState) -> Fixture {
        block_on(async {
            let slabs_in_zone = state.slab_count();
            let data_blocks = state.slab_config.data_blocks;
            let summary_origin = state.last_block;
            let device = Arc::new(FakeDevice::new(
                summary_origin + crate::slab_depot::summary::SUMMARY_BLOCKS_PER_ZONE,
            ));

            // Format the summary the way the depot does: every slab fresh and clean.
            let mut summary =
                crate::slab_depot::summary::SlabSummaryZone::new(0, 1, summary_origin, data_blocks);
            for slab_number in 0..slabs_in_zone {
                summary.update(slab_number, 0, false, true, data_blocks);
            }
            let mut buf = vec![0u8; crate::device::BLOCK_SIZE];
            summary.flush(device.as_ref(), &mut buf).await.expect("flush failed");

            let (sender, receiver) = mpsc::unbounded();
            let allocated = Arc::new(AtomicU64::new(0));
            let mut zone = AllocatorZone::new(
                ZoneConfig {
                    zone_number: 0,
                    zone_count: 1,
                    slab_config: state.slab_config,
                    first_block: state.first_block,
                    nonce: 0xdead_beef,
                    summary_origin,
                    slab_numbers: (0..slabs_in_zone).collect(),
                },
                device.clone(),
                Arc::new(ReadOnlyNotifier::new()),
                sender,
                allocated.clone(),
                Arc::new(Default::default()),
            );

            zone.load(LoadType::Normal).await.expect("load failed");
            let (reply, gate) = futures::channel::oneshot::channel();
            zone.prepare_to_allocate(reply).await;
            gate.await.expect("gate dropped").expect("prepare failed");
            Fixture { zone, device, allocated, _receiver: receiver }
        })
    }

    #[test]
    fn test_priority_function() {
        let fixture = make_prepared_zone(1, 64);
        let zone = &fixture.zone;
        // data_blocks = 64: unopened priority = 1 + log2(48) = 6; max = 2 + log2(64) = 8.
        assert_eq!(zone.unopened_slab_priority, 6);

        let mut slab = crate::slab_depot::slab::Slab::new(
            0,
            0,
            &zone.slab_config,
            zone.first_block,
            0,
            true,
        );
        // Blank journal: the reserved unopened priority.
        assert_eq!(zone.calculate_priority(&slab), 6);

        // A previously-opened slab with plenty of free blocks outranks unopened slabs.
        slab.journal.append(crate::slab_depot::journal::SlabJournalEntry {
            op: JournalOp::Increment,
            pbn: zone.first_block,
            recovery_sequence: 1,
        });
        assert_eq!(zone.calculate_priority(&slab), 8); // 1 + log2(64) = 7, bumped past 6.

        // Drain it down and the priority sinks below the unopened threshold.
        while slab.free_block_count() > 3 {
            slab.ref_counts_mut().reserve_free().expect("reserve failed");
        }
        assert_eq!(zone.calculate_priority(&slab), 2); // 1 + log2(3).

        while slab.ref_counts_mut().reserve_free().is_some() {}
        assert_eq!(zone.calculate_priority(&slab), 0);
    }

    #[test]
    fn test_allocate_until_full() {
        block_on(async {
            let mut fixture = make_prepared_zone(2, 8);
            // No lock is ever released here, so every allocation in the zone holds its PBN lock
            // simultaneously; the pool must cover both slabs' worth of blocks.
            let mut pbns = std::collections::HashSet::new();
            for _ in 0..16 {
                let pbn = fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed");
                assert!(pbns.insert(pbn), "duplicate PBN {}", pbn);
            }
            assert_eq!(fixture.allocated.load(Ordering::Relaxed), 16);
            assert!(!fixture.zone.pbn_locks.is_idle());
            // Zone exhausted.
            assert_eq!(fixture.zone.allocate(PbnLockType::WriteNew), Err(FxDedupError::NoSpace));
        });
    }

    #[test]
    fn test_release_allocation_lock_rolls_back() {
        block_on(async {
            let mut fixture = make_prepared_zone(1, 8);
            let pbn = fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed");
            assert_eq!(fixture.allocated.load(Ordering::Relaxed), 1);
            fixture.zone.release_allocation_lock(pbn).expect("release failed");
            assert_eq!(fixture.allocated.load(Ordering::Relaxed), 0);
            // The same block is handed out again.
            assert_eq!(fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed"), pbn);
        });
    }

    #[test]
    fn test_confirmed_allocation_survives_lock_release() {
        block_on(async {
            let mut fixture = make_prepared_zone(1, 8);
            let pbn = fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed");
            fixture.zone.modify_reference(pbn, JournalOp::Increment, 1).await.expect(
                "modify failed",
            );
            fixture.zone.release_allocation_lock(pbn).expect("release failed");
            assert_eq!(fixture.allocated.load(Ordering::Relaxed), 1);
            // A later decrement frees it.
            fixture.zone.modify_reference(pbn, JournalOp::Decrement, 2).await.expect(
                "modify failed",
            );
            assert_eq!(fixture.allocated.load(Ordering::Relaxed), 0);
        });
    }

    #[test]
    fn test_increment_limit() {
        block_on(async {
            let mut fixture = make_prepared_zone(1, 8);
            assert_eq!(fixture.zone.increment_limit(0), 0);
            let pbn = fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed");
            // Provisional blocks accept no further references until committed.
            assert_eq!(fixture.zone.increment_limit(pbn), 0);
            fixture.zone.modify_reference(pbn, JournalOp::Increment, 1).await.expect(
                "modify failed",
            );
            assert_eq!(fixture.zone.increment_limit(pbn), 252);
        });
    }

    #[test]
    fn test_journal_threshold_reclaim() {
        block_on(async {
            // One slab, tiny journal (8 blocks, flush threshold 4): enough traffic wraps it.
            let mut fixture = make_prepared_zone(1, 8);
            let pbn = fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed");
            fixture.zone.modify_reference(pbn, JournalOp::Increment, 1).await.expect(
                "modify failed",
            );
            // Cycle increments and decrements; each entry is journaled and tail blocks fill
            // until the thresholds force ref-count writes to reclaim space.
            for sequence in 0..2000u64 {
                fixture
                    .zone
                    .modify_reference(pbn, JournalOp::Increment, sequence)
                    .await
                    .expect("increment failed");
                fixture
                    .zone
                    .modify_reference(pbn, JournalOp::Decrement, sequence)
                    .await
                    .expect("decrement failed");
            }
            let slab = fixture.zone.slabs.get(&0).unwrap();
            assert!(slab.journal.tail() > 8, "journal should have wrapped");
            assert!(
                fixture.zone.stats.ref_count_blocks_written.load(Ordering::Relaxed) > 0,
                "thresholds should have forced ref count writes"
            );
            assert!(
                fixture.zone.stats.journal_tail_busy_count.load(Ordering::Relaxed) > 0,
                "full tail blocks should have made appends wait on commits"
            );
        });
    }

    #[test]
    fn test_journal_full_counts_as_disk_full() {
        block_on(async {
            // Flushing and blocking thresholds coincide, so reclaim only happens once the
            // journal is genuinely out of space and the append would have parked.
            let mut state = test_state(1, 1, 8);
            state.slab_config.slab_journal_flushing_threshold =
                state.slab_config.slab_journal_blocking_threshold;
            let mut fixture = make_prepared_zone_with_state(state);
            let pbn = fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed");
            fixture.zone.modify_reference(pbn, JournalOp::Increment, 1).await.expect(
                "modify failed",
            );
            for sequence in 0..2000u64 {
                fixture
                    .zone
                    .modify_reference(pbn, JournalOp::Increment, sequence)
                    .await
                    .expect("increment failed");
                fixture
                    .zone
                    .modify_reference(pbn, JournalOp::Decrement, sequence)
                    .await
                    .expect("decrement failed");
            }
            assert!(
                fixture.zone.stats.journal_disk_full_count.load(Ordering::Relaxed) > 0,
                "hitting the blocking threshold should count as the journal filling"
            );
            assert_eq!(
                fixture.zone.stats.journal_disk_full_count.load(Ordering::Relaxed),
                fixture.zone.stats.journal_blocked_count.load(Ordering::Relaxed)
            );
        });
    }

    #[test]
    fn test_drain_then_operations_fail() {
        block_on(async {
            let mut fixture = make_prepared_zone(1, 8);
            let pbn = fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed");
            fixture.zone.modify_reference(pbn, JournalOp::Increment, 1).await.expect(
                "modify failed",
            );
            fixture.zone.drain(super::DrainKind::Save).await.expect("drain failed");
            assert_eq!(fixture.zone.allocate(PbnLockType::WriteNew), Err(FxDedupError::Quiescent));
            assert_eq!(
                fixture.zone.modify_reference(pbn, JournalOp::Decrement, 2).await,
                Err(FxDedupError::Quiescent)
            );
            // Resume brings it back, with counters intact.
            fixture.zone.resume().expect("resume failed");
            assert_eq!(fixture.allocated.load(Ordering::Relaxed), 1);
            fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed");
        });
    }

    #[test]
    fn test_saved_slab_state_reloads() {
        block_on(async {
            let state = test_state(1, 1, 8);
            let (pbn, device, allocated_before) = {
                let mut fixture = make_prepared_zone(1, 8);
                let pbn = fixture.zone.allocate(PbnLockType::WriteNew).expect("allocate failed");
                fixture.zone.modify_reference(pbn, JournalOp::Increment, 1).await.expect(
                    "modify failed",
                );
                fixture.zone.drain(super::DrainKind::Save).await.expect("drain failed");
                (pbn, fixture.device.clone(), fixture.allocated.load(Ordering::Relaxed))
            };
            assert_eq!(allocated_before, 1);

            // A second zone over the same device sees the saved state.
            let (sender, _receiver) = mpsc::unbounded();
            let allocated = Arc::new(AtomicU64::new(0));
            let mut zone = AllocatorZone::new(
                ZoneConfig {
                    zone_number: 0,
                    zone_count: 1,
                    slab_config: state.slab_config,
                    first_block: state.first_block,
                    nonce: 0xdead_beef,
                    summary_origin: state.last_block,
                    slab_numbers: vec![0],
                },
                device,
                Arc::new(ReadOnlyNotifier::new()),
                sender,
                allocated.clone(),
                Arc::new(Default::default()),
            );
            zone.load(LoadType::Normal).await.expect("load failed");
            let (reply, gate) = futures::channel::oneshot::channel();
            zone.prepare_to_allocate(reply).await;
            gate.await.expect("gate dropped").expect("prepare failed");
            assert_eq!(allocated.load(Ordering::Relaxed), 1);
            assert_eq!(zone.increment_limit(pbn), 252);
            assert_eq!(zone.slabs.get(&0).unwrap().state(), SlabState::Clean);
        });
    }
}
