// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-slab reference counters.  Each data block in a slab has one 8-bit counter: 0 is free,
//! 1..=253 is a real reference count, 254 is saturated (pinned, never decremented), and 255 marks
//! a provisional reservation held by an in-flight write.  These values are part of the on-disk
//! format and must not change.
//!
//! Counters persist in whole blocks, each carrying the slab-journal sequence number up to which
//! its contents are current, so the scrubber can tell which journal entries still need replaying.

use {
    crate::{
        device::{read_block_with_retry, Device, BLOCK_SIZE},
        errors::FxDedupError,
        slab_depot::journal::JournalOp,
    },
    anyhow::{ensure, Context, Error},
    byteorder::{ByteOrder, LittleEndian},
};

pub const EMPTY_REFERENCE: u8 = 0;
pub const MAX_REFERENCES: u8 = 253;
pub const SATURATED_REFERENCE: u8 = 254;
pub const PROVISIONAL_REFERENCE: u8 = 255;

const REF_COUNT_BLOCK_MAGIC: u32 = 0x6263_7266; // "frcb"
const BLOCK_HEADER_SIZE: usize = 16;
pub const COUNTERS_PER_BLOCK: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// How a modification changed the slab's free-block population.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FreeStatus {
    Unchanged,
    BecameFree,
    BecameAllocated,
}

pub struct RefCounts {
    counters: Vec<u8>,
    free_count: u64,

    // Rotating cursor for free-block scans; rewound when a provisional reservation is returned so
    // an aborted allocation hands back the same block next.
    search_cursor: usize,
}

impl RefCounts {
    /// Creates counters for a never-written slab: everything free.
    pub fn new(data_blocks: u64) -> Self {
        RefCounts {
            counters: vec![EMPTY_REFERENCE; data_blocks as usize],
            free_count: data_blocks,
            search_cursor: 0,
        }
    }

    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    pub fn get(&self, index: usize) -> u8 {
        self.counters[index]
    }

    /// How many additional references the block at |index| can take.
    pub fn increment_limit(&self, index: usize) -> u8 {
        match self.counters[index] {
            EMPTY_REFERENCE | PROVISIONAL_REFERENCE => 0,
            SATURATED_REFERENCE => 0,
            count => MAX_REFERENCES - count,
        }
    }

    /// Reserves a free counter, stamping it provisional.  Returns the block index within the
    /// slab, or None if the slab has no free blocks.
    pub fn reserve_free(&mut self) -> Option<usize> {
        if self.free_count == 0 {
            return None;
        }
        let len = self.counters.len();
        for offset in 0..len {
            let index = (self.search_cursor + offset) % len;
            if self.counters[index] == EMPTY_REFERENCE {
                self.counters[index] = PROVISIONAL_REFERENCE;
                self.free_count -= 1;
                self.search_cursor = (index + 1) % len;
                return Some(index);
            }
        }
        // free_count said otherwise; the counters are corrupt but the caller finds that out
        // through the invariant checks on the modify path.
        None
    }

    /// Applies a live reference mutation.  The matching journal entry must already have been
    /// appended.
    pub fn modify(&mut self, index: usize, op: JournalOp) -> Result<FreeStatus, Error> {
        let counter = self.counters[index];
        let (new_value, status) = match op {
            JournalOp::Increment => match counter {
                PROVISIONAL_REFERENCE => (1, FreeStatus::Unchanged),
                EMPTY_REFERENCE => {
                    return Err(FxDedupError::Inconsistent).with_context(|| {
                        format!("Incrementing unreferenced block at index {}", index)
                    });
                }
                SATURATED_REFERENCE => (SATURATED_REFERENCE, FreeStatus::Unchanged),
                MAX_REFERENCES => (SATURATED_REFERENCE, FreeStatus::Unchanged),
                count => (count + 1, FreeStatus::Unchanged),
            },
            JournalOp::Decrement => match counter {
                EMPTY_REFERENCE => {
                    return Err(FxDedupError::Inconsistent).with_context(|| {
                        format!("Decrementing free block at index {}", index)
                    });
                }
                SATURATED_REFERENCE => {
                    return Err(FxDedupError::Inconsistent).with_context(|| {
                        format!("Decrementing saturated block at index {}", index)
                    });
                }
                PROVISIONAL_REFERENCE | 1 => {
                    self.free_count += 1;
                    if counter == PROVISIONAL_REFERENCE && index < self.search_cursor {
                        self.search_cursor = index;
                    }
                    (EMPTY_REFERENCE, FreeStatus::BecameFree)
                }
                count => (count - 1, FreeStatus::Unchanged),
            },
            JournalOp::BlockMapIncrement => match counter {
                // A block-map block pins straight to the saturated value and never comes back.
                PROVISIONAL_REFERENCE => (SATURATED_REFERENCE, FreeStatus::Unchanged),
                EMPTY_REFERENCE => {
                    self.free_count -= 1;
                    (SATURATED_REFERENCE, FreeStatus::BecameAllocated)
                }
                _ => {
                    return Err(FxDedupError::Inconsistent).with_context(|| {
                        format!("Block-map increment of referenced block at index {}", index)
                    });
                }
            },
        };
        self.counters[index] = new_value;
        Ok(status)
    }

    /// Applies a journal entry during scrubbing.  On-disk counters never contain the provisional
    /// value, so replay uses slightly different rules: an increment of a free counter is the
    /// commit of a reservation that was only ever in memory.
    pub fn replay(&mut self, index: usize, op: JournalOp) -> Result<(), Error> {
        ensure!(index < self.counters.len(), FxDedupError::Inconsistent);
        let counter = self.counters[index];
        ensure!(counter != PROVISIONAL_REFERENCE, FxDedupError::Inconsistent);
        self.counters[index] = match op {
            JournalOp::Increment => match counter {
                EMPTY_REFERENCE => {
                    self.free_count -= 1;
                    1
                }
                SATURATED_REFERENCE | MAX_REFERENCES => SATURATED_REFERENCE,
                count => count + 1,
            },
            JournalOp::Decrement => match counter {
                EMPTY_REFERENCE | SATURATED_REFERENCE => {
                    return Err(FxDedupError::Inconsistent).with_context(|| {
                        format!("Journal replay decremented counter {} at index {}", counter, index)
                    });
                }
                1 => {
                    self.free_count += 1;
                    EMPTY_REFERENCE
                }
                count => count - 1,
            },
            JournalOp::BlockMapIncrement => {
                if counter == EMPTY_REFERENCE {
                    self.free_count -= 1;
                }
                SATURATED_REFERENCE
            }
        };
        Ok(())
    }

    /// Zeroes every counter.  Used by rebuild loads, where counters are reconstructed from the
    /// block map by machinery outside this crate.
    pub fn reset_to_empty(&mut self) {
        self.counters.fill(EMPTY_REFERENCE);
        self.free_count = self.counters.len() as u64;
        self.search_cursor = 0;
    }

    fn block_count(&self) -> usize {
        (self.counters.len() + COUNTERS_PER_BLOCK - 1) / COUNTERS_PER_BLOCK
    }

    /// Writes all counters to |device| starting at |origin|, stamping each block with
    /// |journal_point|.  Provisional counters persist as free: a reservation that was never
    /// committed must not survive a crash.  |buf| is the caller's pooled metadata buffer.
    /// Returns the number of blocks written.
    pub async fn save(
        &self,
        device: &dyn Device,
        origin: u64,
        journal_point: u64,
        buf: &mut [u8],
    ) -> Result<u64, Error> {
        assert_eq!(buf.len(), BLOCK_SIZE);
        let blocks = self.block_count();
        for block in 0..blocks {
            buf.fill(0);
            LittleEndian::write_u32(&mut buf[0..4], REF_COUNT_BLOCK_MAGIC);
            LittleEndian::write_u64(&mut buf[8..16], journal_point);
            let start = block * COUNTERS_PER_BLOCK;
            let end = std::cmp::min(start + COUNTERS_PER_BLOCK, self.counters.len());
            for (i, &counter) in self.counters[start..end].iter().enumerate() {
                buf[BLOCK_HEADER_SIZE + i] =
                    if counter == PROVISIONAL_REFERENCE { EMPTY_REFERENCE } else { counter };
            }
            device
                .write_block(origin + block as u64, &buf)
                .await
                .map_err(|_| FxDedupError::Io)
                .context("Failed to write ref count block")?;
        }
        Ok(blocks as u64)
    }

    /// Reads counters for a slab back from |device|.  Returns the counters and the journal point
    /// they are current through.  A region that was never written (zero magic) reads as all
    /// free, current through nothing; garbage reads as corruption.
    pub async fn load(
        device: &dyn Device,
        origin: u64,
        data_blocks: u64,
        buf: &mut [u8],
    ) -> Result<(Self, u64), Error> {
        assert_eq!(buf.len(), BLOCK_SIZE);
        let mut counters = vec![0u8; data_blocks as usize];
        let blocks = (data_blocks as usize + COUNTERS_PER_BLOCK - 1) / COUNTERS_PER_BLOCK;
        let mut journal_point = u64::MAX;
        for block in 0..blocks {
            read_block_with_retry(device, origin + block as u64, buf).await?;
            let magic = LittleEndian::read_u32(&buf[0..4]);
            if block == 0 && magic == 0 {
                return Ok((Self::new(data_blocks), 0));
            }
            ensure!(magic == REF_COUNT_BLOCK_MAGIC, FxDedupError::Inconsistent);
            // The slowest block bounds what the whole array is current through.
            journal_point = std::cmp::min(journal_point, LittleEndian::read_u64(&buf[8..16]));
            let start = block * COUNTERS_PER_BLOCK;
            let end = std::cmp::min(start + COUNTERS_PER_BLOCK, data_blocks as usize);
            counters[start..end].copy_from_slice(&buf[BLOCK_HEADER_SIZE..][..end - start]);
        }
        ensure!(
            counters.iter().all(|&c| c != PROVISIONAL_REFERENCE),
            FxDedupError::Inconsistent
        );
        let free_count = counters.iter().filter(|&&c| c == EMPTY_REFERENCE).count() as u64;
        Ok((RefCounts { counters, free_count, search_cursor: 0 }, journal_point))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{FreeStatus, RefCounts, PROVISIONAL_REFERENCE, SATURATED_REFERENCE},
        crate::{
            errors::FxDedupError, slab_depot::journal::JournalOp, testing::fake_device::FakeDevice,
        },
        futures::executor::block_on,
    };

    #[test]
    fn test_reserve_and_commit() {
        let mut refs = RefCounts::new(8);
        let index = refs.reserve_free().expect("reserve failed");
        assert_eq!(refs.get(index), PROVISIONAL_REFERENCE);
        assert_eq!(refs.free_count(), 7);
        assert_eq!(
            refs.modify(index, JournalOp::Increment).expect("modify failed"),
            FreeStatus::Unchanged
        );
        assert_eq!(refs.get(index), 1);
        assert_eq!(refs.free_count(), 7);
    }

    #[test]
    fn test_abort_returns_same_block() {
        let mut refs = RefCounts::new(8);
        let index = refs.reserve_free().expect("reserve failed");
        assert_eq!(
            refs.modify(index, JournalOp::Decrement).expect("modify failed"),
            FreeStatus::BecameFree
        );
        assert_eq!(refs.free_count(), 8);
        // The aborted reservation is the next block handed out.
        assert_eq!(refs.reserve_free(), Some(index));
    }

    #[test]
    fn test_increment_decrement_restores() {
        let mut refs = RefCounts::new(4);
        let index = refs.reserve_free().expect("reserve failed");
        refs.modify(index, JournalOp::Increment).expect("commit failed");
        refs.modify(index, JournalOp::Increment).expect("increment failed");
        assert_eq!(refs.get(index), 2);
        refs.modify(index, JournalOp::Decrement).expect("decrement failed");
        assert_eq!(refs.get(index), 1);
        assert_eq!(
            refs.modify(index, JournalOp::Decrement).expect("decrement failed"),
            FreeStatus::BecameFree
        );
        assert_eq!(refs.get(index), 0);
    }

    #[test]
    fn test_saturation_is_sticky() {
        let mut refs = RefCounts::new(2);
        let index = refs.reserve_free().expect("reserve failed");
        refs.modify(index, JournalOp::Increment).expect("commit failed");
        for _ in 0..300 {
            refs.modify(index, JournalOp::Increment).expect("increment failed");
        }
        assert_eq!(refs.get(index), SATURATED_REFERENCE);
        assert_eq!(refs.increment_limit(index), 0);
        // Saturated counters never come down.
        assert!(FxDedupError::Inconsistent
            .matches(&refs.modify(index, JournalOp::Decrement).unwrap_err()));
    }

    #[test]
    fn test_block_map_increment_pins() {
        let mut refs = RefCounts::new(4);
        let index = refs.reserve_free().expect("reserve failed");
        refs.modify(index, JournalOp::BlockMapIncrement).expect("modify failed");
        assert_eq!(refs.get(index), SATURATED_REFERENCE);
        assert_eq!(refs.free_count(), 3);
    }

    #[test]
    fn test_invalid_mutations() {
        let mut refs = RefCounts::new(4);
        assert!(FxDedupError::Inconsistent
            .matches(&refs.modify(0, JournalOp::Increment).unwrap_err()));
        assert!(FxDedupError::Inconsistent
            .matches(&refs.modify(0, JournalOp::Decrement).unwrap_err()));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        block_on(async {
            let device = FakeDevice::new(16);
            let mut refs = RefCounts::new(100);
            let committed = refs.reserve_free().expect("reserve failed");
            refs.modify(committed, JournalOp::Increment).expect("commit failed");
            let aborted = refs.reserve_free().expect("reserve failed");
            let pinned = refs.reserve_free().expect("reserve failed");
            refs.modify(pinned, JournalOp::BlockMapIncrement).expect("pin failed");

            let mut buf = vec![0u8; crate::device::BLOCK_SIZE];
            refs.save(&device, 3, 17, &mut buf).await.expect("save failed");
            let (loaded, journal_point) =
                RefCounts::load(&device, 3, 100, &mut buf).await.expect("load failed");
            assert_eq!(journal_point, 17);
            assert_eq!(loaded.get(committed), 1);
            assert_eq!(loaded.get(pinned), SATURATED_REFERENCE);
            // The un-committed reservation did not survive.
            assert_eq!(loaded.get(aborted), 0);
            assert_eq!(loaded.free_count(), 98);
        });
    }

    #[test]
    fn test_free_count_matches_counters_under_random_ops() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut refs = RefCounts::new(64);
        for _ in 0..1000 {
            match rng.gen_range(0..3) {
                0 => {
                    if let Some(index) = refs.reserve_free() {
                        refs.modify(index, JournalOp::Increment).expect("commit failed");
                    }
                }
                1 => {
                    let index = rng.gen_range(0..64);
                    if (1..=253).contains(&refs.get(index)) {
                        refs.modify(index, JournalOp::Increment).expect("increment failed");
                    }
                }
                _ => {
                    let index = rng.gen_range(0..64);
                    if (1..=253).contains(&refs.get(index)) {
                        refs.modify(index, JournalOp::Decrement).expect("decrement failed");
                    }
                }
            }
        }
        let zeros = (0..64).filter(|&index| refs.get(index) == 0).count() as u64;
        assert_eq!(refs.free_count(), zeros);
    }

    #[test]
    fn test_replay() {
        let mut refs = RefCounts::new(8);
        refs.replay(3, JournalOp::Increment).expect("replay failed");
        refs.replay(3, JournalOp::Increment).expect("replay failed");
        refs.replay(5, JournalOp::BlockMapIncrement).expect("replay failed");
        assert_eq!(refs.get(3), 2);
        assert_eq!(refs.get(5), SATURATED_REFERENCE);
        assert_eq!(refs.free_count(), 6);
        refs.replay(3, JournalOp::Decrement).expect("replay failed");
        refs.replay(3, JournalOp::Decrement).expect("replay failed");
        assert_eq!(refs.free_count(), 7);
        assert!(FxDedupError::Inconsistent
            .matches(&refs.replay(3, JournalOp::Decrement).unwrap_err()));
    }
}
