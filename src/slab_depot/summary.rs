// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The slab summary: a compact, eventually-consistent digest of every slab's state, used at load
//! time to decide which slabs need scrubbing and to avoid reading ref-counts for slabs that were
//! never written.  The summary is physically one partition but is divided into fixed-size
//! per-zone regions; zone Z's region holds the entries for the slabs Z owns (slab S lives in zone
//! S mod zone_count, at index S div zone_count within the region), and only zone Z's thread ever
//! writes it.
//!
//! An entry is 7 bytes: a little-endian u16 tail block offset, one flags byte (bit 0:
//! load_ref_counts, bit 1: is_clean, bits 2..=7: a six-bit free-block hint), and four reserved
//! bytes.  585 entries fit in a 4 KiB summary block.

use {
    crate::{
        device::{read_block_with_retry, Device, BLOCK_SIZE},
        errors::FxDedupError,
    },
    anyhow::{Context, Error},
    byteorder::{ByteOrder, LittleEndian},
    static_assertions::const_assert,
    std::collections::BTreeSet,
};

const ENTRY_SIZE: usize = 7;
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / ENTRY_SIZE;

/// Every zone's summary region is this many blocks, giving room for `MAX_SLABS` entries however
/// the slabs divide among zones.
pub const SUMMARY_BLOCKS_PER_ZONE: u64 = 7;

/// The most slabs a depot may have; bounded by the fixed summary geometry.
pub const MAX_SLABS: u64 = (SUMMARY_BLOCKS_PER_ZONE * ENTRIES_PER_BLOCK as u64) - 1;

const_assert!(ENTRIES_PER_BLOCK == 585);

const LOAD_REF_COUNTS_FLAG: u8 = 1 << 0;
const IS_CLEAN_FLAG: u8 = 1 << 1;
const HINT_SHIFT_IN_FLAGS: u32 = 2;
const MAX_FREE_BLOCKS_HINT: u64 = 63;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SlabSummaryEntry {
    /// Where the newest slab journal block lives within the journal region.
    pub tail_block_offset: u16,

    /// Whether the slab's ref-counts have ever been written (and so must be read at load).  A
    /// clean slab without this flag has never been touched: all of its blocks are free.
    pub load_ref_counts: bool,

    /// Whether the on-disk ref-counts reflect every journal entry.
    pub is_clean: bool,

    /// Approximate free-block count, scaled by the zone's hint shift.
    pub free_blocks_hint: u8,
}

impl SlabSummaryEntry {
    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.tail_block_offset);
        let mut flags = (self.free_blocks_hint as u8) << HINT_SHIFT_IN_FLAGS;
        if self.load_ref_counts {
            flags |= LOAD_REF_COUNTS_FLAG;
        }
        if self.is_clean {
            flags |= IS_CLEAN_FLAG;
        }
        buf[2] = flags;
        buf[3..ENTRY_SIZE].fill(0);
    }

    fn decode(buf: &[u8]) -> Self {
        let flags = buf[2];
        SlabSummaryEntry {
            tail_block_offset: LittleEndian::read_u16(&buf[0..2]),
            load_ref_counts: flags & LOAD_REF_COUNTS_FLAG != 0,
            is_clean: flags & IS_CLEAN_FLAG != 0,
            free_blocks_hint: flags >> HINT_SHIFT_IN_FLAGS,
        }
    }
}

/// The status of one slab as reported by the summary at load time.
#[derive(Clone, Copy, Debug)]
pub struct SlabStatus {
    pub slab_number: u64,
    pub is_clean: bool,
    pub load_ref_counts: bool,
    pub emptiness: u8,
    pub tail_block_offset: u16,
}

/// One zone's view of the summary.
pub struct SlabSummaryZone {
    zone: u8,
    zone_count: u8,

    // The first block of this zone's region of the summary partition.
    origin: u64,

    entries: Vec<SlabSummaryEntry>,

    // Blocks within the region with un-flushed updates.  Updates are coalesced: many entry
    // updates to one block produce one write when the zone next flushes.
    dirty_blocks: BTreeSet<u64>,

    // How far free-block counts are shifted down to fit the six-bit hint.
    hint_shift: u32,
}

impl SlabSummaryZone {
    pub fn new(zone: u8, zone_count: u8, summary_origin: u64, data_blocks_per_slab: u64) -> Self {
        SlabSummaryZone {
            zone,
            zone_count,
            origin: summary_origin + zone as u64 * SUMMARY_BLOCKS_PER_ZONE,
            entries: vec![SlabSummaryEntry::default(); MAX_SLABS as usize + 1],
            dirty_blocks: BTreeSet::new(),
            hint_shift: hint_shift(data_blocks_per_slab),
        }
    }

    fn index_for(&self, slab_number: u64) -> usize {
        assert_eq!((slab_number % self.zone_count as u64) as u8, self.zone);
        (slab_number / self.zone_count as u64) as usize
    }

    pub fn free_blocks_hint(&self, free_blocks: u64) -> u8 {
        std::cmp::min(free_blocks >> self.hint_shift, MAX_FREE_BLOCKS_HINT) as u8
    }

    /// Records new state for a slab.  The write happens at the zone's next flush; updates to the
    /// same summary block coalesce.
    pub fn update(
        &mut self,
        slab_number: u64,
        tail_block_offset: u16,
        load_ref_counts: bool,
        is_clean: bool,
        free_blocks: u64,
    ) {
        let index = self.index_for(slab_number);
        self.entries[index] = SlabSummaryEntry {
            tail_block_offset,
            load_ref_counts,
            is_clean,
            free_blocks_hint: self.free_blocks_hint(free_blocks),
        };
        self.dirty_blocks.insert((index / ENTRIES_PER_BLOCK) as u64);
    }

    pub fn entry(&self, slab_number: u64) -> SlabSummaryEntry {
        self.entries[self.index_for(slab_number)]
    }

    /// Writes out all blocks with pending updates.  A block stays marked dirty until its write
    /// succeeds, so a failed flush can be retried.
    pub async fn flush(&mut self, device: &dyn Device, buf: &mut [u8]) -> Result<(), Error> {
        assert_eq!(buf.len(), BLOCK_SIZE);
        let dirty: Vec<u64> = self.dirty_blocks.iter().copied().collect();
        for block in dirty {
            buf.fill(0);
            let first_entry = block as usize * ENTRIES_PER_BLOCK;
            let last_entry = std::cmp::min(first_entry + ENTRIES_PER_BLOCK, self.entries.len());
            for (i, entry) in self.entries[first_entry..last_entry].iter().enumerate() {
                entry.encode(&mut buf[i * ENTRY_SIZE..]);
            }
            device
                .write_block(self.origin + block, buf)
                .await
                .map_err(|_| FxDedupError::Io)
                .context("Failed to write slab summary block")?;
            self.dirty_blocks.remove(&block);
        }
        Ok(())
    }

    /// Reads the zone's region back from the device, replacing the in-memory entries.
    pub async fn load(&mut self, device: &dyn Device, buf: &mut [u8]) -> Result<(), Error> {
        for block in 0..SUMMARY_BLOCKS_PER_ZONE {
            read_block_with_retry(device, self.origin + block, buf).await?;
            let first_entry = block as usize * ENTRIES_PER_BLOCK;
            let last_entry = std::cmp::min(first_entry + ENTRIES_PER_BLOCK, self.entries.len());
            for index in first_entry..last_entry {
                self.entries[index] =
                    SlabSummaryEntry::decode(&buf[(index - first_entry) * ENTRY_SIZE..]);
            }
        }
        self.dirty_blocks.clear();
        Ok(())
    }

    /// The statuses of this zone's first |slab_count_in_zone| slabs, for load-time sorting.
    pub fn statuses(&self, slab_count_in_zone: u64) -> Vec<SlabStatus> {
        (0..slab_count_in_zone)
            .map(|index| {
                let entry = &self.entries[index as usize];
                SlabStatus {
                    slab_number: index * self.zone_count as u64 + self.zone as u64,
                    is_clean: entry.is_clean,
                    load_ref_counts: entry.load_ref_counts,
                    emptiness: entry.free_blocks_hint,
                    tail_block_offset: entry.tail_block_offset,
                }
            })
            .collect()
    }

    pub fn has_dirty_blocks(&self) -> bool {
        !self.dirty_blocks.is_empty()
    }
}

/// Computes the shift that scales a slab's largest possible free count into six bits.
fn hint_shift(data_blocks_per_slab: u64) -> u32 {
    let bits = u64::BITS - data_blocks_per_slab.leading_zeros();
    bits.saturating_sub(6)
}

#[cfg(test)]
mod tests {
    use {
        super::{SlabSummaryEntry, SlabSummaryZone, ENTRIES_PER_BLOCK},
        crate::testing::fake_device::FakeDevice,
        futures::executor::block_on,
    };

    #[test]
    fn test_entry_codec_round_trip() {
        let entry = SlabSummaryEntry {
            tail_block_offset: 0x1234,
            load_ref_counts: true,
            is_clean: false,
            free_blocks_hint: 63,
        };
        let mut buf = [0u8; 7];
        entry.encode(&mut buf);
        assert_eq!(SlabSummaryEntry::decode(&buf), entry);

        let entry = SlabSummaryEntry {
            tail_block_offset: 0,
            load_ref_counts: false,
            is_clean: true,
            free_blocks_hint: 1,
        };
        entry.encode(&mut buf);
        assert_eq!(SlabSummaryEntry::decode(&buf), entry);
    }

    #[test]
    fn test_hint_shift() {
        // Small slabs get exact hints.
        assert_eq!(super::hint_shift(8), 0);
        assert_eq!(super::hint_shift(63), 0);
        // Larger slabs scale down to six bits.
        assert_eq!(super::hint_shift(64), 1);
        assert_eq!(super::hint_shift(1 << 23), 18);
    }

    #[test]
    fn test_update_flush_load_round_trip() {
        block_on(async {
            let device = FakeDevice::new(64);
            let mut buf = vec![0u8; crate::device::BLOCK_SIZE];
            // Two zones; zone 1's region starts after zone 0's.
            let mut zone = SlabSummaryZone::new(1, 2, 0, 100);
            // Slab 5 is in zone 1 (5 mod 2), local index 2.
            zone.update(5, 3, true, false, 77);
            // A second update to the same slab coalesces.
            zone.update(5, 4, true, true, 60);
            zone.update(1, 0, false, true, 100);
            assert!(zone.has_dirty_blocks());
            zone.flush(&device, &mut buf).await.expect("flush failed");
            assert!(!zone.has_dirty_blocks());

            let mut reloaded = SlabSummaryZone::new(1, 2, 0, 100);
            reloaded.load(&device, &mut buf).await.expect("load failed");
            let entry = reloaded.entry(5);
            assert_eq!(entry.tail_block_offset, 4);
            assert!(entry.is_clean);
            assert!(entry.load_ref_counts);
            assert_eq!(entry.free_blocks_hint, 60);

            let statuses = reloaded.statuses(3);
            assert_eq!(statuses.len(), 3);
            assert_eq!(statuses[0].slab_number, 1);
            assert_eq!(statuses[1].slab_number, 3);
            assert_eq!(statuses[2].slab_number, 5);
            assert!(statuses[0].is_clean);
            assert_eq!(statuses[2].emptiness, 60);
        });
    }

    #[test]
    fn test_zone_regions_do_not_overlap() {
        block_on(async {
            let device = FakeDevice::new(64);
            let mut buf = vec![0u8; crate::device::BLOCK_SIZE];
            let mut zone0 = SlabSummaryZone::new(0, 2, 0, 100);
            let mut zone1 = SlabSummaryZone::new(1, 2, 0, 100);
            zone0.update(0, 1, true, true, 1);
            zone1.update(1, 2, true, true, 2);
            zone0.flush(&device, &mut buf).await.expect("flush failed");
            zone1.flush(&device, &mut buf).await.expect("flush failed");

            let mut reloaded0 = SlabSummaryZone::new(0, 2, 0, 100);
            let mut reloaded1 = SlabSummaryZone::new(1, 2, 0, 100);
            reloaded0.load(&device, &mut buf).await.expect("load failed");
            reloaded1.load(&device, &mut buf).await.expect("load failed");
            assert_eq!(reloaded0.entry(0).tail_block_offset, 1);
            assert_eq!(reloaded1.entry(1).tail_block_offset, 2);
        });
    }

    #[test]
    fn test_many_entries_fill_multiple_blocks() {
        block_on(async {
            let device = FakeDevice::new(64);
            let mut buf = vec![0u8; crate::device::BLOCK_SIZE];
            let mut zone = SlabSummaryZone::new(0, 1, 0, 8);
            // Touch an entry beyond the first summary block.
            let far_slab = (ENTRIES_PER_BLOCK + 10) as u64;
            zone.update(far_slab, 7, true, false, 3);
            zone.flush(&device, &mut buf).await.expect("flush failed");
            let mut reloaded = SlabSummaryZone::new(0, 1, 0, 8);
            reloaded.load(&device, &mut buf).await.expect("load failed");
            assert_eq!(reloaded.entry(far_slab).tail_block_offset, 7);
        });
    }
}
