// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The persistent component state for the slab depot.  This is the piece of the outer super-block
//! the depot owns: the slab geometry, the managed block range, and the zone count.  Everything
//! else (slab positions, journal origins, summary offsets) is computed from these values; no
//! per-slab pointers are ever stored.

use {
    anyhow::{ensure, Context, Error},
    serde::{Deserialize, Serialize},
};

/// The geometry shared by every slab in a depot.  All counts are in blocks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SlabConfig {
    /// Total blocks per slab: data blocks followed by ref-count blocks followed by journal
    /// blocks.
    pub slab_blocks: u64,

    /// The number of allocatable data blocks at the start of each slab.
    pub data_blocks: u64,

    /// Blocks holding the slab's reference counters.
    pub ref_count_blocks: u64,

    /// Blocks in the slab's circular journal.
    pub slab_journal_blocks: u64,

    /// When the journal has this many unreclaimed blocks, the allocator writes the slab's
    /// ref-counts so the journal head can advance.
    pub slab_journal_flushing_threshold: u64,

    /// Appends are not allowed to push tail - head past this value.
    pub slab_journal_blocking_threshold: u64,

    /// A loaded slab whose journal is longer than this is scrubbed at high priority.
    pub slab_journal_scrubbing_threshold: u64,
}

impl SlabConfig {
    /// Validates internal consistency of the geometry.
    pub fn validate(&self) -> Result<(), Error> {
        ensure!(self.slab_blocks > 0, "slab_blocks must be non-zero");
        ensure!(self.data_blocks > 0, "slab must have data blocks");
        ensure!(
            self.data_blocks + self.ref_count_blocks + self.slab_journal_blocks
                == self.slab_blocks,
            "slab geometry does not sum to slab_blocks"
        );
        ensure!(self.slab_journal_blocks >= 2, "slab journal must have at least two blocks");
        ensure!(
            self.slab_journal_blocking_threshold <= self.slab_journal_blocks
                && self.slab_journal_flushing_threshold <= self.slab_journal_blocking_threshold,
            "slab journal thresholds out of order"
        );
        Ok(())
    }
}

/// The on-disk state record for a slab depot, version 2.0.  Serialized little-endian with fixed
/// width integers in field order, which is exactly what bincode's default configuration produces.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SlabDepotState {
    pub slab_config: SlabConfig,
    pub first_block: u64,
    pub last_block: u64,
    pub zone_count: u8,
}

impl SlabDepotState {
    /// The number of complete slabs described by this state.
    pub fn slab_count(&self) -> u64 {
        (self.last_block - self.first_block) / self.slab_config.slab_blocks
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.slab_config.validate()?;
        ensure!(self.first_block < self.last_block, "depot block range is empty or inverted");
        ensure!(self.first_block > 0, "depot may not cover the zero block");
        ensure!(self.zone_count > 0, "depot must have at least one zone");
        ensure!(self.slab_count() > 0, "depot must contain at least one slab");
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        bincode::serialize(self).context("Failed to encode slab depot state")
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let state: SlabDepotState =
            bincode::deserialize(buf).context("Failed to decode slab depot state")?;
        state.validate()?;
        Ok(state)
    }
}

#[cfg(test)]
pub(crate) fn test_state(zone_count: u8, slabs_per_zone: u64, data_blocks: u64) -> SlabDepotState {
    // Small geometry used throughout the unit tests: an 8-block journal with low thresholds so
    // reclaim paths are exercised without huge devices.
    let slab_config = SlabConfig {
        slab_blocks: data_blocks + 1 + 8,
        data_blocks,
        ref_count_blocks: 1,
        slab_journal_blocks: 8,
        slab_journal_flushing_threshold: 4,
        slab_journal_blocking_threshold: 6,
        slab_journal_scrubbing_threshold: 3,
    };
    let first_block = 1;
    SlabDepotState {
        slab_config,
        first_block,
        last_block: first_block
            + zone_count as u64 * slabs_per_zone * slab_config.slab_blocks,
        zone_count,
    }
}

#[cfg(test)]
mod tests {
    use super::{SlabConfig, SlabDepotState};

    fn state() -> SlabDepotState {
        SlabDepotState {
            slab_config: SlabConfig {
                slab_blocks: 128,
                data_blocks: 100,
                ref_count_blocks: 4,
                slab_journal_blocks: 24,
                slab_journal_flushing_threshold: 12,
                slab_journal_blocking_threshold: 18,
                slab_journal_scrubbing_threshold: 8,
            },
            first_block: 64,
            last_block: 64 + 128 * 20,
            zone_count: 4,
        }
    }

    #[test]
    fn test_round_trip() {
        let state = state();
        let encoded = state.encode().expect("encode failed");
        let decoded = SlabDepotState::decode(&encoded).expect("decode failed");
        assert_eq!(decoded, state);
        assert_eq!(decoded.encode().expect("encode failed"), encoded);
    }

    #[test]
    fn test_layout_is_little_endian_fixed_width() {
        let encoded = state().encode().expect("encode failed");
        // Seven u64 config fields, first_block, last_block, and a single zone_count byte.
        assert_eq!(encoded.len(), 9 * 8 + 1);
        assert_eq!(&encoded[0..8], &128u64.to_le_bytes());
        assert_eq!(encoded[72], 4);
    }

    #[test]
    fn test_decode_rejects_bad_geometry() {
        let mut state = state();
        state.slab_config.data_blocks += 1;
        let encoded = bincode::serialize(&state).expect("serialize failed");
        SlabDepotState::decode(&encoded).expect_err("bad geometry should fail validation");
    }

    #[test]
    fn test_decode_rejects_dataless_slabs() {
        // A slab with no data blocks sums correctly but can never serve an allocation.
        let mut state = state();
        state.slab_config.ref_count_blocks += state.slab_config.data_blocks;
        state.slab_config.data_blocks = 0;
        let encoded = bincode::serialize(&state).expect("serialize failed");
        SlabDepotState::decode(&encoded).expect_err("dataless slabs should fail validation");
    }

    #[test]
    fn test_slab_count() {
        assert_eq!(state().slab_count(), 20);
    }
}
