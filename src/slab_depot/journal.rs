// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-slab journal: a fixed-size circular log of reference-count mutations.  Every mutation
//! is appended here before the in-memory counter changes, so a crash can always be repaired by
//! replaying the journal over the last-written counters.
//!
//! Blocks are addressed by a monotonically increasing sequence number; sequence N lives at
//! journal block `N mod size`.  Each block carries the head sequence at the time it was written,
//! a nonce tying it to this depot, and a trailing fletcher64 checksum so a torn tail write reads
//! as absent rather than as garbage entries.  A dirty tail block holds a lock against the
//! recovery journal at the oldest recovery sequence any of its entries references; the lock is
//! released only once the block is committed and the summary reflects it.

use {
    crate::{
        checksum::{fletcher64, Checksum},
        device::{read_block_with_retry, Device, BLOCK_SIZE},
        errors::FxDedupError,
    },
    anyhow::{ensure, Context, Error},
    byteorder::{ByteOrder, LittleEndian},
};

const SLAB_JOURNAL_BLOCK_MAGIC: u32 = 0x626a_7366; // "fsjb"
const BLOCK_HEADER_SIZE: usize = 32;
const ENTRY_SIZE: usize = 16;

/// Entries per journal block, leaving room for the header and the trailing checksum.
pub const ENTRIES_PER_BLOCK: usize =
    (BLOCK_SIZE - BLOCK_HEADER_SIZE - std::mem::size_of::<Checksum>()) / ENTRY_SIZE;

const PBN_MASK: u64 = (1 << 60) - 1;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JournalOp {
    Increment,
    Decrement,
    BlockMapIncrement,
}

impl JournalOp {
    fn to_code(self) -> u64 {
        match self {
            JournalOp::Increment => 0,
            JournalOp::Decrement => 1,
            JournalOp::BlockMapIncrement => 2,
        }
    }

    fn from_code(code: u64) -> Result<Self, Error> {
        match code {
            0 => Ok(JournalOp::Increment),
            1 => Ok(JournalOp::Decrement),
            2 => Ok(JournalOp::BlockMapIncrement),
            _ => Err(FxDedupError::Inconsistent)
                .with_context(|| format!("Unknown journal op code {}", code)),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlabJournalEntry {
    pub op: JournalOp,

    /// The physical block the mutation applies to.  Packed into 60 bits on disk.
    pub pbn: u64,

    /// The recovery journal sequence current when the mutation was made.
    pub recovery_sequence: u64,
}

/// A journal block as read back from disk during scrubbing or load.
#[derive(Debug)]
pub struct DecodedBlock {
    pub sequence: u64,
    pub head: u64,
    pub entries: Vec<SlabJournalEntry>,
}

pub struct SlabJournal {
    // First block of the journal region on the device.
    origin: u64,

    // Number of blocks in the circular region.
    size: u64,

    nonce: u64,

    // The oldest sequence whose entries are not yet reflected in the on-disk ref-counts.
    head: u64,

    // The sequence number the current (dirty or empty) tail block will be written with.
    tail: u64,

    // Entries accumulated for the tail block but not yet committed.
    tail_entries: Vec<SlabJournalEntry>,

    // Oldest recovery sequence referenced by the dirty tail block.
    recovery_lock: Option<u64>,

    // True until the first entry is ever appended (in this run or any earlier one).
    blank: bool,
}

impl SlabJournal {
    /// A journal for a slab that has never been written.
    pub fn new(origin: u64, size: u64, nonce: u64) -> Self {
        SlabJournal {
            origin,
            size,
            nonce,
            head: 1,
            tail: 1,
            tail_entries: Vec::new(),
            recovery_lock: None,
            blank: true,
        }
    }

    /// Re-creates the in-memory state for a journal with on-disk history: everything through
    /// |last_sequence| is reflected in ref-counts, and appends continue after it.
    pub fn open_at(origin: u64, size: u64, nonce: u64, last_sequence: u64) -> Self {
        SlabJournal {
            origin,
            size,
            nonce,
            head: last_sequence + 1,
            tail: last_sequence + 1,
            tail_entries: Vec::new(),
            recovery_lock: None,
            blank: false,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.blank
    }

    pub fn is_dirty(&self) -> bool {
        !self.tail_entries.is_empty()
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    /// The on-disk position of the most recently committed block; what the summary records so
    /// load can find the newest block without scanning.
    pub fn tail_block_offset(&self) -> u16 {
        (self.tail.saturating_sub(1) % self.size) as u16
    }

    /// Blocks of journal space in use, counting the dirty tail.
    pub fn blocks_in_use(&self) -> u64 {
        self.tail - self.head + if self.tail_entries.is_empty() { 0 } else { 1 }
    }

    /// Whether an append would need journal space that reclaim has not freed yet.
    pub fn is_at_threshold(&self, threshold: u64) -> bool {
        self.blocks_in_use() >= threshold
    }

    pub fn tail_is_full(&self) -> bool {
        self.tail_entries.len() >= ENTRIES_PER_BLOCK
    }

    /// The recovery-journal lock held by the dirty tail block, if any.
    pub fn recovery_lock(&self) -> Option<u64> {
        self.recovery_lock
    }

    /// Appends an entry to the tail block.  The caller is responsible for committing the tail
    /// first if it is full, and for respecting the blocking threshold.
    pub fn append(&mut self, entry: SlabJournalEntry) {
        assert!(!self.tail_is_full(), "appending to a full tail block");
        assert!(entry.pbn <= PBN_MASK);
        self.blank = false;
        self.recovery_lock = Some(match self.recovery_lock {
            None => entry.recovery_sequence,
            Some(lock) => std::cmp::min(lock, entry.recovery_sequence),
        });
        self.tail_entries.push(entry);
    }

    /// Writes the dirty tail block to the device and opens a fresh tail.  The caller must update
    /// the summary afterwards and then drop the recovery lock via `release_recovery_lock`.  There
    /// is never more than one tail write in flight because the zone processes one operation at a
    /// time.
    pub async fn commit_tail(&mut self, device: &dyn Device, buf: &mut [u8]) -> Result<(), Error> {
        assert!(self.is_dirty(), "committing an empty tail block");
        self.encode_tail_block(buf);
        let position = self.origin + self.tail % self.size;
        device
            .write_block(position, buf)
            .await
            .map_err(|_| FxDedupError::Io)
            .context("Failed to write slab journal block")?;
        self.tail += 1;
        self.tail_entries.clear();
        Ok(())
    }

    /// Releases the tail block's recovery-journal lock; called once the committed block is
    /// reflected in the summary.
    pub fn release_recovery_lock(&mut self) {
        self.recovery_lock = None;
    }

    /// Notes that the on-disk ref-counts now reflect every entry below |journal_point|, allowing
    /// the circle to reuse those blocks.
    pub fn reclaim(&mut self, journal_point: u64) {
        assert!(journal_point <= self.tail);
        self.head = std::cmp::max(self.head, journal_point);
    }

    fn encode_tail_block(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), BLOCK_SIZE);
        buf.fill(0);
        LittleEndian::write_u32(&mut buf[0..4], SLAB_JOURNAL_BLOCK_MAGIC);
        LittleEndian::write_u64(&mut buf[4..12], self.nonce);
        LittleEndian::write_u64(&mut buf[12..20], self.tail);
        LittleEndian::write_u64(&mut buf[20..28], self.head);
        LittleEndian::write_u16(&mut buf[28..30], (self.tail % self.size) as u16);
        LittleEndian::write_u16(&mut buf[30..32], self.tail_entries.len() as u16);
        for (i, entry) in self.tail_entries.iter().enumerate() {
            let offset = BLOCK_HEADER_SIZE + i * ENTRY_SIZE;
            LittleEndian::write_u64(
                &mut buf[offset..offset + 8],
                (entry.op.to_code() << 60) | entry.pbn,
            );
            LittleEndian::write_u64(&mut buf[offset + 8..offset + 16], entry.recovery_sequence);
        }
        let checksum_offset = BLOCK_SIZE - std::mem::size_of::<Checksum>();
        let checksum = fletcher64(&buf[..checksum_offset], self.nonce);
        LittleEndian::write_u64(&mut buf[checksum_offset..], checksum);
    }

    /// Reads and validates the journal block holding |sequence|.  Returns None if the slot does
    /// not hold that sequence (it is blank, stale, or torn), which readers treat as the end of
    /// the journal.
    pub async fn read_block(
        &self,
        device: &dyn Device,
        sequence: u64,
        buf: &mut [u8],
    ) -> Result<Option<DecodedBlock>, Error> {
        read_block_with_retry(device, self.origin + sequence % self.size, buf).await?;
        Self::decode_block(buf, self.nonce, sequence)
    }

    fn decode_block(
        buf: &[u8],
        nonce: u64,
        expected_sequence: u64,
    ) -> Result<Option<DecodedBlock>, Error> {
        if LittleEndian::read_u32(&buf[0..4]) != SLAB_JOURNAL_BLOCK_MAGIC
            || LittleEndian::read_u64(&buf[4..12]) != nonce
        {
            return Ok(None);
        }
        let checksum_offset = BLOCK_SIZE - std::mem::size_of::<Checksum>();
        if LittleEndian::read_u64(&buf[checksum_offset..])
            != fletcher64(&buf[..checksum_offset], nonce)
        {
            return Ok(None);
        }
        let sequence = LittleEndian::read_u64(&buf[12..20]);
        if sequence != expected_sequence {
            return Ok(None);
        }
        let head = LittleEndian::read_u64(&buf[20..28]);
        let entry_count = LittleEndian::read_u16(&buf[30..32]) as usize;
        ensure!(entry_count <= ENTRIES_PER_BLOCK, FxDedupError::Inconsistent);
        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let offset = BLOCK_HEADER_SIZE + i * ENTRY_SIZE;
            let packed = LittleEndian::read_u64(&buf[offset..offset + 8]);
            entries.push(SlabJournalEntry {
                op: JournalOp::from_code(packed >> 60)?,
                pbn: packed & PBN_MASK,
                recovery_sequence: LittleEndian::read_u64(&buf[offset + 8..offset + 16]),
            });
        }
        Ok(Some(DecodedBlock { sequence, head, entries }))
    }

    /// Finds the newest valid block on disk, starting the search at the summary's tail hint and
    /// following sequence numbers forward.  Returns None for a blank journal.
    pub async fn find_tail_on_disk(
        &self,
        device: &dyn Device,
        tail_hint: u16,
        buf: &mut [u8],
    ) -> Result<Option<DecodedBlock>, Error> {
        // The hinted slot holds the newest block unless a tail write raced the summary update, in
        // which case successors may be newer; scan forward until the chain breaks.
        let hint = tail_hint as u64 % self.size;
        read_block_with_retry(device, self.origin + hint, buf).await?;
        let mut newest = match Self::decode_block_at_any_sequence(buf, self.nonce)? {
            Some(block) => block,
            None => return self.scan_for_tail(device, buf).await,
        };
        loop {
            match self.read_block(device, newest.sequence + 1, buf).await? {
                Some(block) => newest = block,
                None => return Ok(Some(newest)),
            }
        }
    }

    // Fallback when the summary hint points at an invalid slot: examine every slot.
    async fn scan_for_tail(
        &self,
        device: &dyn Device,
        buf: &mut [u8],
    ) -> Result<Option<DecodedBlock>, Error> {
        let mut newest: Option<DecodedBlock> = None;
        for slot in 0..self.size {
            read_block_with_retry(device, self.origin + slot, buf).await?;
            if let Some(block) = Self::decode_block_at_any_sequence(buf, self.nonce)? {
                if newest.as_ref().map(|n| block.sequence > n.sequence).unwrap_or(true) {
                    newest = Some(block);
                }
            }
        }
        Ok(newest)
    }

    fn decode_block_at_any_sequence(
        buf: &[u8],
        nonce: u64,
    ) -> Result<Option<DecodedBlock>, Error> {
        if LittleEndian::read_u32(&buf[0..4]) != SLAB_JOURNAL_BLOCK_MAGIC {
            return Ok(None);
        }
        let sequence = LittleEndian::read_u64(&buf[12..20]);
        Self::decode_block(buf, nonce, sequence)
    }

    /// Erases the journal region on disk.  Used by rebuild loads, which discard all journal
    /// history before reconstructing ref-counts from the block map.
    pub async fn erase(&mut self, device: &dyn Device, buf: &mut [u8]) -> Result<(), Error> {
        buf.fill(0);
        for slot in 0..self.size {
            device
                .write_block(self.origin + slot, buf)
                .await
                .map_err(|_| FxDedupError::Io)
                .context("Failed to erase slab journal block")?;
        }
        self.head = 1;
        self.tail = 1;
        self.tail_entries.clear();
        self.recovery_lock = None;
        self.blank = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::{JournalOp, SlabJournal, SlabJournalEntry, ENTRIES_PER_BLOCK},
        crate::testing::fake_device::FakeDevice,
        futures::executor::block_on,
    };

    const NONCE: u64 = 0x1122_3344_5566_7788;

    fn entry(pbn: u64, recovery_sequence: u64) -> SlabJournalEntry {
        SlabJournalEntry { op: JournalOp::Increment, pbn, recovery_sequence }
    }

    fn buf() -> Vec<u8> {
        vec![0u8; crate::device::BLOCK_SIZE]
    }

    #[test]
    fn test_entries_per_block() {
        assert_eq!(ENTRIES_PER_BLOCK, 253);
    }

    #[test]
    fn test_blankness() {
        let mut journal = SlabJournal::new(0, 8, NONCE);
        assert!(journal.is_blank());
        journal.append(entry(1, 1));
        assert!(!journal.is_blank());
        assert!(journal.is_dirty());
    }

    #[test]
    fn test_commit_round_trip() {
        block_on(async {
            let device = FakeDevice::new(8);
            let mut journal = SlabJournal::new(0, 8, NONCE);
            journal.append(SlabJournalEntry {
                op: JournalOp::Increment,
                pbn: 0xabc,
                recovery_sequence: 5,
            });
            journal.append(SlabJournalEntry {
                op: JournalOp::Decrement,
                pbn: (1 << 60) - 1,
                recovery_sequence: 6,
            });
            journal.append(SlabJournalEntry {
                op: JournalOp::BlockMapIncrement,
                pbn: 7,
                recovery_sequence: 6,
            });
            assert_eq!(journal.recovery_lock(), Some(5));
            let mut buf = buf();
            journal.commit_tail(&device, &mut buf).await.expect("commit failed");
            journal.release_recovery_lock();
            assert_eq!(journal.tail(), 2);
            assert!(!journal.is_dirty());

            let block = journal
                .read_block(&device, 1, &mut buf)
                .await
                .expect("read failed")
                .expect("no block");
            assert_eq!(block.sequence, 1);
            assert_eq!(block.head, 1);
            assert_eq!(block.entries.len(), 3);
            assert_eq!(block.entries[0].pbn, 0xabc);
            assert_eq!(block.entries[0].op, JournalOp::Increment);
            assert_eq!(block.entries[1].pbn, (1 << 60) - 1);
            assert_eq!(block.entries[1].op, JournalOp::Decrement);
            assert_eq!(block.entries[2].op, JournalOp::BlockMapIncrement);
        });
    }

    #[test]
    fn test_unwritten_slot_reads_as_absent() {
        block_on(async {
            let device = FakeDevice::new(8);
            let journal = SlabJournal::new(0, 8, NONCE);
            assert!(journal
                .read_block(&device, 1, &mut buf())
                .await
                .expect("read failed")
                .is_none());
        });
    }

    #[test]
    fn test_torn_write_reads_as_absent() {
        block_on(async {
            let device = FakeDevice::new(8);
            let mut journal = SlabJournal::new(0, 8, NONCE);
            journal.append(entry(1, 1));
            let mut buf = buf();
            journal.commit_tail(&device, &mut buf).await.expect("commit failed");

            // Corrupt a byte in the middle of the block; the checksum no longer matches.
            use crate::device::Device;
            device.read_block(1 % 8, &mut buf).await.expect("read failed");
            buf[100] ^= 0xff;
            device.write_block(1 % 8, &buf).await.expect("write failed");

            assert!(journal.read_block(&device, 1, &mut buf).await.expect("read failed").is_none());
        });
    }

    #[test]
    fn test_circular_reuse_and_reclaim() {
        block_on(async {
            let device = FakeDevice::new(4);
            let mut journal = SlabJournal::new(0, 4, NONCE);
            let mut buf = buf();
            for sequence in 1..=9u64 {
                journal.append(entry(sequence, sequence));
                journal.commit_tail(&device, &mut buf).await.expect("commit failed");
                journal.release_recovery_lock();
                journal.reclaim(sequence + 1);
            }
            assert_eq!(journal.tail(), 10);
            assert_eq!(journal.head(), 10);
            // Sequence 9 lives at slot 1 and replaced sequence 5.
            let block = journal
                .read_block(&device, 9, &mut buf)
                .await
                .expect("read failed")
                .expect("no block");
            assert_eq!(block.entries[0].pbn, 9);
            assert!(journal.read_block(&device, 5, &mut buf).await.expect("read failed").is_none());
        });
    }

    #[test]
    fn test_find_tail_with_stale_hint() {
        block_on(async {
            let device = FakeDevice::new(4);
            let mut journal = SlabJournal::new(0, 4, NONCE);
            let mut buf = buf();
            for sequence in 1..=3u64 {
                journal.append(entry(sequence, sequence));
                journal.commit_tail(&device, &mut buf).await.expect("commit failed");
                journal.reclaim(sequence + 1);
            }
            // The hint lags behind the true tail; the forward chain still finds sequence 3.
            let newest = journal
                .find_tail_on_disk(&device, 1, &mut buf)
                .await
                .expect("find failed")
                .expect("no tail found");
            assert_eq!(newest.sequence, 3);
        });
    }

    #[test]
    fn test_erase() {
        block_on(async {
            let device = FakeDevice::new(4);
            let mut journal = SlabJournal::new(0, 4, NONCE);
            let mut buf = buf();
            journal.append(entry(1, 1));
            journal.commit_tail(&device, &mut buf).await.expect("commit failed");
            journal.erase(&device, &mut buf).await.expect("erase failed");
            assert!(journal.is_blank());
            assert!(journal
                .find_tail_on_disk(&device, 0, &mut buf)
                .await
                .expect("find failed")
                .is_none());
        });
    }
}
