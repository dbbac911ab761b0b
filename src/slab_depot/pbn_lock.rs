// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-zone locks on physical block numbers.  A lock exists only while some write-path operation
//! is working on the block; the pool hands out indices into a dense array recycled through a free
//! list, with a map from PBN to live lock.  Zones own disjoint PBN ranges so there is no
//! cross-zone locking.

use {
    crate::errors::FxDedupError,
    anyhow::Error,
    std::collections::HashMap,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PbnLockType {
    /// Held by a write that allocated the block.  Conflicts with every other lock.
    WriteNew,

    /// Held by a write placing data into a compressed block.  Conflicts with writers but shares
    /// with readers.
    CompressedWrite,

    /// Held by a read.  Shares with other reads and with block-map traversal.
    Read,

    /// Held by block-map traversal.
    BlockMap,
}

impl PbnLockType {
    fn conflicts_with(&self, other: PbnLockType) -> bool {
        match (self, other) {
            (PbnLockType::WriteNew, _) | (_, PbnLockType::WriteNew) => true,
            (PbnLockType::CompressedWrite, PbnLockType::CompressedWrite) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct PbnLock {
    lock_type: PbnLockType,
    holder_count: u32,

    // Whether this lock holds the provisional reference taken when its block was allocated.  The
    // reference is a bit on the lock, not a counter: a lock holds at most one.
    provisional_reference: bool,
}

impl PbnLock {
    pub fn lock_type(&self) -> PbnLockType {
        self.lock_type
    }

    pub fn has_provisional_reference(&self) -> bool {
        self.provisional_reference
    }
}

/// What `release` observed; if the lock still held its provisional reference the caller must
/// return that reservation to the slab.
#[derive(Debug, Eq, PartialEq)]
pub enum LockRelease {
    SharersRemain,
    Released { provisional_reference: bool },
}

pub struct PbnLockPool {
    locks: Vec<PbnLock>,
    free_list: Vec<usize>,
    by_pbn: HashMap<u64, usize>,
    capacity: usize,
}

impl PbnLockPool {
    pub fn new(capacity: usize) -> Self {
        PbnLockPool {
            locks: Vec::new(),
            free_list: Vec::new(),
            by_pbn: HashMap::new(),
            capacity,
        }
    }

    /// Attempts to take a lock of |lock_type| on |pbn|.  Returns `Some(true)` if a new lock was
    /// created, `Some(false)` if an existing compatible lock was shared, and `None` on conflict
    /// (what a conflict means is the caller's business; on a freshly allocated block it is a
    /// `LockInvariant` violation).  Fails with `OutOfMemory` when the pool is exhausted.
    pub fn attempt_acquire(
        &mut self,
        pbn: u64,
        lock_type: PbnLockType,
    ) -> Result<Option<bool>, Error> {
        if let Some(&index) = self.by_pbn.get(&pbn) {
            let lock = &mut self.locks[index];
            if lock.lock_type.conflicts_with(lock_type) {
                return Ok(None);
            }
            lock.holder_count += 1;
            return Ok(Some(false));
        }
        let index = match self.free_list.pop() {
            Some(index) => {
                self.locks[index] =
                    PbnLock { lock_type, holder_count: 1, provisional_reference: false };
                index
            }
            None => {
                if self.locks.len() >= self.capacity {
                    return Err(FxDedupError::OutOfMemory.into());
                }
                self.locks.push(PbnLock {
                    lock_type,
                    holder_count: 1,
                    provisional_reference: false,
                });
                self.locks.len() - 1
            }
        };
        self.by_pbn.insert(pbn, index);
        Ok(Some(true))
    }

    /// Releases one holder of the lock on |pbn|.
    pub fn release(&mut self, pbn: u64) -> LockRelease {
        let index = *self.by_pbn.get(&pbn).expect("releasing a lock that is not held");
        let lock = &mut self.locks[index];
        assert!(lock.holder_count > 0);
        lock.holder_count -= 1;
        if lock.holder_count > 0 {
            return LockRelease::SharersRemain;
        }
        let provisional_reference = lock.provisional_reference;
        lock.provisional_reference = false;
        self.by_pbn.remove(&pbn);
        self.free_list.push(index);
        LockRelease::Released { provisional_reference }
    }

    pub fn get(&self, pbn: u64) -> Option<&PbnLock> {
        self.by_pbn.get(&pbn).map(|&index| &self.locks[index])
    }

    pub fn assign_provisional_reference(&mut self, pbn: u64) {
        let index = *self.by_pbn.get(&pbn).expect("no lock to assign a provisional reference");
        self.locks[index].provisional_reference = true;
    }

    /// Clears the provisional reference bit, returning whether it was set.  Used on commit, when
    /// the reservation becomes a real reference and is no longer the lock's to roll back.
    pub fn clear_provisional_reference(&mut self, pbn: u64) -> bool {
        match self.by_pbn.get(&pbn) {
            Some(&index) => std::mem::replace(&mut self.locks[index].provisional_reference, false),
            None => false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.by_pbn.is_empty()
    }
}
