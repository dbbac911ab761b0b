// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::device::{Device, BLOCK_SIZE},
    anyhow::{anyhow, ensure, Error},
    async_trait::async_trait,
    std::sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex,
    },
};

/// An in-memory device.  Contents survive "crashes" (dropping the depot without draining it) so
/// tests can exercise recovery: a test reopens a new depot over the same FakeDevice.
pub struct FakeDevice {
    blocks: Mutex<Vec<u8>>,
    block_count: u64,
    read_count: AtomicU64,
    write_count: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FakeDevice {
    pub fn new(block_count: u64) -> Self {
        FakeDevice {
            blocks: Mutex::new(vec![0u8; block_count as usize * BLOCK_SIZE]),
            block_count,
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes all subsequent reads (or writes) fail, for error-path tests.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    fn range(&self, pbn: u64, len: usize) -> Result<std::ops::Range<usize>, Error> {
        ensure!(len == BLOCK_SIZE, "transfer must be exactly one block");
        ensure!(pbn < self.block_count, "block {} out of range", pbn);
        let start = pbn as usize * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }
}

#[async_trait]
impl Device for FakeDevice {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    async fn read_block(&self, pbn: u64, buf: &mut [u8]) -> Result<(), Error> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("FakeDevice injected read failure"));
        }
        self.read_count.fetch_add(1, Ordering::SeqCst);
        let range = self.range(pbn, buf.len())?;
        buf.copy_from_slice(&self.blocks.lock().unwrap()[range]);
        Ok(())
    }

    async fn write_block(&self, pbn: u64, buf: &[u8]) -> Result<(), Error> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("FakeDevice injected write failure"));
        }
        self.write_count.fetch_add(1, Ordering::SeqCst);
        let range = self.range(pbn, buf.len())?;
        self.blocks.lock().unwrap()[range].copy_from_slice(buf);
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}
