// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{errors::FxDedupError, log::*},
    anyhow::{Context, Error},
    async_trait::async_trait,
};

/// The size of all metadata blocks the allocator core reads and writes.
pub const BLOCK_SIZE: usize = 4096;

/// The interface the allocator core uses for metadata I/O.  Offsets are physical block numbers on
/// the underlying device; all transfers are whole blocks of `BLOCK_SIZE` bytes.  Implementations
/// must tolerate concurrent calls from different zone threads (zones never touch each other's
/// blocks).
#[async_trait]
pub trait Device: Send + Sync {
    /// The number of addressable blocks.
    fn block_count(&self) -> u64;

    /// Reads the block at |pbn| into |buf|.  |buf| must be exactly `BLOCK_SIZE` bytes.
    async fn read_block(&self, pbn: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// Writes |buf| to the block at |pbn|.  |buf| must be exactly `BLOCK_SIZE` bytes.
    async fn write_block(&self, pbn: u64, buf: &[u8]) -> Result<(), Error>;

    /// Flushes the device's write cache.
    async fn flush(&self) -> Result<(), Error>;
}

/// Reads a metadata block, retrying once on failure.  Read errors are transient more often than
/// write errors, so a single retry is worthwhile before the failure is allowed to force read-only
/// mode.
pub async fn read_block_with_retry(
    device: &dyn Device,
    pbn: u64,
    buf: &mut [u8],
) -> Result<(), Error> {
    if let Err(e) = device.read_block(pbn, buf).await {
        warn!(error = ?e, pbn, "Metadata read failed; retrying");
        device
            .read_block(pbn, buf)
            .await
            .map_err(|_| FxDedupError::Io)
            .with_context(|| format!("Metadata read of block {} failed twice", pbn))?;
    }
    Ok(())
}
