// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::device::BLOCK_SIZE,
    futures::channel::oneshot,
    std::collections::VecDeque,
};

/// A metadata I/O buffer.  Every metadata transfer a zone performs flows through one of these.
pub type Vio = Vec<u8>;

/// A bounded, zone-local pool of metadata buffers.  When the pool is exhausted the requester
/// parks on a waiter queue that is drained as buffers come back.
pub struct VioPool {
    free: Vec<Vio>,

    // Buffers currently checked out.  A buffer handed straight from `release` to a parked waiter
    // stays checked out, so the count is unchanged by the hand-off.
    outstanding: usize,

    waiters: VecDeque<oneshot::Sender<Vio>>,
}

impl VioPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        VioPool {
            free: (0..size).map(|_| vec![0u8; BLOCK_SIZE]).collect(),
            outstanding: 0,
            waiters: VecDeque::new(),
        }
    }

    /// Takes a buffer from the pool.  If the pool is dry the caller is parked: it gets back a
    /// receiver that resolves to a buffer once one is released.
    pub fn acquire(&mut self) -> Result<Vio, oneshot::Receiver<Vio>> {
        match self.free.pop() {
            Some(vio) => {
                self.outstanding += 1;
                Ok(vio)
            }
            None => {
                let (sender, receiver) = oneshot::channel();
                self.waiters.push_back(sender);
                Err(receiver)
            }
        }
    }

    /// Returns a buffer, handing it directly to the oldest live waiter if one is parked.
    pub fn release(&mut self, mut vio: Vio) {
        loop {
            match self.waiters.pop_front() {
                None => {
                    assert!(self.outstanding > 0);
                    self.outstanding -= 1;
                    self.free.push(vio);
                    return;
                }
                // A waiter that gave up dropped its receiver; skip it and try the next.
                Some(waiter) => match waiter.send(vio) {
                    Ok(()) => return,
                    Err(returned) => vio = returned,
                },
            }
        }
    }

    /// Whether any buffer is checked out.  Drain asserts this is false at its final step.
    pub fn is_busy(&self) -> bool {
        self.outstanding > 0
    }
}

#[cfg(test)]
mod tests {
    use {super::VioPool, futures::executor::block_on};

    #[test]
    fn test_acquire_release() {
        let mut pool = VioPool::new(2);
        assert!(!pool.is_busy());
        let a = pool.acquire().expect("pool should not be empty");
        let b = pool.acquire().expect("pool should not be empty");
        assert!(pool.is_busy());
        pool.release(a);
        pool.release(b);
        assert!(!pool.is_busy());
    }

    #[test]
    fn test_exhausted_pool_parks_waiter() {
        block_on(async {
            let mut pool = VioPool::new(1);
            let vio = pool.acquire().expect("pool should not be empty");
            let waiter = pool.acquire().expect_err("pool should be exhausted");
            pool.release(vio);
            // The released buffer went straight to the waiter, so the pool is still busy.
            assert!(pool.is_busy());
            let vio = waiter.await.expect("waiter should get a vio");
            pool.release(vio);
            assert!(!pool.is_busy());
        });
    }

    #[test]
    fn test_abandoned_waiter_is_skipped() {
        block_on(async {
            let mut pool = VioPool::new(1);
            let vio = pool.acquire().expect("pool should not be empty");
            let abandoned = pool.acquire().expect_err("pool should be exhausted");
            drop(abandoned);
            let waiter = pool.acquire().expect_err("pool should be exhausted");
            pool.release(vio);
            let vio = waiter.await.expect("waiter should get a vio");
            pool.release(vio);
            assert!(!pool.is_busy());
        });
    }
}
