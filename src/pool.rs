// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The work-request pool (C2): a fixed-capacity, thread-safe pool of packet
//! descriptors shared by the control channel and the fabric facade. Slot
//! storage is a plain `parking_lot::Mutex` per descriptor rather than the
//! teacher's lock-free `fixed_map` slots, since here the unit of sharing is
//! "one buffer, one owner at a time" rather than a concurrently-read map;
//! the free list itself is a `crossbeam_queue::ArrayQueue`, matching the
//! bounded-queue idiom used for command queues elsewhere in this crate.

use crate::{
    config::MAX_PROBE_HEADER_SIZE,
    error::{Error, Kind, Resource},
};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// An outstanding lease on one descriptor. Carries no reference back to the
/// pool; `Pool::release` takes it by value so a caller cannot accidentally
/// use it after releasing.
#[derive(Debug)]
pub struct Handle(u32);

impl Handle {
    #[inline]
    fn index(&self) -> usize {
        self.0 as usize
    }
}

pub struct Pool {
    slots: Box<[Mutex<[u8; MAX_PROBE_HEADER_SIZE]>]>,
    in_use: Box<[AtomicBool]>,
    free: ArrayQueue<u32>,
}

impl Pool {
    /// Builds a pool with exactly `capacity` descriptors, all initially
    /// free. Spec.md §4.2 calls for two pool instances per connection with
    /// different capacities (the control-channel pool and the fabric-probe
    /// pool); callers construct one `Pool` per role.
    pub fn new(capacity: usize) -> Self {
        let free = ArrayQueue::new(capacity);
        for i in 0..capacity as u32 {
            // capacity == free.capacity(), so this can never fail
            free.push(i).ok();
        }
        Self {
            slots: (0..capacity)
                .map(|_| Mutex::new([0u8; MAX_PROBE_HEADER_SIZE]))
                .collect(),
            in_use: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            free,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Non-blocking acquire. Returns `Resource::PoolExhausted` rather than
    /// waiting, so the FSM never blocks on pool pressure (spec.md §7).
    pub fn acquire(&self) -> Result<Handle, Error> {
        let index = self
            .free
            .pop()
            .ok_or_else(|| Error::new(Kind::Resource(Resource::PoolExhausted)))?;
        self.in_use[index as usize].store(true, Ordering::Release);
        Ok(Handle(index))
    }

    /// Returns a descriptor to the pool. Idempotent: a second `release` of
    /// the same index (e.g. a completion-path release racing a
    /// timeout-driven one) is a no-op rather than double-freeing the slot
    /// into the free list.
    pub fn release(&self, handle: Handle) {
        let idx = handle.index();
        if self.in_use[idx].swap(false, Ordering::AcqRel) {
            let _ = self.free.push(handle.0);
        }
    }

    /// Runs `f` against the descriptor's backing buffer while the caller
    /// holds `handle`.
    pub fn with_buffer<R>(&self, handle: &Handle, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.slots[handle.index()].lock();
        f(&mut *guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_exhausts_at_capacity() {
        let pool = Pool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn released_slot_is_reusable() {
        let pool = Pool::new(1);
        let handle = pool.acquire().unwrap();
        pool.with_buffer(&handle, |buf| buf[0] = 7);
        pool.release(handle);
        let handle = pool.acquire().unwrap();
        pool.with_buffer(&handle, |buf| assert_eq!(buf[0], 7));
        pool.release(handle);
    }

    #[test]
    fn release_is_idempotent() {
        let pool = Pool::new(1);
        let handle = pool.acquire().unwrap();
        let idx = handle.0;
        pool.release(handle);
        // a second release of the same index must not duplicate the free
        // slot into the queue
        pool.release(Handle(idx));
        let first = pool.acquire().unwrap();
        assert!(pool.acquire().is_err());
        pool.release(first);
    }
}
