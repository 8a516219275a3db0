// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! The fabric endpoint facade (C6). Per Design Notes §9, the "function
//! pointer vtable" the source uses for the libfabric provider API becomes
//! an interface abstraction here: a `Fabric` trait with `open`/`post_send`/
//! `post_receive`/`drain_completions`/`close`, so the real fabric provider,
//! a loopback pair, and a fault-injecting wrapper (`crate::testing`) can all
//! satisfy the probe FSM's needs. The actual fabric driver is an external
//! collaborator (spec.md §1) — this module does not talk to real hardware,
//! it only defines the contract the FSM is written against.

use crate::{config::EFA_PROBE_PACKET_DATA_PATTERN, error::Error, gid::Gid};

/// A fixed-size buffer filled with the probe pattern byte, sent
/// `EFA_PROBE_PACKET_COUNT` times immediately after `EfaStart` (spec.md §6).
#[derive(Clone, Copy)]
pub struct ProbeFrame<const N: usize>([u8; N]);

impl<const N: usize> ProbeFrame<N> {
    pub fn new() -> Self {
        Self([EFA_PROBE_PACKET_DATA_PATTERN; N])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> Default for ProbeFrame<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The 8-byte-aligned block size memory registration carves the receive
/// slab into (spec.md §4.6: "a slab of `reserve_packets` equal-sized,
/// 8-byte-aligned blocks").
pub const RECEIVE_BLOCK_ALIGN: usize = 8;

#[cfg(target_os = "linux")]
static HUGEPAGE_SUPPORTED: once_cell::sync::OnceCell<bool> = once_cell::sync::OnceCell::new();

/// Probes once per process whether anonymous `MAP_HUGETLB` mappings are
/// available, caching the result (spec.md §4.6 memory registration is
/// "performed once on open", and re-probing on every endpoint open/reset
/// would be wasted syscalls for a fact that cannot change at runtime).
#[cfg(target_os = "linux")]
fn hugepage_supported() -> bool {
    *HUGEPAGE_SUPPORTED.get_or_init(|| unsafe {
        let probe_len = 2 * 1024 * 1024;
        let probe = libc::mmap(
            std::ptr::null_mut(),
            probe_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            -1,
            0,
        );
        if probe == libc::MAP_FAILED {
            false
        } else {
            libc::munmap(probe, probe_len);
            true
        }
    })
}

/// The backing storage for a receive slab: either a hugepage-backed
/// anonymous mapping or a plain heap allocation (spec.md §4.6: "carved from
/// a hugepage allocation, with heap fallback"). Not a `Vec<u8>` because an
/// `mmap`-backed region must be released with `munmap`, not the global
/// allocator `Vec::drop` would reach for.
pub struct ReceiveSlab {
    ptr: *mut u8,
    len: usize,
    mmap_backed: bool,
}

// SAFETY: `ptr` owns `len` bytes exclusively; nothing else holds a
// reference to this mapping, so it may be sent to and read from any thread.
unsafe impl Send for ReceiveSlab {}
unsafe impl Sync for ReceiveSlab {}

impl ReceiveSlab {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// The `index`-th `block_len`-byte block, 8-byte-aligned per spec.md §4.6.
    pub fn block(&self, index: usize, block_len: usize) -> &[u8] {
        &self.as_slice()[index * block_len..(index + 1) * block_len]
    }

    pub fn block_mut(&mut self, index: usize, block_len: usize) -> &mut [u8] {
        &mut self.as_mut_slice()[index * block_len..(index + 1) * block_len]
    }
}

impl Drop for ReceiveSlab {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        if self.mmap_backed {
            // SAFETY: `ptr`/`len` are exactly the mapping returned by the
            // `mmap` call that produced this slab.
            unsafe {
                libc::munmap(self.ptr.cast(), self.len);
            }
        } else {
            // SAFETY: `ptr`/`len` are exactly the allocation `Vec::into_raw_parts`
            // (emulated below) produced, with matching capacity.
            unsafe {
                drop(Vec::from_raw_parts(self.ptr, self.len, self.len));
            }
        }
    }
}

/// Carves `reserve_packets` equal-sized, 8-byte-aligned blocks of
/// `block_len` bytes each out of a single hugepage-backed mapping, falling
/// back to a plain heap allocation when hugepages aren't available (spec.md
/// §4.6).
pub fn alloc_receive_slab(reserve_packets: usize, block_len: usize) -> ReceiveSlab {
    let block_len = block_len.next_multiple_of(RECEIVE_BLOCK_ALIGN);
    let total = block_len * reserve_packets;

    #[cfg(target_os = "linux")]
    if total > 0 && hugepage_supported() {
        // SAFETY: requesting a fresh anonymous mapping; the result is
        // checked against `MAP_FAILED` before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if ptr != libc::MAP_FAILED {
            return ReceiveSlab {
                ptr: ptr.cast::<u8>(),
                len: total,
                mmap_backed: true,
            };
        }
    }

    let mut heap = vec![0u8; total].into_boxed_slice();
    let ptr = heap.as_mut_ptr();
    std::mem::forget(heap);
    ReceiveSlab {
        ptr,
        len: total,
        mmap_backed: false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Ok,
    Failed,
}

/// One drained completion-queue entry. `context` is the caller-supplied
/// token passed to `post_send`/`post_receive`, round-tripped unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub context: u64,
    pub status: CompletionStatus,
}

/// The fabric provider contract (spec.md §4.6). Implementations own the
/// memory-registration slab; this trait only sees opaque buffer handles.
pub trait Fabric: Send {
    /// Allocates the domain, endpoint, completion queue, address vector,
    /// and the two memory regions (payload, internal headers). `remote_gid`
    /// is `None` until negotiation learns the peer's identity.
    fn open(&mut self, local_gid: Gid, remote_gid: Option<Gid>) -> Result<(), Error>;

    /// Posts a send. `more_to_send` lets the caller hint that another send
    /// is coming immediately, so the facade can defer the hardware doorbell
    /// (spec.md §4.6); the facade must still flush once the in-flight
    /// counter reaches `EFA_TX_PACKET_CACHE_SIZE`.
    fn post_send(&mut self, payload: &[u8], context: u64, more_to_send: bool) -> Result<(), Error>;

    /// Posts one receive buffer back to the fabric. `more_to_post` batches
    /// hardware doorbells the same way `post_send`'s flag does.
    fn post_receive(&mut self, context: u64, more_to_post: bool) -> Result<(), Error>;

    /// Drains up to `max` completions into `out`, returning
    /// `(ok_count, error_count)`. Never blocks.
    fn drain_completions(&mut self, out: &mut Vec<Completion>, max: usize) -> (usize, usize);

    /// Unregisters memory, closes the endpoint, and frees the descriptor
    /// pool. Idempotent is not required — callers close exactly once.
    fn close(&mut self) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_slab_blocks_are_independently_writable() {
        let mut slab = alloc_receive_slab(4, 37);
        for i in 0..4 {
            slab.block_mut(i, 40)[0] = i as u8;
        }
        for i in 0..4 {
            assert_eq!(slab.block(i, 40)[0], i as u8);
        }
    }

    #[test]
    fn zero_reserve_packets_is_a_no_op_allocation() {
        let slab = alloc_receive_slab(0, 64);
        assert!(slab.as_slice().is_empty());
    }

    #[test]
    fn block_len_rounds_up_to_alignment() {
        let slab = alloc_receive_slab(1, 37);
        assert_eq!(slab.as_slice().len(), 40);
    }
}
