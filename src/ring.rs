//! On-shared-memory layout: ring headers and descriptors.
//!
//! Everything in this module describes bytes that live inside a `Region`'s
//! mmap, not the process's own heap. Reads/writes to `head`/`tail` go through
//! atomics with explicit ordering (see `RingHeader::head`/`set_head` and
//! friends) because the producer and consumer are different processes racing
//! on the same cache line.

use std::sync::atomic::{AtomicU32, Ordering};

/// Magic value stamped into every ring header at init time and checked
/// before the ring is trusted on the data path.
pub const RING_COOKIE: u32 = 0x3132_6573; // "res21", arbitrary but stable

bitflags! {
    /// Bits living in a ring header's `flags` word.
    pub struct RingFlags: u32 {
        /// Set by the consumer to ask the producer not to signal the
        /// interrupt fd on every `tx_burst`.
        const INTERRUPT_SUPPRESSED = 0b0000_0001;
    }
}

/// Which direction a ring carries packets in, from the slave's perspective.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Slave to master.
    S2M,
    /// Master to slave.
    M2S,
}

/// A ring header as laid out in shared memory. `#[repr(C)]` so the byte
/// layout is stable across the two processes (which may even be built by
/// different compilers).
#[repr(C)]
pub struct RingHeader {
    pub cookie: AtomicU32,
    pub flags: AtomicU32,
    pub head: AtomicU32,
    pub tail: AtomicU32,
}

impl RingHeader {
    pub fn init(&self) {
        self.cookie.store(RING_COOKIE, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }

    pub fn cookie_valid(&self) -> bool {
        self.cookie.load(Ordering::Relaxed) == RING_COOKIE
    }

    /// Producer-side read of `head`. Relaxed: only the producer ever writes it.
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Relaxed)
    }

    /// Producer publishes a new `head`. `Release` so every descriptor write
    /// that happened before this call is visible to a consumer that observes
    /// the new value with `Acquire`.
    pub fn set_head(&self, new_head: u32) {
        self.head.store(new_head, Ordering::Release);
    }

    /// Consumer-side read of `head`, used to discover newly published
    /// descriptors. `Acquire` pairs with the producer's `Release` store.
    pub fn head_acquire(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// Consumer-side read of `tail`. Relaxed: only the consumer ever writes it.
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Relaxed)
    }

    /// Consumer publishes a new `tail`, returning slots to the producer.
    /// `Release` so the producer, which reads `tail` with implicit
    /// acquire-by-relaxed-plus-happens-before via the socket/interrupt signal,
    /// never sees a `tail` advance before the consumer is done with a buffer.
    pub fn set_tail(&self, new_tail: u32) {
        self.tail.store(new_tail, Ordering::Release);
    }

    /// Producer-side read of `tail` to compute free space.
    pub fn tail_acquire(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    pub fn flag_bits(&self) -> RingFlags {
        RingFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }
}

/// A descriptor slot, one per ring entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Descriptor {
    pub region_index: u16,
    pub flags: u16,
    pub buffer_length: u32,
    pub length: u32,
    pub offset: u32,
}

/// Size, in bytes, of one ring (header + its descriptor array).
pub fn ring_size_bytes(log2_ring_size: u8) -> usize {
    ::std::mem::size_of::<RingHeader>()
        + ring_slots(log2_ring_size) * ::std::mem::size_of::<Descriptor>()
}

pub fn ring_slots(log2_ring_size: u8) -> usize {
    1usize << log2_ring_size
}

pub fn ring_mask(log2_ring_size: u8) -> u32 {
    (ring_slots(log2_ring_size) as u32) - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_and_mask_agree() {
        assert_eq!(ring_slots(4), 16);
        assert_eq!(ring_mask(4), 15);
    }

    #[test]
    fn ring_size_includes_header() {
        let size = ring_size_bytes(4);
        assert!(size > 16 * ::std::mem::size_of::<Descriptor>());
    }
}
