//! The data-path API (§4.5): `buffer_alloc`/`tx_burst` operate on a tx
//! queue, `rx_burst`/`buffer_free` on an rx queue. All four are lock-free:
//! each ring has exactly one producer and one consumer, and the ordering is
//! enforced entirely by the `Release`/`Acquire` pairs in `ring::RingHeader`.

use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::ring::Descriptor;

/// A claimed ring slot, handed to the application by `buffer_alloc` (tx) or
/// `rx_burst` (rx). `data`/`capacity` point directly into the shared region.
pub struct Buffer {
    pub desc_index: u32,
    pub data: *mut u8,
    pub capacity: u32,
    pub data_len: u32,
}

unsafe impl Send for Buffer {}

unsafe fn descriptor_ptr(ring: *mut crate::ring::RingHeader, slot: u32) -> *mut Descriptor {
    let descs =
        (ring as *mut u8).add(::std::mem::size_of::<crate::ring::RingHeader>()) as *mut Descriptor;
    descs.add(slot as usize)
}

/// Claims up to `want` free tx slots. Returns the claimed buffers; if fewer
/// than `want` were available the error is `RingFull` but the partial batch
/// is still returned (mirrors the original's "best effort" allocator).
pub fn buffer_alloc(q: &mut Queue, want: u16) -> (Vec<Buffer>, Result<()>) {
    let header = unsafe { q.header() };
    let mask = q.mask();
    let slots = mask + 1;

    let head = header.head();
    let tail = header.tail_acquire();
    let occupied = head.wrapping_sub(tail);
    // head == tail is reserved to mean "empty", so one slot is never usable.
    let free = slots.saturating_sub(occupied).saturating_sub(1);
    let free = free.saturating_sub(q.alloc_bufs);

    let claim = (want as u32).min(free);
    let mut bufs = Vec::with_capacity(claim as usize);

    for i in 0..claim {
        let slot = (head.wrapping_add(q.alloc_bufs).wrapping_add(i)) & mask;
        let desc = unsafe { &*descriptor_ptr(q.ring, slot) };
        bufs.push(Buffer {
            desc_index: slot,
            data: unsafe {
                (q.ring as *mut u8).sub(q.byte_offset_within_region).add(desc.offset as usize)
            },
            capacity: desc.buffer_length,
            data_len: 0,
        });
    }
    q.alloc_bufs += claim;

    let result = if claim < want as u32 {
        Err(Error::RingFull)
    } else {
        Ok(())
    };
    (bufs, result)
}

/// Publishes `bufs` (previously claimed by `buffer_alloc`, in claim order)
/// to the peer: writes each descriptor's `length`, advances `head` by the
/// batch size, and signals the interrupt fd unless the consumer asked to
/// suppress it. `head`/`tail` are monotonic counters, never masked down to a
/// slot index — only `head & mask` ever addresses a descriptor.
pub fn tx_burst(q: &mut Queue, bufs: &[Buffer]) -> Result<u16> {
    for buf in bufs {
        let desc = unsafe { &mut *descriptor_ptr(q.ring, buf.desc_index) };
        desc.length = buf.data_len;
    }

    let suppressed = {
        let header = unsafe { q.header() };
        let new_head = header.head().wrapping_add(bufs.len() as u32);
        header.set_head(new_head);
        header.flag_bits().contains(crate::ring::RingFlags::INTERRUPT_SUPPRESSED)
    };
    q.alloc_bufs = q.alloc_bufs.saturating_sub(bufs.len() as u32);

    if !suppressed {
        signal(q.interrupt_fd)?;
    }

    Ok(bufs.len() as u16)
}

/// Claims newly published rx descriptors (those the producer has advanced
/// `head` past since our last call). Does not advance `tail`; the
/// application must call `buffer_free` once done with each buffer.
pub fn rx_burst(q: &mut Queue, max: u16) -> Vec<Buffer> {
    let mask = q.mask();
    let header = unsafe { q.header() };
    let head = header.head_acquire();

    if head == q.last_head {
        return Vec::new();
    }

    let available = head.wrapping_sub(q.last_head);
    let claim = available.min(max as u32);
    let mut bufs = Vec::with_capacity(claim as usize);

    for i in 0..claim {
        let slot = (q.last_head.wrapping_add(i)) & mask;
        let desc = unsafe { &*descriptor_ptr(q.ring, slot) };
        bufs.push(Buffer {
            desc_index: slot,
            data: unsafe {
                (q.ring as *mut u8).sub(q.byte_offset_within_region).add(desc.offset as usize)
            },
            capacity: desc.buffer_length,
            data_len: desc.length,
        });
    }

    q.last_head = q.last_head.wrapping_add(claim);
    q.alloc_bufs += claim;
    bufs
}

/// Returns `bufs` (previously claimed by `rx_burst`, in claim order) to the
/// producer by advancing `tail` by the batch size. Like `head`, `tail` is a
/// monotonic counter, not masked to a slot index.
pub fn buffer_free(q: &mut Queue, bufs: &[Buffer]) -> u16 {
    let n = bufs.len().min(q.alloc_bufs as usize) as u32;

    let header = unsafe { q.header() };
    let new_tail = header.tail().wrapping_add(n);
    header.set_tail(new_tail);
    q.alloc_bufs = q.alloc_bufs.saturating_sub(n);
    n as u16
}

fn signal(fd: std::os::unix::io::RawFd) -> Result<()> {
    let value: u64 = 1;
    let ret = unsafe {
        libc::write(
            fd,
            &value as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        return Err(Error::InterruptWriteFailure);
    }
    Ok(())
}
