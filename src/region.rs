//! Shared-memory region allocation and mapping.
//!
//! The slave allocates the region (one `memfd`, write-shrink-sealed so
//! neither side can truncate it out from under the other) and passes its fd
//! to the master over the control channel; both sides then mmap it
//! read-write. See `ring.rs` for what lives inside.

use std::ffi::CStr;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, SealFlag};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;

use crate::error::{Error, Result};
use crate::ring::{ring_size_bytes, Descriptor, Direction, RingHeader};

/// Bytes occupied by every ring header + descriptor array, before the
/// packet buffer area that follows them.
pub fn rings_area_size(num_s2m_rings: u16, num_m2s_rings: u16, log2_ring_size: u8) -> usize {
    (num_s2m_rings as usize + num_m2s_rings as usize) * ring_size_bytes(log2_ring_size)
}

/// Total region size: ring headers/descriptors followed by one
/// `buffer_size`-sized buffer per descriptor slot.
pub fn region_size(
    num_s2m_rings: u16,
    num_m2s_rings: u16,
    log2_ring_size: u8,
    buffer_size: u32,
) -> usize {
    let rings_area = rings_area_size(num_s2m_rings, num_m2s_rings, log2_ring_size);
    let total_slots =
        (num_s2m_rings as usize + num_m2s_rings as usize) * (1usize << log2_ring_size);
    rings_area + total_slots * buffer_size as usize
}

/// A mapped shared-memory region. `Drop` unmaps; the fd is closed when the
/// owning `File`/fd wrapper is dropped by whoever holds it (region creation
/// keeps raw fds, matching the "every allocation has one release path"
/// discipline used elsewhere in this crate).
pub struct Region {
    fd: RawFd,
    base: *mut libc::c_void,
    len: usize,
}

unsafe impl Send for Region {}

impl Region {
    /// Creates a fresh sealed, sized, mapped region. Used by the slave,
    /// which owns region allocation per the handshake contract.
    pub fn create(size: usize) -> Result<Self> {
        let name = CStr::from_bytes_with_nul(b"memif region 0\0").unwrap();
        let fd = memfd_create(name, MemFdCreateFlag::MFD_ALLOW_SEALING).map_err(Error::from)?;

        fcntl(fd, FcntlArg::F_ADD_SEALS(SealFlag::F_SEAL_SHRINK)).map_err(Error::from)?;
        ftruncate(fd, size as libc::off_t).map_err(Error::from)?;

        let region = Self::map(fd, size)?;
        Ok(region)
    }

    /// Maps a region the caller already owns the fd for (the master's side,
    /// after receiving the fd via `SCM_RIGHTS`).
    pub fn from_fd(fd: RawFd, size: usize) -> Result<Self> {
        Self::map(fd, size)
    }

    fn map(fd: RawFd, size: usize) -> Result<Self> {
        let base = unsafe {
            mmap(
                ::std::ptr::null_mut(),
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
            .map_err(Error::from)?
        };

        Ok(Region {
            fd,
            base,
            len: size,
        })
    }

    pub fn as_raw_fd_unowned(&self) -> RawFd {
        self.fd
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Pointer to the start of ring `index` in `direction`, given the layout
    /// parameters agreed during handshake.
    ///
    /// # Safety
    /// Caller must ensure `index` is within bounds for the direction and
    /// that the region was initialized with matching `log2_ring_size`.
    pub unsafe fn ring_at(
        &self,
        direction: Direction,
        index: u16,
        num_s2m_rings: u16,
        log2_ring_size: u8,
    ) -> *mut RingHeader {
        let ring_bytes = ring_size_bytes(log2_ring_size);
        let slot = match direction {
            Direction::S2M => index as usize,
            Direction::M2S => num_s2m_rings as usize + index as usize,
        };
        self.base.add(slot * ring_bytes) as *mut RingHeader
    }

    /// Pointer to descriptor `slot` within a ring whose header starts at `ring`.
    ///
    /// # Safety
    /// `slot` must be `< 2^log2_ring_size`.
    pub unsafe fn descriptor_at(&self, ring: *mut RingHeader, slot: u32) -> *mut Descriptor {
        let descs = (ring as *mut u8).add(::std::mem::size_of::<RingHeader>()) as *mut Descriptor;
        descs.add(slot as usize)
    }

    /// Pointer to the packet payload bytes for a descriptor's `offset`.
    ///
    /// # Safety
    /// `offset` must have been computed by `init_descriptors` for this region.
    pub unsafe fn buffer_at(&self, offset: u32) -> *mut u8 {
        self.base.add(offset as usize) as *mut u8
    }

    /// Initializes every ring header and descriptor in a freshly created
    /// region: cookies, zeroed head/tail, and precomputed buffer offsets.
    ///
    /// # Safety
    /// Must only be called once, immediately after `create`, before any fd
    /// is handed to the peer.
    pub unsafe fn init_rings(
        &self,
        num_s2m_rings: u16,
        num_m2s_rings: u16,
        log2_ring_size: u8,
        buffer_size: u32,
    ) {
        let buffer_offset = rings_area_size(num_s2m_rings, num_m2s_rings, log2_ring_size) as u32;
        let slots_per_ring = 1u32 << log2_ring_size;

        for (direction, count) in [(Direction::S2M, num_s2m_rings), (Direction::M2S, num_m2s_rings)]
        {
            for i in 0..count {
                let ring = self.ring_at(direction, i, num_s2m_rings, log2_ring_size);
                (*ring).init();
                let ring_base_slot = match direction {
                    Direction::S2M => i as u32,
                    Direction::M2S => num_s2m_rings as u32 + i as u32,
                };
                for j in 0..slots_per_ring {
                    let slot = ring_base_slot * slots_per_ring + j;
                    let desc = self.descriptor_at(ring, j);
                    (*desc).region_index = 0;
                    (*desc).flags = 0;
                    (*desc).length = 0;
                    (*desc).buffer_length = buffer_size;
                    (*desc).offset = buffer_offset + slot * buffer_size;
                }
            }
        }
    }
}

impl AsRawFd for Region {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_size_accounts_for_both_directions() {
        let size = region_size(1, 1, 4, 2048);
        let rings = rings_area_size(1, 1, 4);
        assert_eq!(size, rings + 2 * 16 * 2048);
    }

    #[test]
    fn create_and_init_roundtrip() {
        let size = region_size(1, 1, 4, 128);
        let region = Region::create(size).expect("region create");
        unsafe {
            region.init_rings(1, 1, 4, 128);
            let ring = region.ring_at(Direction::S2M, 0, 1, 4);
            assert!((*ring).cookie_valid());
            let desc = region.descriptor_at(ring, 0);
            assert_eq!((*desc).buffer_length, 128);
        }
    }
}
