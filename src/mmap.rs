//! Raw page mapping used by the bridge's internal allocators and the
//! trampoline arena.
//!
//! The bridge never routes its own bookkeeping through the host or foreign
//! allocator; everything below goes straight to anonymous mappings.

use crate::{Error, Result};
use core::ffi::c_void;
use core::ptr::NonNull;

bitflags::bitflags! {
    /// Memory protection flags for mapped pages.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ProtFlags: i32 {
        /// Pages may not be accessed.
        const PROT_NONE = libc::PROT_NONE;
        /// Pages may be read.
        const PROT_READ = libc::PROT_READ;
        /// Pages may be written.
        const PROT_WRITE = libc::PROT_WRITE;
        /// Pages may be executed.
        const PROT_EXEC = libc::PROT_EXEC;
    }
}

bitflags::bitflags! {
    /// Mapping flags for anonymous mappings.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MapFlags: i32 {
        /// Changes are private to this process.
        const MAP_PRIVATE = libc::MAP_PRIVATE;
        /// The mapping is not backed by any file.
        const MAP_ANONYMOUS = libc::MAP_ANONYMOUS;
    }
}

/// Page mapping interface.
///
/// The default implementation goes through libc; tests and unusual hosts
/// can substitute their own.
pub trait Mmap {
    /// Creates an anonymous mapping of `len` bytes.
    ///
    /// # Safety
    /// The caller owns the returned region and must unmap it with
    /// [`Mmap::munmap`] using the same length.
    unsafe fn mmap_anonymous(len: usize, prot: ProtFlags) -> Result<NonNull<c_void>>;

    /// Unmaps a region previously returned by [`Mmap::mmap_anonymous`].
    ///
    /// # Safety
    /// `addr`/`len` must describe exactly one live mapping.
    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()>;

    /// Changes the protection of a mapped region.
    ///
    /// # Safety
    /// `addr`/`len` must lie within a live mapping and be page-aligned.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;
}

/// An implementation of the [`Mmap`] trait backed by libc.
pub struct MmapImpl;

impl Mmap for MmapImpl {
    unsafe fn mmap_anonymous(len: usize, prot: ProtFlags) -> Result<NonNull<c_void>> {
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                prot.bits(),
                (MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS).bits(),
                -1,
                0,
            )
        };
        if core::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(map_error("mmap anonymous failed"));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        let res = unsafe { libc::munmap(addr.as_ptr(), len) };
        if res != 0 {
            return Err(map_error("munmap failed"));
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        let res = unsafe { libc::mprotect(addr.as_ptr(), len, prot.bits()) };
        if res != 0 {
            return Err(map_error("mprotect failed"));
        }
        Ok(())
    }
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Rounds `value` up to the next page boundary.
#[inline]
pub fn page_end(value: usize) -> usize {
    let page = page_size();
    (value + page - 1) & !(page - 1)
}

/// Rounds `addr` down to the start of its page.
#[inline]
pub fn page_start(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

#[cold]
#[inline(never)]
fn map_error(msg: &'static str) -> Error {
    crate::map_error(msg)
}
