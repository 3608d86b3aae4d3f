//! Fixed-slot region allocator with page-granular write protection.

use crate::mmap::{Mmap, MmapImpl, ProtFlags, page_size};
use core::marker::PhantomData;
use core::ptr::NonNull;

/// Slots can never be smaller than a free-block record.
const MIN_SLOT: usize = 2 * size_of::<*const ()>();

/// Page header size. Slots start at this offset so the first slot keeps
/// 16-byte alignment.
const PAGE_HEADER: usize = 16;

#[repr(C)]
struct PageHeader {
    next: *mut PageHeader,
}

/// A run of free slots, threaded through the slots themselves.
///
/// Slot boundaries follow the record stride, not the pointer alignment, so
/// these records may sit at any byte address; they are only ever accessed
/// with unaligned loads and stores.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
    free_count: usize,
}

/// Untyped fixed-slot allocator.
///
/// Pages are mapped one at a time; a fresh page contributes a single
/// free-block record covering all of its slots, so consecutive allocations
/// from it land exactly `slot_size` apart. Exhaustion of the underlying
/// mapping is fatal: the bridge has nothing to fall back to.
pub struct SlotAllocator {
    slot_size: usize,
    page_list: *mut PageHeader,
    free_list: *mut FreeBlock,
}

unsafe impl Send for SlotAllocator {}

impl SlotAllocator {
    /// Creates an allocator for `slot_size`-byte slots. Sizes below the
    /// free-block record size are rounded up to it.
    pub const fn new(slot_size: usize) -> Self {
        let slot_size = if slot_size < MIN_SLOT { MIN_SLOT } else { slot_size };
        Self {
            slot_size,
            page_list: core::ptr::null_mut(),
            free_list: core::ptr::null_mut(),
        }
    }

    /// Returns a zero-initialized slot.
    pub fn alloc(&mut self) -> NonNull<u8> {
        if self.free_list.is_null() {
            self.map_page();
        }
        unsafe {
            let record = self.free_list;
            let block = record.read_unaligned();
            if block.free_count > 1 {
                let next = record.cast::<u8>().add(self.slot_size).cast::<FreeBlock>();
                next.write_unaligned(FreeBlock {
                    next: block.next,
                    free_count: block.free_count - 1,
                });
                self.free_list = next;
            } else {
                self.free_list = block.next;
            }
            core::ptr::write_bytes(record.cast::<u8>(), 0, self.slot_size);
            NonNull::new_unchecked(record.cast())
        }
    }

    /// Returns `ptr` to the free list.
    ///
    /// # Safety
    /// `ptr` must come from [`SlotAllocator::alloc`] on this allocator and
    /// must not be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        if !self.owns(ptr.as_ptr()) {
            crate::fatal(format_args!(
                "region allocator: freeing foreign pointer {:p} (slot_size={})",
                ptr, self.slot_size
            ));
        }
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0, self.slot_size);
            let record = ptr.as_ptr().cast::<FreeBlock>();
            record.write_unaligned(FreeBlock {
                next: self.free_list,
                free_count: 1,
            });
            self.free_list = record;
        }
    }

    /// Applies `prot` to every page this allocator has mapped.
    ///
    /// # Safety
    /// Removing write or read access invalidates live references into the
    /// slots for the duration; the caller must not touch them until access
    /// is restored.
    pub unsafe fn protect_all(&mut self, prot: ProtFlags) -> crate::Result<()> {
        let mut page = self.page_list;
        while !page.is_null() {
            let next = unsafe { (*page).next };
            unsafe { MmapImpl::mprotect(NonNull::new_unchecked(page.cast()), page_size(), prot)? };
            page = next;
        }
        Ok(())
    }

    fn owns(&self, ptr: *mut u8) -> bool {
        let addr = ptr as usize;
        let mut page = self.page_list;
        while !page.is_null() {
            let start = page as usize + PAGE_HEADER;
            let end = page as usize + page_size();
            if addr >= start && addr < end && (addr - start) % self.slot_size == 0 {
                return true;
            }
            page = unsafe { (*page).next };
        }
        false
    }

    fn map_page(&mut self) {
        let size = page_size();
        let map = unsafe { MmapImpl::mmap_anonymous(size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) };
        let map = match map {
            Ok(map) => map,
            Err(err) => crate::fatal(format_args!("region allocator: {err}")),
        };
        let page = map.as_ptr().cast::<PageHeader>();
        unsafe {
            (*page).next = self.page_list;
            self.page_list = page;

            let first = map.as_ptr().cast::<u8>().add(PAGE_HEADER).cast::<FreeBlock>();
            first.write_unaligned(FreeBlock {
                next: self.free_list,
                free_count: (size - PAGE_HEADER) / self.slot_size,
            });
            self.free_list = first;
        }
    }
}

impl Drop for SlotAllocator {
    fn drop(&mut self) {
        let mut page = self.page_list;
        while !page.is_null() {
            let next = unsafe { (*page).next };
            unsafe {
                let _ = MmapImpl::munmap(NonNull::new_unchecked(page.cast()), page_size());
            }
            page = next;
        }
    }
}

/// Typed wrapper over [`SlotAllocator`] for one record type.
pub struct RegionAllocator<T> {
    inner: SlotAllocator,
    _marker: PhantomData<T>,
}

impl<T> RegionAllocator<T> {
    pub const fn new() -> Self {
        Self {
            inner: SlotAllocator::new(size_of::<T>()),
            _marker: PhantomData,
        }
    }

    /// Returns a zero-initialized record.
    pub fn alloc(&mut self) -> NonNull<T> {
        self.inner.alloc().cast()
    }

    /// # Safety
    /// `ptr` must come from [`RegionAllocator::alloc`] on this allocator
    /// and must not be used afterwards. The record is not dropped.
    pub unsafe fn free(&mut self, ptr: NonNull<T>) {
        unsafe { self.inner.free(ptr.cast()) }
    }

    /// See [`SlotAllocator::protect_all`].
    ///
    /// # Safety
    /// As for [`SlotAllocator::protect_all`].
    pub unsafe fn protect_all(&mut self, prot: ProtFlags) -> crate::Result<()> {
        unsafe { self.inner.protect_all(prot) }
    }
}

impl<T> Default for RegionAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}
