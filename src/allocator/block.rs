//! General-purpose block allocator: power-of-two pools for small requests,
//! a direct mapping per large request.

use crate::mmap::{Mmap, MmapImpl, ProtFlags, page_end, page_size, page_start};
use core::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

/// Every page this allocator hands out opens with this signature, which is
/// how `free` tells its own pointers from garbage.
const SIGNATURE: [u8; 4] = [b'A', b'B', b'R', 1];

const MIN_LOG2: u32 = 4;
const MAX_LOG2: u32 = 10;
const SMALL_MAX: usize = 1 << MAX_LOG2;
const POOL_COUNT: usize = (MAX_LOG2 - MIN_LOG2 + 1) as usize;

/// Page type tag for dedicated large-object mappings.
const LARGE_OBJECT: u32 = 111;

/// Returned pointers are at least 16-byte aligned, so the header is too.
const PAGE_INFO_SIZE: usize = 16;

#[repr(C)]
struct PageInfo {
    signature: [u8; 4],
    kind: u32,
    /// Total mapping size; meaningful for large objects only.
    allocated_size: usize,
}

#[repr(C)]
struct SmallPage {
    info: PageInfo,
    next: *mut SmallPage,
}

/// A run of free blocks, threaded through the blocks themselves.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
    free_count: usize,
}

struct SmallPool {
    block_size: usize,
    page_list: *mut SmallPage,
    free_list: *mut FreeBlock,
}

impl SmallPool {
    const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            page_list: core::ptr::null_mut(),
            free_list: core::ptr::null_mut(),
        }
    }

    fn alloc(&mut self, kind: u32) -> NonNull<u8> {
        if self.free_list.is_null() {
            self.map_page(kind);
        }
        unsafe {
            let record = self.free_list;
            if (*record).free_count > 1 {
                let next = record.cast::<u8>().add(self.block_size).cast::<FreeBlock>();
                (*next).next = (*record).next;
                (*next).free_count = (*record).free_count - 1;
                self.free_list = next;
            } else {
                self.free_list = (*record).next;
            }
            core::ptr::write_bytes(record.cast::<u8>(), 0, self.block_size);
            NonNull::new_unchecked(record.cast())
        }
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0, self.block_size);
            let record = ptr.as_ptr().cast::<FreeBlock>();
            (*record).next = self.free_list;
            (*record).free_count = 1;
            self.free_list = record;
        }
    }

    fn map_page(&mut self, kind: u32) {
        let size = page_size();
        let map = unsafe { MmapImpl::mmap_anonymous(size, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) };
        let map = match map {
            Ok(map) => map,
            Err(err) => crate::fatal(format_args!("block allocator: {err}")),
        };
        let page = map.as_ptr().cast::<SmallPage>();
        unsafe {
            (*page).info.signature = SIGNATURE;
            (*page).info.kind = kind;
            (*page).info.allocated_size = size;
            (*page).next = self.page_list;
            self.page_list = page;

            // First block sits at the next block_size boundary past the
            // header, keeping every block block_size-aligned in its page.
            let first_off = size_of::<SmallPage>().next_multiple_of(self.block_size);
            let first = map.as_ptr().cast::<u8>().add(first_off).cast::<FreeBlock>();
            (*first).next = self.free_list;
            (*first).free_count = (size - first_off) / self.block_size;
            self.free_list = first;
        }
    }

    fn unmap_all(&mut self) {
        let mut page = self.page_list;
        while !page.is_null() {
            let next = unsafe { (*page).next };
            unsafe {
                let _ = MmapImpl::munmap(NonNull::new_unchecked(page.cast()), page_size());
            }
            page = next;
        }
        self.page_list = core::ptr::null_mut();
        self.free_list = core::ptr::null_mut();
    }
}

struct Pools {
    pools: [Option<SmallPool>; POOL_COUNT],
}

unsafe impl Send for Pools {}

/// Malloc-style allocator for bridge-made allocations on behalf of foreign
/// runtime calls.
///
/// Requests up to 1024 bytes come from power-of-two pools (16 to 1024);
/// anything larger gets a dedicated anonymous mapping. All returned
/// pointers are 16-byte aligned. Concurrent callers serialize on an
/// internal lock.
pub struct BlockAllocator {
    inner: Mutex<Pools>,
}

impl BlockAllocator {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Pools {
                pools: [const { None }; POOL_COUNT],
            }),
        }
    }

    /// Allocates `size` bytes, zero-initialized. A zero-size request is
    /// treated as one byte. Exhaustion is fatal.
    pub fn alloc(&self, size: usize) -> NonNull<u8> {
        let size = size.max(1);
        if size > SMALL_MAX {
            return alloc_large(size);
        }
        let mut pools = self.lock();
        pools.pool_for_size(size).alloc(log2_ceil(size).max(MIN_LOG2))
    }

    /// Releases `ptr`. Null is a no-op; a pointer this allocator never
    /// produced is fatal.
    ///
    /// # Safety
    /// A non-null `ptr` must come from this allocator and must not be used
    /// afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        let info = page_info(ptr);
        unsafe {
            if (*info).kind == LARGE_OBJECT {
                let len = (*info).allocated_size;
                let _ = MmapImpl::munmap(NonNull::new_unchecked(info.cast()), len);
            } else {
                let kind = (*info).kind;
                let mut pools = self.lock();
                pools.pool_for_kind(kind).free(ptr);
            }
        }
    }

    /// Resizes `ptr` to `size` bytes, preserving `min(old, new)` bytes of
    /// content. May move the allocation when growing; shrinking within the
    /// same block class returns the same pointer. `realloc(null, n)` is
    /// `alloc(n)`; `realloc(ptr, 0)` frees and returns `None`.
    ///
    /// # Safety
    /// A non-null `ptr` must come from this allocator; when the allocation
    /// moves or is freed the old pointer must not be used afterwards.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Some(self.alloc(size));
        };
        if size == 0 {
            unsafe { self.free(ptr.as_ptr()) };
            return None;
        }

        let info = page_info(ptr);
        let old_size = unsafe {
            if (*info).kind == LARGE_OBJECT {
                (*info).allocated_size - (ptr.as_ptr() as usize - info as usize)
            } else {
                let pools = self.lock();
                pools.kind_block_size((*info).kind)
            }
        };

        if old_size < size {
            let new = self.alloc(size);
            unsafe {
                core::ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size);
                self.free(ptr.as_ptr());
            }
            return Some(new);
        }
        Some(ptr)
    }

    /// Unmaps every small-object page. Outstanding large objects are
    /// untouched; they are individually owned.
    ///
    /// # Safety
    /// No pointer previously returned from a small allocation may be used
    /// afterwards.
    pub unsafe fn purge(&self) {
        let mut pools = self.lock();
        for pool in pools.pools.iter_mut().flatten() {
            pool.unmap_all();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pools> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Pools {
    fn pool_for_size(&mut self, size: usize) -> &mut SmallPool {
        let kind = log2_ceil(size).max(MIN_LOG2);
        self.pool_for_kind(kind)
    }

    fn pool_for_kind(&mut self, kind: u32) -> &mut SmallPool {
        if !(MIN_LOG2..=MAX_LOG2).contains(&kind) {
            crate::fatal(format_args!("block allocator: invalid page kind {kind}"));
        }
        self.pools[(kind - MIN_LOG2) as usize].get_or_insert_with(|| SmallPool::new(1 << kind))
    }

    fn kind_block_size(&self, kind: u32) -> usize {
        if !(MIN_LOG2..=MAX_LOG2).contains(&kind) {
            crate::fatal(format_args!("block allocator: invalid page kind {kind}"));
        }
        1 << kind
    }
}

fn alloc_large(size: usize) -> NonNull<u8> {
    let Some(total) = PAGE_INFO_SIZE.checked_add(size) else {
        crate::fatal(format_args!("block allocator: overflow allocating {size} bytes"));
    };
    let total = page_end(total);
    let map = unsafe { MmapImpl::mmap_anonymous(total, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) };
    let map = match map {
        Ok(map) => map,
        Err(err) => crate::fatal(format_args!("block allocator: {err}")),
    };
    unsafe {
        let info = map.as_ptr().cast::<PageInfo>();
        (*info).signature = SIGNATURE;
        (*info).kind = LARGE_OBJECT;
        (*info).allocated_size = total;
        NonNull::new_unchecked(map.as_ptr().cast::<u8>().add(PAGE_INFO_SIZE))
    }
}

/// Recovers the page header behind an allocation and validates it.
fn page_info(ptr: NonNull<u8>) -> *mut PageInfo {
    let info = page_start(ptr.as_ptr() as usize - PAGE_INFO_SIZE) as *mut PageInfo;
    if unsafe { (*info).signature } != SIGNATURE {
        crate::fatal(format_args!(
            "block allocator: invalid pointer {:p} (page signature mismatch)",
            ptr
        ));
    }
    info
}

fn log2_ceil(size: usize) -> u32 {
    usize::BITS - (size - 1).leading_zeros()
}
