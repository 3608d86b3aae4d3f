//! Tracing trampolines.
//!
//! A trampoline is the architecture's code template instantiated into an
//! executable page: the tracing callback sees the symbol name, the saved
//! argument registers and the real target, then the stub restores every
//! register and tail-jumps to the target. The caller's stack and return
//! address are untouched, so the interposed function behaves exactly as if
//! it had been called directly.

use crate::mmap::{Mmap, MmapImpl, ProtFlags, page_size};
use crate::{Result, arch};
use core::ffi::{c_char, c_void};
use core::ptr::NonNull;
use std::ffi::CString;
use std::sync::{Mutex, PoisonError};

/// Tracing callback: symbol name, saved registers (the first slot is the
/// first integer argument register) and the jump target.
pub type TraceFn = unsafe extern "C" fn(name: *const c_char, regs: *const usize, target: usize);

struct ArenaInner {
    pages: Vec<NonNull<c_void>>,
    cursor: usize,
    names: Vec<CString>,
}

unsafe impl Send for ArenaInner {}

/// Arena of executable trampoline pages.
///
/// Pages are mapped writable and executable and stay that way: a published
/// trampoline may be running on any thread at any time, so instantiating
/// the next one on the same page must never revoke execute access. Symbol
/// names are copied into arena-owned storage, so a trampoline never
/// dangles into an unloaded object's string table.
pub struct TrampolineArena {
    inner: Mutex<ArenaInner>,
}

impl TrampolineArena {
    pub const fn new() -> Self {
        TrampolineArena {
            inner: Mutex::new(ArenaInner {
                pages: Vec::new(),
                cursor: 0,
                names: Vec::new(),
            }),
        }
    }

    /// Instantiates a trampoline for `name` that reports to `tracer` and
    /// transfers to `target`. Returns the entry address.
    pub fn create(&self, name: &str, target: usize, tracer: TraceFn) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let size = arch::TRAMPOLINE_SIZE.next_multiple_of(16);
        let page = page_size();
        let base = match inner.pages.last() {
            Some(&last) if inner.cursor + size <= page => last,
            _ => {
                let map = unsafe {
                    MmapImpl::mmap_anonymous(
                        page,
                        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                    )?
                };
                inner.pages.push(map);
                inner.cursor = 0;
                map
            }
        };

        let name = CString::new(name).unwrap_or_default();
        let name_ptr = name.as_ptr() as usize;
        inner.names.push(name);

        let entry = base.as_ptr() as usize + inner.cursor;
        inner.cursor += size;

        let mut code = arch::trampoline_template().to_vec();
        fill_hole(&mut code, arch::TRAMPOLINE_NAME_HOLE, name_ptr);
        fill_hole(&mut code, arch::TRAMPOLINE_TRACER_HOLE, tracer as usize);
        for &hole in arch::TRAMPOLINE_TARGET_HOLES {
            fill_hole(&mut code, hole, target);
        }

        unsafe {
            core::ptr::copy_nonoverlapping(code.as_ptr(), entry as *mut u8, code.len());
        }
        arch::flush_icache(entry as *const u8, code.len());

        log::debug!("trampoline for \"{}\" at {entry:#x} -> {target:#x}", display_name(&inner));
        Ok(entry)
    }
}

impl Default for TrampolineArena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TrampolineArena {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for page in &inner.pages {
            unsafe {
                let _ = MmapImpl::munmap(*page, page_size());
            }
        }
    }
}

fn fill_hole(code: &mut [u8], offset: usize, value: usize) {
    code[offset..offset + size_of::<usize>()].copy_from_slice(&value.to_ne_bytes());
}

fn display_name(inner: &ArenaInner) -> &str {
    inner
        .names
        .last()
        .and_then(|name| name.to_str().ok())
        .unwrap_or("?")
}
