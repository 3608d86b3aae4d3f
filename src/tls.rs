//! Thread-local access patching.
//!
//! Foreign code addresses its thread block with small fixed displacements
//! off the thread pointer. Those slots belong to the host runtime here, so
//! the bridge rewrites the displacements to land in a private shadow block
//! instead. The instruction scanning lives in the architecture module;
//! this driver owns gating, the one-time displacement computation and the
//! overflow diagnostic.

use crate::arch::aarch64;
use crate::config::TlsPatchMode;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Slots in the per-thread shadow block.
pub const TLS_SLOT_COUNT: usize = 16;

thread_local! {
    static SHADOW_BLOCK: UnsafeCell<[usize; TLS_SLOT_COUNT]> =
        const { UnsafeCell::new([0; TLS_SLOT_COUNT]) };
}

/// Address of the calling thread's shadow block.
pub fn shadow_block_addr() -> usize {
    SHADOW_BLOCK.with(|block| block.get() as usize)
}

/// Rewrites foreign thread-local accesses into the shadow block.
pub struct TlsPatcher {
    mode: TlsPatchMode,
    fixed: Option<usize>,
    displacement: OnceLock<Option<u32>>,
}

impl TlsPatcher {
    /// A patcher whose displacement is measured from the running thread.
    pub fn new(mode: TlsPatchMode) -> Self {
        TlsPatcher {
            mode,
            fixed: None,
            displacement: OnceLock::new(),
        }
    }

    /// A patcher with a caller-chosen displacement, in slots.
    pub fn with_displacement(mode: TlsPatchMode, slots: usize) -> Self {
        TlsPatcher {
            mode,
            fixed: Some(slots),
            displacement: OnceLock::new(),
        }
    }

    /// Whether the configuration selects `soname` for patching.
    pub fn should_patch(&self, soname: &str) -> bool {
        match &self.mode {
            TlsPatchMode::Disabled => false,
            TlsPatchMode::All => true,
            TlsPatchMode::Libraries(names) => {
                let base = soname.rsplit('/').next().unwrap_or(soname);
                names.iter().any(|name| name == base)
            }
        }
    }

    /// Patches the executable words of `soname`. Returns how many
    /// instructions were rewritten.
    ///
    /// The pass is idempotent: a rewritten displacement lies outside the
    /// reserved-slot window, so running it again matches nothing.
    pub fn patch_library(&self, soname: &str, code: &mut [u32]) -> usize {
        if !self.should_patch(soname) {
            return 0;
        }
        let Some(offset) = self.displacement() else {
            return 0;
        };
        let patched = aarch64::patch_tls_range(code, offset);
        if patched > 0 {
            log::debug!("[{soname}] rewrote {patched} thread-local accesses (+{offset} slots)");
        }
        patched
    }

    /// The displacement in slots, computed once. `None` means patching is
    /// off for the rest of the run; the out-of-range diagnostic fires at
    /// most once per process, however many patchers exist.
    fn displacement(&self) -> Option<u32> {
        static OVERFLOW_WARNED: AtomicBool = AtomicBool::new(false);
        *self.displacement.get_or_init(|| {
            let raw = match self.fixed {
                Some(raw) => raw,
                None => native_displacement()?,
            };
            if raw > aarch64::TLS_MAX_OFFSET as usize {
                if !OVERFLOW_WARNED.swap(true, Ordering::Relaxed) {
                    log::warn!(
                        "thread-local displacement {raw:#x} exceeds the immediate range, patching disabled"
                    );
                }
                return None;
            }
            Some(raw as u32)
        })
    }
}

#[cfg(target_arch = "aarch64")]
fn native_displacement() -> Option<usize> {
    let tp = crate::arch::thread_pointer();
    Some(shadow_block_addr().wrapping_sub(tp) / size_of::<usize>())
}

#[cfg(not(target_arch = "aarch64"))]
fn native_displacement() -> Option<usize> {
    log::debug!("no thread-local access patcher for this architecture");
    None
}
