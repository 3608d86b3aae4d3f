//! Symbol interposition.
//!
//! Names in this table resolve to host-supplied implementations before any
//! scope search, which is how a foreign object's libc-equivalent calls
//! (property access, exit-time registration, environment, formatted
//! output) land in the bridge instead of its own C runtime. Each entry
//! carries the direct implementation and an optional traced variant; a
//! per-process callback may claim a name before the table is consulted.

pub mod trampoline;

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, Ordering};
use hashbrown::{DefaultHashBuilder, HashMap};

/// A callback consulted before the table for every name.
pub type HookCallback = fn(name: &str) -> Option<usize>;

struct HookEntry {
    func: usize,
    traced: Option<usize>,
}

/// Builds a [`HookTable`], starting from the bridge's fixed minimum set or
/// from nothing.
pub struct HookTableBuilder {
    entries: HashMap<Box<str>, HookEntry, DefaultHashBuilder>,
    callback: Option<HookCallback>,
}

impl HookTableBuilder {
    /// An empty builder.
    pub fn empty() -> Self {
        HookTableBuilder {
            entries: HashMap::default(),
            callback: None,
        }
    }

    /// A builder preloaded with the entries every foreign object needs:
    /// property access, environment access, formatted output, exit-time
    /// destructor registration and the shadow thread-block accessor.
    pub fn with_base_hooks() -> Self {
        let mut builder = Self::empty();
        builder
            .hook("property_get", crate::properties::property_get as usize)
            .hook("property_set", crate::properties::property_set as usize)
            .hook("__system_property_get", crate::properties::property_get as usize)
            .hook("printf", libc::printf as usize)
            .hook("getenv", libc::getenv as usize)
            .hook("setenv", libc::setenv as usize)
            .hook("__cxa_atexit", crate::dso::cxa_atexit as usize)
            .hook("__cxa_finalize", crate::dso::cxa_finalize as usize)
            .hook("__cxa_thread_atexit_impl", crate::dso::cxa_atexit as usize)
            .hook("__get_tls_hooks", get_tls_hooks as usize);
        builder
    }

    /// Registers `func` for `name`, replacing any earlier entry.
    pub fn hook(&mut self, name: &str, func: usize) -> &mut Self {
        self.entries.insert(name.into(), HookEntry { func, traced: None });
        self
    }

    /// Registers `func` for `name` along with a traced variant used while
    /// tracing is enabled.
    pub fn hook_traced(&mut self, name: &str, func: usize, traced: usize) -> &mut Self {
        self.entries.insert(
            name.into(),
            HookEntry {
                func,
                traced: Some(traced),
            },
        );
        self
    }

    /// Installs the pre-table callback.
    pub fn callback(&mut self, callback: HookCallback) -> &mut Self {
        self.callback = Some(callback);
        self
    }

    pub fn build(self) -> HookTable {
        HookTable {
            entries: self.entries,
            callback: self.callback,
            tracing: AtomicBool::new(false),
        }
    }
}

/// The interposition table the resolution engine consults first.
pub struct HookTable {
    entries: HashMap<Box<str>, HookEntry, DefaultHashBuilder>,
    callback: Option<HookCallback>,
    tracing: AtomicBool,
}

impl HookTable {
    /// Toggles delivery of traced variants.
    pub fn set_tracing(&self, enabled: bool) {
        self.tracing.store(enabled, Ordering::Relaxed);
    }

    /// Resolves `name`: the callback first, then the table. With tracing
    /// enabled an entry's traced variant wins over its direct one.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        if let Some(callback) = self.callback
            && let Some(addr) = callback(name)
        {
            log::debug!("hook callback claimed \"{name}\" -> {addr:#x}");
            return Some(addr);
        }
        let entry = self.entries.get(name)?;
        if self.tracing.load(Ordering::Relaxed)
            && let Some(traced) = entry.traced
        {
            return Some(traced);
        }
        Some(entry.func)
    }

    /// Number of hooked names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hooked accessor handing foreign code its shadow thread block.
pub unsafe extern "C" fn get_tls_hooks() -> *mut c_void {
    crate::tls::shadow_block_addr() as *mut c_void
}
