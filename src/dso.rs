//! DSO lifecycle tracking.
//!
//! Foreign libraries register exit-time destructors keyed by a DSO handle.
//! If the library is unmapped before those run, process exit walks freed
//! code. The tracker reference-counts handles and keeps the owning library
//! pinned while any registration is live; the finalize registry runs the
//! destructors that are still outstanding at teardown, exactly once each.

use core::ffi::{c_int, c_void};
use hashbrown::{DefaultHashBuilder, HashMap};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Keeps the library owning a handle mapped.
///
/// The production implementation wraps the host's dlopen/dlclose pair;
/// tests substitute their own.
pub trait LibraryPinner {
    /// Pins the library containing `handle`. Returns an opaque token for
    /// the later unpin, or `None` when the owner cannot be found.
    fn pin(&self, handle: usize) -> Option<usize>;
    /// Releases a pin taken by [`pin`](Self::pin).
    fn unpin(&self, token: usize);
}

struct HandleEntry {
    count: usize,
    pin: Option<usize>,
}

/// [`LibraryPinner`] backed by the host loader.
///
/// The library owning a handle is found with `dladdr` and reopened by
/// name, which bumps the loader's reference count until the matching
/// `dlclose`. A handle no loaded library owns is counted but not pinned.
pub struct DlPinner;

impl LibraryPinner for DlPinner {
    fn pin(&self, handle: usize) -> Option<usize> {
        let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
        if unsafe { libc::dladdr(handle as *const c_void, &mut info) } == 0
            || info.dli_fname.is_null()
        {
            log::debug!("no loaded library owns DSO handle {handle:#x}");
            return None;
        }
        let lib = unsafe { libc::dlopen(info.dli_fname, libc::RTLD_LAZY) };
        if lib.is_null() {
            log::warn!("cannot pin library for DSO handle {handle:#x}");
            return None;
        }
        Some(lib as usize)
    }

    fn unpin(&self, token: usize) {
        unsafe { libc::dlclose(token as *mut c_void) };
    }
}

/// Handle reference counts with pin-on-first, unpin-on-last semantics.
///
/// Pin and unpin both run outside the internal lock: the pinner may take
/// arbitrary loader locks of its own, and holding ours across it invites
/// an ordering deadlock.
pub struct DsoTracker<P: LibraryPinner> {
    pinner: P,
    handles: Mutex<HashMap<usize, HandleEntry, DefaultHashBuilder>>,
}

impl<P: LibraryPinner> DsoTracker<P> {
    pub fn new(pinner: P) -> Self {
        DsoTracker {
            pinner,
            handles: Mutex::new(HashMap::default()),
        }
    }

    /// Counts one registration against `handle`, pinning its library on
    /// the first one.
    pub fn register(&self, handle: usize) {
        {
            let mut handles = self.lock();
            if let Some(entry) = handles.get_mut(&handle) {
                entry.count += 1;
                return;
            }
        }
        let pin = self.pinner.pin(handle);
        let mut handles = self.lock();
        match handles.get_mut(&handle) {
            // Lost a race against another first registration; give the
            // spare pin back.
            Some(entry) => {
                entry.count += 1;
                drop(handles);
                if let Some(token) = pin {
                    self.pinner.unpin(token);
                }
            }
            None => {
                handles.insert(handle, HandleEntry { count: 1, pin });
            }
        }
    }

    /// Drops one registration against `handle`, unpinning its library
    /// when the last one goes. An unknown handle is a logged no-op.
    pub fn deregister(&self, handle: usize) {
        let mut handles = self.lock();
        let Some(entry) = handles.get_mut(&handle) else {
            drop(handles);
            log::warn!("deregistering unknown DSO handle {handle:#x}");
            return;
        };
        entry.count -= 1;
        if entry.count > 0 {
            return;
        }
        let released = handles.remove(&handle).and_then(|entry| entry.pin);
        drop(handles);
        if let Some(token) = released {
            self.pinner.unpin(token);
        }
    }

    /// Live registration count for `handle`.
    pub fn count(&self, handle: usize) -> usize {
        self.lock().get(&handle).map_or(0, |entry| entry.count)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, HandleEntry, DefaultHashBuilder>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Destructor signature used by the exit-time registration primitive.
pub type DtorFn = unsafe extern "C" fn(*mut c_void);

struct Registration {
    func: DtorFn,
    arg: usize,
    handle: usize,
}

/// Exit-time destructor registrations, keyed by DSO handle.
pub struct FinalizeRegistry {
    entries: Mutex<Vec<Registration>>,
}

impl FinalizeRegistry {
    pub const fn new() -> Self {
        FinalizeRegistry {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, func: DtorFn, arg: usize, handle: usize) {
        self.lock().push(Registration { func, arg, handle });
    }

    /// Runs and removes the destructors registered against `handle`, in
    /// reverse registration order, returning how many ran. Destructors run
    /// outside the lock; a destructor may itself register or finalize.
    pub fn finalize(&self, handle: usize) -> usize {
        let mut selected = Vec::new();
        {
            let mut entries = self.lock();
            let mut i = 0;
            while i < entries.len() {
                if entries[i].handle == handle {
                    selected.push(entries.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        let ran = selected.len();
        for registration in selected.into_iter().rev() {
            unsafe { (registration.func)(registration.arg as *mut c_void) };
        }
        ran
    }

    /// Runs every destructor still registered, in reverse registration
    /// order. Used at process teardown for libraries that never finalized
    /// themselves.
    pub fn finalize_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.lock());
        for registration in drained.into_iter().rev() {
            unsafe { (registration.func)(registration.arg as *mut c_void) };
        }
    }

    /// Registrations currently held for `handle`.
    pub fn count(&self, handle: usize) -> usize {
        self.lock().iter().filter(|r| r.handle == handle).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FinalizeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FinalizeRegistry {
    fn drop(&mut self) {
        self.finalize_all();
    }
}

/// The process-wide registry behind the hooked registration primitives.
pub(crate) fn process_registry() -> &'static FinalizeRegistry {
    static REGISTRY: OnceLock<FinalizeRegistry> = OnceLock::new();
    REGISTRY.get_or_init(FinalizeRegistry::new)
}

/// The process-wide tracker behind the hooked registration primitives.
/// Every registration against a non-null handle counts here, keeping the
/// owning library pinned until its destructors have run.
pub fn process_tracker() -> &'static DsoTracker<DlPinner> {
    static TRACKER: OnceLock<DsoTracker<DlPinner>> = OnceLock::new();
    TRACKER.get_or_init(|| DsoTracker::new(DlPinner))
}

/// Hooked `__cxa_atexit`.
///
/// # Safety
/// `func` must stay callable until it is finalized.
pub unsafe extern "C" fn cxa_atexit(
    func: Option<DtorFn>,
    arg: *mut c_void,
    dso: *mut c_void,
) -> c_int {
    let Some(func) = func else {
        return -1;
    };
    process_registry().register(func, arg as usize, dso as usize);
    if !dso.is_null() {
        process_tracker().register(dso as usize);
    }
    0
}

/// Hooked `__cxa_finalize`. Drops one tracker registration per destructor
/// that ran, releasing the pin when the last one goes.
pub unsafe extern "C" fn cxa_finalize(dso: *mut c_void) {
    let ran = process_registry().finalize(dso as usize);
    if !dso.is_null() {
        let tracker = process_tracker();
        for _ in 0..ran {
            tracker.deregister(dso as usize);
        }
    }
}
