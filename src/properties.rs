//! System property access for foreign code.
//!
//! Foreign objects expect an `property_get`/`property_set` pair backed by
//! a property service. The bridge answers from a `key=value` store file,
//! falling back to boot parameters on the kernel command line, and treats
//! writes as a logged no-op. Files are parsed per query; there is no
//! cache to go stale.

use core::ffi::{CStr, c_char, c_int};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Foreign callers pass fixed 92-byte value buffers.
pub const PROP_VALUE_MAX: usize = 92;

/// Property lookups over a store file and the kernel command line.
pub struct PropertyStore {
    prop_file: PathBuf,
    cmdline_file: PathBuf,
}

impl Default for PropertyStore {
    fn default() -> Self {
        PropertyStore {
            prop_file: PathBuf::from("/system/build.prop"),
            cmdline_file: PathBuf::from("/proc/cmdline"),
        }
    }
}

impl PropertyStore {
    /// A store over the given files, for embedders and tests that do not
    /// use the system paths.
    pub fn with_files(prop_file: impl Into<PathBuf>, cmdline_file: impl Into<PathBuf>) -> Self {
        PropertyStore {
            prop_file: prop_file.into(),
            cmdline_file: cmdline_file.into(),
        }
    }

    /// Looks `key` up in the store file, then the command line. A missing
    /// or unreadable file means "no properties", not an error.
    pub fn get(&self, key: &str) -> Option<String> {
        find_key(&self.prop_file, key).or_else(|| find_key_cmdline(&self.cmdline_file, key))
    }

    /// [`get`](Self::get) with a caller default.
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    /// Property writes have nowhere to go without a property service;
    /// the request is logged and dropped.
    pub fn set(&self, key: &str, value: &str) {
        log::info!("property_set(\"{key}\", \"{value}\") ignored, no property service");
    }
}

fn find_key(path: &Path, key: &str) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name == key {
            return Some(value.to_owned());
        }
    }
    None
}

/// Boot parameters spell properties as `androidboot.<name>=<value>` and
/// foreign code asks for them as `ro.<name>`.
fn find_key_cmdline(path: &Path, key: &str) -> Option<String> {
    let mut cmdline = String::new();
    std::fs::File::open(path).ok()?.read_to_string(&mut cmdline).ok()?;
    let wanted = key.strip_prefix("ro.")?;
    for entry in cmdline.trim_end_matches('\n').split(' ') {
        let Some((name, value)) = entry.split_once('=') else {
            continue;
        };
        if name.strip_prefix("androidboot.").is_some_and(|name| name == wanted && !name.is_empty())
        {
            return Some(value.to_owned());
        }
    }
    None
}

/// The process-wide store the hooked entry points answer from.
pub(crate) fn system_store() -> &'static PropertyStore {
    static STORE: OnceLock<PropertyStore> = OnceLock::new();
    STORE.get_or_init(PropertyStore::default)
}

/// Hooked `property_get`: fills `value` (a `PROP_VALUE_MAX` buffer) and
/// returns the value length.
///
/// # Safety
/// `key` and a non-null `default_value` must be valid C strings; `value`
/// must point at a writable buffer of `PROP_VALUE_MAX` bytes.
pub unsafe extern "C" fn property_get(
    key: *const c_char,
    value: *mut c_char,
    default_value: *const c_char,
) -> c_int {
    if key.is_null() || value.is_null() {
        return 0;
    }
    let Ok(key) = unsafe { CStr::from_ptr(key) }.to_str() else {
        return 0;
    };
    let found = system_store().get(key).or_else(|| {
        if default_value.is_null() {
            None
        } else {
            unsafe { CStr::from_ptr(default_value) }
                .to_str()
                .ok()
                .map(str::to_owned)
        }
    });
    let Some(found) = found else {
        unsafe { *value = 0 };
        return 0;
    };
    let bytes = found.as_bytes();
    let len = bytes.len().min(PROP_VALUE_MAX - 1);
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), value.cast::<u8>(), len);
        *value.add(len) = 0;
    }
    len as c_int
}

/// Hooked `property_set`: logged no-op.
///
/// # Safety
/// `key` and `value` must be valid C strings.
pub unsafe extern "C" fn property_set(key: *const c_char, value: *const c_char) -> c_int {
    if key.is_null() || value.is_null() {
        return -1;
    }
    let key = unsafe { CStr::from_ptr(key) }.to_string_lossy();
    let value = unsafe { CStr::from_ptr(value) }.to_string_lossy();
    system_store().set(&key, &value);
    0
}
