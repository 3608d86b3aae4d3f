//! Vendor override resolution for hardware module libraries.
//!
//! A load of `/system/lib/hw/<base>.default.so` may be redirected to a
//! vendor-specific `<base>*.so` under `/system/vendor/lib/hw/`. Every
//! miss, including an unreadable vendor directory, falls back to the
//! requested path.

use std::path::{Path, PathBuf};

const HWOVERRIDE_PATH: &str = "/system/lib/hw/";
const HWVENDOR_PATH: &str = "/system/vendor/lib/hw/";
const DEFAULT_SO: &str = ".default.so";
const SO_SUFFIX: &str = ".so";

/// Override resolver over a pair of module directories.
pub struct HwOverride {
    enabled: bool,
    hw_dir: PathBuf,
    vendor_dir: PathBuf,
}

impl Default for HwOverride {
    fn default() -> Self {
        HwOverride::new(true)
    }
}

impl HwOverride {
    /// A resolver over the system directories. `enabled: false` (the
    /// `HYBRIS_NO_HWOVERRIDE` setting) turns every resolve into a
    /// pass-through.
    pub fn new(enabled: bool) -> Self {
        HwOverride {
            enabled,
            hw_dir: PathBuf::from(HWOVERRIDE_PATH),
            vendor_dir: PathBuf::from(HWVENDOR_PATH),
        }
    }

    /// A resolver over explicit directories, for embedders and tests.
    pub fn with_dirs(hw_dir: impl Into<PathBuf>, vendor_dir: impl Into<PathBuf>) -> Self {
        HwOverride {
            enabled: true,
            hw_dir: hw_dir.into(),
            vendor_dir: vendor_dir.into(),
        }
    }

    /// Resolves `path`, substituting a vendor library when one matches.
    pub fn resolve<'a>(&self, path: &'a Path) -> std::borrow::Cow<'a, Path> {
        match self.find_override(path) {
            Some(substitute) => {
                log::info!(
                    "override HW library {} -> {}",
                    path.display(),
                    substitute.display()
                );
                std::borrow::Cow::Owned(substitute)
            }
            None => std::borrow::Cow::Borrowed(path),
        }
    }

    fn find_override(&self, path: &Path) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        let name = path.strip_prefix(&self.hw_dir).ok()?.to_str()?;
        // Only a direct child of the module directory is eligible.
        if name.contains('/') {
            return None;
        }
        let base = name.strip_suffix(DEFAULT_SO)?;
        if base.is_empty() {
            return None;
        }
        let entries = std::fs::read_dir(&self.vendor_dir).ok()?;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.len() > base.len() + SO_SUFFIX.len()
                && file_name.starts_with(base)
                && file_name.ends_with(SO_SUFFIX)
            {
                return Some(self.vendor_dir.join(file_name));
            }
        }
        None
    }
}
