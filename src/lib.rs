//! # abi-bridge
//! Runtime pieces for loading and calling shared objects that were built
//! against a foreign C library ABI (bionic-style symbol names, thread-local
//! storage layout and cleanup conventions) from a host process using an
//! incompatible C runtime.
//!
//! The crate covers what happens *after* a foreign object's segments are
//! mapped: binding its relocations against host-controlled lookup scopes,
//! interposing libc-equivalent symbols, rewriting thread-pointer-relative
//! accesses to a private shadow TLS block, and tracking destructor
//! registrations so teardown never calls into an unmapped library.
//! Segment mapping and process bring-up belong to the embedding loader.

pub mod allocator;
pub mod arch;
pub mod config;
pub mod dso;
pub mod hooks;
pub mod hwoverride;
pub mod image;
pub mod logging;
pub mod mmap;
pub mod properties;
pub mod relocation;
pub mod symbol;
pub mod tls;

use std::borrow::Cow;
use std::fmt::Display;

/// Error types used throughout the bridge runtime.
///
/// A failed load leaves the object in a rejected, well-defined state; none
/// of the components unwind across the load boundary.
#[derive(Debug)]
pub enum Error {
    /// An error occurred while reading bridge input files (property store,
    /// boot command line).
    Io {
        /// A descriptive message about the I/O error.
        msg: Cow<'static, str>,
    },

    /// An error occurred during memory mapping or protection changes.
    Mmap {
        /// A descriptive message about the memory mapping error.
        msg: Cow<'static, str>,
    },

    /// An error occurred while binding a foreign object's relocations:
    /// an unresolved non-weak symbol, an unsupported relocation kind, or a
    /// malformed relocation stream.
    Relocation {
        /// A descriptive message naming the object and the symbol or kind.
        msg: Cow<'static, str>,
    },

    /// An error raised by an embedding-provided callback or handler.
    Custom {
        /// A descriptive message about the custom error.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io { msg } => write!(f, "I/O error: {msg}"),
            Error::Mmap { msg } => write!(f, "Memory mapping error: {msg}"),
            Error::Relocation { msg } => write!(f, "Relocation error: {msg}"),
            Error::Custom { msg } => write!(f, "Custom error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Io { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn map_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Mmap { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn relocate_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Relocation { msg: msg.into() }
}

/// Creates a custom error with the specified message.
#[cold]
#[inline(never)]
pub fn custom_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Custom { msg: msg.into() }
}

/// Unrecoverable internal failure. The bridge has no fallback when it
/// cannot grow its own bookkeeping, so this never returns.
#[cold]
#[inline(never)]
pub(crate) fn fatal(msg: std::fmt::Arguments<'_>) -> ! {
    log::error!("fatal: {msg}");
    eprintln!("abi-bridge fatal: {msg}");
    std::process::abort();
}

pub type Result<T> = core::result::Result<T, Error>;
