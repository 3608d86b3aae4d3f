//! Architecture support for the bridge.
//!
//! Each architecture module exposes the same surface: relocation type
//! constants and names, the compound-relocation rule, thread-local access
//! instruction accessors where the architecture has a patcher, and a
//! trampoline code template with named holes. The modules are compiled on
//! every host so the pure pieces stay testable; only the thread-pointer
//! read and the cache flush are native-only.

pub mod aarch64;
pub mod x86_64;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        pub use aarch64::*;
    } else if #[cfg(target_arch = "x86_64")] {
        pub use x86_64::*;
    }
}
