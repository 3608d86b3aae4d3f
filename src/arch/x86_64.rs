//! x86-64 relocation constants and the tracing trampoline template.
//!
//! There is no thread-local access patcher on x86-64: the foreign objects
//! this bridge targets reach their thread block through `%fs` segment
//! overrides that already resolve against the host's thread pointer, so
//! only the relocation constants and the trampoline live here.

use elf::abi::*;

/// The ELF machine type for x86-64.
pub const EM_ARCH: u16 = EM_X86_64;

/// No-op relocation type.
pub const REL_NONE: u32 = R_X86_64_NONE;
/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_X86_64_RELATIVE;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_X86_64_64;
/// PC-relative relocation type - symbol address minus place.
pub const REL_PC: u32 = R_X86_64_PC64;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_X86_64_GLOB_DAT;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_X86_64_JUMP_SLOT;

/// The only (second, third) type pair accepted in a compound relocation
/// entry besides (none, none). x86-64 has no widening chain, so every
/// compound entry is rejected.
pub const COMPOUND_PAIR: Option<(u32, u32)> = None;

/// Map an x86-64 relocation type to a human readable name.
pub fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_PC64 => "R_X86_64_PC64",
        R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
        _ => "UNKNOWN",
    }
}

// Tracing trampoline.
//
// The stub pushes every caller-saved general-purpose register (the return
// address is already on the stack), calls the tracing callback with
// (name, saved registers, target) and tail-jumps to the real target via an
// absolute rip-relative jump, leaving the caller's return address in place.
// Nine pushes keep the stack 16-byte aligned at the callback call site.

/// Trampoline size in bytes.
pub const TRAMPOLINE_SIZE: usize = 75;
/// Byte offset of the symbol-name pointer hole.
pub const TRAMPOLINE_NAME_HOLE: usize = 15;
/// Byte offsets of the target-address holes.
pub const TRAMPOLINE_TARGET_HOLES: &[usize] = &[28, 67];
/// Byte offset of the tracing-callback hole.
pub const TRAMPOLINE_TRACER_HOLE: usize = 38;

/// Builds the trampoline code with all three holes zeroed.
pub fn trampoline_template() -> [u8; TRAMPOLINE_SIZE] {
    let mut code = [0u8; TRAMPOLINE_SIZE];
    code[..15].copy_from_slice(&[
        0x50, // push rax
        0x41, 0x53, // push r11
        0x41, 0x52, // push r10
        0x41, 0x51, // push r9
        0x41, 0x50, // push r8
        0x51, // push rcx
        0x52, // push rdx
        0x56, // push rsi
        0x57, // push rdi
        0x48, 0xBF, // movabs rdi, name
    ]);
    code[23..28].copy_from_slice(&[
        0x48, 0x89, 0xE6, // mov rsi, rsp (saved rdi)
        0x48, 0xBA, // movabs rdx, target
    ]);
    code[36..38].copy_from_slice(&[
        0x48, 0xB8, // movabs rax, tracer
    ]);
    code[46..67].copy_from_slice(&[
        0xFF, 0xD0, // call rax
        0x5F, // pop rdi
        0x5E, // pop rsi
        0x5A, // pop rdx
        0x59, // pop rcx
        0x41, 0x58, // pop r8
        0x41, 0x59, // pop r9
        0x41, 0x5A, // pop r10
        0x41, 0x5B, // pop r11
        0x58, // pop rax
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp [rip], i.e. through the hole below
    ]);
    code
}

/// Makes freshly written code visible to the instruction stream. x86-64
/// keeps instruction and data caches coherent, so this is a no-op.
pub fn flush_icache(_start: *const u8, _len: usize) {}
