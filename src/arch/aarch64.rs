//! AArch64 relocation constants, thread-local access instruction fields
//! and the tracing trampoline template.

use elf::abi::*;

/// The ELF machine type for AArch64.
pub const EM_ARCH: u16 = EM_AARCH64;

/// No-op relocation type.
pub const REL_NONE: u32 = R_AARCH64_NONE;
/// Relative relocation type - add base address to relative offset.
pub const REL_RELATIVE: u32 = R_AARCH64_RELATIVE;
/// Symbolic relocation type - set to absolute symbol address.
pub const REL_SYMBOLIC: u32 = R_AARCH64_ABS64;
/// PC-relative relocation type - symbol address minus place.
pub const REL_PC: u32 = R_AARCH64_PREL64;
/// GOT entry relocation type - set GOT entry to symbol address.
pub const REL_GOT: u32 = R_AARCH64_GLOB_DAT;
/// PLT jump slot relocation type - set PLT entry to symbol address.
pub const REL_JUMP_SLOT: u32 = R_AARCH64_JUMP_SLOT;

/// The only (second, third) type pair accepted in a compound relocation
/// entry besides (none, none). AArch64 has no widening chain, so every
/// compound entry is rejected.
pub const COMPOUND_PAIR: Option<(u32, u32)> = None;

/// Map an AArch64 relocation type to a human readable name.
pub fn rel_type_to_str(r_type: u32) -> &'static str {
    match r_type {
        R_AARCH64_NONE => "R_AARCH64_NONE",
        R_AARCH64_ABS64 => "R_AARCH64_ABS64",
        R_AARCH64_PREL64 => "R_AARCH64_PREL64",
        R_AARCH64_GLOB_DAT => "R_AARCH64_GLOB_DAT",
        R_AARCH64_RELATIVE => "R_AARCH64_RELATIVE",
        R_AARCH64_JUMP_SLOT => "R_AARCH64_JUMP_SLOT",
        _ => "UNKNOWN",
    }
}

// Thread-local access rewriting.
//
// The foreign objects address their thread block as `MRS Xn, TPIDR_EL0`
// followed shortly by a 64-bit LDR/STR with an unsigned immediate offset
// based on Xn. The patcher moves those accesses into the bridge's shadow
// block by adding a displacement to the immediate. All field work is done
// with masks and shifts over the raw `u32`; the word is never reinterpreted
// as a packed structure.

/// Thread-local slot index below the patchable window.
pub const TLS_SLOT_APP: u32 = 2;
/// Thread-local slot index above the patchable window.
pub const TLS_SLOT_STACK_GUARD: u32 = 5;
/// Largest displacement an unsigned 12-bit immediate can absorb.
pub const TLS_MAX_OFFSET: u32 = 0xFFF;

/// How many instructions after an `MRS` the matching load or store may
/// trail by.
const TLS_SCAN_WINDOW: usize = 4;

const MRS_OPCODE: u32 = 0xD53;
const SYSREG_TPIDR_EL0: u32 = 0x5E82;
const LDST_LDR64: u32 = 0xE5;
const LDST_STR64: u32 = 0xE4;
const LDST_SIZE_64: u32 = 0b11;

/// Returns the destination register if `insn` is `MRS Xn, TPIDR_EL0`.
#[inline]
pub fn mrs_tpidr_dest(insn: u32) -> Option<u32> {
    if insn >> 20 == MRS_OPCODE && (insn >> 5) & 0x7FFF == SYSREG_TPIDR_EL0 {
        Some(insn & 0x1F)
    } else {
        None
    }
}

/// Whether `insn` is a 64-bit LDR or STR with an unsigned immediate offset.
#[inline]
pub fn is_ldst_uimm64(insn: u32) -> bool {
    let op = (insn >> 22) & 0xFF;
    (op == LDST_LDR64 || op == LDST_STR64) && insn >> 30 == LDST_SIZE_64
}

/// Base register field of a load/store.
#[inline]
pub fn ldst_base(insn: u32) -> u32 {
    (insn >> 5) & 0x1F
}

/// Unsigned immediate field of a load/store, scaled in doublewords.
#[inline]
pub fn ldst_imm12(insn: u32) -> u32 {
    (insn >> 10) & 0xFFF
}

/// Replaces the unsigned immediate field of a load/store.
#[inline]
pub fn set_ldst_imm12(insn: u32, imm: u32) -> u32 {
    (insn & !(0xFFF << 10)) | ((imm & 0xFFF) << 10)
}

/// Rewrites thread-pointer-relative accesses in `code` by adding `offset`
/// (in doubleword slots) to their displacement. Returns the number of
/// instructions patched.
///
/// Only accesses whose displacement falls strictly inside the reserved
/// slot window are touched, so a patched instruction never matches a
/// second time.
pub fn patch_tls_range(code: &mut [u32], offset: u32) -> usize {
    let mut patched = 0;
    let mut i = 0;
    while i < code.len() {
        if let Some(base) = mrs_tpidr_dest(code[i]) {
            let end = (i + 1 + TLS_SCAN_WINDOW).min(code.len());
            for j in i + 1..end {
                let insn = code[j];
                if !is_ldst_uimm64(insn) || ldst_base(insn) != base {
                    continue;
                }
                let imm = ldst_imm12(insn);
                if imm > TLS_SLOT_APP && imm < TLS_SLOT_STACK_GUARD {
                    code[j] = set_ldst_imm12(insn, imm + offset);
                    patched += 1;
                    break;
                }
            }
        }
        i += 1;
    }
    patched
}

/// Reads the thread pointer.
#[cfg(target_arch = "aarch64")]
#[inline]
pub fn thread_pointer() -> usize {
    let tp: usize;
    unsafe {
        core::arch::asm!("mrs {tp}, tpidr_el0", tp = out(reg) tp, options(nostack, nomem));
    }
    tp
}

// Tracing trampoline.
//
// The stub spills every general-purpose register and the link register,
// calls the tracing callback with (name, saved registers, target), restores
// everything and tail-jumps to the real target through x16 (the
// intra-procedure-call scratch register). The three literals live in a
// pool behind the code so a trampoline is a template plus three holes.

const TRAMPOLINE_WORDS: usize = 46;
const NAME_WORD: usize = 40;
const TARGET_WORD: usize = 42;
const TRACER_WORD: usize = 44;

/// Trampoline size in bytes.
pub const TRAMPOLINE_SIZE: usize = TRAMPOLINE_WORDS * 4;
/// Byte offset of the symbol-name pointer hole.
pub const TRAMPOLINE_NAME_HOLE: usize = NAME_WORD * 4;
/// Byte offsets of the target-address holes.
pub const TRAMPOLINE_TARGET_HOLES: &[usize] = &[TARGET_WORD * 4];
/// Byte offset of the tracing-callback hole.
pub const TRAMPOLINE_TRACER_HOLE: usize = TRACER_WORD * 4;

#[inline]
fn ldr_literal(rt: u32, from: usize, to: usize) -> u32 {
    0x5800_0000 | (((to - from) as u32) << 5) | rt
}

/// Builds the trampoline code with all three holes zeroed.
pub fn trampoline_template() -> [u8; TRAMPOLINE_SIZE] {
    let mut words = [0u32; TRAMPOLINE_WORDS];
    let mut i = 0;

    // stp xN, xN+1, [sp, #-16]! for x0..x29, then the link register.
    let mut reg = 0u32;
    while reg < 30 {
        words[i] = 0xA9BF_03E0 | ((reg + 1) << 10) | reg;
        i += 1;
        reg += 2;
    }
    words[i] = 0xF81F_0FFE; // str x30, [sp, #-16]!
    i += 1;

    words[i] = ldr_literal(0, i, NAME_WORD); // ldr x0, name
    i += 1;
    words[i] = 0x9103_C3E1; // add x1, sp, #240 (saved x0)
    i += 1;
    words[i] = ldr_literal(2, i, TARGET_WORD); // ldr x2, target
    i += 1;
    words[i] = ldr_literal(4, i, TRACER_WORD); // ldr x4, tracer
    i += 1;
    words[i] = 0xD63F_0080; // blr x4
    i += 1;

    words[i] = 0xF841_07FE; // ldr x30, [sp], #16
    i += 1;
    let mut reg = 28i32;
    while reg >= 0 {
        words[i] = 0xA8C1_03E0 | (((reg + 1) as u32) << 10) | reg as u32;
        i += 1;
        reg -= 2;
    }

    words[i] = ldr_literal(16, i, TARGET_WORD); // ldr x16, target
    i += 1;
    words[i] = 0xD61F_0200; // br x16
    i += 1;
    words[i] = 0xD503_201F; // nop (aligns the literal pool)

    let mut bytes = [0u8; TRAMPOLINE_SIZE];
    for (dst, word) in bytes.chunks_exact_mut(4).zip(words) {
        dst.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Makes freshly written code at `start..start+len` visible to the
/// instruction stream.
#[allow(unused_variables)]
pub fn flush_icache(start: *const u8, len: usize) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        // Clean each line to the point of unification, then invalidate the
        // corresponding instruction-cache lines. 64-byte lines cover every
        // current implementation; a finer line size only costs extra ops.
        let mut addr = start as usize & !63;
        let end = start as usize + len;
        while addr < end {
            core::arch::asm!("dc cvau, {a}", a = in(reg) addr, options(nostack));
            addr += 64;
        }
        core::arch::asm!("dsb ish", options(nostack));
        let mut addr = start as usize & !63;
        while addr < end {
            core::arch::asm!("ic ivau, {a}", a = in(reg) addr, options(nostack));
            addr += 64;
        }
        core::arch::asm!("dsb ish", "isb", options(nostack));
    }
}
