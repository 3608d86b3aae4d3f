mod common;

use abi_bridge::arch::aarch64::{self, TLS_MAX_OFFSET};
use abi_bridge::config::TlsPatchMode;
use abi_bridge::tls::TlsPatcher;
use rstest::rstest;

/// `mrs xN, tpidr_el0`
fn mrs(dest: u32) -> u32 {
    0xD53B_D040 | dest
}

/// `ldr xT, [xN, #imm * 8]`
fn ldr(rt: u32, base: u32, imm: u32) -> u32 {
    0xF940_0000 | (imm << 10) | (base << 5) | rt
}

/// `str xT, [xN, #imm * 8]`
fn str64(rt: u32, base: u32, imm: u32) -> u32 {
    0xF900_0000 | (imm << 10) | (base << 5) | rt
}

const NOP: u32 = 0xD503_201F;

#[rstest]
fn reserved_slot_access_is_displaced() {
    common::init_logging();
    let mut code = [mrs(3), ldr(2, 3, 3), NOP, str64(4, 3, 4)];
    let patched = aarch64::patch_tls_range(&mut code, 16);
    // Only the first access after the mrs is rewritten.
    assert_eq!(patched, 1);
    assert_eq!(code[1], ldr(2, 3, 19));
    assert_eq!(code[3], str64(4, 3, 4));
}

#[rstest]
fn each_mrs_opens_its_own_window() {
    let mut code = [mrs(3), ldr(2, 3, 3), mrs(7), str64(0, 7, 4)];
    let patched = aarch64::patch_tls_range(&mut code, 8);
    assert_eq!(patched, 2);
    assert_eq!(code[1], ldr(2, 3, 11));
    assert_eq!(code[3], str64(0, 7, 12));
}

#[rstest]
#[case(2)]
#[case(5)]
fn accesses_outside_the_reserved_slots_are_left_alone(#[case] imm: u32) {
    let mut code = [mrs(3), ldr(2, 3, imm)];
    assert_eq!(aarch64::patch_tls_range(&mut code, 16), 0);
    assert_eq!(code[1], ldr(2, 3, imm));
}

#[rstest]
fn access_off_another_register_is_left_alone() {
    let mut code = [mrs(3), ldr(2, 5, 3)];
    assert_eq!(aarch64::patch_tls_range(&mut code, 16), 0);
    assert_eq!(code[1], ldr(2, 5, 3));
}

#[rstest]
fn access_past_the_scan_window_is_left_alone() {
    let mut code = [mrs(3), NOP, NOP, NOP, NOP, ldr(2, 3, 3)];
    assert_eq!(aarch64::patch_tls_range(&mut code, 16), 0);
    assert_eq!(code[5], ldr(2, 3, 3));
}

#[rstest]
fn patching_is_idempotent() {
    let mut code = [mrs(3), ldr(2, 3, 3)];
    assert_eq!(aarch64::patch_tls_range(&mut code, 16), 1);
    let once = code;
    // The rewritten displacement sits outside the reserved window now.
    assert_eq!(aarch64::patch_tls_range(&mut code, 16), 0);
    assert_eq!(code, once);
}

#[rstest]
fn patcher_rewrites_selected_library() {
    let patcher = TlsPatcher::with_displacement(TlsPatchMode::All, 32);
    let mut code = [mrs(1), ldr(0, 1, 3)];
    assert_eq!(patcher.patch_library("libfoo.so", &mut code), 1);
    assert_eq!(code[1], ldr(0, 1, 35));
}

#[rstest]
fn patcher_gates_on_basename_list() {
    let mode = TlsPatchMode::Libraries(vec!["libcamera.so".into()]);
    let patcher = TlsPatcher::with_displacement(mode, 32);
    assert!(patcher.should_patch("/system/lib64/libcamera.so"));
    assert!(patcher.should_patch("libcamera.so"));
    assert!(!patcher.should_patch("/system/lib64/libaudio.so"));

    let mut code = [mrs(1), ldr(0, 1, 3)];
    assert_eq!(patcher.patch_library("libaudio.so", &mut code), 0);
    assert_eq!(code[1], ldr(0, 1, 3));
}

#[rstest]
fn disabled_patcher_touches_nothing() {
    let patcher = TlsPatcher::with_displacement(TlsPatchMode::Disabled, 32);
    assert!(!patcher.should_patch("libfoo.so"));
    let mut code = [mrs(1), ldr(0, 1, 3)];
    assert_eq!(patcher.patch_library("libfoo.so", &mut code), 0);
}

#[rstest]
fn out_of_range_displacement_disables_patching() {
    let patcher =
        TlsPatcher::with_displacement(TlsPatchMode::All, TLS_MAX_OFFSET as usize + 1);
    let mut code = [mrs(1), ldr(0, 1, 3)];
    assert_eq!(patcher.patch_library("libfoo.so", &mut code), 0);
    // The decision is permanent for this patcher, and a second patcher
    // with the same displacement stays disabled too.
    assert_eq!(patcher.patch_library("libbar.so", &mut code), 0);
    let another =
        TlsPatcher::with_displacement(TlsPatchMode::All, TLS_MAX_OFFSET as usize + 1);
    assert_eq!(another.patch_library("libbaz.so", &mut code), 0);
    assert_eq!(code[1], ldr(0, 1, 3));
}
