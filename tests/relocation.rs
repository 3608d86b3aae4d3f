mod common;

use abi_bridge::arch;
use abi_bridge::hooks::HookTableBuilder;
use abi_bridge::image::GotInfo;
use abi_bridge::relocation::{RelocEntry, RelocStream, RelocationEngine};
use abi_bridge::symbol::{LookupScope, Symbol};
use common::{pending_image, provider};
use elf::abi::{STB_GLOBAL, STB_WEAK, STV_DEFAULT, STV_HIDDEN, STV_PROTECTED};
use rstest::rstest;

const BASE: usize = 0x7000_0000;
const WORD: usize = size_of::<usize>();

#[rstest]
fn relative_entries_bind_against_load_bias() {
    common::init_logging();
    let relocs = vec![
        RelocEntry::new(0x10, 0, arch::REL_RELATIVE, 0x100),
        RelocEntry::new(0x18, 0, arch::REL_RELATIVE, 0x200),
    ];
    let mut image = pending_image("librel.so", BASE, 0x40, Vec::new(), relocs);
    let scope = LookupScope::new(&[], &[]);
    RelocationEngine::new().relocate(&mut image, &scope).unwrap();
    assert_eq!(image.read_word(0x10).unwrap(), BASE + 0x100);
    assert_eq!(image.read_word(0x18).unwrap(), BASE + 0x200);
}

#[rstest]
fn named_entries_bind_to_scope_definitions() {
    let exporter = provider("libexport.so", 0x100000, vec![Symbol::global("answer", 0x40)]);
    let globals = [&exporter];
    let scope = LookupScope::new(&globals, &[]);

    let symbols = vec![Symbol::undefined("answer", STB_GLOBAL)];
    let relocs = vec![
        RelocEntry::new(0x00, 1, arch::REL_SYMBOLIC, 8),
        RelocEntry::new(0x08, 1, arch::REL_GOT, 0),
        RelocEntry::new(0x10, 1, arch::REL_JUMP_SLOT, 0),
        RelocEntry::new(0x18, 1, arch::REL_PC, 0),
    ];
    let mut image = pending_image("libuse.so", BASE, 0x40, symbols, relocs);
    RelocationEngine::new().relocate(&mut image, &scope).unwrap();

    let target = 0x100000 + 0x40;
    assert_eq!(image.read_word(0x00).unwrap(), target + 8);
    assert_eq!(image.read_word(0x08).unwrap(), target);
    assert_eq!(image.read_word(0x10).unwrap(), target);
    assert_eq!(
        image.read_word(0x18).unwrap(),
        target.wrapping_sub(BASE + 0x18)
    );
}

#[rstest]
fn global_group_wins_over_local_group() {
    let in_global = provider("libglobal.so", 0x100000, vec![Symbol::global("dup", 0x10)]);
    let in_local = provider("liblocal.so", 0x200000, vec![Symbol::global("dup", 0x20)]);
    let globals = [&in_global];
    let locals = [&in_local];
    let scope = LookupScope::new(&globals, &locals);

    let symbols = vec![Symbol::undefined("dup", STB_GLOBAL)];
    let relocs = vec![RelocEntry::new(0, 1, arch::REL_SYMBOLIC, 0)];
    let mut image = pending_image("libuse.so", BASE, WORD, symbols, relocs);
    RelocationEngine::new().relocate(&mut image, &scope).unwrap();
    assert_eq!(image.read_word(0).unwrap(), 0x100000 + 0x10);
}

#[rstest]
fn weak_undefined_binds_to_zero() {
    let symbols = vec![Symbol::undefined("might_exist", STB_WEAK)];
    let relocs = vec![RelocEntry::new(0, 1, arch::REL_SYMBOLIC, 8)];
    let mut image = pending_image("libweak.so", BASE, WORD, symbols, relocs);
    let scope = LookupScope::new(&[], &[]);
    RelocationEngine::new().relocate(&mut image, &scope).unwrap();
    assert_eq!(image.read_word(0).unwrap(), 0);
}

#[rstest]
fn unresolved_strong_reference_fails_naming_both() {
    let symbols = vec![Symbol::undefined("missing_fn", STB_GLOBAL)];
    let relocs = vec![RelocEntry::new(0, 1, arch::REL_SYMBOLIC, 0)];
    let mut image = pending_image("libneedy.so", BASE, WORD, symbols, relocs);
    let scope = LookupScope::new(&[], &[]);
    let err = RelocationEngine::new()
        .relocate(&mut image, &scope)
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("libneedy.so"), "{msg}");
    assert!(msg.contains("missing_fn"), "{msg}");
}

#[rstest]
fn unknown_relocation_kind_fails() {
    let relocs = vec![RelocEntry::new(0, 0, 0xFFF0, 0)];
    let mut image = pending_image("libodd.so", BASE, WORD, Vec::new(), relocs);
    let scope = LookupScope::new(&[], &[]);
    let err = RelocationEngine::new()
        .relocate(&mut image, &scope)
        .unwrap_err();
    assert!(err.to_string().contains("UNKNOWN"), "{err}");
}

#[rstest]
fn compound_chains_are_rejected() {
    let mut entry = RelocEntry::new(0, 0, arch::REL_RELATIVE, 0);
    entry.kind2 = arch::REL_SYMBOLIC;
    let mut image = pending_image("libchain.so", BASE, WORD, Vec::new(), vec![entry]);
    let scope = LookupScope::new(&[], &[]);
    let err = RelocationEngine::new()
        .relocate(&mut image, &scope)
        .unwrap_err();
    assert!(err.to_string().contains("compound"), "{err}");
}

#[rstest]
fn relocation_is_deterministic_across_passes() {
    let exporter = provider("libexport.so", 0x300000, vec![Symbol::global("stable", 0x80)]);
    let globals = [&exporter];
    let scope = LookupScope::new(&globals, &[]);

    let symbols = vec![Symbol::undefined("stable", STB_GLOBAL)];
    let relocs = vec![
        RelocEntry::new(0x00, 1, arch::REL_SYMBOLIC, 0),
        RelocEntry::new(0x08, 0, arch::REL_RELATIVE, 0x20),
    ];
    let mut image = pending_image("libtwice.so", BASE, 0x20, symbols, relocs);
    let engine = RelocationEngine::new();

    engine.relocate(&mut image, &scope).unwrap();
    let first = (image.read_word(0).unwrap(), image.read_word(8).unwrap());
    engine.relocate(&mut image, &scope).unwrap();
    let second = (image.read_word(0).unwrap(), image.read_word(8).unwrap());
    assert_eq!(first, second);
}

#[rstest]
fn packed_stream_matches_plain_entries() {
    let exporter = provider("libexport.so", 0x400000, vec![Symbol::global("fn_a", 0x100)]);
    let globals = [&exporter];
    let scope = LookupScope::new(&globals, &[]);
    let engine = RelocationEngine::new();

    let symbols = vec![Symbol::undefined("fn_a", STB_GLOBAL)];
    let entries = vec![
        RelocEntry::new(0x10, 0, arch::REL_RELATIVE, 0x1000),
        RelocEntry::new(0x18, 0, arch::REL_RELATIVE, 0x2000),
        RelocEntry::new(0x20, 1, arch::REL_SYMBOLIC, 4),
    ];

    let mut plain = pending_image("libplain.so", BASE, 0x40, symbols.clone(), entries.clone());
    engine.relocate(&mut plain, &scope).unwrap();

    let mut packed = pending_image("libpacked.so", BASE, 0x40, symbols, Vec::new());
    packed.set_relocations(RelocStream::Packed(common::pack_relocs(&entries)));
    engine.relocate(&mut packed, &scope).unwrap();

    for offset in [0x10, 0x18, 0x20] {
        assert_eq!(
            plain.read_word(offset).unwrap(),
            packed.read_word(offset).unwrap()
        );
    }
}

#[rstest]
fn hostile_offset_fails_cleanly() {
    let relocs = vec![RelocEntry::new(usize::MAX - 2, 0, arch::REL_RELATIVE, 0)];
    let mut image = pending_image("libhostile.so", BASE, WORD, Vec::new(), relocs);
    let scope = LookupScope::new(&[], &[]);
    assert!(RelocationEngine::new().relocate(&mut image, &scope).is_err());
    assert!(image.read_word(usize::MAX).is_err());
}

#[rstest]
fn malformed_packed_stream_fails() {
    let mut image = pending_image("libbad.so", BASE, WORD, Vec::new(), Vec::new());
    image.set_relocations(RelocStream::Packed(b"APS9".to_vec()));
    let scope = LookupScope::new(&[], &[]);
    assert!(RelocationEngine::new().relocate(&mut image, &scope).is_err());
}

fn got_symbols() -> Vec<Symbol> {
    let mut protected = Symbol::global("own_fn", 0x60);
    protected.visibility = STV_PROTECTED;
    vec![
        Symbol::undefined("ext_fn", STB_GLOBAL),
        protected,
        Symbol::undefined("opt_fn", STB_WEAK),
    ]
}

#[rstest]
fn got_pass_populates_local_and_global_entries() {
    let exporter = provider("libexport.so", 0x500000, vec![Symbol::global("ext_fn", 0x30)]);
    let globals = [&exporter];
    let scope = LookupScope::new(&globals, &[]);

    let mut image = pending_image("libgot.so", BASE, 0x200, got_symbols(), Vec::new());
    image.set_got(GotInfo {
        offset: 0x100,
        local_count: 2,
        first_global_sym: 1,
    });
    // The static linker leaves unbiased addresses in the local entries.
    image.write_word(0x100, 0x40).unwrap();
    image.write_word(0x108, 0x80).unwrap();

    RelocationEngine::new().relocate_got(&mut image, &scope).unwrap();

    assert_eq!(image.read_word(0x100).unwrap(), BASE + 0x40);
    assert_eq!(image.read_word(0x108).unwrap(), BASE + 0x80);
    // Global entries follow the locals in symbol order.
    assert_eq!(image.read_word(0x110).unwrap(), 0x500000 + 0x30);
    assert_eq!(image.read_word(0x118).unwrap(), BASE + 0x60);
    assert_eq!(image.read_word(0x120).unwrap(), 0);
}

#[rstest]
fn got_pass_rejects_undefined_protected() {
    let mut bad = Symbol::undefined("ghost", STB_GLOBAL);
    bad.visibility = STV_PROTECTED;
    let mut image = pending_image("libgot.so", BASE, 0x200, vec![bad], Vec::new());
    image.set_got(GotInfo {
        offset: 0x100,
        local_count: 0,
        first_global_sym: 1,
    });
    let scope = LookupScope::new(&[], &[]);
    let err = RelocationEngine::new()
        .relocate_got(&mut image, &scope)
        .unwrap_err();
    assert!(err.to_string().contains("ghost"), "{err}");
}

#[rstest]
fn got_pass_rejects_other_visibility() {
    let mut bad = Symbol::global("shy_fn", 0x10);
    bad.visibility = STV_HIDDEN;
    let mut image = pending_image("libgot.so", BASE, 0x200, vec![bad], Vec::new());
    image.set_got(GotInfo {
        offset: 0x100,
        local_count: 0,
        first_global_sym: 1,
    });
    let scope = LookupScope::new(&[], &[]);
    let err = RelocationEngine::new()
        .relocate_got(&mut image, &scope)
        .unwrap_err();
    assert!(err.to_string().contains("visibility"), "{err}");
}

#[rstest]
fn hooked_names_win_over_scope_definitions() {
    let exporter = provider("libexport.so", 0x600000, vec![Symbol::global("hookme", 0x10)]);
    let globals = [&exporter];
    let scope = LookupScope::new(&globals, &[]);

    let mut builder = HookTableBuilder::empty();
    builder.hook("hookme", 0xDEAD_0000);
    let hooks = builder.build();

    let symbols = vec![Symbol::undefined("hookme", STB_GLOBAL)];
    let relocs = vec![RelocEntry::new(0, 1, arch::REL_JUMP_SLOT, 0)];
    let mut image = pending_image("libuse.so", BASE, WORD, symbols, relocs);
    RelocationEngine::with_hooks(&hooks)
        .relocate(&mut image, &scope)
        .unwrap();
    assert_eq!(image.read_word(0).unwrap(), 0xDEAD_0000);
}

#[rstest]
fn versioned_reference_finds_its_matching_definition() {
    let mut v1 = Symbol::global("dlsym", 0x10);
    v1.version = Some("LIBC".into());
    let mut v2 = Symbol::global("dlsym", 0x20);
    v2.version = Some("LIBC_PRIVATE".into());
    let exporter = provider("libexport.so", 0x700000, vec![v1, v2]);
    let globals = [&exporter];
    let scope = LookupScope::new(&globals, &[]);

    let mut reference = Symbol::undefined("dlsym", STB_GLOBAL);
    reference.version = Some("LIBC_PRIVATE".into());
    let relocs = vec![RelocEntry::new(0, 1, arch::REL_SYMBOLIC, 0)];
    let mut image = pending_image("libuse.so", BASE, WORD, vec![reference], relocs);
    RelocationEngine::new().relocate(&mut image, &scope).unwrap();
    assert_eq!(image.read_word(0).unwrap(), 0x700000 + 0x20);
}

#[rstest]
fn self_defined_symbols_resolve_without_scope() {
    let mut symbols = vec![Symbol::global("here", 0x28)];
    symbols[0].visibility = STV_DEFAULT;
    let relocs = vec![RelocEntry::new(0, 1, arch::REL_GOT, 0)];
    let mut image = pending_image("libself.so", BASE, WORD, symbols, relocs);
    let scope = LookupScope::new(&[], &[]);
    RelocationEngine::new().relocate(&mut image, &scope).unwrap();
    assert_eq!(image.read_word(0).unwrap(), BASE + 0x28);
}
