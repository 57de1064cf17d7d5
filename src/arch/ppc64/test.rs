use super::build_intervals;
use crate::map::arena::Arena;
use crate::recipe::{BpLoc, Interval, RaLoc, RecipeFlags, SpLoc, REG_LINK, REG_SCRATCH};

const STWU_M32: u32 = 0x9421_ffe0; // stwu r1,-32(r1)
const MFLR_R0: u32 = 0x7c08_02a6;
const STW_R0_36: u32 = 0x9001_0024; // stw r0,36(r1)
const NOP: u32 = 0x6000_0000; // ori r0,r0,0
const LWZ_R0_36: u32 = 0x8001_0024; // lwz r0,36(r1)
const MTLR_R0: u32 = 0x7c08_03a6;
const ADDI_SP_32: u32 = 0x3821_0020; // addi r1,r1,32
const BLR: u32 = 0x4e80_0020;
const STWUX: u32 = 0x7c21_496e; // stwux r1,r1,r9
const STDU_M128: u32 = 0xf821_ff81; // stdu r1,-128(r1)
const STD_R0_136: u32 = 0xf801_0088; // std r0,136(r1)

const BASE: usize = 0x10_0000;

fn build(words: &[u32]) -> Vec<Interval> {
    let arena = Arena::new(1 << 20).unwrap();
    let code: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
    build_intervals(&arena, &code, BASE).unwrap().to_vec()
}

fn assert_tiles(chain: &[Interval], start: usize, end: usize) {
    assert!(!chain.is_empty());
    assert_eq!(chain.first().unwrap().start, start);
    assert_eq!(chain.last().unwrap().end, end);
    for w in chain.windows(2) {
        assert_eq!(w[0].end, w[1].start, "gap or overlap in {:?}", chain);
        assert_ne!(w[0].recipe, w[1].recipe, "uncoalesced neighbors in {:?}", chain);
    }
}

#[test]
fn test_standard_frame() {
    let chain = build(&[STWU_M32, MFLR_R0, STW_R0_36, NOP, LWZ_R0_36, MTLR_R0, BLR]);
    assert_tiles(&chain, BASE, BASE + 28);
    assert_eq!(chain.len(), 6);

    let sp: Vec<_> = chain.iter().map(|iv| iv.recipe.sp).collect();
    assert_eq!(
        sp,
        [
            SpLoc::Reg,
            SpLoc::SpRel(32),
            SpLoc::SpRel(32),
            SpLoc::SpRel(32),
            SpLoc::SpRel(32),
            SpLoc::SpRel(32),
        ]
    );
    let ra: Vec<_> = chain.iter().map(|iv| iv.recipe.ra).collect();
    assert_eq!(
        ra,
        [
            RaLoc::Reg(REG_LINK),
            RaLoc::Reg(REG_LINK),
            RaLoc::Reg(REG_SCRATCH),
            RaLoc::SpRel(36),
            RaLoc::Reg(REG_SCRATCH),
            RaLoc::Reg(REG_LINK),
        ]
    );
    // The linkage slot spans the body, here just the nop.
    assert_eq!(chain[3].start, BASE + 12);
    assert_eq!(chain[3].end, BASE + 20);
    for iv in &chain {
        assert_eq!(iv.recipe.bp, BpLoc::Unchanged);
        assert!(iv.recipe.flags.contains(RecipeFlags::SP_DEREF | RecipeFlags::RA_LINK_SLOT));
    }
}

#[test]
fn test_standard_frame_with_dealloc() {
    let chain =
        build(&[STWU_M32, MFLR_R0, STW_R0_36, NOP, LWZ_R0_36, MTLR_R0, ADDI_SP_32, BLR]);
    assert_tiles(&chain, BASE, BASE + 32);
    assert_eq!(chain.len(), 7);
    assert_eq!(chain.last().unwrap().recipe.sp, SpLoc::Reg);
    assert_eq!(chain.last().unwrap().recipe.ra, RaLoc::Reg(REG_LINK));
}

#[test]
fn test_variable_sized_frame() {
    // stwu allocates 48, then stwux extends by a register amount.
    let chain = build(&[0x9421_ffd0, STWUX, NOP]);
    assert_tiles(&chain, BASE, BASE + 12);
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[1].recipe.sp, SpLoc::SpRel(48));
    assert!(!chain[1].recipe.flags.contains(RecipeFlags::FRAME_SZ_UNKNOWN));
    assert_eq!(chain[2].recipe.sp, SpLoc::SpRel(-1));
    assert!(chain[2].recipe.flags.contains(RecipeFlags::FRAME_SZ_UNKNOWN));
}

#[test]
fn test_interior_return_restores_canonical() {
    // RA is back in R0 when the interior blr hits; the bytes after it must
    // unwind with the canonical (post-prologue) recipe.
    let chain = build(&[STWU_M32, MFLR_R0, STW_R0_36, LWZ_R0_36, BLR, NOP, NOP]);
    assert_tiles(&chain, BASE, BASE + 28);
    let after_blr = chain.iter().find(|iv| iv.start == BASE + 20).unwrap();
    assert_eq!(after_blr.recipe.ra, RaLoc::SpRel(36));
    assert_eq!(after_blr.recipe.sp, SpLoc::SpRel(32));
}

#[test]
fn test_final_blr_is_not_interior() {
    let chain = build(&[STWU_M32, MFLR_R0, STW_R0_36, LWZ_R0_36, BLR]);
    // No canonical restore after the last instruction.
    assert_eq!(chain.last().unwrap().recipe.ra, RaLoc::Reg(REG_SCRATCH));
}

#[test]
fn test_doubleword_family() {
    // stdu/std with an 8-byte linkage word: 128 + 8 = 136.
    let chain = build(&[STDU_M128, MFLR_R0, STD_R0_136, NOP]);
    assert_tiles(&chain, BASE, BASE + 16);
    assert_eq!(chain[1].recipe.sp, SpLoc::SpRel(128));
    assert_eq!(chain[3].recipe.ra, RaLoc::SpRel(136));
}

#[test]
fn test_unrelated_store_does_not_become_linkage() {
    // stw r0,8(r1) with a 32-word frame misses the linkage slot check.
    let chain = build(&[STWU_M32, MFLR_R0, 0x9001_0008, NOP]);
    assert!(chain.iter().all(|iv| !matches!(iv.recipe.ra, RaLoc::SpRel(_))));
}

#[test]
fn test_empty_function_rejected() {
    let arena = Arena::new(1 << 20).unwrap();
    assert!(build_intervals(&arena, &[], BASE).is_none());
}

#[test]
fn test_build_twice_identical() {
    let words = [STWU_M32, MFLR_R0, STW_R0_36, NOP, LWZ_R0_36, MTLR_R0, BLR];
    assert_eq!(build(&words), build(&words));
}

proptest::proptest! {
    /// Arbitrary bytes never break the tiling invariants, and building
    /// twice gives the same chain.
    #[test]
    fn prop_random_code_tiles(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 4..256)) {
        let arena = Arena::new(1 << 20).unwrap();
        let a = build_intervals(&arena, &bytes, BASE).unwrap().to_vec();
        assert_tiles(&a, BASE, BASE + bytes.len());
        let b = build_intervals(&arena, &bytes, BASE).unwrap().to_vec();
        proptest::prop_assert_eq!(a, b);
    }
}
