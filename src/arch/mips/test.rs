use super::build_intervals;
use crate::map::arena::Arena;
use crate::recipe::{BpLoc, Interval, RaLoc, RecipeFlags, SpLoc, REG_LINK};

const DADDIU_SP_M96: u32 = 0x67bd_ffa0; // daddiu sp,sp,-96
const DADDIU_SP_P96: u32 = 0x67bd_0060; // daddiu sp,sp,96
const SD_RA_40SP: u32 = 0xffbf_0028; // sd ra,40(sp)
const SD_FP_56SP: u32 = 0xffbe_0038; // sd fp,56(sp)
const LD_RA_40SP: u32 = 0xdfbf_0028; // ld ra,40(sp)
const JR_RA: u32 = 0x03e0_0008;
const NOP: u32 = 0;
const MOVE_V0_FP: u32 = 0x03c0_102d; // daddu v0,fp,zero
const SD_V0_M32FP: u32 = 0xffc2_ffe0; // sd v0,-32(fp)
const SD_RA_M64FP: u32 = 0xffdf_ffc0; // sd ra,-64(fp)
const LD_RA_M64FP: u32 = 0xdfdf_ffc0; // ld ra,-64(fp)
const DSUBU_SP_V0: u32 = 0x03a2_e82f; // dsubu sp,sp,v0
const MOVE_SP_FP: u32 = 0x03c0_e82d; // daddu sp,fp,zero

const BASE: usize = 0x40_0000;

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
        assert_eq!(w[0].end, w[1].start);
        assert_ne!(w[0].recipe, w[1].recipe);
    }
}

#[test]
fn test_leaf() {
    // A leaf never touches SP or RA: one interval, everything in registers.
    let chain = build(&[JR_RA, NOP]);
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].start, BASE);
    assert_eq!(chain[0].end, BASE + 8);
    assert_eq!(chain[0].recipe.sp, SpLoc::Reg);
    assert_eq!(chain[0].recipe.ra, RaLoc::Reg(REG_LINK));
}

#[test]
fn test_sp_frame() {
    let chain =
        build(&[DADDIU_SP_M96, SD_RA_40SP, NOP, LD_RA_40SP, JR_RA, DADDIU_SP_P96]);
    assert_tiles(&chain, BASE, BASE + 24);
    assert_eq!(chain.len(), 4);
    assert_eq!(chain[1].recipe.sp, SpLoc::SpRel(96));
    assert_eq!(chain[1].recipe.ra, RaLoc::Reg(REG_LINK));
    assert_eq!(chain[2].recipe.ra, RaLoc::SpRel(40));
    // RA reloaded before the return; the trailing dealloc sits in the
    // delay slot of a terminal return, so no restore happens.
    assert_eq!(chain[3].recipe.ra, RaLoc::Reg(REG_LINK));
    assert_eq!(chain[3].recipe.sp, SpLoc::SpRel(96));
}

#[test]
fn test_interior_return_skips_delay_slot() {
    let chain = build(&[
        DADDIU_SP_M96,
        SD_RA_40SP,
        LD_RA_40SP,
        JR_RA,
        DADDIU_SP_P96, // delay slot of the interior return
        NOP,
        NOP,
    ]);
    assert_tiles(&chain, BASE, BASE + 28);
    // Past the delay slot the canonical recipe is back in force; the
    // dealloc in the slot is invisible from inside the function.
    let after = chain.iter().find(|iv| iv.start == BASE + 20).unwrap();
    assert_eq!(after.recipe.ra, RaLoc::SpRel(40));
    assert_eq!(after.recipe.sp, SpLoc::SpRel(96));
}

#[test]
fn test_fp_saved_in_sp_frame() {
    let chain = build(&[DADDIU_SP_M96, SD_FP_56SP, NOP]);
    assert_eq!(chain.last().unwrap().recipe.bp, BpLoc::Saved(56));
    assert_eq!(chain.last().unwrap().recipe.sp, SpLoc::SpRel(96));
}

#[test]
fn test_alloca_pivots_to_fp_frame() {
    // Once the frame grows by a register amount, constant offsets from SP
    // are useless; the canonical SP recipe is rebased onto FP.
    let chain = build(&[DADDIU_SP_M96, SD_RA_40SP, DSUBU_SP_V0, NOP]);
    assert_tiles(&chain, BASE, BASE + 16);
    let last = chain.last().unwrap();
    assert!(last.recipe.flags.contains(RecipeFlags::FP_FRAME));
    assert!(last.recipe.flags.contains(RecipeFlags::FRAME_SZ_UNKNOWN));
    assert_eq!(last.recipe.sp, SpLoc::Reg);
    // 40(sp) in a 96-byte frame is -(96-40) from FP.
    assert_eq!(last.recipe.ra, RaLoc::BpRel(-56));
}

#[test]
fn test_alloca_without_canonical_frame_is_ignored() {
    let chain = build(&[DSUBU_SP_V0, NOP]);
    assert_eq!(chain.len(), 1);
    assert!(!chain[0].recipe.flags.contains(RecipeFlags::FP_FRAME));
}

#[test]
fn test_fp_staged_through_v0() {
    let chain = build(&[MOVE_V0_FP, DADDIU_SP_M96, SD_V0_M32FP, SD_RA_M64FP, NOP]);
    assert_tiles(&chain, BASE, BASE + 20);
    let last = chain.last().unwrap();
    assert!(last.recipe.flags.contains(RecipeFlags::FP_FRAME));
    assert_eq!(last.recipe.bp, BpLoc::Saved(-32));
    assert_eq!(last.recipe.ra, RaLoc::BpRel(-64));
    // The staging move itself amends the entry interval in place.
    assert!(chain[0].recipe.flags.contains(RecipeFlags::FP_IN_V0));
}

#[test]
fn test_move_sp_fp_deallocates() {
    // FP frame fully unwound: RA reloaded, then SP restored from FP.
    let chain = build(&[
        DADDIU_SP_M96,
        SD_RA_40SP,
        DSUBU_SP_V0,
        LD_RA_M64FP,
        MOVE_SP_FP,
        NOP,
        NOP,
    ]);
    let last = chain.last().unwrap();
    assert!(!last.recipe.flags.contains(RecipeFlags::FP_FRAME));
    assert_eq!(last.recipe.ra, RaLoc::Reg(REG_LINK));
    assert_eq!(last.recipe.sp, SpLoc::Reg);
}

#[test]
fn test_negative_sp_offset_is_rejected() {
    // Deallocating more than was allocated keeps the previous offset.
    let chain = build(&[DADDIU_SP_P96, NOP]);
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].recipe.sp, SpLoc::Reg);
}

#[test]
fn test_build_twice_identical() {
    let words = [DADDIU_SP_M96, SD_RA_40SP, NOP, LD_RA_40SP, JR_RA, DADDIU_SP_P96];
    assert_eq!(build(&words), build(&words));
}

proptest::proptest! {
    #[test]
    fn prop_random_code_tiles(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 4..256)) {
        let arena = Arena::new(1 << 20).unwrap();
        let a = build_intervals(&arena, &bytes, BASE).unwrap().to_vec();
        assert_tiles(&a, BASE, BASE + bytes.len());
        let b = build_intervals(&arena, &bytes, BASE).unwrap().to_vec();
        proptest::prop_assert_eq!(a, b);
    }
}
