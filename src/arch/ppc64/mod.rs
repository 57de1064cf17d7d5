//! PowerPC interval builder.
//!
//! R1 stays the stack pointer for every frame shape; non-leaf procedures
//! store the caller's SP with a store-with-update, so the stack carries a
//! back chain of frame pointers. The prologue moves LR through R0 into a
//! slot one word above the caller's SP. The scan tracks those moves:
//!
//!   stwu r1,-N(r1)   allocate frame, store back chain
//!   mflr r0          RA now in R0
//!   stw  r0,N+4(r1)  RA now in the linkage slot (canonical)
//!   ...
//!   lwz  r0,N+4(r1)  RA back in R0
//!   mtlr r0          RA back in LR
//!   blr              return
//!
//! Both the word (`stwu`/`stw`/`lwz`) and doubleword (`stdu`/`std`/`ld`)
//! families are recognized, with the linkage word sized to match. Frames
//! allocated by `stwux`/`stdux` have no constant size; their recipes carry
//! `FRAME_SZ_UNKNOWN` and unwind through the back chain alone.

use crate::arch::{Chain, ChainWriter};
use crate::map::arena::Arena;
use crate::recipe::{BpLoc, RaLoc, Recipe, RecipeFlags, SpLoc, REG_LINK, REG_SCRATCH};

#[cfg(test)]
mod test;

const SP: u32 = 1;
const R0: u32 = 0;

fn opcd(i: u32) -> u32 {
    i >> 26
}

fn rs(i: u32) -> u32 {
    (i >> 21) & 31
}

fn ra(i: u32) -> u32 {
    (i >> 16) & 31
}

fn rb(i: u32) -> u32 {
    (i >> 11) & 31
}

fn xo(i: u32) -> u32 {
    (i >> 1) & 0x3ff
}

fn d_imm(i: u32) -> i32 {
    i as u16 as i16 as i32
}

fn ds_imm(i: u32) -> i32 {
    (i & 0xfffc) as u16 as i16 as i32
}

fn is_mflr_r0(i: u32) -> bool {
    i == 0x7c08_02a6
}

fn is_mtlr_r0(i: u32) -> bool {
    i == 0x7c08_03a6
}

fn is_blr(i: u32) -> bool {
    i == 0x4e80_0020
}

/// `stw r0,D(r1)` or `std r0,D(r1)`: returns (D, linkage word).
fn store_ra_disp(i: u32) -> Option<(i32, i32)> {
    if opcd(i) == 36 && rs(i) == R0 && ra(i) == SP {
        Some((d_imm(i), 4))
    } else if opcd(i) == 62 && rs(i) == R0 && ra(i) == SP && i & 3 == 0 {
        Some((ds_imm(i), 8))
    } else {
        None
    }
}

/// `lwz r0,D(r1)` or `ld r0,D(r1)`.
fn load_ra_disp(i: u32) -> Option<(i32, i32)> {
    if opcd(i) == 32 && rs(i) == R0 && ra(i) == SP {
        Some((d_imm(i), 4))
    } else if opcd(i) == 58 && rs(i) == R0 && ra(i) == SP && i & 3 == 0 {
        Some((ds_imm(i), 8))
    } else {
        None
    }
}

/// `stwu r1,D(r1)` or `stdu r1,D(r1)`: store SP and update it by D.
fn store_update_disp(i: u32) -> Option<i32> {
    if opcd(i) == 37 && rs(i) == SP && ra(i) == SP {
        Some(d_imm(i))
    } else if opcd(i) == 62 && rs(i) == SP && ra(i) == SP && i & 3 == 1 {
        Some(ds_imm(i))
    } else {
        None
    }
}

/// `stwux r1,r1,rX` or `stdux r1,r1,rX`: variable-sized allocation.
fn is_store_update_indexed(i: u32) -> bool {
    opcd(i) == 31 && ra(i) == SP && (xo(i) == 183 || xo(i) == 181)
}

/// `addi r1,r1,N`.
fn addi_sp_disp(i: u32) -> Option<i32> {
    (opcd(i) == 14 && rs(i) == SP && ra(i) == SP).then(|| d_imm(i))
}

/// `mr r1,rX` (encoded `or r1,rS,rB` with rS == rB).
fn is_mr_sp(i: u32) -> bool {
    opcd(i) == 31 && xo(i) == 444 && ra(i) == SP && rs(i) == rb(i)
}

pub(crate) fn build_intervals<'a>(arena: &'a Arena, code: &[u8], base: usize) -> Option<Chain> {
    if code.len() < 4 {
        return None;
    }

    let initial = Recipe::new(
        SpLoc::Reg,
        RaLoc::Reg(REG_LINK),
        BpLoc::Unchanged,
        RecipeFlags::SP_DEREF | RecipeFlags::RA_LINK_SLOT,
    );
    let mut w = ChainWriter::new(arena, base, initial);
    let mut canon = initial;

    let n = code.len() / 4;
    for idx in 0..n {
        let insn = u32::from_ne_bytes(code[idx * 4..idx * 4 + 4].try_into().unwrap());
        let at = base + (idx + 1) * 4;
        let cur = *w.recipe();

        if is_mflr_r0(insn) {
            w.transition(at, Recipe { ra: RaLoc::Reg(REG_SCRATCH), ..cur });
        } else if is_mtlr_r0(insn) {
            w.transition(at, Recipe { ra: RaLoc::Reg(REG_LINK), ..cur });
        } else if let Some((disp, word)) = store_ra_disp(insn) {
            // Only the linkage slot of the current frame counts; other R0
            // spills are unrelated.
            if disp == cur.frame_size() + word {
                let next = Recipe { ra: RaLoc::SpRel(disp), ..cur };
                w.transition(at, next);
                if canon == initial {
                    canon = next;
                }
            }
        } else if let Some((disp, word)) = load_ra_disp(insn) {
            if disp == cur.frame_size() + word {
                w.transition(at, Recipe { ra: RaLoc::Reg(REG_SCRATCH), ..cur });
            }
        } else if let Some(disp) = store_update_disp(insn) {
            w.transition(at, Recipe { sp: SpLoc::SpRel(-disp), ..cur });
        } else if is_store_update_indexed(insn) {
            // Variable-sized frame; the size operand is in a register we
            // do not track. The back chain still works.
            w.transition(
                at,
                Recipe {
                    sp: SpLoc::SpRel(-1),
                    flags: cur.flags | RecipeFlags::FRAME_SZ_UNKNOWN,
                    ..cur
                },
            );
        } else if addi_sp_disp(insn).is_some_and(|d| d == cur.frame_size()) {
            w.transition(
                at,
                Recipe {
                    sp: SpLoc::Reg,
                    flags: cur.flags - RecipeFlags::FRAME_SZ_UNKNOWN,
                    ..cur
                },
            );
        } else if is_mr_sp(insn) {
            // Without register tracking, only accept the restore when a
            // frame is actually allocated.
            if cur.frame_size() > 0 || cur.flags.contains(RecipeFlags::FRAME_SZ_UNKNOWN) {
                w.transition(
                    at,
                    Recipe {
                        sp: SpLoc::Reg,
                        flags: cur.flags - RecipeFlags::FRAME_SZ_UNKNOWN,
                        ..cur
                    },
                );
            }
        } else if is_blr(insn) && idx + 1 < n {
            // Interior return: code past it runs with the canonical frame.
            if cur != canon {
                w.transition(at, canon);
            }
        }
    }

    Some(w.finish(base + code.len()))
}
