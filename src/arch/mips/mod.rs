//! MIPS interval builder.
//!
//! Calls store the return address in RA, frames are SP-relative unless the
//! procedure allocates a variable amount (then it pivots to an FP frame),
//! and every control transfer drags a delay slot behind it.
//!
//! Typical SP frame (GCC, Pathscale):
//!
//!   daddiu  sp,sp,-96   allocate frame
//!   sd      ra,40(sp)   spill RA before a call
//!   ...
//!   ld      ra,40(sp)   reload RA
//!   jr      ra          return
//!   daddiu  sp,sp,96    deallocate (delay slot)
//!
//! FP frames stage the caller's FP through V0 before spilling it, address
//! their slots at negative offsets from FP, and deallocate with
//! `move sp,fp`.

use crate::arch::{Chain, ChainWriter};
use crate::map::arena::Arena;
use crate::recipe::{BpLoc, RaLoc, Recipe, RecipeFlags, SpLoc, REG_LINK};
use crate::stats;

#[cfg(test)]
mod test;

const REG_0: u32 = 0;
const REG_V0: u32 = 2;
const REG_SP: u32 = 29;
const REG_FP: u32 = 30;
const REG_RA: u32 = 31;

const OP_SPECIAL: u32 = 0;
const FN_JR: u32 = 0x08;
const FN_ADD: u32 = 0x20;
const FN_ADDU: u32 = 0x21;
const FN_SUB: u32 = 0x22;
const FN_SUBU: u32 = 0x23;
const FN_OR: u32 = 0x25;
const FN_DADD: u32 = 0x2c;
const FN_DADDU: u32 = 0x2d;
const FN_DSUB: u32 = 0x2e;
const FN_DSUBU: u32 = 0x2f;

const OP_ADDI: u32 = 0x08;
const OP_ADDIU: u32 = 0x09;
const OP_DADDI: u32 = 0x18;
const OP_DADDIU: u32 = 0x19;
const OP_LW: u32 = 0x23;
const OP_SW: u32 = 0x2b;
const OP_LD: u32 = 0x37;
const OP_SD: u32 = 0x3f;

fn op(i: u32) -> u32 {
    i >> 26
}

fn reg_s(i: u32) -> u32 {
    (i >> 21) & 31
}

fn reg_t(i: u32) -> u32 {
    (i >> 16) & 31
}

fn reg_d(i: u32) -> u32 {
    (i >> 11) & 31
}

fn funct(i: u32) -> u32 {
    i & 0x3f
}

fn imm(i: u32) -> i32 {
    i as u16 as i16 as i32
}

/// `daddiu sp,sp,K` and friends; returns the allocation amount
/// (positive = frame grows).
fn adjust_sp_const(i: u32) -> Option<i32> {
    // The non-'u' forms trap on overflow and should never appear, but the
    // mask is cheap.
    let o = op(i);
    if (o == OP_DADDIU || o == OP_ADDIU || o == OP_DADDI || o == OP_ADDI)
        && reg_s(i) == REG_SP
        && reg_t(i) == REG_SP
    {
        Some(-imm(i))
    } else {
        None
    }
}

/// `dsubu sp,sp,vN`: variable-sized allocation.
fn is_adjust_sp_var(i: u32) -> bool {
    op(i) == OP_SPECIAL
        && matches!(funct(i), FN_DSUBU | FN_SUBU | FN_DSUB | FN_SUB)
        && reg_d(i) == REG_SP
        && reg_s(i) == REG_SP
}

/// `sd src,D(base)` / `sw src,D(base)`.
fn store_in_frame(i: u32, base: u32, src: u32) -> Option<i32> {
    let o = op(i);
    ((o == OP_SD || o == OP_SW) && reg_s(i) == base && reg_t(i) == src).then(|| imm(i))
}

/// `ld dst,D(base)` / `lw dst,D(base)`.
fn load_from_frame(i: u32, base: u32, dst: u32) -> Option<i32> {
    let o = op(i);
    ((o == OP_LD || o == OP_LW) && reg_s(i) == base && reg_t(i) == dst).then(|| imm(i))
}

fn is_jr(i: u32, to: u32) -> bool {
    op(i) == OP_SPECIAL && funct(i) == FN_JR && reg_s(i) == to
}

/// `move dst,src` (encoded as `addu`/`or` with a zero third operand).
fn is_move(i: u32, dst: u32, src: u32) -> bool {
    op(i) == OP_SPECIAL
        && matches!(funct(i), FN_DADDU | FN_ADDU | FN_OR | FN_DADD | FN_ADD)
        && reg_d(i) == dst
        && reg_s(i) == src
        && reg_t(i) == REG_0
}

fn is_fp_frame(r: &Recipe) -> bool {
    r.flags.contains(RecipeFlags::FP_FRAME)
}

fn ra_in_reg(r: &Recipe) -> bool {
    matches!(r.ra, RaLoc::Reg(_))
}

/// SP-relative offsets must stay non-negative; a negative one means the
/// scan lost track.
fn check_sp_ofst(ofst: i32, prev: i32) -> i32 {
    if ofst < 0 {
        stats::inc_suspicious_intervals();
        prev
    } else {
        ofst
    }
}

/// Rebases an SP-relative slot to the FP, which sits one frame above.
fn sp_to_fp_ofst(frame_sz: i32, sp_rel: i32) -> i32 {
    -(frame_sz - sp_rel)
}

pub(crate) fn build_intervals<'a>(arena: &'a Arena, code: &[u8], base: usize) -> Option<Chain> {
    if code.len() < 4 {
        return None;
    }

    let initial = Recipe::new(
        SpLoc::Reg,
        RaLoc::Reg(REG_LINK),
        BpLoc::Unchanged,
        RecipeFlags::empty(),
    );
    let mut w = ChainWriter::new(arena, base, initial);
    // The canonical recipe is restored after interior returns; the SP
    // flavor survives `move sp,fp` deallocation separately.
    let mut canon = initial;
    let mut canon_sp = initial;

    let n = code.len() / 4;
    let mut idx = 0;
    while idx < n {
        let insn = u32::from_ne_bytes(code[idx * 4..idx * 4 + 4].try_into().unwrap());
        let at = base + (idx + 1) * 4;
        let cur = *w.recipe();

        if let Some(amnt) = adjust_sp_const(insn) {
            if !is_fp_frame(&cur) {
                let sp_arg = check_sp_ofst(cur.frame_size() + amnt, cur.frame_size());
                let ra = match cur.ra {
                    RaLoc::SpRel(d) => RaLoc::SpRel(check_sp_ofst(d + amnt, d)),
                    other => other,
                };
                let sp = if sp_arg == 0 { SpLoc::Reg } else { SpLoc::SpRel(sp_arg) };
                w.transition(at, Recipe { sp, ra, ..cur });
            }
            // FP frames absorb extra SP motion without a recipe change.
        } else if let Some(d) = store_in_frame(insn, REG_SP, REG_RA) {
            if is_fp_frame(&cur) {
                // An SP-relative RA spill inside an FP frame means the
                // scan lost the plot somewhere above.
                stats::inc_suspicious_intervals();
            }
            let next = Recipe { ra: RaLoc::SpRel(d), ..cur };
            w.transition(at, next);
            canon = next;
            canon_sp = next;
        } else if let Some(d) = store_in_frame(insn, REG_SP, REG_FP) {
            // FP here may just be the saved register s8, but remembering
            // the slot is harmless either way.
            let next = Recipe { bp: BpLoc::Saved(d), ..cur };
            w.transition(at, next);
            canon = next;
            canon_sp = next;
        } else if load_from_frame(insn, REG_SP, REG_RA).is_some() {
            w.transition(at, Recipe { ra: RaLoc::Reg(REG_LINK), ..cur });
        } else if is_jr(insn, REG_RA) && idx + 2 < n {
            // Interior return. The delay slot belongs to the return path;
            // its frame effect can never be observed here, so skip it.
            if cur != canon {
                w.transition(base + (idx + 2) * 4, canon);
                idx += 1;
            }
        } else if let Some(d) = store_in_frame(insn, REG_FP, REG_RA) {
            let (sp, bp) = if !is_fp_frame(&cur) {
                let bp = match cur.bp {
                    BpLoc::Saved(fd) => BpLoc::Saved(sp_to_fp_ofst(cur.frame_size(), fd)),
                    other => other,
                };
                (SpLoc::Reg, bp)
            } else {
                (cur.sp, cur.bp)
            };
            let next = Recipe {
                sp,
                ra: RaLoc::BpRel(d),
                bp,
                flags: cur.flags | RecipeFlags::FP_FRAME,
            };
            w.transition(at, next);
            canon = next;
        } else if is_move(insn, REG_V0, REG_FP) {
            w.amend(Recipe { flags: cur.flags | RecipeFlags::FP_IN_V0, ..cur });
        } else if cur.flags.contains(RecipeFlags::FP_IN_V0)
            && store_in_frame(insn, REG_FP, REG_V0).is_some()
        {
            let fp_arg = store_in_frame(insn, REG_FP, REG_V0).unwrap();
            let (sp, ra) = if !is_fp_frame(&cur) {
                let ra = match cur.ra {
                    RaLoc::SpRel(d) => RaLoc::BpRel(sp_to_fp_ofst(cur.frame_size(), d)),
                    other => other,
                };
                (SpLoc::Reg, ra)
            } else {
                (cur.sp, cur.ra)
            };
            let next = Recipe {
                sp,
                ra,
                bp: BpLoc::Saved(fp_arg),
                flags: cur.flags | RecipeFlags::FP_FRAME,
            };
            w.transition(at, next);
            canon = next;
        } else if is_adjust_sp_var(insn) {
            // Constant-size bookkeeping is useless from here on; pivot to
            // the FP frame derived from the canonical SP recipe.
            if canon != initial && !is_fp_frame(&canon) {
                let ra = match canon.ra {
                    RaLoc::SpRel(d) => RaLoc::BpRel(sp_to_fp_ofst(canon.frame_size(), d)),
                    other => other,
                };
                let bp = match canon.bp {
                    BpLoc::Saved(d) => BpLoc::Saved(sp_to_fp_ofst(canon.frame_size(), d)),
                    other => other,
                };
                let next = Recipe {
                    sp: SpLoc::Reg,
                    ra,
                    bp,
                    flags: cur.flags | RecipeFlags::FP_FRAME | RecipeFlags::FRAME_SZ_UNKNOWN,
                };
                w.transition(at, next);
                canon = next;
            }
        } else if load_from_frame(insn, REG_FP, REG_RA).is_some() {
            if !is_fp_frame(&cur) {
                stats::inc_suspicious_intervals();
            }
            w.transition(at, Recipe { ra: RaLoc::Reg(REG_LINK), ..cur });
        } else if is_move(insn, REG_SP, REG_FP) {
            if is_fp_frame(&cur) {
                // Full deallocation only if the prologue spilled RA and it
                // is already back in the register.
                let full = !ra_in_reg(&canon) && ra_in_reg(&cur);
                let next = if full { initial } else { canon_sp };
                w.transition(at, next);
            }
            // Otherwise leave the recipe alone and let the rest of the
            // epilogue deallocate normally.
        }

        idx += 1;
    }

    Some(w.finish(base + code.len()))
}
