//! x86-64 interval builder.
//!
//! Variable-width instructions rule out mask matching, so each instruction
//! goes through the classified decoder and the scan abstractly interprets
//! its effect on four tracked positions: the return address and the saved
//! RBP relative to the current RSP, and both relative to RBP once a frame
//! pointer is established. A high-water mark (the canonical state) is
//! restored after interior returns and tail jumps, whose following bytes
//! run with the fully built frame. Undecodable bytes advance the scan by
//! one without touching the recipe; an instruction extending past the
//! function's end stops it.

use crate::arch::{Chain, ChainWriter};
use crate::map::arena::Arena;
use crate::recipe::{BpLoc, RaLoc, Recipe, RecipeFlags, SpLoc};
use crate::stats;

mod decode;


use decode::{decode_one, InsnClass};

const WORD: i64 = 8;

#[derive(Clone, Copy, PartialEq, Eq)]
enum RaShape {
    /// RA at `RSP + sp_ra_pos`.
    SpRel,
    /// Standard frame: saved RBP at `RBP`, RA one word above.
    BpFrame,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct State {
    ra: RaShape,
    sp_ra_pos: i64,
    sp_bp_pos: Option<i64>,
    bp: BpLoc,
    frame_unknown: bool,
}

impl State {
    fn entry() -> Self {
        Self {
            ra: RaShape::SpRel,
            sp_ra_pos: 0,
            sp_bp_pos: None,
            bp: BpLoc::Unchanged,
            frame_unknown: false,
        }
    }

    fn recipe(&self) -> Recipe {
        let flags = if self.frame_unknown {
            RecipeFlags::FRAME_SZ_UNKNOWN
        } else {
            RecipeFlags::empty()
        };
        match self.ra {
            RaShape::BpFrame => Recipe::new(SpLoc::Reg, RaLoc::BpFrame, BpLoc::Saved(0), flags),
            RaShape::SpRel => {
                let bp = match self.sp_bp_pos {
                    Some(d) => BpLoc::Saved(d as i32),
                    None => self.bp,
                };
                Recipe::new(
                    SpLoc::SpRel((self.sp_ra_pos + WORD) as i32),
                    RaLoc::SpRel(self.sp_ra_pos as i32),
                    bp,
                    flags,
                )
            }
        }
    }
}

pub(crate) fn build_intervals<'a>(arena: &'a Arena, code: &[u8], base: usize) -> Option<Chain> {
    if code.is_empty() {
        return None;
    }

    let mut state = State::entry();
    let mut canon = state;
    let mut w = ChainWriter::new(arena, base, state.recipe());

    let mut pos = 0usize;
    while pos < code.len() {
        let Some(d) = decode_one(&code[pos..], (base + pos) as u64) else {
            // Undecodable byte: skip it, keep the recipe.
            pos += 1;
            continue;
        };
        if pos + d.len > code.len() {
            break;
        }
        let at = base + pos + d.len;

        match d.class {
            InsnClass::PushBp => {
                state.sp_ra_pos += WORD;
                state.sp_bp_pos = Some(0);
            }
            InsnClass::Push => {
                state.sp_ra_pos += WORD;
                state.sp_bp_pos = state.sp_bp_pos.map(|d| d + WORD);
            }
            InsnClass::PopBp => {
                if state.ra == RaShape::BpFrame {
                    // `lea rsp,[rbp]; pop rbp` style epilogue: RSP now
                    // sits on the return address.
                    state.ra = RaShape::SpRel;
                    state.sp_ra_pos = 0;
                } else {
                    state.sp_ra_pos = (state.sp_ra_pos - WORD).max(0);
                }
                state.sp_bp_pos = None;
                state.bp = BpLoc::Unchanged;
            }
            InsnClass::Pop => {
                if state.sp_ra_pos < WORD {
                    stats::inc_suspicious_intervals();
                }
                state.sp_ra_pos = (state.sp_ra_pos - WORD).max(0);
                state.sp_bp_pos = state.sp_bp_pos.map(|d| d - WORD).filter(|d| *d >= 0);
            }
            InsnClass::SpAdd(delta) => {
                if state.ra == RaShape::SpRel {
                    let ra = state.sp_ra_pos - delta;
                    if ra < 0 {
                        stats::inc_suspicious_intervals();
                    } else {
                        state.sp_ra_pos = ra;
                        state.sp_bp_pos = state.sp_bp_pos.map(|d| d - delta);
                        if canon == State::entry() && delta < 0 {
                            // First constant allocation: remember the
                            // frame for interior returns.
                            canon = state;
                        }
                    }
                }
                // BP frames don't care where RSP wanders.
            }
            InsnClass::SpAddReg => {
                state.frame_unknown = true;
                if state.ra == RaShape::SpRel {
                    // Alloca without a frame pointer: positions below here
                    // are unknowable.
                    state.bp = BpLoc::Hosed;
                }
            }
            InsnClass::MovBpSp => {
                if state.sp_bp_pos == Some(0) {
                    state.ra = RaShape::BpFrame;
                    canon = state;
                } else {
                    // RBP overwritten with no saved copy.
                    state.bp = BpLoc::Hosed;
                    state.sp_bp_pos = None;
                }
            }
            InsnClass::SpFromBp(disp) => {
                if state.ra == RaShape::BpFrame {
                    state.ra = RaShape::SpRel;
                    state.sp_ra_pos = WORD - disp;
                    state.sp_bp_pos = Some(-disp).filter(|d| *d >= 0);
                }
            }
            InsnClass::Leave => {
                state.ra = RaShape::SpRel;
                state.sp_ra_pos = 0;
                state.sp_bp_pos = None;
                state.bp = BpLoc::Unchanged;
            }
            InsnClass::Ret | InsnClass::JmpIndirect => {
                if pos + d.len < code.len() {
                    // Interior exit: what follows runs with the canonical
                    // frame.
                    state = canon;
                }
            }
            InsnClass::Call => {
                if canon == State::entry() && state.ra == RaShape::SpRel {
                    canon = state;
                }
            }
            InsnClass::Other => {}
        }

        w.transition(at, state.recipe());
        pos += d.len;
    }

    Some(w.finish(base + code.len()))
}
