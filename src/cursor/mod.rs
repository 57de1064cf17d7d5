//! The cursor state machine.
//!
//! A cursor is one in-progress unwind: the current frame's registers plus
//! the recipe interval covering its PC. `step` applies the recipe to
//! produce the caller's frame, consulting the recipe map for the caller's
//! interval and falling back to progressively blunter tools when the clean
//! path fails: the leaf skip-frame heuristic, then the stack troller.
//!
//! The engine dispatches on the recipe's tagged unions; there is no
//! per-architecture virtual call. Architecture conventions arrive as
//! recipe flags (back-chain SP, FP frames, linkage slots).

use crate::ctx::{self, Registers};
use crate::host::Host;
use crate::map::{Lookup, RecipeMap};
use crate::probe::read_word;
use crate::recipe::{BpLoc, Interval, RaLoc, RecipeFlags, SpLoc, REG_SCRATCH};
use crate::stats;

mod troll;


const W: usize = std::mem::size_of::<usize>();

/// Verdict of one `step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// The cursor now points at the caller's frame.
    Ok,
    /// Like `Ok`, but the frame was recovered by scanning the stack; the
    /// rest of the chain is suspect.
    Troll,
    /// Clean end of the chain (outermost frame or stack bottom).
    Stop,
    /// No further progress is possible; abandon the chain.
    Error,
}

pub struct Cursor<'a> {
    map: &'a RecipeMap,
    host: &'a dyn Host,
    pc: usize,
    sp: usize,
    bp: usize,
    ra: usize,
    interval: Option<Interval>,
    top: bool,
}

fn add(base: usize, disp: i32) -> usize {
    base.wrapping_add(disp as isize as usize)
}

impl<'a> Cursor<'a> {
    /// Starts an unwind from a captured register snapshot.
    ///
    /// The first frame is the only one whose return address may still be
    /// in a register; if its recipe says so, the value is taken from the
    /// snapshot now, before stepping destroys it.
    pub fn init(map: &'a RecipeMap, host: &'a dyn Host, regs: &Registers) -> Self {
        let mut cursor = Self {
            map,
            host,
            pc: regs.pc,
            sp: regs.sp,
            bp: regs.bp,
            ra: 0,
            interval: None,
            top: true,
        };
        if let Lookup::Ready { interval, .. } = map.lookup(regs.pc, host) {
            if let RaLoc::Reg(r) = interval.recipe.ra {
                cursor.ra = if r == REG_SCRATCH { regs.scratch } else { regs.ra };
            }
            cursor.interval = Some(interval);
        }
        cursor
    }

    /// The current frame's PC (the only register a cursor exposes).
    pub fn ip(&self) -> usize {
        self.pc
    }

    /// Advances to the caller's frame.
    pub fn step(&mut self) -> Step {
        let Some(iv) = self.interval else {
            return Step::Error;
        };
        let r = iv.recipe;

        if self.host.in_outermost_frame(self.pc) {
            return Step::Stop;
        }
        let bottom = self.host.stack_bottom();
        if self.sp >= bottom {
            return Step::Stop;
        }

        let interior = !self.top;
        let fp_frame = r.flags.contains(RecipeFlags::FP_FRAME);
        // FP is the weak spot: it doubles as a callee-saved register, so
        // only trust it when it points into the live stack.
        let fp_ok = self.bp >= self.sp && self.bp < bottom;

        // Caller SP first: interior frames keep their return address just
        // above it.
        let mut next_sp: Option<usize> = None;
        let mut next_bp = self.bp;
        let mut next_ra = 0usize;

        if r.ra == RaLoc::BpFrame {
            if fp_ok {
                next_sp = Some(self.bp + 2 * W);
            }
        } else if fp_frame {
            if fp_ok {
                next_sp = match r.sp {
                    SpLoc::Reg => Some(self.bp),
                    SpLoc::SpRel(d) => {
                        if r.flags.contains(RecipeFlags::FP_OFST_POS) {
                            Some(add(self.bp, d))
                        } else {
                            read_word(add(self.bp, d))
                        }
                    }
                };
                if let BpLoc::Saved(d) = r.bp {
                    if let Some(v) = read_word(add(self.bp, d)) {
                        next_bp = v;
                    }
                }
            }
        } else {
            next_sp = match r.sp {
                SpLoc::Reg => {
                    if interior && r.flags.contains(RecipeFlags::SP_DEREF) {
                        // Interior frames never run with an unallocated
                        // frame; follow the back chain instead.
                        stats::inc_sp_corrections();
                        read_word(self.sp)
                    } else {
                        Some(self.sp)
                    }
                }
                SpLoc::SpRel(d) => {
                    if r.flags.contains(RecipeFlags::SP_DEREF) {
                        read_word(self.sp)
                    } else {
                        Some(add(self.sp, d))
                    }
                }
            };
            match r.bp {
                BpLoc::Saved(d) => {
                    if let Some(v) = read_word(add(self.sp, d)) {
                        next_bp = v;
                    }
                }
                BpLoc::Hosed => next_bp = 0,
                BpLoc::Unchanged => {}
            }
        }

        // Caller PC.
        let mut next_pc: Option<usize> = None;
        let mut ra_loc: Option<usize> = None;
        match r.ra {
            RaLoc::Reg(_) => {
                if interior && r.flags.contains(RecipeFlags::RA_LINK_SLOT) {
                    // A register RA below the top frame means the interval
                    // is wrong; the linkage slot is the best recovery.
                    stats::inc_ra_corrections();
                    if let Some(nsp) = next_sp {
                        ra_loc = Some(nsp + W);
                        next_pc = read_word(nsp + W);
                    }
                } else {
                    next_pc = Some(self.ra);
                }
            }
            RaLoc::SpRel(d) => {
                if r.flags.contains(RecipeFlags::SP_DEREF) {
                    // The slot sits one word above the caller's SP; with a
                    // back chain that also covers variable-sized frames.
                    if let Some(nsp) = next_sp {
                        ra_loc = Some(nsp + W);
                        next_pc = read_word(nsp + W);
                    }
                } else {
                    let a = add(self.sp, d);
                    ra_loc = Some(a);
                    next_pc = read_word(a);
                }
            }
            RaLoc::BpRel(d) => {
                if fp_ok {
                    let a = add(self.bp, d);
                    ra_loc = Some(a);
                    next_pc = read_word(a);
                }
            }
            RaLoc::BpFrame => {
                if fp_ok {
                    let a = self.bp + W;
                    ra_loc = Some(a);
                    next_pc = read_word(a);
                    if let Some(v) = read_word(self.bp) {
                        next_bp = v;
                    }
                }
            }
        }

        // Caller's interval.
        let mut next_top = false;
        let mut trolled = false;
        let mut lookup = next_pc.map(|p| self.map.lookup(p, self.host));
        let mut ready = matches!(lookup, Some(Lookup::Ready { .. }));

        // A miss may be the kernel's signal-return stub rather than a bad
        // frame: recover the context the kernel pushed and restart from
        // the interrupted (pre-signal) frame.
        if !ready {
            if let Some(pc) = next_pc {
                if let Some(regs) = ctx::trampoline_context(
                    pc,
                    ra_loc.unwrap_or(0),
                    next_sp.unwrap_or(0),
                    self.sp,
                    bottom,
                ) {
                    let l = self.map.lookup(regs.pc, self.host);
                    if !l.is_ready() {
                        return Step::Error;
                    }
                    next_pc = Some(regs.pc);
                    next_sp = Some(regs.sp);
                    next_bp = regs.bp;
                    next_ra = regs.ra;
                    next_top = true;
                    lookup = Some(l);
                    ready = true;
                }
            }
        }

        if !ready && !interior && r.flags.contains(RecipeFlags::RA_LINK_SLOT) {
            // Leaf skip-frame: assume the interval mistracked the RA and
            // try one frame deeper through the back chain.
            if let Some(nsp) = next_sp {
                if let Some(try_sp) = read_word(nsp) {
                    if try_sp > nsp {
                        if let Some(pc) = read_word(try_sp + W) {
                            let l = self.map.lookup(pc, self.host);
                            if l.is_ready() {
                                next_pc = Some(pc);
                                next_sp = Some(try_sp);
                                lookup = Some(l);
                                ready = true;
                            }
                        }
                    }
                }
            }
        }

        if !ready {
            stats::inc_trolls();
            let Some(hit) =
                troll::scan(self.map, self.host, self.sp, bottom, self.map.troll_words)
            else {
                stats::inc_troll_failures();
                return Step::Error;
            };
            trolled = true;
            next_pc = Some(hit.ra);
            lookup = Some(hit.lookup);

            // Realign the frame on the slot the RA was found in.
            match r.ra {
                RaLoc::SpRel(d) if !r.flags.contains(RecipeFlags::SP_DEREF) => {
                    let new_sp = hit.slot.wrapping_sub(d as usize);
                    next_sp = Some(match r.sp {
                        SpLoc::Reg => new_sp,
                        SpLoc::SpRel(n) => add(new_sp, n),
                    });
                    if let BpLoc::Saved(b) = r.bp {
                        if let Some(v) = read_word(add(new_sp, b)) {
                            next_bp = v;
                        }
                    }
                }
                RaLoc::BpRel(d) if fp_frame => {
                    let new_fp = hit.slot.wrapping_sub(d as isize as usize);
                    next_sp = match r.sp {
                        SpLoc::Reg => Some(new_fp),
                        SpLoc::SpRel(n) => {
                            if r.flags.contains(RecipeFlags::FP_OFST_POS) {
                                Some(add(new_fp, n))
                            } else {
                                read_word(add(new_fp, n))
                            }
                        }
                    };
                    if let BpLoc::Saved(b) = r.bp {
                        if let Some(v) = read_word(add(new_fp, b)) {
                            next_bp = v;
                        }
                    }
                }
                _ => next_sp = Some(hit.slot + W),
            }
            if let Some(s) = next_sp {
                if hit.slot >= s {
                    // Whatever the realignment said, never step back below
                    // the slot we just consumed.
                    next_sp = Some(hit.slot + W);
                }
            }
        }

        let (Some(next_pc), Some(next_sp)) = (next_pc, next_sp) else {
            return Step::Error;
        };
        let Some(Lookup::Ready { interval, .. }) = lookup else {
            return Step::Error;
        };

        // Progress invariant: SP must move toward the stack bottom, except
        // that a top frame with an unallocated frame stays put.
        if !next_top {
            let may_equal = matches!(r.sp, SpLoc::Reg) && !interior;
            if next_sp < self.sp || (next_sp == self.sp && !may_equal) {
                return Step::Error;
            }
        }

        self.pc = next_pc;
        self.sp = next_sp;
        self.bp = next_bp;
        self.ra = next_ra;
        self.interval = Some(interval);
        self.top = next_top;

        if trolled {
            Step::Troll
        } else {
            Step::Ok
        }
    }
}
