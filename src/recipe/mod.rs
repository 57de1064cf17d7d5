//! Unwind recipes and the PC intervals that carry them.
//!
//! A recipe tells the cursor how to recover the caller's stack pointer,
//! frame pointer and return address from the callee's. Recipes are attached
//! to half-open PC intervals; within one interval the recipe is constant.

use std::fmt;

use bitflags::bitflags;


/// Register holding the return address on link-register architectures
/// (LR on PowerPC, RA on MIPS).
pub const REG_LINK: u8 = 0;

/// Scratch register the return address moves through during the prologue
/// (R0 on PowerPC).
pub const REG_SCRATCH: u8 = 1;

/// Where the caller's stack pointer comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpLoc {
    /// The frame is unallocated: the current SP already is the caller's SP.
    Reg,
    /// The caller's SP is recovered from the current SP and this operand
    /// (added to it, or dereferenced through it when
    /// [`RecipeFlags::SP_DEREF`] is set).
    SpRel(i32),
}

/// Where the caller's return address comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaLoc {
    /// Still live in a register; valid only in the frame where the sample hit.
    Reg(u8),
    /// Spilled at `SP + offset`.
    SpRel(i32),
    /// Spilled at `BP + offset` (frame-pointer frames).
    BpRel(i32),
    /// Standard linkage convention: saved BP at `BP`, return address one
    /// word above it.
    BpFrame,
}

/// What happened to the caller's frame pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BpLoc {
    /// Untouched; the register still holds the caller's value.
    Unchanged,
    /// Spilled at this offset from the frame base.
    Saved(i32),
    /// Clobbered with no recoverable copy.
    Hosed,
}

bitflags! {
    /// Architecture conventions and degradations riding on a recipe.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct RecipeFlags: u16 {
        /// Frame size is not a compile-time constant (variable allocation).
        const FRAME_SZ_UNKNOWN = 1 << 0;
        /// The caller's SP is stored at `*SP` (PowerPC back chain), not
        /// recovered by arithmetic.
        const SP_DEREF = 1 << 1;
        /// The frame is addressed through the frame pointer (MIPS FP frames).
        const FP_FRAME = 1 << 2;
        /// In an FP frame, the caller's SP is `FP + sp_arg` rather than a
        /// load through FP.
        const FP_OFST_POS = 1 << 3;
        /// The caller's FP is staged in V0 before being spilled (MIPS).
        const FP_IN_V0 = 1 << 4;
        /// A standard linkage slot exists at `caller_sp + word`; interior
        /// frames may re-read the return address from it.
        const RA_LINK_SLOT = 1 << 5;
    }
}

/// How to derive the caller's frame from the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Recipe {
    pub sp: SpLoc,
    pub ra: RaLoc,
    pub bp: BpLoc,
    pub flags: RecipeFlags,
}

impl Recipe {
    pub const fn new(sp: SpLoc, ra: RaLoc, bp: BpLoc, flags: RecipeFlags) -> Self {
        Self { sp, ra, bp, flags }
    }

    /// Frame size implied by the SP operand, zero for unallocated frames.
    pub fn frame_size(&self) -> i32 {
        match self.sp {
            SpLoc::Reg => 0,
            SpLoc::SpRel(n) => n,
        }
    }
}

/// A half-open PC range `[start, end)` over which one recipe holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    pub start: usize,
    pub end: usize,
    pub recipe: Recipe,
}

impl Interval {
    pub fn contains(&self, pc: usize) -> bool {
        self.start <= pc && pc < self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}) sp={:?} ra={:?} bp={:?} flags={:?}",
            self.start, self.end, self.recipe.sp, self.recipe.ra, self.recipe.bp, self.recipe.flags
        )
    }
}

/// Locates the interval containing `pc` in a chain sorted by `start`.
///
/// Chains published by the builders tile their function exactly, so a miss
/// means `pc` is outside the function entirely.
pub fn find_interval(chain: &[Interval], pc: usize) -> Option<&Interval> {
    let idx = chain.partition_point(|iv| iv.start <= pc);
    let iv = chain.get(idx.checked_sub(1)?)?;
    iv.contains(pc).then_some(iv)
}
