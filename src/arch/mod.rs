//! Per-architecture interval builders.
//!
//! Each builder linearly scans one function's machine code and partitions
//! it into maximal PC ranges with a constant unwind recipe. All three
//! builders are pure over `(bytes, base address)`; the one matching the
//! build target is what the recipe map invokes.

use std::ptr::null_mut;

use crate::map::arena::Arena;
use crate::recipe::{Interval, Recipe};

pub(crate) mod mips;
pub(crate) mod ppc64;
pub(crate) mod x86;

#[cfg(target_arch = "x86_64")]
pub(crate) use x86::build_intervals as build_native;

#[cfg(target_arch = "powerpc64")]
pub(crate) use ppc64::build_intervals as build_native;

#[cfg(any(target_arch = "mips", target_arch = "mips64"))]
pub(crate) use mips::build_intervals as build_native;

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "powerpc64",
    target_arch = "mips",
    target_arch = "mips64"
)))]
pub(crate) fn build_native(_arena: &Arena, _code: &[u8], _base: usize) -> Option<Chain> {
    None
}

struct ChainNode {
    iv: Interval,
    next: *mut ChainNode,
}

/// An interval chain under construction, linked through the arena.
pub(crate) struct Chain {
    head: *mut ChainNode,
    len: usize,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter { cur: self.head, _chain: self }
    }

    #[cfg(test)]
    pub fn to_vec(&self) -> Vec<Interval> {
        self.iter().collect()
    }
}

pub(crate) struct ChainIter<'a> {
    cur: *mut ChainNode,
    _chain: &'a Chain,
}

impl Iterator for ChainIter<'_> {
    type Item = Interval;

    fn next(&mut self) -> Option<Interval> {
        if self.cur.is_null() {
            return None;
        }
        let node = unsafe { &*self.cur };
        self.cur = node.next;
        Some(node.iv)
    }
}

/// Accumulates intervals during a scan.
///
/// `transition(at, recipe)` closes the running interval at `at` and opens a
/// new one there. Transitions to an identical recipe are absorbed, so the
/// finished chain never holds two equal neighbors.
pub(crate) struct ChainWriter<'a> {
    arena: &'a Arena,
    head: *mut ChainNode,
    tail: *mut ChainNode,
    len: usize,
    cur_start: usize,
    cur: Recipe,
}

impl<'a> ChainWriter<'a> {
    pub fn new(arena: &'a Arena, fn_start: usize, initial: Recipe) -> Self {
        Self { arena, head: null_mut(), tail: null_mut(), len: 0, cur_start: fn_start, cur: initial }
    }

    /// The recipe in force at the current scan position.
    pub fn recipe(&self) -> &Recipe {
        &self.cur
    }

    /// Rewrites the running recipe without opening a new interval; used
    /// when an instruction amends state already true at the interval's
    /// start (e.g. flagging a staging register).
    pub fn amend(&mut self, recipe: Recipe) {
        self.cur = recipe;
    }

    pub fn transition(&mut self, at: usize, recipe: Recipe) {
        if recipe == self.cur {
            return;
        }
        if at == self.cur_start {
            self.cur = recipe;
            return;
        }
        self.emit(at);
        self.cur_start = at;
        self.cur = recipe;
    }

    fn emit(&mut self, end: usize) {
        let iv = Interval { start: self.cur_start, end, recipe: self.cur };
        let node = self
            .arena
            .alloc(ChainNode { iv, next: null_mut() })
            .unwrap_or_else(|| crate::map::arena_exhausted());
        if self.tail.is_null() {
            self.head = node.as_ptr();
        } else {
            unsafe { (*self.tail).next = node.as_ptr() };
        }
        self.tail = node.as_ptr();
        self.len += 1;
    }

    /// Closes the last interval at the function's end.
    pub fn finish(mut self, fn_end: usize) -> Chain {
        if self.cur_start < fn_end {
            self.emit(fn_end);
        }
        Chain { head: self.head, len: self.len }
    }
}
