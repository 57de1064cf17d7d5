use std::cell::Cell;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use super::arena::Arena;
use super::Status;
use crate::recipe::Interval;

pub(crate) const MAX_HEIGHT: usize = 8;

/// A published, immutable interval chain. Lives in the arena forever.
pub(crate) struct IntervalSlice {
    ptr: *const Interval,
    len: usize,
}

impl IntervalSlice {
    pub fn new(ptr: *const Interval, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Safe once published: the backing arena is never unmapped and the
    /// slice is never written again.
    pub unsafe fn as_slice(&self) -> &'static [Interval] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// One function record: an address range, its build status, and (once
/// `READY`) the published interval chain.
pub(crate) struct Node {
    pub start: usize,
    pub end: usize,
    pub load_module: u64,
    pub status: AtomicU8,
    pub tree: AtomicPtr<IntervalSlice>,
    height: Cell<u8>,
    next: [Cell<*mut Node>; MAX_HEIGHT],
}

impl Node {
    pub fn status(&self, order: Ordering) -> Status {
        Status::from_u8(self.status.load(order))
    }
}

/// Range skip list keyed by the lower bound of each record.
///
/// Structural operations (find, insert, unlink) must run under the map
/// spinlock; only the per-node `status` and `tree` atomics may be touched
/// without it. Ranges of live records are pairwise disjoint, so exact-key
/// equality never arises.
pub(crate) struct SkipList {
    head: NonNull<Node>,
    tail: NonNull<Node>,
    rng: Cell<u64>,
    free: Cell<*mut Node>,
}

// Guarded by the map spinlock; see above.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

pub(crate) struct Overlap;

impl SkipList {
    /// Builds an empty list carrying the two sentinel records
    /// `[0, 0)` and `[usize::MAX, usize::MAX)`.
    pub fn new(arena: &Arena) -> Option<Self> {
        let tail = Self::raw_node(arena, usize::MAX, usize::MAX, 0, Status::Never)?;
        let head = Self::raw_node(arena, 0, 0, 0, Status::Never)?;
        for lvl in 0..MAX_HEIGHT {
            unsafe { head.as_ref() }.next[lvl].set(tail.as_ptr());
        }
        unsafe { head.as_ref() }.height.set(MAX_HEIGHT as u8);
        Some(Self {
            head,
            tail,
            rng: Cell::new(0x9e3779b97f4a7c15),
            free: Cell::new(null_mut()),
        })
    }

    fn raw_node(
        arena: &Arena,
        start: usize,
        end: usize,
        load_module: u64,
        status: Status,
    ) -> Option<NonNull<Node>> {
        const NULL_LINK: Cell<*mut Node> = Cell::new(null_mut());
        arena.alloc(Node {
            start,
            end,
            load_module,
            status: AtomicU8::new(status as u8),
            tree: AtomicPtr::new(null_mut()),
            height: Cell::new(1),
            next: [NULL_LINK; MAX_HEIGHT],
        })
    }

    fn random_height(&self) -> usize {
        // xorshift64*; seeded at construction, stepped under the lock.
        let mut x = self.rng.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng.set(x);
        let bits = x.wrapping_mul(0x2545f4914f6cdd1d);
        let mut h = 1;
        while h < MAX_HEIGHT && (bits >> h) & 1 == 1 {
            h += 1;
        }
        h
    }

    /// Last node (head included) whose `start` is `<= pc`, with the
    /// predecessor at every level recorded in `update`.
    fn search(&self, pc: usize, update: &mut [*mut Node; MAX_HEIGHT]) -> *mut Node {
        let mut cur = self.head.as_ptr();
        for lvl in (0..MAX_HEIGHT).rev() {
            loop {
                let nxt = unsafe { (*cur).next[lvl].get() };
                if nxt == self.tail.as_ptr() || unsafe { (*nxt).start } > pc {
                    break;
                }
                cur = nxt;
            }
            update[lvl] = cur;
        }
        cur
    }

    /// Record whose range contains `pc`, if any.
    pub fn find(&self, pc: usize) -> Option<&Node> {
        let mut update = [null_mut(); MAX_HEIGHT];
        let cand = self.search(pc, &mut update);
        if cand == self.head.as_ptr() {
            return None;
        }
        let node = unsafe { &*cand };
        (pc < node.end).then_some(node)
    }

    /// Inserts a record for `[start, end)`. Fails if any live record
    /// overlaps the range (a lost insert race, or a poisoning bug).
    pub fn insert(
        &self,
        arena: &Arena,
        start: usize,
        end: usize,
        load_module: u64,
        status: Status,
    ) -> Result<&Node, Overlap> {
        debug_assert!(start < end);
        let mut update = [null_mut(); MAX_HEIGHT];
        let pred = self.search(start, &mut update);
        if pred != self.head.as_ptr() && unsafe { (*pred).end } > start {
            return Err(Overlap);
        }
        let succ = unsafe { (*pred).next[0].get() };
        if succ != self.tail.as_ptr() && unsafe { (*succ).start } < end {
            return Err(Overlap);
        }

        let node = match self.pop_free() {
            Some(node) => {
                // Recycled header: rewrite in place.
                unsafe {
                    let p = node.as_ptr();
                    (*p).start = start;
                    (*p).end = end;
                    (*p).load_module = load_module;
                    (*p).status.store(status as u8, Ordering::Relaxed);
                    (*p).tree.store(null_mut(), Ordering::Relaxed);
                }
                node
            }
            None => Self::raw_node(arena, start, end, load_module, status)
                .unwrap_or_else(|| super::arena_exhausted()),
        };

        let height = self.random_height();
        let n = unsafe { node.as_ref() };
        n.height.set(height as u8);
        for lvl in 0..height {
            let pred = update[lvl];
            n.next[lvl].set(unsafe { (*pred).next[lvl].get() });
            unsafe { (*pred).next[lvl].set(node.as_ptr()) };
        }
        Ok(unsafe { &*node.as_ptr() })
    }

    fn pop_free(&self) -> Option<NonNull<Node>> {
        let node = NonNull::new(self.free.get())?;
        self.free.set(unsafe { node.as_ref() }.next[0].get());
        Some(node)
    }

    fn unlink(&self, node: *mut Node) {
        let start = unsafe { (*node).start };
        let mut update = [null_mut(); MAX_HEIGHT];
        self.search(start.wrapping_sub(1), &mut update);
        // `search(start - 1)` lands on the strict predecessor since live
        // starts are unique; for start == 0 it degenerates to a full scan
        // from head at each level below.
        let height = unsafe { (*node).height.get() } as usize;
        for lvl in 0..height {
            let mut pred = if start == 0 { self.head.as_ptr() } else { update[lvl] };
            loop {
                let nxt = unsafe { (*pred).next[lvl].get() };
                if nxt == node {
                    unsafe { (*pred).next[lvl].set((*node).next[lvl].get()) };
                    break;
                }
                if nxt == self.tail.as_ptr() || unsafe { (*nxt).start } > start {
                    break;
                }
                pred = nxt;
            }
        }
    }

    fn first_intersecting(&self, lo: usize, hi: usize) -> Option<*mut Node> {
        let mut update = [null_mut(); MAX_HEIGHT];
        let cand = self.search(lo, &mut update);
        if cand != self.head.as_ptr() {
            let n = unsafe { &*cand };
            if n.end > lo && n.start < hi {
                return Some(cand);
            }
        }
        let succ = unsafe { (*cand).next[0].get() };
        if succ != self.tail.as_ptr() && unsafe { (*succ).start } < hi {
            return Some(succ);
        }
        None
    }

    /// Unlinks every record intersecting `[lo, hi)`, reporting each to
    /// `evicted`. Headers are recycled unless a build is in flight on them
    /// (`FORTHCOMING`): the off-lock builder still owns such a header, so
    /// it leaks into the arena instead of being reused.
    pub fn remove_range(&self, lo: usize, hi: usize, mut evicted: impl FnMut(&Node)) {
        while let Some(node) = self.first_intersecting(lo, hi) {
            self.unlink(node);
            let n = unsafe { &*node };
            evicted(n);
            if n.status(Ordering::Acquire) != Status::Forthcoming {
                n.next[0].set(self.free.get());
                self.free.set(node);
            }
        }
    }

    /// Level-0 walk over live records, in address order.
    pub fn for_each(&self, mut f: impl FnMut(&Node)) {
        let mut cur = unsafe { self.head.as_ref() }.next[0].get();
        while cur != self.tail.as_ptr() {
            let n = unsafe { &*cur };
            f(n);
            cur = n.next[0].get();
        }
    }
}
