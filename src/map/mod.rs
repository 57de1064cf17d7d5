//! The process-wide PC → recipe map.
//!
//! A range skip list maps every probe PC to a function record. Records are
//! built lazily: the first thread to touch a function claims it with a
//! compare-and-set, runs the interval builder, and publishes the result;
//! racing threads spin until the chain is `READY`. Address space with no
//! unwindable code is covered by poisoned (`NEVER`) records so bad PCs are
//! rejected without consulting the oracle.
//!
//! Structural state is guarded by one bounded spinlock. Published interval
//! chains are immutable and read without the lock.

use std::hint;
use std::io::Result;
use std::sync::atomic::Ordering;

use crate::arch;
use crate::guard;
use crate::host::Host;
use crate::recipe::{find_interval, Interval};
use crate::stats;
use crate::Config;

pub(crate) mod arena;
pub(crate) mod skiplist;

#[cfg(test)]
mod test;

use arena::Arena;
use skiplist::{IntervalSlice, SkipList};

/// Build status of a function record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Poisoned: the range is known to hold no unwindable code.
    Never = 0,
    /// Bounds known, intervals not yet built.
    Deferred = 1,
    /// Some thread is building the intervals right now.
    Forthcoming = 2,
    /// Interval chain published.
    Ready = 3,
}

impl Status {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Never,
            1 => Status::Deferred,
            2 => Status::Forthcoming,
            _ => Status::Ready,
        }
    }
}

/// Outcome of a map probe.
#[derive(Clone, Copy, Debug)]
pub enum Lookup {
    /// The PC lies in a built function; `interval` contains it.
    Ready {
        interval: Interval,
        fn_start: usize,
        fn_end: usize,
        load_module: u64,
    },
    /// The PC lies in a poisoned range.
    Poisoned,
    /// No record and the bounds oracle had nothing (or rejected the PC).
    NotFound,
}

impl Lookup {
    pub fn is_ready(&self) -> bool {
        matches!(self, Lookup::Ready { .. })
    }
}

struct SpinLock {
    locked: std::sync::atomic::AtomicU32,
}

impl SpinLock {
    const fn new() -> Self {
        Self { locked: std::sync::atomic::AtomicU32::new(0) }
    }

    fn acquire(&self, spin_limit: usize) {
        let mut spins = 0usize;
        loop {
            if self.locked.compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed).is_ok()
            {
                guard::note_lock_acquired();
                return;
            }
            while self.locked.load(Ordering::Relaxed) != 0 {
                hint::spin_loop();
                spins += 1;
                check_spin_cap(spin_limit, spins);
            }
        }
    }

    fn release(&self) {
        self.locked.store(0, Ordering::Release);
        guard::note_lock_released();
    }

    /// Called by the SEGV handler on behalf of a thread that faulted while
    /// holding the lock. The caller clears the thread's held counter.
    unsafe fn force_release(&self) {
        self.locked.store(0, Ordering::Release);
    }
}

/// Futex-style parking is off the table inside a signal handler, so every
/// wait here spins. The cap turns a wedged peer into one dropped sample
/// instead of a deadlocked process; outside a sample there is nothing to
/// drop, so the spin continues unbounded.
fn check_spin_cap(spin_limit: usize, spins: usize) {
    if spin_limit != 0 && spins > spin_limit && guard::in_sample() {
        stats::inc_spin_abandons();
        guard::drop_sample();
    }
}

pub(crate) type BuildFn = for<'a> fn(&'a Arena, &[u8], usize) -> Option<arch::Chain>;

pub struct RecipeMap {
    lock: SpinLock,
    arena: Arena,
    list: SkipList,
    builder: BuildFn,
    spin_limit: usize,
    pub(crate) troll_words: usize,
}

struct MapLock<'a>(&'a RecipeMap);

impl Drop for MapLock<'_> {
    fn drop(&mut self) {
        self.0.lock.release();
    }
}

impl RecipeMap {
    /// Builds an empty map: the two sentinels plus one all-poisoned record
    /// covering `[0, usize::MAX)`.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_builder(config, arch::build_native)
    }

    pub(crate) fn with_builder(config: &Config, builder: BuildFn) -> Result<Self> {
        let arena = Arena::new(config.arena_bytes)?;
        let list = SkipList::new(&arena).unwrap_or_else(|| arena_exhausted());
        let map = Self {
            lock: SpinLock::new(),
            arena,
            list,
            builder,
            spin_limit: config.spin_limit,
            troll_words: config.troll_words,
        };
        let g = map.locked();
        if map.list.insert(&map.arena, 0, usize::MAX, 0, Status::Never).is_err() {
            unreachable!("fresh map cannot overlap");
        }
        drop(g);
        log::debug!(
            "recipe map: arena {} MiB, spin limit {}",
            config.arena_bytes >> 20,
            config.spin_limit
        );
        Ok(map)
    }

    fn locked(&self) -> MapLock<'_> {
        self.lock.acquire(self.spin_limit);
        MapLock(self)
    }

    pub(crate) unsafe fn force_unlock(&self) {
        self.lock.force_release();
    }

    /// Maps `pc` to its recipe interval, building the owning function's
    /// chain on first touch. Idempotent and callable from a signal handler.
    pub fn lookup(&self, pc: usize, host: &dyn Host) -> Lookup {
        loop {
            let g = self.locked();
            let Some(node) = self.list.find(pc) else {
                drop(g);
                if !self.insert_deferred(pc, host) {
                    return Lookup::NotFound;
                }
                continue;
            };
            let (fn_start, fn_end, load_module) = (node.start, node.end, node.load_module);

            match node.status(Ordering::Acquire) {
                Status::Never => return Lookup::Poisoned,
                Status::Ready => {
                    let tree = node.tree.load(Ordering::Acquire);
                    drop(g);
                    return self.finish(tree, pc, fn_start, fn_end, load_module);
                }
                Status::Deferred => {
                    let claimed = node
                        .status
                        .compare_exchange(
                            Status::Deferred as u8,
                            Status::Forthcoming as u8,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok();
                    if !claimed {
                        // Lost the claim; wait like everyone else.
                        let status = &node.status;
                        drop(g);
                        self.spin_while_forthcoming(status);
                        continue;
                    }
                    // This thread owns the build. The node cannot be
                    // recycled while FORTHCOMING, so it stays valid with
                    // the lock released.
                    drop(g);
                    match self.build_and_publish(fn_start, fn_end) {
                        Some(tree) => {
                            node.tree.store(tree, Ordering::Release);
                            node.status.store(Status::Ready as u8, Ordering::Release);
                            return self.finish(tree, pc, fn_start, fn_end, load_module);
                        }
                        None => {
                            // Nothing decodable; poison the record so
                            // spinners are released and later probes skip
                            // the oracle.
                            node.status.store(Status::Never as u8, Ordering::Release);
                            return Lookup::Poisoned;
                        }
                    }
                }
                Status::Forthcoming => {
                    let status = &node.status;
                    drop(g);
                    self.spin_while_forthcoming(status);
                    continue;
                }
            }
        }
    }

    fn finish(
        &self,
        tree: *mut IntervalSlice,
        pc: usize,
        fn_start: usize,
        fn_end: usize,
        load_module: u64,
    ) -> Lookup {
        // Published trees are immutable and arena memory is immortal.
        let chain = unsafe { (*tree).as_slice() };
        match find_interval(chain, pc) {
            Some(iv) => Lookup::Ready { interval: *iv, fn_start, fn_end, load_module },
            // A READY chain tiles its function, so this means the record
            // was replaced between the probe and the search.
            None => Lookup::NotFound,
        }
    }

    fn spin_while_forthcoming(&self, status: &std::sync::atomic::AtomicU8) {
        let mut spins = 0usize;
        while status.load(Ordering::Acquire) == Status::Forthcoming as u8 {
            hint::spin_loop();
            spins += 1;
            check_spin_cap(self.spin_limit, spins);
        }
    }

    /// Consults the oracle (with no lock held) and races a `DEFERRED`
    /// record into the map. Returns false if the PC has no usable bounds;
    /// a lost race still returns true so the caller re-probes.
    fn insert_deferred(&self, pc: usize, host: &dyn Host) -> bool {
        let Some(b) = host.enclosing_bounds(pc) else {
            return false;
        };
        if pc < b.start || b.end <= pc {
            // Oracle handed back a range that excludes the probe; treat it
            // as unknown rather than trusting either answer.
            return false;
        }
        if b.start == b.end {
            return false;
        }
        let g = self.locked();
        let _ = self.list.insert(&self.arena, b.start, b.end, b.load_module, Status::Deferred);
        drop(g);
        true
    }

    fn build_and_publish(&self, fn_start: usize, fn_end: usize) -> Option<*mut IntervalSlice> {
        // The text may be unmapped between the bounds probe and this read;
        // a fault lands on the armed per-thread pad.
        let code = unsafe {
            std::slice::from_raw_parts(fn_start as *const u8, fn_end - fn_start)
        };
        let chain = (self.builder)(&self.arena, code, fn_start)?;
        let len = chain.len();
        let slice = self.arena.alloc_slice::<Interval>(len).unwrap_or_else(|| arena_exhausted());
        for (i, iv) in chain.iter().enumerate() {
            unsafe { slice.as_ptr().add(i).write(iv) };
        }
        let tree = self
            .arena
            .alloc(IntervalSlice::new(slice.as_ptr(), len))
            .unwrap_or_else(|| arena_exhausted());
        stats::add_intervals_built(len as u64);
        Some(tree.as_ptr())
    }

    /// `[start, end)` has just become executable: carve it out of the
    /// poisoned record covering it.
    pub fn notify_map(&self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        log::debug!("notify_map [{start:#x}, {end:#x})");
        let g = self.locked();
        let Some(node) = self.list.find(start) else {
            drop(g);
            log::warn!("notify_map: {start:#x} not covered by any record");
            return;
        };
        if node.status(Ordering::Acquire) != Status::Never {
            drop(g);
            log::warn!("notify_map: {start:#x} covered by a live record");
            return;
        }
        let (s0, e0) = (node.start, node.end);
        self.list.remove_range(start, start + 1, |_| {});
        if s0 < start {
            let _ = self.list.insert(&self.arena, s0, start, 0, Status::Never);
        }
        if end < e0 {
            let _ = self.list.insert(&self.arena, end, e0, 0, Status::Never);
        }
    }

    /// `[start, end)` is being unmapped: evict every record it touches and
    /// repoison, merging with poisoned neighbors.
    pub fn notify_unmap(&self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        log::debug!("notify_unmap [{start:#x}, {end:#x})");
        let g = self.locked();
        self.list.remove_range(start, end, |n| {
            if n.status(Ordering::Acquire) != Status::Never {
                stats::inc_records_evicted();
            }
        });
        let mut lo = start;
        let mut hi = end;
        if start > 0 {
            if let Some(left) = self.list.find(start - 1) {
                if left.status(Ordering::Acquire) == Status::Never {
                    lo = left.start;
                    self.list.remove_range(left.start, left.end, |_| {});
                }
            }
        }
        if end < usize::MAX {
            if let Some(right) = self.list.find(end) {
                if right.status(Ordering::Acquire) == Status::Never {
                    hi = right.end;
                    self.list.remove_range(right.start, right.end, |_| {});
                }
            }
        }
        let _ = self.list.insert(&self.arena, lo, hi, 0, Status::Never);
        drop(g);
    }

    /// Live records in address order, for diagnostics and tests.
    pub fn ranges(&self) -> Vec<(usize, usize, Status)> {
        let g = self.locked();
        let mut out = Vec::new();
        self.list.for_each(|n| {
            out.push((n.start, n.end, n.status(Ordering::Acquire)));
        });
        drop(g);
        out
    }
}

pub(crate) fn arena_exhausted() -> ! {
    // Async-signal-safe: raw write, then abort. Arena exhaustion is not
    // recoverable per-sample; every later build would hit it too.
    const MSG: &[u8] = b"unwind-recipe: recipe arena exhausted\n";
    unsafe {
        libc::write(2, MSG.as_ptr().cast(), MSG.len());
        libc::abort()
    }
}
