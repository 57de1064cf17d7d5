//! Process-wide unwinder statistics.
//!
//! Signal-time code never formats diagnostics; it bumps these counters and
//! the embedder reads them out of band via [`snapshot`].

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

static SAMPLES_DROPPED: AtomicU64 = AtomicU64::new(0);
static REENTRIES_REFUSED: AtomicU64 = AtomicU64::new(0);
static SPIN_ABANDONS: AtomicU64 = AtomicU64::new(0);
static TROLLS: AtomicU64 = AtomicU64::new(0);
static TROLL_FAILURES: AtomicU64 = AtomicU64::new(0);
static SUSPICIOUS_INTERVALS: AtomicU64 = AtomicU64::new(0);
static RA_CORRECTIONS: AtomicU64 = AtomicU64::new(0);
static SP_CORRECTIONS: AtomicU64 = AtomicU64::new(0);
static INTERVALS_BUILT: AtomicU64 = AtomicU64::new(0);
static RECORDS_EVICTED: AtomicU64 = AtomicU64::new(0);

pub(crate) fn inc_samples_dropped() {
    SAMPLES_DROPPED.fetch_add(1, Relaxed);
}

pub(crate) fn inc_reentries_refused() {
    REENTRIES_REFUSED.fetch_add(1, Relaxed);
}

pub(crate) fn inc_spin_abandons() {
    SPIN_ABANDONS.fetch_add(1, Relaxed);
}

pub(crate) fn inc_trolls() {
    TROLLS.fetch_add(1, Relaxed);
}

pub(crate) fn inc_troll_failures() {
    TROLL_FAILURES.fetch_add(1, Relaxed);
}

pub(crate) fn inc_suspicious_intervals() {
    SUSPICIOUS_INTERVALS.fetch_add(1, Relaxed);
}

pub(crate) fn inc_ra_corrections() {
    RA_CORRECTIONS.fetch_add(1, Relaxed);
}

pub(crate) fn inc_sp_corrections() {
    SP_CORRECTIONS.fetch_add(1, Relaxed);
}

pub(crate) fn add_intervals_built(n: u64) {
    INTERVALS_BUILT.fetch_add(n, Relaxed);
}

pub(crate) fn inc_records_evicted() {
    RECORDS_EVICTED.fetch_add(1, Relaxed);
}

/// A point-in-time copy of every counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Samples abandoned through the landing pad.
    pub samples_dropped: u64,
    /// Samples refused because the thread was already handling one.
    pub reentries_refused: u64,
    /// Spin-cap expirations that dropped a sample.
    pub spin_abandons: u64,
    /// Stack scans attempted to recover a lost return address.
    pub trolls: u64,
    /// Stack scans that found nothing plausible.
    pub troll_failures: u64,
    /// Intervals flagged suspicious by a builder.
    pub suspicious_intervals: u64,
    /// Interior frames whose register-resident RA had to be re-read
    /// from the linkage slot.
    pub ra_corrections: u64,
    /// Interior frames whose unallocated SP had to be corrected.
    pub sp_corrections: u64,
    /// Intervals published into the recipe map.
    pub intervals_built: u64,
    /// Function records evicted by unmap notifications.
    pub records_evicted: u64,
}

/// Reads every counter. Values are mutually unordered (relaxed loads).
pub fn snapshot() -> Stats {
    Stats {
        samples_dropped: SAMPLES_DROPPED.load(Relaxed),
        reentries_refused: REENTRIES_REFUSED.load(Relaxed),
        spin_abandons: SPIN_ABANDONS.load(Relaxed),
        trolls: TROLLS.load(Relaxed),
        troll_failures: TROLL_FAILURES.load(Relaxed),
        suspicious_intervals: SUSPICIOUS_INTERVALS.load(Relaxed),
        ra_corrections: RA_CORRECTIONS.load(Relaxed),
        sp_corrections: SP_CORRECTIONS.load(Relaxed),
        intervals_built: INTERVALS_BUILT.load(Relaxed),
        records_evicted: RECORDS_EVICTED.load(Relaxed),
    }
}
