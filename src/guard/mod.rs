//! Per-thread fault recovery and sample bracketing.
//!
//! Before a thread walks a foreign stack it arms a landing pad: a saved
//! machine context it can be thrown back to if the walk dereferences
//! something unmapped. The installed SIGSEGV/SIGBUS handler performs that
//! throw after releasing any recipe-map lock the thread holds (tracked by
//! a per-thread counter, since the fault may hit mid-critical-section).
//! Faults outside a sample are chained to whatever handler was installed
//! before ours.
//!
//! This nonlocal exit is a register restore, not an unwind: no destructors
//! run between the fault and the arming point. Everything the abandoned
//! code owned leaks, which is why samples allocate only from the arena.

use std::cell::{Cell, UnsafeCell};
use std::io::Result;
use std::mem::MaybeUninit;
use std::sync::OnceLock;

use libc::{c_int, c_void, siginfo_t};

use crate::ffi::syscall;
use crate::stats;

struct ThreadData {
    pad: UnsafeCell<MaybeUninit<libc::ucontext_t>>,
    pad_armed: Cell<bool>,
    aborted: Cell<bool>,
    handling_sample: Cell<bool>,
    map_locks_held: Cell<u32>,
}

thread_local! {
    static TD: ThreadData = const {
        ThreadData {
            pad: UnsafeCell::new(MaybeUninit::uninit()),
            pad_armed: Cell::new(false),
            aborted: Cell::new(false),
            handling_sample: Cell::new(false),
            map_locks_held: Cell::new(0),
        }
    };
}

/// Touches this thread's slot so later signal-time accesses cannot hit a
/// lazy TLS initialization path. Call once per sampled thread, before its
/// first sample can arrive.
pub fn thread_init() {
    TD.with(|_| {});
}

pub(crate) fn note_lock_acquired() {
    let _ = TD.try_with(|td| td.map_locks_held.set(td.map_locks_held.get() + 1));
}

pub(crate) fn note_lock_released() {
    let _ = TD.try_with(|td| {
        let held = td.map_locks_held.get();
        td.map_locks_held.set(held.saturating_sub(1));
    });
}

pub(crate) fn in_sample() -> bool {
    TD.try_with(|td| td.handling_sample.get()).unwrap_or(false)
}

/// Abandons the in-flight sample by restoring the landing pad.
///
/// Must only be called between [`protect`]'s arming point and its return;
/// anywhere else there is nothing to land on and the process aborts.
pub(crate) fn drop_sample() -> ! {
    let armed = TD.try_with(|td| {
        if !td.pad_armed.get() {
            return false;
        }
        release_held_locks(td);
        stats::inc_samples_dropped();
        td.aborted.set(true);
        true
    });
    if matches!(armed, Ok(true)) {
        TD.with(|td| {
            let uc = td.pad.get() as *const libc::ucontext_t;
            unsafe { syscall::restore_context(uc) };
        });
    }
    fatal(b"unwind-recipe: drop_sample with no landing pad armed\n");
}

fn release_held_locks(td: &ThreadData) {
    if td.map_locks_held.get() > 0 {
        if let Some(map) = crate::try_global_map() {
            unsafe { map.force_unlock() };
        }
        td.map_locks_held.set(0);
    }
}

fn fatal(msg: &[u8]) -> ! {
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::abort()
    }
}

/// Marks this thread as handling a sample for the guard's lifetime.
/// Nested samples are refused, mirroring the handler-side reentry check.
pub struct SampleScope {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl SampleScope {
    pub fn enter() -> Option<Self> {
        TD.with(|td| {
            if td.handling_sample.replace(true) {
                stats::inc_reentries_refused();
                return None;
            }
            Some(SampleScope { _not_send: std::marker::PhantomData })
        })
    }
}

impl Drop for SampleScope {
    fn drop(&mut self) {
        TD.with(|td| td.handling_sample.set(false));
    }
}

/// Runs `f` with the landing pad armed. Returns `None` if the work was
/// abandoned through the pad (the sample is already counted as dropped).
///
/// The pad is a bare register restore: locals of `f` live at the moment of
/// a fault are simply gone afterwards. State that must survive an abort
/// belongs in the arena or in atomics.
pub fn protect<R>(f: impl FnOnce() -> R) -> Option<R> {
    TD.with(|td| {
        td.aborted.set(false);
        let uc = td.pad.get() as *mut libc::ucontext_t;
        // Returns twice: once now, once more if the pad is restored.
        if unsafe { syscall::save_context(uc) }.is_err() {
            return None;
        }
        if td.aborted.get() {
            // Re-entered from the SEGV handler or drop_sample.
            td.pad_armed.set(false);
            return None;
        }
        // Arm only now that the saved context is valid to restore.
        td.pad_armed.set(true);
        let r = f();
        td.pad_armed.set(false);
        Some(r)
    })
}

/// Refuses reentry, arms the pad, runs the sample body.
pub fn protect_sample<R>(f: impl FnOnce() -> R) -> Option<R> {
    let _scope = SampleScope::enter()?;
    protect(f)
}

#[derive(Clone, Copy)]
struct PrevAction {
    handler: usize,
    flags: c_int,
}

static PREV_SEGV: OnceLock<PrevAction> = OnceLock::new();
static PREV_BUS: OnceLock<PrevAction> = OnceLock::new();

/// Installs the fault handler for SIGSEGV and SIGBUS, saving whatever was
/// there for chaining.
pub(crate) fn install_fault_handler() -> Result<()> {
    for (sig, slot) in [(libc::SIGSEGV, &PREV_SEGV), (libc::SIGBUS, &PREV_BUS)] {
        let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
        act.sa_sigaction = on_fault as usize;
        act.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        unsafe { libc::sigemptyset(&mut act.sa_mask) };
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        syscall::sigaction(sig, &act, Some(&mut old))?;
        let _ = slot.set(PrevAction { handler: old.sa_sigaction, flags: old.sa_flags });
    }
    Ok(())
}

extern "C" fn on_fault(sig: c_int, info: *mut siginfo_t, uctx: *mut c_void) {
    let ours = TD
        .try_with(|td| td.pad_armed.get() && td.handling_sample.get())
        .unwrap_or(false);
    if ours {
        TD.with(|td| {
            release_held_locks(td);
            stats::inc_samples_dropped();
            td.aborted.set(true);
            let uc = td.pad.get() as *const libc::ucontext_t;
            unsafe { syscall::restore_context(uc) };
        });
        // setcontext failed; nothing left to do safely.
        fatal(b"unwind-recipe: failed to restore landing pad\n");
    }
    chain(sig, info, uctx);
}

/// Forwards a fault that is not ours to the previously installed handler.
fn chain(sig: c_int, info: *mut siginfo_t, uctx: *mut c_void) {
    let prev = match sig {
        libc::SIGBUS => PREV_BUS.get(),
        _ => PREV_SEGV.get(),
    };
    match prev.copied() {
        None => restore_default(sig),
        Some(prev) => match prev.handler {
            libc::SIG_DFL => restore_default(sig),
            libc::SIG_IGN => (),
            h if prev.flags & libc::SA_SIGINFO != 0 => {
                let f: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                    unsafe { std::mem::transmute(h) };
                f(sig, info, uctx)
            }
            h => {
                let f: extern "C" fn(c_int) = unsafe { std::mem::transmute(h) };
                f(sig)
            }
        },
    }
}

/// Restores the default action and returns; the faulting instruction
/// re-executes, the kernel re-delivers the signal, and the process dies
/// with the right disposition.
fn restore_default(sig: c_int) {
    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    act.sa_sigaction = libc::SIG_DFL;
    unsafe { libc::sigemptyset(&mut act.sa_mask) };
    let _ = syscall::sigaction(sig, &act, None);
}
