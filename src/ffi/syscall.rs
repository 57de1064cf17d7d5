use std::io::{Error, Result};
use std::ptr::{null_mut, NonNull};

pub fn mmap_anon(len: usize) -> Result<NonNull<u8>> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    // NORESERVE: the map is committed page by page as records are built,
    // so reserving the whole span up front would charge unused swap.
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    let ptr = unsafe { libc::mmap(null_mut(), len, prot, flags, -1, 0) };
    if ptr != libc::MAP_FAILED {
        // mmap never returns null on success.
        Ok(unsafe { NonNull::new_unchecked(ptr.cast()) })
    } else {
        Err(Error::last_os_error())
    }
}

pub unsafe fn munmap(ptr: *mut u8, len: usize) -> Result<()> {
    let result = libc::munmap(ptr as _, len);
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn sigaction(
    sig: i32,
    act: &libc::sigaction,
    old: Option<&mut libc::sigaction>,
) -> Result<()> {
    let old = old.map(|o| o as *mut _).unwrap_or(null_mut());
    let result = unsafe { libc::sigaction(sig, act, old) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

// https://man7.org/linux/man-pages/man3/getcontext.3.html
extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn setcontext(ucp: *const libc::ucontext_t) -> libc::c_int;
}

/// Saves the calling context into `uc`.
///
/// Returns twice: once when armed, and again whenever some later
/// [`save_context`]-paired restore lands on `uc`. The caller must
/// distinguish the two returns through memory it re-reads after the call.
pub unsafe fn save_context(uc: *mut libc::ucontext_t) -> Result<()> {
    let result = getcontext(uc);
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Restores a context saved by [`save_context`]. Does not return on
/// success.
pub unsafe fn restore_context(uc: *const libc::ucontext_t) -> Error {
    setcontext(uc);
    // Only reachable if the restore itself failed.
    Error::last_os_error()
}
