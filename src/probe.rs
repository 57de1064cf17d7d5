//! Guarded raw-memory reads used while walking foreign stacks and code.
//!
//! Obvious garbage (null, misaligned) is rejected up front; anything else
//! is dereferenced directly and a fault lands on the per-thread pad armed
//! around the unwind. Reads are volatile so the compiler cannot float them
//! across the arming point.

pub(crate) fn read_word(addr: usize) -> Option<usize> {
    if addr == 0 || addr % std::mem::size_of::<usize>() != 0 {
        return None;
    }
    Some(unsafe { std::ptr::read_volatile(addr as *const usize) })
}

#[cfg(any(target_arch = "powerpc64", target_arch = "mips", target_arch = "mips64"))]
pub(crate) fn read_u32(addr: usize) -> Option<u32> {
    if addr == 0 || addr % 4 != 0 {
        return None;
    }
    Some(unsafe { std::ptr::read_volatile(addr as *const u32) })
}

#[cfg(target_arch = "x86_64")]
pub(crate) fn read_bytes<const N: usize>(addr: usize) -> Option<[u8; N]> {
    if addr == 0 {
        return None;
    }
    let mut out = [0u8; N];
    for (i, b) in out.iter_mut().enumerate() {
        *b = unsafe { std::ptr::read_volatile((addr + i) as *const u8) };
    }
    Some(out)
}
