//! Machine-context adapter.
//!
//! Translates the platform register snapshot handed to a signal handler
//! into the few registers the cursor needs, and recognizes the kernel's
//! signal-return trampoline so an unwind can cross a handler frame back
//! into the interrupted code.

#[cfg(target_arch = "x86_64")]
use crate::probe::read_bytes;
#[cfg(any(target_arch = "powerpc64", target_arch = "mips", target_arch = "mips64"))]
use crate::probe::read_u32;


/// The register view the cursor starts from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub pc: usize,
    pub sp: usize,
    /// Frame pointer (BP on x86, FP/s8 on MIPS; unused on PowerPC).
    pub bp: usize,
    /// Link/return-address register (LR on PowerPC, RA on MIPS; zero on
    /// x86, where the return address never lives in a register).
    pub ra: usize,
    /// Prologue staging register (R0 on PowerPC).
    pub scratch: usize,
}

/// PC of the interrupted instruction, for the embedder's own bookkeeping.
pub fn context_pc(uc: &libc::ucontext_t) -> usize {
    Registers::from_ucontext(uc).pc
}

#[cfg(target_arch = "x86_64")]
impl Registers {
    pub fn from_ucontext(uc: &libc::ucontext_t) -> Self {
        let g = &uc.uc_mcontext.gregs;
        Self {
            pc: g[libc::REG_RIP as usize] as usize,
            sp: g[libc::REG_RSP as usize] as usize,
            bp: g[libc::REG_RBP as usize] as usize,
            ra: 0,
            scratch: 0,
        }
    }
}

#[cfg(target_arch = "powerpc64")]
impl Registers {
    pub fn from_ucontext(uc: &libc::ucontext_t) -> Self {
        // Kernel gp_regs layout: r0..r31, then nip at 32, link at 36.
        let g = &uc.uc_mcontext.gp_regs;
        Self {
            pc: g[32] as usize,
            sp: g[1] as usize,
            bp: g[31] as usize,
            ra: g[36] as usize,
            scratch: g[0] as usize,
        }
    }
}

#[cfg(any(target_arch = "mips", target_arch = "mips64"))]
impl Registers {
    pub fn from_ucontext(uc: &libc::ucontext_t) -> Self {
        let g = &uc.uc_mcontext.gregs;
        Self {
            pc: uc.uc_mcontext.pc as usize,
            sp: g[29] as usize,
            bp: g[30] as usize,
            ra: g[31] as usize,
            scratch: 0,
        }
    }
}

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "powerpc64",
    target_arch = "mips",
    target_arch = "mips64"
)))]
impl Registers {
    pub fn from_ucontext(_uc: &libc::ucontext_t) -> Self {
        Self::default()
    }
}

/// If the frame about to be entered is the kernel's signal-return
/// trampoline, recovers the machine context the kernel pushed and returns
/// the registers of the interrupted (pre-signal) frame.
///
/// `ra_loc` is the address the return address was read from, `next_sp` the
/// caller SP just computed for the candidate frame.
#[cfg(target_arch = "x86_64")]
pub(crate) fn trampoline_context(
    next_pc: usize,
    ra_loc: usize,
    _next_sp: usize,
    _cur_sp: usize,
    _stack_bottom: usize,
) -> Option<Registers> {
    // __restore_rt: mov rax, __NR_rt_sigreturn; syscall
    const SIG: [u8; 9] = [0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];
    // Nothing in the first page is code; don't even probe it.
    if next_pc < 0x1000 || ra_loc == 0 || read_bytes::<9>(next_pc)? != SIG {
        return None;
    }
    // The slot holding the restorer address is rt_sigframe.pretcode; the
    // ucontext follows it immediately.
    let uc = ra_loc.checked_add(8)?;
    if uc % std::mem::align_of::<libc::ucontext_t>() != 0 {
        return None;
    }
    Some(Registers::from_ucontext(unsafe { &*(uc as *const libc::ucontext_t) }))
}

#[cfg(target_arch = "powerpc64")]
pub(crate) fn trampoline_context(
    next_pc: usize,
    _ra_loc: usize,
    next_sp: usize,
    cur_sp: usize,
    stack_bottom: usize,
) -> Option<Registers> {
    // li r0, __NR_rt_sigreturn; sc (materialized on the signal stack)
    const LI_R0_RT_SIGRETURN: u32 = 0x3800_0000 | 172;
    const SC: u32 = 0x4400_0002;
    // rt_sigframe sits one ABI frame above the trampoline frame's SP.
    const SIGNAL_FRAMESIZE: usize = 128;
    if next_pc < 0x1000 || !(cur_sp < next_pc && next_pc < stack_bottom) {
        return None;
    }
    if read_u32(next_pc)? != LI_R0_RT_SIGRETURN || read_u32(next_pc + 4)? != SC {
        return None;
    }
    let uc = next_sp.checked_add(SIGNAL_FRAMESIZE)?;
    Some(Registers::from_ucontext(unsafe { &*(uc as *const libc::ucontext_t) }))
}

#[cfg(any(target_arch = "mips", target_arch = "mips64"))]
pub(crate) fn trampoline_context(
    next_pc: usize,
    _ra_loc: usize,
    _next_sp: usize,
    cur_sp: usize,
    stack_bottom: usize,
) -> Option<Registers> {
    // li v0, __NR_rt_sigreturn; syscall (n64 and n32 flavors)
    const LI_V0_N64: u32 = 0x2402_0000 + 5000 + 211;
    const LI_V0_N32: u32 = 0x2402_0000 + 6000 + 211;
    const SYSCALL: u32 = 0x0000_000c;
    const SIGFRAME_CODE_OFST: usize = 4 * 4;
    const SIGFRAME_SIGCONTEXT_OFST: usize = 6 * 4;
    const RTSIGFRAME_SIGINFO_SZ: usize = 128;
    if next_pc < 0x1000 || !(cur_sp < next_pc && next_pc < stack_bottom) {
        return None;
    }
    let first = read_u32(next_pc)?;
    if !(first == LI_V0_N64 || first == LI_V0_N32) || read_u32(next_pc + 4)? != SYSCALL {
        return None;
    }
    let uc = next_pc - SIGFRAME_CODE_OFST + SIGFRAME_SIGCONTEXT_OFST + RTSIGFRAME_SIGINFO_SZ;
    Some(Registers::from_ucontext(unsafe { &*(uc as *const libc::ucontext_t) }))
}

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "powerpc64",
    target_arch = "mips",
    target_arch = "mips64"
)))]
pub(crate) fn trampoline_context(
    _next_pc: usize,
    _ra_loc: usize,
    _next_sp: usize,
    _cur_sp: usize,
    _stack_bottom: usize,
) -> Option<Registers> {
    None
}
