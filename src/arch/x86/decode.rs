//! Classified single-instruction decode.
//!
//! Backed by the table-driven iced-x86 decoder so ISA coverage is broad
//! without per-instruction allocation; only the handful of frame-relevant
//! shapes are surfaced, everything else collapses to `Other`.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

/// Frame effect of one decoded instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InsnClass {
    PushBp,
    /// Any other push (register, immediate, memory): one word onto the stack.
    Push,
    PopBp,
    Pop,
    /// Constant added to RSP (negative for `sub`).
    SpAdd(i64),
    /// RSP adjusted by a register: variable-sized allocation.
    SpAddReg,
    MovBpSp,
    /// `mov rsp,rbp` or `lea rsp,[rbp+disp]`: SP rebased off BP.
    SpFromBp(i64),
    Leave,
    Ret,
    Call,
    /// Indirect jump: a tail call out of this frame.
    JmpIndirect,
    Other,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Decoded {
    pub len: usize,
    pub class: InsnClass,
}

pub(crate) fn decode_one(code: &[u8], ip: u64) -> Option<Decoded> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return None;
    }
    let insn = decoder.decode();
    if insn.code() == Code::INVALID {
        return None;
    }
    Some(Decoded { len: insn.len(), class: classify(&insn) })
}

fn is_reg(insn: &Instruction, op: u32, reg: Register) -> bool {
    insn.op_kind(op) == OpKind::Register && insn.op_register(op) == reg
}

fn imm_i64(insn: &Instruction) -> Option<i64> {
    match insn.op_kind(1) {
        OpKind::Immediate8
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate32to64
        | OpKind::Immediate64 => Some(insn.immediate(1) as i64),
        _ => None,
    }
}

fn classify(insn: &Instruction) -> InsnClass {
    match insn.mnemonic() {
        Mnemonic::Push => {
            if is_reg(insn, 0, Register::RBP) {
                InsnClass::PushBp
            } else {
                InsnClass::Push
            }
        }
        Mnemonic::Pop => {
            if is_reg(insn, 0, Register::RBP) {
                InsnClass::PopBp
            } else {
                InsnClass::Pop
            }
        }
        Mnemonic::Sub if is_reg(insn, 0, Register::RSP) => match imm_i64(insn) {
            Some(k) => InsnClass::SpAdd(-k),
            None if insn.op_kind(1) == OpKind::Register => InsnClass::SpAddReg,
            None => InsnClass::Other,
        },
        Mnemonic::Add if is_reg(insn, 0, Register::RSP) => match imm_i64(insn) {
            Some(k) => InsnClass::SpAdd(k),
            None if insn.op_kind(1) == OpKind::Register => InsnClass::SpAddReg,
            None => InsnClass::Other,
        },
        Mnemonic::Mov => {
            if is_reg(insn, 0, Register::RBP) && is_reg(insn, 1, Register::RSP) {
                InsnClass::MovBpSp
            } else if is_reg(insn, 0, Register::RSP) && is_reg(insn, 1, Register::RBP) {
                InsnClass::SpFromBp(0)
            } else {
                InsnClass::Other
            }
        }
        Mnemonic::Lea if is_reg(insn, 0, Register::RSP) => {
            if insn.memory_base() == Register::RBP && insn.memory_index() == Register::None {
                InsnClass::SpFromBp(insn.memory_displacement64() as i64)
            } else if insn.memory_base() == Register::RSP
                && insn.memory_index() == Register::None
            {
                InsnClass::SpAdd(insn.memory_displacement64() as i64)
            } else {
                InsnClass::Other
            }
        }
        Mnemonic::Leave => InsnClass::Leave,
        Mnemonic::Ret | Mnemonic::Retf => InsnClass::Ret,
        Mnemonic::Call => InsnClass::Call,
        Mnemonic::Jmp => match insn.op0_kind() {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => InsnClass::Other,
            _ => InsnClass::JmpIndirect,
        },
        _ => InsnClass::Other,
    }
}
