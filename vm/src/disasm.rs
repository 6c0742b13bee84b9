//! Decoding of op streams into [`Instruction`]s.
//!
//! The machine executes exactly what [`decode`] produces, so the disassembler
//! output is always the program the machine will run.

use std::fmt;

use alloy::primitives::{Bytes, U256};
use thiserror::Error;

use crate::ops::{LoopFlags, Op};

/// Errors raised while parsing bytecode or a program encoding.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum DecodeError {
    /// The byte at `pos` is not an opcode.
    #[error("unknown opcode {op} at {pos}")]
    UnknownOpcode { pos: usize, op: u8 },

    /// An opcode's inline arguments run past the end of the program.
    #[error("truncated {op} at {pos}: needs {needed} bytes, {available} remain")]
    Truncated {
        pos: usize,
        op: Op,
        needed: usize,
        available: usize,
    },

    /// `PUSH_INPUT` references an input the program does not carry.
    #[error("input index {index} out of range at {pos} (inputs: {inputs})")]
    InputIndex {
        pos: usize,
        index: u8,
        inputs: usize,
    },

    /// A request encoding without its leading output-count byte.
    #[error("request is missing its output count")]
    MissingOutputCount,

    /// The outer `(bytes, bytes[])` encoding is malformed.
    #[error("invalid program encoding: {0}")]
    Abi(String),
}

/// A decoded opcode together with its inline arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Instruction {
    Push { width: u8, value: U256 },
    PushByte(u8),
    PushBytes(Bytes),
    PushInput(u8),
    PushOutput(u8),
    PushSlot,
    PushTarget,
    PushStack,
    StackSize,
    SetTarget,
    SetOutput(u8),
    EvalLoop { flags: LoopFlags, back: u8 },
    EvalInline,
    RequireNonzero(u8),
    RequireContract,
    IsContract,
    ReadSlots(u8),
    ReadBytes,
    ReadArray(u8),
    ReadHashedBytes,
    SlotZero,
    SlotAdd,
    SlotFollow,
    SetSlot,
    Dup,
    Pop,
    Swap,
    Keccak,
    Concat(u8),
    Slice { offset: u16, length: u16 },
    Length,
    Plus,
    Times,
    Divide,
    Mod,
    Subtract,
    And,
    Or,
    Xor,
    Not,
    ShiftLeft(u8),
    ShiftRight(u8),
    IsZero,
    Eq,
    Lt,
    Gt,
}

impl Instruction {
    pub fn op(&self) -> Op {
        match self {
            Instruction::Push { width, .. } => Op::Push(*width),
            Instruction::PushByte(_) => Op::PushByte,
            Instruction::PushBytes(_) => Op::PushBytes,
            Instruction::PushInput(_) => Op::PushInput,
            Instruction::PushOutput(_) => Op::PushOutput,
            Instruction::PushSlot => Op::PushSlot,
            Instruction::PushTarget => Op::PushTarget,
            Instruction::PushStack => Op::PushStack,
            Instruction::StackSize => Op::StackSize,
            Instruction::SetTarget => Op::SetTarget,
            Instruction::SetOutput(_) => Op::SetOutput,
            Instruction::EvalLoop { .. } => Op::EvalLoop,
            Instruction::EvalInline => Op::EvalInline,
            Instruction::RequireNonzero(_) => Op::RequireNonzero,
            Instruction::RequireContract => Op::RequireContract,
            Instruction::IsContract => Op::IsContract,
            Instruction::ReadSlots(_) => Op::ReadSlots,
            Instruction::ReadBytes => Op::ReadBytes,
            Instruction::ReadArray(_) => Op::ReadArray,
            Instruction::ReadHashedBytes => Op::ReadHashedBytes,
            Instruction::SlotZero => Op::SlotZero,
            Instruction::SlotAdd => Op::SlotAdd,
            Instruction::SlotFollow => Op::SlotFollow,
            Instruction::SetSlot => Op::SetSlot,
            Instruction::Dup => Op::Dup,
            Instruction::Pop => Op::Pop,
            Instruction::Swap => Op::Swap,
            Instruction::Keccak => Op::Keccak,
            Instruction::Concat(_) => Op::Concat,
            Instruction::Slice { .. } => Op::Slice,
            Instruction::Length => Op::Length,
            Instruction::Plus => Op::Plus,
            Instruction::Times => Op::Times,
            Instruction::Divide => Op::Divide,
            Instruction::Mod => Op::Mod,
            Instruction::Subtract => Op::Subtract,
            Instruction::And => Op::And,
            Instruction::Or => Op::Or,
            Instruction::Xor => Op::Xor,
            Instruction::Not => Op::Not,
            Instruction::ShiftLeft(_) => Op::ShiftLeft,
            Instruction::ShiftRight(_) => Op::ShiftRight,
            Instruction::IsZero => Op::IsZero,
            Instruction::Eq => Op::Eq,
            Instruction::Lt => Op::Lt,
            Instruction::Gt => Op::Gt,
        }
    }

    fn fmt_args(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Push { value, .. } => write!(f, " {value:#x}"),
            Instruction::PushByte(x) => write!(f, " {x:#04x}"),
            Instruction::PushBytes(bytes) => write!(f, " {bytes}"),
            Instruction::PushInput(index)
            | Instruction::PushOutput(index)
            | Instruction::SetOutput(index) => write!(f, " index={index}"),
            Instruction::EvalLoop { flags, back } => {
                write!(f, " flags={:#04x} back={back}", flags.bits())
            }
            Instruction::RequireNonzero(back) => write!(f, " back={back}"),
            Instruction::ReadSlots(count) | Instruction::Concat(count) => {
                write!(f, " count={count}")
            }
            Instruction::ReadArray(step) => write!(f, " step={step}"),
            Instruction::Slice { offset, length } => {
                write!(f, " offset={offset} length={length}")
            }
            Instruction::ShiftLeft(bits) | Instruction::ShiftRight(bits) => {
                write!(f, " bits={bits}")
            }
            _ => Ok(()),
        }
    }
}

/// One decoded instruction and the byte offset of its opcode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Action {
    pub pos: usize,
    pub instruction: Instruction,
}

impl Action {
    pub fn op(&self) -> Op {
        self.instruction.op()
    }

    /// Symbolic opcode name, e.g. `READ_SLOTS`.
    pub fn name(&self) -> String {
        self.op().to_string()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}: {:>3} {}", self.pos, self.op().byte(), self.op())?;
        self.instruction.fmt_args(f)
    }
}

/// The full disassembly of an op stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Disassembly {
    /// Declared output count, present only for the prefixed request form.
    pub outputs: Option<u8>,
    pub actions: Vec<Action>,
}

impl fmt::Display for Disassembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(outputs) = self.outputs {
            writeln!(f, "outputs: {outputs}")?;
        }
        for action in &self.actions {
            writeln!(f, "{action}")?;
        }
        Ok(())
    }
}

/// Disassembles a raw op stream.
///
/// With `prefixed` set the first byte is read as a request's output count,
/// otherwise the stream is treated as a bare program.
pub fn disassemble(ops: &[u8], prefixed: bool) -> Result<Disassembly, DecodeError> {
    if prefixed {
        let (&outputs, rest) = ops.split_first().ok_or(DecodeError::MissingOutputCount)?;
        Ok(Disassembly {
            outputs: Some(outputs),
            actions: decode_at(rest, 1)?,
        })
    } else {
        Ok(Disassembly {
            outputs: None,
            actions: decode_at(ops, 0)?,
        })
    }
}

/// Decodes a bare op stream.
pub fn decode(ops: &[u8]) -> Result<Vec<Action>, DecodeError> {
    decode_at(ops, 0)
}

/// Decodes `ops`, reporting positions shifted by `base`.
pub(crate) fn decode_at(ops: &[u8], base: usize) -> Result<Vec<Action>, DecodeError> {
    let mut reader = Reader { ops, pos: 0, base };
    let mut actions = Vec::new();
    while reader.pos < ops.len() {
        let pos = base + reader.pos;
        let byte = ops[reader.pos];
        let op = Op::from_byte(byte).ok_or(DecodeError::UnknownOpcode { pos, op: byte })?;
        reader.pos += 1;
        let instruction = reader.instruction(op, pos)?;
        actions.push(Action { pos, instruction });
    }
    Ok(actions)
}

struct Reader<'a> {
    ops: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, op: Op, at: usize, needed: usize) -> Result<&'a [u8], DecodeError> {
        let available = self.ops.len() - self.pos;
        if needed > available {
            return Err(DecodeError::Truncated {
                pos: at,
                op,
                needed,
                available,
            });
        }
        let bytes = &self.ops[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(bytes)
    }

    fn u8(&mut self, op: Op, at: usize) -> Result<u8, DecodeError> {
        Ok(self.take(op, at, 1)?[0])
    }

    fn u16(&mut self, op: Op, at: usize) -> Result<u16, DecodeError> {
        let bytes = self.take(op, at, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn instruction(&mut self, op: Op, at: usize) -> Result<Instruction, DecodeError> {
        debug_assert_eq!(self.base + self.pos, at + 1);
        Ok(match op {
            Op::Push(width) => Instruction::Push {
                width,
                value: U256::from_be_slice(self.take(op, at, op.arg_width())?),
            },
            Op::PushByte => Instruction::PushByte(self.u8(op, at)?),
            Op::PushBytes => {
                let len = self.u16(op, at)?;
                Instruction::PushBytes(Bytes::copy_from_slice(
                    self.take(op, at, usize::from(len))?,
                ))
            }
            Op::PushInput => Instruction::PushInput(self.u8(op, at)?),
            Op::PushOutput => Instruction::PushOutput(self.u8(op, at)?),
            Op::PushSlot => Instruction::PushSlot,
            Op::PushTarget => Instruction::PushTarget,
            Op::PushStack => Instruction::PushStack,
            Op::StackSize => Instruction::StackSize,
            Op::SetTarget => Instruction::SetTarget,
            Op::SetOutput => Instruction::SetOutput(self.u8(op, at)?),
            Op::EvalLoop => {
                let flags = LoopFlags::from_bits_retain(self.u8(op, at)?);
                let back = self.u8(op, at)?;
                Instruction::EvalLoop { flags, back }
            }
            Op::EvalInline => Instruction::EvalInline,
            Op::RequireNonzero => Instruction::RequireNonzero(self.u8(op, at)?),
            Op::RequireContract => Instruction::RequireContract,
            Op::IsContract => Instruction::IsContract,
            Op::ReadSlots => Instruction::ReadSlots(self.u8(op, at)?),
            Op::ReadBytes => Instruction::ReadBytes,
            Op::ReadArray => Instruction::ReadArray(self.u8(op, at)?),
            Op::ReadHashedBytes => Instruction::ReadHashedBytes,
            Op::SlotZero => Instruction::SlotZero,
            Op::SlotAdd => Instruction::SlotAdd,
            Op::SlotFollow => Instruction::SlotFollow,
            Op::SetSlot => Instruction::SetSlot,
            Op::Dup => Instruction::Dup,
            Op::Pop => Instruction::Pop,
            Op::Swap => Instruction::Swap,
            Op::Keccak => Instruction::Keccak,
            Op::Concat => Instruction::Concat(self.u8(op, at)?),
            Op::Slice => {
                let offset = self.u16(op, at)?;
                let length = self.u16(op, at)?;
                Instruction::Slice { offset, length }
            }
            Op::Length => Instruction::Length,
            Op::Plus => Instruction::Plus,
            Op::Times => Instruction::Times,
            Op::Divide => Instruction::Divide,
            Op::Mod => Instruction::Mod,
            Op::Subtract => Instruction::Subtract,
            Op::And => Instruction::And,
            Op::Or => Instruction::Or,
            Op::Xor => Instruction::Xor,
            Op::Not => Instruction::Not,
            Op::ShiftLeft => Instruction::ShiftLeft(self.u8(op, at)?),
            Op::ShiftRight => Instruction::ShiftRight(self.u8(op, at)?),
            Op::IsZero => Instruction::IsZero,
            Op::Eq => Instruction::Eq,
            Op::Lt => Instruction::Lt,
            Op::Gt => Instruction::Gt,
        })
    }
}
