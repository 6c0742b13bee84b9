//! Builder and codec for gateway programs and requests.

use std::ops::{Deref, DerefMut};

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolValue;

use crate::disasm::{self, Action, DecodeError, Instruction};
use crate::ops::{LoopFlags, Op};

/// Maximum number of inputs a program may carry; inputs are addressed by a
/// single byte.
pub const MAX_INPUTS: usize = 256;

/// An append-only op stream plus the table of inputs it references.
///
/// Programs without an output-count prefix are the unit of nested evaluation
/// (`EVAL_INLINE`, `EVAL_LOOP`). Top-level requests use [`GatewayRequest`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GatewayProgram {
    pub(crate) ops: Vec<u8>,
    pub(crate) inputs: Vec<Bytes>,
}

impl GatewayProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[u8] {
        &self.ops
    }

    pub fn inputs(&self) -> &[Bytes] {
        &self.inputs
    }

    /// ABI encoding `(bytes ops, bytes[] inputs)`.
    pub fn encode(&self) -> Bytes {
        let ops = Bytes::copy_from_slice(&self.ops);
        (ops, self.inputs.clone()).abi_encode_params().into()
    }

    /// Parses and validates an encoding produced by [`encode`](Self::encode).
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let program = Self::decode_unchecked(data)?;
        program.parse(0)?;
        Ok(program)
    }

    pub(crate) fn decode_unchecked(data: &[u8]) -> Result<Self, DecodeError> {
        let (ops, inputs) = <(Bytes, Vec<Bytes>)>::abi_decode_params(data, true)
            .map_err(|e| DecodeError::Abi(e.to_string()))?;
        Ok(Self {
            ops: ops.to_vec(),
            inputs,
        })
    }

    /// Decodes the ops starting at `base` and checks every input reference.
    pub(crate) fn parse(&self, base: usize) -> Result<Vec<Action>, DecodeError> {
        let actions = disasm::decode_at(&self.ops[base..], base)?;
        for action in &actions {
            if let Instruction::PushInput(index) = action.instruction {
                if usize::from(index) >= self.inputs.len() {
                    return Err(DecodeError::InputIndex {
                        pos: action.pos,
                        index,
                        inputs: self.inputs.len(),
                    });
                }
            }
        }
        Ok(actions)
    }

    /// Adds an input and returns its index. Identical inputs are shared.
    ///
    /// # Panics
    ///
    /// Panics if the program already carries [`MAX_INPUTS`] distinct inputs.
    pub fn add_input(&mut self, input: impl Into<Bytes>) -> u8 {
        let input = input.into();
        let index = match self.inputs.iter().position(|x| *x == input) {
            Some(index) => index,
            None => {
                assert!(self.inputs.len() < MAX_INPUTS, "too many inputs");
                self.inputs.push(input);
                self.inputs.len() - 1
            }
        };
        index as u8
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.ops.push(op.byte());
        self
    }

    fn op_u8(&mut self, op: Op, arg: u8) -> &mut Self {
        self.ops.extend_from_slice(&[op.byte(), arg]);
        self
    }

    /// Pushes an integer using the narrowest `PUSH_N` form.
    pub fn push(&mut self, value: U256) -> &mut Self {
        let width = value.bit_len().div_ceil(8);
        self.ops.push(width as u8);
        self.ops
            .extend_from_slice(&value.to_be_bytes::<32>()[32 - width..]);
        self
    }

    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        self.push(U256::from(value))
    }

    pub fn push_byte(&mut self, value: u8) -> &mut Self {
        self.op_u8(Op::PushByte, value)
    }

    pub fn push_address(&mut self, address: Address) -> &mut Self {
        self.push(U256::from_be_slice(address.as_slice()))
    }

    /// Pushes raw bytes, inline when they fit a `u16` length prefix and
    /// through the input table otherwise.
    pub fn push_bytes(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        match u16::try_from(bytes.len()) {
            Ok(len) => {
                self.ops.push(Op::PushBytes.byte());
                self.ops.extend_from_slice(&len.to_be_bytes());
                self.ops.extend_from_slice(bytes);
                self
            }
            Err(_) => {
                let index = self.add_input(Bytes::copy_from_slice(bytes));
                self.push_input(index)
            }
        }
    }

    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_bytes(s.as_bytes())
    }

    /// Pushes the encoding of `program` for a later `EVAL_INLINE` or
    /// `EVAL_LOOP`.
    pub fn push_program(&mut self, program: &GatewayProgram) -> &mut Self {
        self.push_bytes(program.encode())
    }

    pub fn push_input(&mut self, index: u8) -> &mut Self {
        self.op_u8(Op::PushInput, index)
    }

    pub fn push_output(&mut self, index: u8) -> &mut Self {
        self.op_u8(Op::PushOutput, index)
    }

    pub fn push_slot(&mut self) -> &mut Self {
        self.op(Op::PushSlot)
    }

    pub fn push_target(&mut self) -> &mut Self {
        self.op(Op::PushTarget)
    }

    /// Pushes a copy of the value at absolute stack `index`.
    pub fn push_stack(&mut self, index: u64) -> &mut Self {
        self.push_u64(index).op(Op::PushStack)
    }

    pub fn stack_size(&mut self) -> &mut Self {
        self.op(Op::StackSize)
    }

    pub fn set_target(&mut self, address: Address) -> &mut Self {
        self.push_address(address).target()
    }

    /// `SET_TARGET` from the top of the stack.
    pub fn target(&mut self) -> &mut Self {
        self.op(Op::SetTarget)
    }

    pub fn set_output(&mut self, index: u8) -> &mut Self {
        self.op_u8(Op::SetOutput, index)
    }

    /// Expects `[..items, count, program]` on the stack.
    pub fn eval_loop(&mut self, flags: LoopFlags, back: u8) -> &mut Self {
        self.ops.extend_from_slice(&[Op::EvalLoop.byte(), flags.bits(), back]);
        self
    }

    pub fn eval_inline(&mut self) -> &mut Self {
        self.op(Op::EvalInline)
    }

    pub fn require_nonzero(&mut self, back: u8) -> &mut Self {
        self.op_u8(Op::RequireNonzero, back)
    }

    pub fn require_contract(&mut self) -> &mut Self {
        self.op(Op::RequireContract)
    }

    pub fn is_contract(&mut self) -> &mut Self {
        self.op(Op::IsContract)
    }

    pub fn read_slots(&mut self, count: u8) -> &mut Self {
        self.op_u8(Op::ReadSlots, count)
    }

    /// Reads the single word at the current slot.
    pub fn read(&mut self) -> &mut Self {
        self.read_slots(1)
    }

    pub fn read_bytes(&mut self) -> &mut Self {
        self.op(Op::ReadBytes)
    }

    pub fn read_array(&mut self, step: u8) -> &mut Self {
        self.op_u8(Op::ReadArray, step)
    }

    pub fn read_hashed_bytes(&mut self) -> &mut Self {
        self.op(Op::ReadHashedBytes)
    }

    #[deprecated(note = "use `set_slot(U256::ZERO)`")]
    pub fn zero_slot(&mut self) -> &mut Self {
        self.op(Op::SlotZero)
    }

    /// `SLOT_ADD` from the top of the stack.
    pub fn add_slot(&mut self) -> &mut Self {
        self.op(Op::SlotAdd)
    }

    pub fn offset(&mut self, n: U256) -> &mut Self {
        self.push(n).add_slot()
    }

    /// `SLOT_FOLLOW`: `slot = keccak(top ++ slot)`.
    pub fn follow(&mut self) -> &mut Self {
        self.op(Op::SlotFollow)
    }

    pub fn follow_index(&mut self, key: U256) -> &mut Self {
        self.push(key).follow()
    }

    pub fn set_slot(&mut self, slot: U256) -> &mut Self {
        self.push(slot).slot()
    }

    /// `SET_SLOT` from the top of the stack.
    pub fn slot(&mut self) -> &mut Self {
        self.op(Op::SetSlot)
    }

    /// Duplicates the value `back` positions below the top.
    pub fn dup(&mut self, back: u64) -> &mut Self {
        self.push_u64(back).op(Op::Dup)
    }

    pub fn pop(&mut self) -> &mut Self {
        self.op(Op::Pop)
    }

    pub fn swap(&mut self, back: u64) -> &mut Self {
        self.push_u64(back).op(Op::Swap)
    }

    pub fn keccak(&mut self) -> &mut Self {
        self.op(Op::Keccak)
    }

    pub fn concat(&mut self, count: u8) -> &mut Self {
        self.op_u8(Op::Concat, count)
    }

    pub fn slice(&mut self, offset: u16, length: u16) -> &mut Self {
        self.ops.push(Op::Slice.byte());
        self.ops.extend_from_slice(&offset.to_be_bytes());
        self.ops.extend_from_slice(&length.to_be_bytes());
        self
    }

    pub fn length(&mut self) -> &mut Self {
        self.op(Op::Length)
    }

    pub fn plus(&mut self) -> &mut Self {
        self.op(Op::Plus)
    }

    pub fn times(&mut self) -> &mut Self {
        self.op(Op::Times)
    }

    pub fn divide(&mut self) -> &mut Self {
        self.op(Op::Divide)
    }

    pub fn modulo(&mut self) -> &mut Self {
        self.op(Op::Mod)
    }

    pub fn subtract(&mut self) -> &mut Self {
        self.op(Op::Subtract)
    }

    pub fn and(&mut self) -> &mut Self {
        self.op(Op::And)
    }

    pub fn or(&mut self) -> &mut Self {
        self.op(Op::Or)
    }

    pub fn xor(&mut self) -> &mut Self {
        self.op(Op::Xor)
    }

    pub fn not(&mut self) -> &mut Self {
        self.op(Op::Not)
    }

    pub fn shl(&mut self, bits: u8) -> &mut Self {
        self.op_u8(Op::ShiftLeft, bits)
    }

    pub fn shr(&mut self, bits: u8) -> &mut Self {
        self.op_u8(Op::ShiftRight, bits)
    }

    pub fn is_zero(&mut self) -> &mut Self {
        self.op(Op::IsZero)
    }

    pub fn equals(&mut self) -> &mut Self {
        self.op(Op::Eq)
    }

    pub fn lt(&mut self) -> &mut Self {
        self.op(Op::Lt)
    }

    pub fn gt(&mut self) -> &mut Self {
        self.op(Op::Gt)
    }
}

/// A top-level program whose first op byte is the number of outputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GatewayRequest(GatewayProgram);

impl Default for GatewayRequest {
    fn default() -> Self {
        Self::new(0)
    }
}

impl GatewayRequest {
    pub fn new(outputs: u8) -> Self {
        Self(GatewayProgram {
            ops: vec![outputs],
            inputs: Vec::new(),
        })
    }

    pub fn output_count(&self) -> u8 {
        self.0.ops[0]
    }

    /// Pops the top of the stack into the next output register.
    ///
    /// # Panics
    ///
    /// Panics if the request already declares 255 outputs.
    pub fn add_output(&mut self) -> &mut Self {
        let index = self.0.ops[0];
        self.0.ops[0] = index.checked_add(1).expect("too many outputs");
        self.0.set_output(index);
        self
    }

    pub fn program(&self) -> &GatewayProgram {
        &self.0
    }

    pub fn encode(&self) -> Bytes {
        self.0.encode()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let program = GatewayProgram::decode_unchecked(data)?;
        if program.ops.is_empty() {
            return Err(DecodeError::MissingOutputCount);
        }
        program.parse(1)?;
        Ok(Self(program))
    }

    /// Decoded actions after the output-count byte.
    pub(crate) fn actions(&self) -> Result<Vec<Action>, DecodeError> {
        self.0.parse(1)
    }
}

/// Re-exposes the [`GatewayProgram`] builder on [`GatewayRequest`] so chains
/// keep the request type and can end in [`GatewayRequest::add_output`].
macro_rules! forward_builder {
    ($($(#[$meta:meta])* fn $name:ident($($arg:ident: $ty:ty),*);)*) => {
        #[allow(deprecated)]
        impl GatewayRequest {
            $(
                $(#[$meta])*
                pub fn $name(&mut self $(, $arg: $ty)*) -> &mut Self {
                    self.0.$name($($arg),*);
                    self
                }
            )*
        }
    };
}

forward_builder! {
    fn op(op: Op);
    fn push(value: U256);
    fn push_u64(value: u64);
    fn push_byte(value: u8);
    fn push_address(address: Address);
    fn push_bytes(bytes: impl AsRef<[u8]>);
    fn push_str(s: &str);
    fn push_program(program: &GatewayProgram);
    fn push_input(index: u8);
    fn push_output(index: u8);
    fn push_slot();
    fn push_target();
    fn push_stack(index: u64);
    fn stack_size();
    fn set_target(address: Address);
    fn target();
    fn set_output(index: u8);
    fn eval_loop(flags: LoopFlags, back: u8);
    fn eval_inline();
    fn require_nonzero(back: u8);
    fn require_contract();
    fn is_contract();
    fn read_slots(count: u8);
    fn read();
    fn read_bytes();
    fn read_array(step: u8);
    fn read_hashed_bytes();
    #[deprecated(note = "use `set_slot(U256::ZERO)`")]
    fn zero_slot();
    fn add_slot();
    fn offset(n: U256);
    fn follow();
    fn follow_index(key: U256);
    fn set_slot(slot: U256);
    fn slot();
    fn dup(back: u64);
    fn pop();
    fn swap(back: u64);
    fn keccak();
    fn concat(count: u8);
    fn slice(offset: u16, length: u16);
    fn length();
    fn plus();
    fn times();
    fn divide();
    fn modulo();
    fn subtract();
    fn and();
    fn or();
    fn xor();
    fn not();
    fn shl(bits: u8);
    fn shr(bits: u8);
    fn is_zero();
    fn equals();
    fn lt();
    fn gt();
}

impl Deref for GatewayRequest {
    type Target = GatewayProgram;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for GatewayRequest {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_uses_narrowest_width() {
        let mut p = GatewayProgram::new();
        p.push(U256::ZERO).push_u64(0xff).push_u64(0x1234).push(U256::MAX);
        let ops = p.ops();
        assert_eq!(&ops[..5], &[0, 1, 0xff, 2, 0x12]);
        assert_eq!(ops[6], 32);
        assert_eq!(ops.len(), 1 + 2 + 3 + 33);
    }

    #[test]
    fn add_output_increments_count() {
        let mut req = GatewayRequest::new(0);
        req.push_u64(1).add_output();
        req.push_u64(2).add_output();
        assert_eq!(req.output_count(), 2);
        assert_eq!(req.ops(), &[2, 1, 1, 51, 0, 1, 2, 51, 1]);
    }

    #[test]
    fn large_bytes_go_through_inputs() {
        let big = vec![7u8; usize::from(u16::MAX) + 1];
        let mut p = GatewayProgram::new();
        p.push_bytes(&big).push_bytes(&big);
        assert_eq!(p.inputs().len(), 1);
        assert_eq!(p.ops(), &[35, 0, 35, 0]);
    }

    #[test]
    fn encoding_round_trips() {
        let mut req = GatewayRequest::new(0);
        req.set_target(Address::repeat_byte(0x11))
            .set_slot(U256::from(5))
            .read_bytes()
            .add_output();
        req.push_bytes(vec![1u8; 70_000]).add_output();
        let decoded = GatewayRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.output_count(), 2);
    }

    #[test]
    fn decode_rejects_bad_programs() {
        let mut p = GatewayProgram::new();
        p.push_input(0);
        assert_eq!(
            GatewayProgram::decode(&p.encode()),
            Err(DecodeError::InputIndex {
                pos: 0,
                index: 0,
                inputs: 0
            })
        );

        let empty = GatewayProgram::new();
        assert_eq!(
            GatewayRequest::decode(&empty.encode()),
            Err(DecodeError::MissingOutputCount)
        );

        let mut req = GatewayRequest::new(1);
        req.op(Op::Push(4));
        assert!(matches!(
            GatewayRequest::decode(&req.encode()),
            Err(DecodeError::Truncated { pos: 1, .. })
        ));

        assert!(matches!(
            GatewayProgram::decode(&[1, 2, 3]),
            Err(DecodeError::Abi(_))
        ));
    }
}
