//! The request interpreter.
//!
//! Evaluation is synchronous and runs over a [`StateView`]. Storage reads are
//! recorded as needs and return [`Value::Deferred`] handles; a handle is only
//! forced when an opcode has to look at its bytes. If a forced value is not
//! in the view the pass stops with [`Outcome::Suspended`], listing every key
//! the caller should fetch before running the (deterministic) pass again.

use alloy::primitives::{keccak256, Address, Bytes, U256};
use gateway_common::WORD_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::disasm::{Action, DecodeError, Instruction};
use crate::need::{Need, NeedSet};
use crate::ops::LoopFlags;
use crate::program::{GatewayProgram, GatewayRequest};
use crate::state::StateView;
use crate::value::{self, Deferred, SlotRun, Value};

/// Exit code of a failed `REQ_*` assertion.
pub const REQUIRE_FAILED: u8 = 1;

/// Nesting limit for `EVAL_INLINE`/`EVAL_LOOP`.
pub const MAX_EVAL_DEPTH: usize = 16;

/// Upper bound on executed instructions per pass, across all nesting.
pub const MAX_STEPS: usize = 1 << 20;

const WORD: usize = WORD_SIZE;

/// Resource limits applied while evaluating.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Maximum stack depth of any frame.
    pub max_stack: usize,
    /// Maximum number of distinct targets.
    pub max_targets: usize,
    /// Maximum number of distinct `(target, slot)` storage proofs.
    pub max_unique_proofs: usize,
    /// Maximum storage bytes requested by `READ_*` ops, 32 per word.
    pub max_read_bytes: usize,
    /// Maximum length of any single stack value, in bytes.
    pub max_value_bytes: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_stack: 64,
            max_targets: 32,
            max_unique_proofs: 128,
            max_read_bytes: 8192,
            max_value_bytes: 32_768,
        }
    }
}

/// Fatal evaluation errors. Failed requirements are not errors, see
/// [`MachineResult::exit_code`].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum MachineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("stack overflow")]
    StackOverflow,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("stack index {index} out of range (size: {size})")]
    StackIndex { index: U256, size: usize },

    #[error("too many targets: {0}")]
    TooManyTargets(usize),

    #[error("too many proofs: {0}")]
    TooManyProofs(usize),

    #[error("too many bytes: {0}")]
    TooManyBytes(usize),

    #[error("value too large: {size} bytes (max: {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("invalid address: {0}")]
    InvalidAddress(Bytes),

    #[error("output index {index} out of range (outputs: {outputs})")]
    OutputIndex { index: u8, outputs: usize },

    #[error("invalid bytes header {0:#x}")]
    InvalidBytesHeader(U256),

    #[error("invalid array step 0")]
    InvalidArrayStep,

    #[error("hashed bytes do not match {target} at slot {slot:#x}")]
    HashMismatch { target: Address, slot: U256 },

    #[error("loop count {0} exceeds stack")]
    LoopCount(U256),

    #[error("evaluation nested deeper than {MAX_EVAL_DEPTH}")]
    DepthLimit,

    #[error("evaluation exceeded {MAX_STEPS} steps")]
    StepLimit,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MachineResult {
    /// Output registers. May still hold deferred reads.
    pub outputs: Vec<Value>,
    /// 0 on success, [`REQUIRE_FAILED`] after a failed assertion.
    pub exit_code: u8,
    pub needs: NeedSet,
}

/// State the last pass wanted but the view did not have.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Missing {
    pub slots: Vec<(Address, U256)>,
    pub contracts: Vec<Address>,
}

impl Missing {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.contracts.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Done(MachineResult),
    Suspended { missing: Missing, needs: NeedSet },
}

#[derive(Clone, Debug, Default)]
pub struct Machine {
    config: MachineConfig,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Runs one pass of `request` over `view`.
    pub fn evaluate<V: StateView>(
        &self,
        request: &GatewayRequest,
        view: &V,
    ) -> Result<Outcome, MachineError> {
        let actions = request.actions()?;
        let mut exec = Execution {
            config: &self.config,
            view,
            outputs: vec![Value::default(); usize::from(request.output_count())],
            needs: NeedSet::new(),
            read_bytes: 0,
            missing_contracts: Vec::new(),
            steps: 0,
        };
        let mut frame = Frame::default();
        match exec.run(&mut frame, &actions, request.inputs(), 0) {
            Ok(exit_code) => Ok(Outcome::Done(MachineResult {
                outputs: exec.outputs,
                exit_code,
                needs: exec.needs,
            })),
            Err(Halt::Suspend) => Ok(Outcome::Suspended {
                missing: exec.missing(),
                needs: exec.needs,
            }),
            Err(Halt::Fault(e)) => Err(e),
        }
    }
}

enum Halt {
    Suspend,
    Fault(MachineError),
}

impl From<MachineError> for Halt {
    fn from(e: MachineError) -> Self {
        Halt::Fault(e)
    }
}

impl From<DecodeError> for Halt {
    fn from(e: DecodeError) -> Self {
        Halt::Fault(e.into())
    }
}

#[derive(Clone, Debug, Default)]
struct Frame {
    target: Address,
    slot: U256,
    stack: Vec<Value>,
}

impl Frame {
    fn pop(&mut self) -> Result<Value, MachineError> {
        self.stack.pop().ok_or(MachineError::StackUnderflow)
    }

    /// Position of the value `back` entries below the top.
    fn back_index(&self, back: U256) -> Result<usize, MachineError> {
        let size = self.stack.len();
        usize::try_from(back)
            .ok()
            .filter(|back| *back < size)
            .map(|back| size - 1 - back)
            .ok_or(MachineError::StackIndex { index: back, size })
    }
}

struct Execution<'a, V> {
    config: &'a MachineConfig,
    view: &'a V,
    outputs: Vec<Value>,
    needs: NeedSet,
    read_bytes: usize,
    missing_contracts: Vec<Address>,
    steps: usize,
}

impl<'a, V: StateView> Execution<'a, V> {
    fn missing(&self) -> Missing {
        let mut missing = Missing {
            slots: Vec::new(),
            contracts: self.missing_contracts.clone(),
        };
        for need in &self.needs {
            if let Some(slot) = need.slot {
                let key = (need.target, slot);
                if self.view.storage(need.target, slot).is_none() && !missing.slots.contains(&key)
                {
                    missing.slots.push(key);
                }
            }
        }
        missing
    }

    fn push(&self, frame: &mut Frame, value: Value) -> Result<(), MachineError> {
        if frame.stack.len() >= self.config.max_stack {
            return Err(MachineError::StackOverflow);
        }
        self.check_size(value.len())?;
        frame.stack.push(value);
        Ok(())
    }

    fn check_size(&self, size: usize) -> Result<(), MachineError> {
        let max = self.config.max_value_bytes;
        if size > max {
            return Err(MachineError::ValueTooLarge { size, max });
        }
        Ok(())
    }

    fn push_word(&self, frame: &mut Frame, x: U256) -> Result<(), MachineError> {
        self.push(frame, Value::Ready(value::word(x)))
    }

    fn force(&self, value: &Value) -> Result<Bytes, Halt> {
        value.materialize(self.view).ok_or(Halt::Suspend)
    }

    fn pop_bytes(&self, frame: &mut Frame) -> Result<Bytes, Halt> {
        let value = frame.pop()?;
        self.force(&value)
    }

    fn pop_uint(&self, frame: &mut Frame) -> Result<U256, Halt> {
        Ok(value::uint(&self.pop_bytes(frame)?))
    }

    fn storage(&self, target: Address, slot: U256) -> Result<U256, Halt> {
        self.view.storage(target, slot).ok_or(Halt::Suspend)
    }

    fn is_contract(&mut self, target: Address) -> Result<bool, Halt> {
        self.ensure_account(target)?;
        match self.view.is_contract(target) {
            Some(is_contract) => Ok(is_contract),
            None => {
                if !self.missing_contracts.contains(&target) {
                    self.missing_contracts.push(target);
                }
                Err(Halt::Suspend)
            }
        }
    }

    fn need_account(&mut self, target: Address) -> Result<(), MachineError> {
        self.needs.push(Need::account(target));
        let targets = self.needs.unique_targets();
        if targets > self.config.max_targets {
            return Err(MachineError::TooManyTargets(targets));
        }
        Ok(())
    }

    /// Storage proofs are verified against the account, so a target's
    /// account need always precedes its first storage need.
    fn ensure_account(&mut self, target: Address) -> Result<(), MachineError> {
        if !self.needs.has_target(&target) {
            self.need_account(target)?;
        }
        Ok(())
    }

    fn need_storage(&mut self, target: Address, slot: U256) -> Result<(), MachineError> {
        self.ensure_account(target)?;
        self.needs.push(Need::storage(target, slot));
        let proofs = self.needs.unique_storage();
        if proofs > self.config.max_unique_proofs {
            return Err(MachineError::TooManyProofs(proofs));
        }
        Ok(())
    }

    fn need_run(&mut self, target: Address, run: SlotRun) -> Result<(), MachineError> {
        for slot in run.slots() {
            self.need_storage(target, slot)?;
        }
        Ok(())
    }

    fn charge_words(&mut self, words: usize) -> Result<(), MachineError> {
        let total = words
            .saturating_mul(WORD)
            .saturating_add(self.read_bytes);
        if total > self.config.max_read_bytes {
            return Err(MachineError::TooManyBytes(total));
        }
        self.read_bytes = total;
        Ok(())
    }

    fn run(
        &mut self,
        frame: &mut Frame,
        actions: &[Action],
        inputs: &[Bytes],
        depth: usize,
    ) -> Result<u8, Halt> {
        if depth > MAX_EVAL_DEPTH {
            return Err(MachineError::DepthLimit.into());
        }
        for action in actions {
            self.steps += 1;
            if self.steps > MAX_STEPS {
                return Err(MachineError::StepLimit.into());
            }
            if let Some(exit_code) = self.step(frame, action, inputs, depth)? {
                return Ok(exit_code);
            }
        }
        Ok(0)
    }

    /// Executes one instruction. Returns an exit code when the current
    /// program must stop.
    fn step(
        &mut self,
        frame: &mut Frame,
        action: &Action,
        inputs: &[Bytes],
        depth: usize,
    ) -> Result<Option<u8>, Halt> {
        match &action.instruction {
            Instruction::Push { value, .. } => self.push_word(frame, *value)?,
            Instruction::PushByte(x) => self.push_word(frame, U256::from(*x))?,
            Instruction::PushBytes(bytes) => self.push(frame, Value::Ready(bytes.clone()))?,
            Instruction::PushInput(index) => {
                let input = inputs
                    .get(usize::from(*index))
                    .ok_or(DecodeError::InputIndex {
                        pos: action.pos,
                        index: *index,
                        inputs: inputs.len(),
                    })?;
                self.push(frame, Value::Ready(input.clone()))?;
            }
            Instruction::PushOutput(index) => {
                let output = self.output(*index)?.clone();
                self.push(frame, output)?;
            }
            Instruction::PushSlot => {
                let slot = frame.slot;
                self.push_word(frame, slot)?;
            }
            Instruction::PushTarget => {
                let target = U256::from_be_slice(frame.target.as_slice());
                self.push_word(frame, target)?;
            }
            Instruction::PushStack => {
                let index = self.pop_uint(frame)?;
                let value = usize::try_from(index)
                    .ok()
                    .and_then(|i| frame.stack.get(i))
                    .cloned()
                    .ok_or(MachineError::StackIndex {
                        index,
                        size: frame.stack.len(),
                    })?;
                self.push(frame, value)?;
            }
            Instruction::StackSize => {
                let size = U256::from(frame.stack.len());
                self.push_word(frame, size)?;
            }
            Instruction::SetTarget => {
                let bytes = self.pop_bytes(frame)?;
                let x = value::uint(&bytes);
                if bytes.len() > WORD || x.bit_len() > 160 {
                    return Err(MachineError::InvalidAddress(bytes).into());
                }
                frame.target = Address::from_slice(&x.to_be_bytes::<32>()[12..]);
                frame.slot = U256::ZERO;
                self.need_account(frame.target)?;
            }
            Instruction::SetOutput(index) => {
                let value = frame.pop()?;
                *self.output_mut(*index)? = value;
            }
            Instruction::EvalLoop { flags, back } => {
                self.eval_loop(frame, *flags, *back, depth)?;
            }
            Instruction::EvalInline => {
                let program = self.pop_program(frame)?;
                let actions = program.parse(0)?;
                let exit_code = self.run(frame, &actions, program.inputs(), depth + 1)?;
                if exit_code != 0 {
                    return Ok(Some(exit_code));
                }
            }
            Instruction::RequireNonzero(back) => {
                let index = frame.back_index(U256::from(*back))?;
                let bytes = self.force(&frame.stack[index])?;
                if value::is_zero(&bytes) {
                    return Ok(Some(REQUIRE_FAILED));
                }
            }
            Instruction::RequireContract => {
                if !self.is_contract(frame.target)? {
                    return Ok(Some(REQUIRE_FAILED));
                }
            }
            Instruction::IsContract => {
                let is_contract = self.is_contract(frame.target)?;
                self.push_word(frame, U256::from(is_contract as u8))?;
            }
            Instruction::ReadSlots(count) => self.read_slots(frame, usize::from(*count))?,
            Instruction::ReadBytes => self.read_bytes(frame)?,
            Instruction::ReadArray(step) => self.read_array(frame, *step)?,
            Instruction::ReadHashedBytes => self.read_hashed_bytes(frame)?,
            Instruction::SlotZero => frame.slot = U256::ZERO,
            Instruction::SlotAdd => {
                let n = self.pop_uint(frame)?;
                frame.slot = frame.slot.wrapping_add(n);
            }
            Instruction::SlotFollow => {
                let key = self.pop_bytes(frame)?;
                frame.slot = follow(&key, frame.slot);
            }
            Instruction::SetSlot => frame.slot = self.pop_uint(frame)?,
            Instruction::Dup => {
                let back = self.pop_uint(frame)?;
                let index = frame.back_index(back)?;
                let value = frame.stack[index].clone();
                self.push(frame, value)?;
            }
            Instruction::Pop => {
                frame.pop()?;
            }
            Instruction::Swap => {
                let back = self.pop_uint(frame)?;
                let index = frame.back_index(back)?;
                let top = frame.stack.len() - 1;
                frame.stack.swap(index, top);
            }
            Instruction::Keccak => {
                let bytes = self.pop_bytes(frame)?;
                let hash = keccak256(&bytes);
                self.push(frame, Value::Ready(Bytes::copy_from_slice(hash.as_slice())))?;
            }
            Instruction::Concat(count) => {
                let count = usize::from(*count);
                if count > frame.stack.len() {
                    return Err(MachineError::StackUnderflow.into());
                }
                let size = frame.stack[frame.stack.len() - count..]
                    .iter()
                    .fold(0usize, |size, value| size.saturating_add(value.len()));
                self.check_size(size)?;
                let values = frame.stack.split_off(frame.stack.len() - count);
                let mut out = Vec::with_capacity(size);
                for value in &values {
                    out.extend_from_slice(&self.force(value)?);
                }
                self.push(frame, Value::Ready(out.into()))?;
            }
            Instruction::Slice { offset, length } => {
                self.check_size(usize::from(*length))?;
                let bytes = self.pop_bytes(frame)?;
                let (offset, length) = (usize::from(*offset), usize::from(*length));
                let mut out = vec![0u8; length];
                if offset < bytes.len() {
                    let end = bytes.len().min(offset + length);
                    out[..end - offset].copy_from_slice(&bytes[offset..end]);
                }
                self.push(frame, Value::Ready(out.into()))?;
            }
            Instruction::Length => {
                let value = frame.pop()?;
                self.push_word(frame, U256::from(value.len()))?;
            }
            Instruction::Plus => self.binary(frame, |a, b| a.wrapping_add(b))?,
            Instruction::Times => self.binary(frame, |a, b| a.wrapping_mul(b))?,
            Instruction::Divide => self.binary(frame, |a, b| a.checked_div(b).unwrap_or_default())?,
            Instruction::Mod => self.binary(frame, |a, b| a.checked_rem(b).unwrap_or_default())?,
            Instruction::Subtract => self.binary(frame, |a, b| a.wrapping_sub(b))?,
            Instruction::And => self.binary(frame, |a, b| a & b)?,
            Instruction::Or => self.binary(frame, |a, b| a | b)?,
            Instruction::Xor => self.binary(frame, |a, b| a ^ b)?,
            Instruction::Not => {
                let a = self.pop_uint(frame)?;
                self.push_word(frame, !a)?;
            }
            Instruction::ShiftLeft(bits) => {
                let a = self.pop_uint(frame)?;
                self.push_word(frame, a << usize::from(*bits))?;
            }
            Instruction::ShiftRight(bits) => {
                let a = self.pop_uint(frame)?;
                self.push_word(frame, a >> usize::from(*bits))?;
            }
            Instruction::IsZero => {
                let bytes = self.pop_bytes(frame)?;
                self.push_word(frame, U256::from(value::is_zero(&bytes) as u8))?;
            }
            Instruction::Eq => self.binary(frame, |a, b| U256::from((a == b) as u8))?,
            Instruction::Lt => self.binary(frame, |a, b| U256::from((a < b) as u8))?,
            Instruction::Gt => self.binary(frame, |a, b| U256::from((a > b) as u8))?,
        }
        Ok(None)
    }

    fn output(&self, index: u8) -> Result<&Value, MachineError> {
        let outputs = self.outputs.len();
        self.outputs
            .get(usize::from(index))
            .ok_or(MachineError::OutputIndex { index, outputs })
    }

    fn output_mut(&mut self, index: u8) -> Result<&mut Value, MachineError> {
        let outputs = self.outputs.len();
        self.outputs
            .get_mut(usize::from(index))
            .ok_or(MachineError::OutputIndex { index, outputs })
    }

    /// Pops `b` then `a` and pushes `f(a, b)`.
    fn binary(&self, frame: &mut Frame, f: impl FnOnce(U256, U256) -> U256) -> Result<(), Halt> {
        let b = self.pop_uint(frame)?;
        let a = self.pop_uint(frame)?;
        self.push_word(frame, f(a, b))?;
        Ok(())
    }

    fn pop_program(&self, frame: &mut Frame) -> Result<GatewayProgram, Halt> {
        let bytes = self.pop_bytes(frame)?;
        Ok(GatewayProgram::decode_unchecked(&bytes)?)
    }

    fn read_slots(&mut self, frame: &mut Frame, count: usize) -> Result<(), Halt> {
        if count == 0 {
            return Ok(self.push(frame, Value::default())?);
        }
        self.charge_words(count)?;
        let run = SlotRun {
            start: frame.slot,
            count,
        };
        self.need_run(frame.target, run)?;
        let target = frame.target;
        self.push(
            frame,
            Value::Deferred(Deferred {
                target,
                runs: vec![run],
                len: count * WORD,
            }),
        )?;
        Ok(())
    }

    /// Solidity `bytes`/`string` storage layout: values shorter than 32 bytes
    /// live in the header slot with `2 * len` in the low byte, longer values
    /// store `2 * len + 1` and start at `keccak(slot)`.
    fn read_bytes(&mut self, frame: &mut Frame) -> Result<(), Halt> {
        self.charge_words(1)?;
        self.need_storage(frame.target, frame.slot)?;
        let header = self.storage(frame.target, frame.slot)?;
        if !header.bit(0) {
            let len = usize::from(header.as_limbs()[0] as u8 >> 1);
            if len >= WORD {
                return Err(MachineError::InvalidBytesHeader(header).into());
            }
            let bytes = Bytes::copy_from_slice(&header.to_be_bytes::<32>()[..len]);
            self.push(frame, Value::Ready(bytes))?;
            return Ok(());
        }
        let len = usize::try_from(header >> 1).unwrap_or(usize::MAX);
        let words = len.div_ceil(WORD);
        self.charge_words(words)?;
        let run = SlotRun {
            start: data_slot(frame.slot),
            count: words,
        };
        self.need_run(frame.target, run)?;
        let target = frame.target;
        self.push(
            frame,
            Value::Deferred(Deferred {
                target,
                runs: vec![run],
                len,
            }),
        )?;
        Ok(())
    }

    /// Pushes the length word followed by the packed element words. Elements
    /// narrower than a word are packed `32 / step` to a word; wider elements
    /// take `ceil(step / 32)` words each.
    fn read_array(&mut self, frame: &mut Frame, step: u8) -> Result<(), Halt> {
        if step == 0 {
            return Err(MachineError::InvalidArrayStep.into());
        }
        self.charge_words(1)?;
        self.need_storage(frame.target, frame.slot)?;
        let len = self.storage(frame.target, frame.slot)?;
        let step = usize::from(step);
        let words = if step < WORD {
            let per = U256::from(WORD / step);
            let rem = len % per;
            len / per + U256::from(!rem.is_zero() as u8)
        } else {
            len.saturating_mul(U256::from(step.div_ceil(WORD)))
        };
        let words = usize::try_from(words).unwrap_or(usize::MAX);
        self.charge_words(words)?;
        let head = SlotRun {
            start: frame.slot,
            count: 1,
        };
        let data = SlotRun {
            start: data_slot(frame.slot),
            count: words,
        };
        self.need_run(frame.target, data)?;
        let target = frame.target;
        self.push(
            frame,
            Value::Deferred(Deferred {
                target,
                runs: vec![head, data],
                len: (words + 1) * WORD,
            }),
        )?;
        Ok(())
    }

    /// Pops a preimage and checks it against the hash stored at the slot.
    fn read_hashed_bytes(&mut self, frame: &mut Frame) -> Result<(), Halt> {
        let preimage = self.pop_bytes(frame)?;
        self.charge_words(1)?;
        self.need_storage(frame.target, frame.slot)?;
        let hash = self.storage(frame.target, frame.slot)?;
        if U256::from_be_slice(keccak256(&preimage).as_slice()) != hash {
            return Err(MachineError::HashMismatch {
                target: frame.target,
                slot: frame.slot,
            }
            .into());
        }
        self.push(frame, Value::Ready(preimage))?;
        Ok(())
    }

    fn eval_loop(
        &mut self,
        frame: &mut Frame,
        flags: LoopFlags,
        back: u8,
        depth: usize,
    ) -> Result<(), Halt> {
        let program = self.pop_program(frame)?;
        let count = self.pop_uint(frame)?;
        let count = usize::try_from(count)
            .ok()
            .filter(|count| *count <= frame.stack.len())
            .ok_or(MachineError::LoopCount(count))?;
        let items = frame.stack.split_off(frame.stack.len() - count);
        let back = usize::from(back);
        if back > frame.stack.len() {
            return Err(MachineError::StackUnderflow.into());
        }
        let shared = frame.stack[frame.stack.len() - back..].to_vec();
        let actions = program.parse(0)?;
        for item in items.into_iter().rev() {
            let mut inner = Frame {
                target: frame.target,
                slot: frame.slot,
                stack: shared.clone(),
            };
            self.push(&mut inner, item)?;
            let exit_code = self.run(&mut inner, &actions, program.inputs(), depth + 1)?;
            let stop = if exit_code == 0 {
                flags.contains(LoopFlags::STOP_ON_SUCCESS)
            } else {
                flags.contains(LoopFlags::STOP_ON_FAILURE)
            };
            if stop {
                if flags.contains(LoopFlags::ACQUIRE_STATE) {
                    frame.target = inner.target;
                    frame.slot = inner.slot;
                    for value in inner.stack {
                        self.push(frame, value)?;
                    }
                }
                break;
            }
        }
        Ok(())
    }
}

/// Mapping slot derivation: `keccak(key ++ slot)`.
pub fn follow(key: &[u8], slot: U256) -> U256 {
    let mut buf = Vec::with_capacity(key.len() + WORD);
    buf.extend_from_slice(key);
    buf.extend_from_slice(&slot.to_be_bytes::<32>());
    U256::from_be_slice(keccak256(buf).as_slice())
}

/// First data word of a dynamic value stored at `slot`.
pub fn data_slot(slot: U256) -> U256 {
    U256::from_be_slice(keccak256(slot.to_be_bytes::<32>()).as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Op;
    use crate::state::Snapshot;

    fn done(outcome: Outcome) -> MachineResult {
        match outcome {
            Outcome::Done(result) => result,
            Outcome::Suspended { missing, .. } => panic!("suspended on {missing:?}"),
        }
    }

    fn outputs(result: &MachineResult) -> Vec<Bytes> {
        result
            .outputs
            .iter()
            .map(|v| v.materialize(&Snapshot::default()).unwrap())
            .collect()
    }

    fn eval(req: &GatewayRequest) -> MachineResult {
        done(Machine::default().evaluate(req, &Snapshot::default()).unwrap())
    }

    #[test]
    fn arithmetic() {
        let mut req = GatewayRequest::new(0);
        req.push_u64(7).push_u64(2).subtract().add_output();
        req.push_u64(2).push_u64(7).subtract().add_output();
        req.push_u64(7).push_u64(0).divide().add_output();
        req.push_u64(7).push_u64(0).modulo().add_output();
        req.push_u64(1).shl(255).push_u64(2).times().add_output();
        req.push_u64(0).not().shr(248).add_output();
        let result = eval(&req);
        let out = outputs(&result);
        assert_eq!(value::uint(&out[0]), U256::from(5));
        assert_eq!(value::uint(&out[1]), U256::MAX - U256::from(4));
        assert_eq!(value::uint(&out[2]), U256::ZERO);
        assert_eq!(value::uint(&out[3]), U256::ZERO);
        assert_eq!(value::uint(&out[4]), U256::ZERO);
        assert_eq!(value::uint(&out[5]), U256::from(0xff));
    }

    #[test]
    fn bytes_ops() {
        let mut req = GatewayRequest::new(0);
        req.push_str("abc").push_str("de").concat(2).add_output();
        req.push_str("hello").slice(3, 4).add_output();
        req.push_str("hello").length().add_output();
        req.push_bytes([]).keccak().add_output();
        let out = outputs(&eval(&req));
        assert_eq!(&out[0][..], b"abcde");
        assert_eq!(&out[1][..], b"lo\0\0");
        assert_eq!(value::uint(&out[2]), U256::from(5));
        assert_eq!(&out[3][..], keccak256([]).as_slice());
    }

    #[test]
    fn require_nonzero_stops_with_exit_code() {
        let mut req = GatewayRequest::new(1);
        req.push_u64(0).require_nonzero(0).push_u64(1).set_output(0);
        let result = eval(&req);
        assert_eq!(result.exit_code, REQUIRE_FAILED);
        assert!(result.outputs[0].is_empty());
    }

    #[test]
    fn suspends_on_forced_read() {
        let target = Address::repeat_byte(0xaa);
        let mut req = GatewayRequest::new(0);
        req.set_target(target)
            .read()
            .add_output()
            .set_slot(U256::from(1))
            .read()
            .set_slot(U256::ZERO)
            .follow()
            .read()
            .add_output();

        let mut view = Snapshot::default();
        let machine = Machine::default();
        let Outcome::Suspended { missing, needs } = machine.evaluate(&req, &view).unwrap() else {
            panic!("expected suspension");
        };
        assert_eq!(
            missing.slots,
            vec![(target, U256::ZERO), (target, U256::from(1))]
        );
        assert_eq!(needs.len(), 3);

        view.insert_storage(target, U256::from(1), U256::from(9));
        let result = done(machine.evaluate(&req, &view).unwrap());
        let key = follow(&value::word(U256::from(9)), U256::ZERO);
        assert_eq!(
            result.outputs[1].slots(),
            vec![(target, key)]
        );
        assert!(result.outputs[0].materialize(&view).is_none());
    }

    #[test]
    fn eval_loop_stops_on_first_success() {
        // Keep the first non-zero item.
        let mut body = GatewayProgram::new();
        body.require_nonzero(0).set_output(0);
        let mut req = GatewayRequest::new(1);
        req.push_u64(3)
            .push_u64(0)
            .push_u64(2)
            .push_u64(0)
            .push_u64(4)
            .push_program(&body)
            .eval_loop(LoopFlags::STOP_ON_SUCCESS, 0);
        let result = eval(&req);
        assert_eq!(result.exit_code, 0);
        assert_eq!(value::uint(&outputs(&result)[0]), U256::from(2));
    }

    #[test]
    fn eval_loop_acquires_state() {
        let target = Address::repeat_byte(7);
        let mut body = GatewayProgram::new();
        body.target().push_u64(5).slot().push_u64(1);
        let mut req = GatewayRequest::new(2);
        req.push_address(target)
            .push_u64(1)
            .push_program(&body)
            .eval_loop(LoopFlags::STOP_ON_SUCCESS | LoopFlags::ACQUIRE_STATE, 0)
            .push_target()
            .set_output(0)
            .push_slot()
            .set_output(1);
        let result = eval(&req);
        let out = outputs(&result);
        assert_eq!(&out[0][12..], target.as_slice());
        assert_eq!(value::uint(&out[1]), U256::from(5));
    }

    #[test]
    fn eval_inline_runs_in_place() {
        let mut body = GatewayProgram::new();
        body.push_u64(2).times();
        let mut req = GatewayRequest::new(0);
        req.push_u64(21).push_program(&body).eval_inline().add_output();
        assert_eq!(value::uint(&outputs(&eval(&req))[0]), U256::from(42));
    }

    #[test]
    fn self_evaluation_is_bounded() {
        let mut body = GatewayProgram::new();
        body.dup(0).eval_inline();
        let mut req = GatewayRequest::new(0);
        req.push_program(&body).dup(0).eval_inline();
        assert_eq!(
            Machine::default().evaluate(&req, &Snapshot::default()),
            Err(MachineError::DepthLimit)
        );
    }

    #[test]
    fn rejects_wide_address() {
        let mut req = GatewayRequest::new(0);
        req.push(U256::from(1) << 160usize).target();
        assert!(matches!(
            Machine::default().evaluate(&req, &Snapshot::default()),
            Err(MachineError::InvalidAddress(_))
        ));
    }

    #[test]
    fn eval_loop_stops_on_first_failure() {
        let mut body = GatewayProgram::new();
        body.require_nonzero(0).set_output(0);
        let mut req = GatewayRequest::new(1);
        // Visited top first: 7, 5, then 0 stops the loop before 9.
        req.push_u64(9)
            .push_u64(0)
            .push_u64(5)
            .push_u64(7)
            .push_u64(4)
            .push_program(&body)
            .eval_loop(LoopFlags::STOP_ON_FAILURE, 0);
        let result = eval(&req);
        assert_eq!(result.exit_code, 0);
        assert_eq!(value::uint(&outputs(&result)[0]), U256::from(5));
    }

    #[test]
    fn eval_loop_without_stop_flags_visits_everything() {
        // Sums the non-zero items and moves the slot, which must not leak out.
        let mut body = GatewayProgram::new();
        body.set_slot(U256::from(9))
            .require_nonzero(0)
            .push_output(0)
            .plus()
            .set_output(0);
        let mut req = GatewayRequest::new(3);
        req.push_u64(42)
            .push_u64(1)
            .push_u64(0)
            .push_u64(2)
            .push_u64(4)
            .push_u64(4)
            .push_program(&body)
            .eval_loop(LoopFlags::empty(), 0)
            .push_slot()
            .set_output(1)
            .stack_size()
            .set_output(2);
        let result = eval(&req);
        assert_eq!(result.exit_code, 0);
        let out = outputs(&result);
        assert_eq!(value::uint(&out[0]), U256::from(7));
        assert_eq!(value::uint(&out[1]), U256::ZERO);
        assert_eq!(value::uint(&out[2]), U256::from(1));
    }

    #[test]
    fn eval_loop_copies_shared_values_into_each_iteration() {
        // Each iteration consumes its copy of the shared value.
        let mut body = GatewayProgram::new();
        body.plus().push_output(0).plus().set_output(0);
        let mut req = GatewayRequest::new(2);
        req.push_u64(100)
            .push_u64(1)
            .push_u64(2)
            .push_u64(2)
            .push_program(&body)
            .eval_loop(LoopFlags::empty(), 1)
            .stack_size()
            .set_output(1);
        let out = outputs(&eval(&req));
        assert_eq!(value::uint(&out[0]), U256::from(203));
        assert_eq!(value::uint(&out[1]), U256::from(1));
    }

    #[test]
    fn read_hashed_bytes_checks_the_stored_hash() {
        let target = Address::repeat_byte(0x33);
        let slot = U256::from(3);
        let mut view = Snapshot::default();
        view.insert_storage(target, slot, U256::from_be_slice(keccak256(b"hello").as_slice()));

        let mut req = GatewayRequest::new(0);
        req.set_target(target)
            .set_slot(slot)
            .push_str("hello")
            .read_hashed_bytes()
            .add_output();
        let result = done(Machine::default().evaluate(&req, &view).unwrap());
        assert_eq!(&result.outputs[0].materialize(&view).unwrap()[..], b"hello");
        assert_eq!(
            result.needs.as_slice(),
            &[Need::account(target), Need::storage(target, slot)]
        );

        let mut req = GatewayRequest::new(0);
        req.set_target(target)
            .set_slot(slot)
            .push_str("world")
            .read_hashed_bytes()
            .add_output();
        assert_eq!(
            Machine::default().evaluate(&req, &view),
            Err(MachineError::HashMismatch { target, slot })
        );
    }

    #[test]
    fn swap_and_xor() {
        let mut req = GatewayRequest::new(0);
        req.push_u64(1)
            .push_u64(2)
            .push_u64(3)
            .swap(2)
            .add_output()
            .add_output()
            .add_output();
        req.push_u64(0b1100).push_u64(0b1010).xor().add_output();
        let out = outputs(&eval(&req));
        let words: Vec<U256> = out.iter().map(|x| value::uint(x)).collect();
        assert_eq!(
            words,
            [1u64, 2, 3, 0b0110].map(U256::from).to_vec()
        );
    }

    #[test]
    #[allow(deprecated)]
    fn zero_slot_resets_the_slot() {
        let mut req = GatewayRequest::new(0);
        req.set_slot(U256::from(9))
            .zero_slot()
            .push_slot()
            .add_output();
        assert_eq!(value::uint(&outputs(&eval(&req))[0]), U256::ZERO);
    }

    #[test]
    fn push_output_keeps_deferred_reads() {
        let target = Address::repeat_byte(0x44);
        let slot = U256::from(5);
        let mut req = GatewayRequest::new(0);
        req.set_target(target).set_slot(slot).read().add_output();
        req.push_output(0).add_output();
        req.push_output(0).push_u64(1).plus().add_output();

        let mut view = Snapshot::default();
        view.insert_storage(target, slot, U256::from(41));
        let result = done(Machine::default().evaluate(&req, &view).unwrap());
        assert_eq!(result.outputs[1], result.outputs[0]);
        assert_eq!(result.outputs[1].slots(), vec![(target, slot)]);
        let sum = result.outputs[2].materialize(&view).unwrap();
        assert_eq!(value::uint(&sum), U256::from(42));

        let mut req = GatewayRequest::new(1);
        req.push_output(7);
        assert_eq!(
            Machine::default().evaluate(&req, &view),
            Err(MachineError::OutputIndex {
                index: 7,
                outputs: 1
            })
        );
    }

    #[test]
    fn malformed_inline_program_is_a_decode_error() {
        let mut body = GatewayProgram::new();
        body.op(Op::PushBytes);
        let mut req = GatewayRequest::new(0);
        req.push_program(&body).eval_inline();
        // The nested program is opaque bytes until it runs.
        assert!(GatewayRequest::decode(&req.encode()).is_ok());
        assert!(matches!(
            Machine::default().evaluate(&req, &Snapshot::default()),
            Err(MachineError::Decode(DecodeError::Truncated {
                op: Op::PushBytes,
                ..
            }))
        ));

        let mut req = GatewayRequest::new(0);
        req.push_bytes([1, 2, 3]).eval_inline();
        assert!(matches!(
            Machine::default().evaluate(&req, &Snapshot::default()),
            Err(MachineError::Decode(DecodeError::Abi(_)))
        ));
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: MachineConfig = serde_json::from_str(r#"{"max_stack": 8}"#).unwrap();
        assert_eq!(
            config,
            MachineConfig {
                max_stack: 8,
                ..Default::default()
            }
        );
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<MachineConfig>(&json).unwrap(), config);
    }
}
