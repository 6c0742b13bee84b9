//! Stack values and their deferred storage-backed form.

use alloy::primitives::{Address, Bytes, U256};
use gateway_common::WORD_SIZE;

use crate::state::StateView;

/// A run of consecutive storage words.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotRun {
    pub start: U256,
    pub count: usize,
}

impl SlotRun {
    pub fn slots(&self) -> impl Iterator<Item = U256> + '_ {
        (0..self.count).map(|i| self.start.wrapping_add(U256::from(i)))
    }
}

/// Bytes that are known by location but not yet by content.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Deferred {
    pub target: Address,
    pub runs: Vec<SlotRun>,
    /// Byte length after concatenating every run.
    pub len: usize,
}

impl Deferred {
    pub fn slots(&self) -> impl Iterator<Item = U256> + '_ {
        self.runs.iter().flat_map(SlotRun::slots)
    }

    pub fn materialize(&self, view: &impl StateView) -> Option<Bytes> {
        let mut out = Vec::with_capacity(self.runs.iter().map(|r| r.count).sum::<usize>() * WORD_SIZE);
        for slot in self.slots() {
            let value = view.storage(self.target, slot)?;
            out.extend_from_slice(&value.to_be_bytes::<32>());
        }
        out.truncate(self.len);
        Some(out.into())
    }
}

/// A value on the machine stack or in an output register.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value {
    Ready(Bytes),
    Deferred(Deferred),
}

impl Default for Value {
    fn default() -> Self {
        Value::Ready(Bytes::new())
    }
}

impl Value {
    pub fn len(&self) -> usize {
        match self {
            Value::Ready(bytes) => bytes.len(),
            Value::Deferred(deferred) => deferred.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the bytes, or `None` while any backing slot is unknown to
    /// `view`.
    pub fn materialize(&self, view: &impl StateView) -> Option<Bytes> {
        match self {
            Value::Ready(bytes) => Some(bytes.clone()),
            Value::Deferred(deferred) => deferred.materialize(view),
        }
    }

    /// `(target, slot)` keys that must be known before materializing.
    pub fn slots(&self) -> Vec<(Address, U256)> {
        match self {
            Value::Ready(_) => Vec::new(),
            Value::Deferred(deferred) => deferred
                .slots()
                .map(|slot| (deferred.target, slot))
                .collect(),
        }
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Ready(bytes)
    }
}

/// A 32-byte big-endian word.
pub fn word(x: U256) -> Bytes {
    x.to_be_bytes::<32>().to_vec().into()
}

/// Interprets bytes as a big-endian integer, keeping the low 256 bits.
pub fn uint(bytes: &[u8]) -> U256 {
    U256::from_be_slice(&bytes[bytes.len().saturating_sub(WORD_SIZE)..])
}

pub fn is_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Snapshot;

    #[test]
    fn uint_keeps_low_bits() {
        let mut long = vec![0xffu8; 8];
        long.extend_from_slice(&word(U256::from(7)));
        assert_eq!(uint(&long), U256::from(7));
        assert_eq!(uint(&[]), U256::ZERO);
        assert_eq!(uint(&[1, 0]), U256::from(256));
    }

    #[test]
    fn deferred_waits_for_every_slot() {
        let target = Address::repeat_byte(1);
        let value = Value::Deferred(Deferred {
            target,
            runs: vec![SlotRun {
                start: U256::from(3),
                count: 2,
            }],
            len: 40,
        });
        let mut view = Snapshot::default();
        view.insert_storage(target, U256::from(3), U256::from(1));
        assert_eq!(value.materialize(&view), None);
        assert_eq!(value.len(), 40);

        view.insert_storage(target, U256::from(4), U256::MAX);
        let bytes = value.materialize(&view).unwrap();
        assert_eq!(bytes.len(), 40);
        assert_eq!(bytes[31], 1);
        assert!(bytes[32..].iter().all(|b| *b == 0xff));
    }
}
