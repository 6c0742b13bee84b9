//! Read-only views of chain state used by the machine.

use std::collections::HashMap;

use alloy::primitives::{Address, U256};

/// A synchronous snapshot of whatever state is currently known.
///
/// `None` means "not known yet", never "absent": an unset slot is
/// `Some(U256::ZERO)` and a missing account is `Some(false)`.
pub trait StateView {
    fn storage(&self, target: Address, slot: U256) -> Option<U256>;

    fn is_contract(&self, target: Address) -> Option<bool>;
}

impl<T: StateView + ?Sized> StateView for &T {
    fn storage(&self, target: Address, slot: U256) -> Option<U256> {
        (**self).storage(target, slot)
    }

    fn is_contract(&self, target: Address) -> Option<bool> {
        (**self).is_contract(target)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    storage: HashMap<(Address, U256), U256>,
    contracts: HashMap<Address, bool>,
}

impl Snapshot {
    pub fn insert_storage(&mut self, target: Address, slot: U256, value: U256) {
        self.storage.insert((target, slot), value);
    }

    pub fn insert_contract(&mut self, target: Address, is_contract: bool) {
        self.contracts.insert(target, is_contract);
    }

    pub fn len(&self) -> usize {
        self.storage.len() + self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateView for Snapshot {
    fn storage(&self, target: Address, slot: U256) -> Option<U256> {
        self.storage.get(&(target, slot)).copied()
    }

    fn is_contract(&self, target: Address) -> Option<bool> {
        self.contracts.get(&target).copied()
    }
}
