use std::collections::HashSet;
use std::fmt;

use alloy::primitives::{Address, U256};

/// A location that must be backed by a proof.
///
/// Without a slot the need is for the account itself.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Need {
    pub target: Address,
    pub slot: Option<U256>,
}

impl Need {
    pub fn account(target: Address) -> Self {
        Self { target, slot: None }
    }

    pub fn storage(target: Address, slot: U256) -> Self {
        Self {
            target,
            slot: Some(slot),
        }
    }
}

impl fmt::Display for Need {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            Some(slot) => write!(f, "{}[{slot:#x}]", self.target),
            None => write!(f, "{}", self.target),
        }
    }
}

/// Every need recorded during evaluation, in the order the verifier replays
/// them.
///
/// Repeated needs keep their position; uniqueness is tracked alongside so
/// the machine can enforce its limits as needs arrive.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NeedSet {
    needs: Vec<Need>,
    unique: HashSet<Need>,
    targets: HashSet<Address>,
    unique_storage: usize,
}

impl NeedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an occurrence of `need`. Returns true if it was not seen
    /// before.
    pub fn push(&mut self, need: Need) -> bool {
        self.needs.push(need);
        self.targets.insert(need.target);
        let fresh = self.unique.insert(need);
        if fresh && need.slot.is_some() {
            self.unique_storage += 1;
        }
        fresh
    }

    pub fn contains(&self, need: &Need) -> bool {
        self.unique.contains(need)
    }

    pub fn has_target(&self, target: &Address) -> bool {
        self.targets.contains(target)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Need> {
        self.needs.iter()
    }

    pub fn as_slice(&self) -> &[Need] {
        &self.needs
    }

    pub fn len(&self) -> usize {
        self.needs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.needs.is_empty()
    }

    pub fn unique_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn unique_storage(&self) -> usize {
        self.unique_storage
    }
}

impl<'a> IntoIterator for &'a NeedSet {
    type Item = &'a Need;
    type IntoIter = std::slice::Iter<'a, Need>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<Need> for NeedSet {
    fn from_iter<I: IntoIterator<Item = Need>>(iter: I) -> Self {
        let mut set = Self::new();
        for need in iter {
            set.push(need);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_occurrences_and_counts_unique() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let needs: NeedSet = [
            Need::account(a),
            Need::storage(a, U256::from(1)),
            Need::storage(a, U256::from(1)),
            Need::account(b),
            Need::storage(b, U256::from(1)),
        ]
        .into_iter()
        .collect();
        assert_eq!(needs.len(), 5);
        assert_eq!(needs.unique_targets(), 2);
        assert_eq!(needs.unique_storage(), 2);
        assert!(needs.contains(&Need::storage(b, U256::from(1))));
        assert!(!needs.contains(&Need::storage(b, U256::from(2))));
    }
}
