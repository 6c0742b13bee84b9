#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use alloy::primitives::{keccak256, Address, Bytes, U256};
use gateway_vm::{
    GatewayRequest, Machine, MachineConfig, MachineError, MachineResult, Outcome, StateView,
};

/// Fully known state: anything not written reads as zero.
#[derive(Clone, Debug, Default)]
pub struct World {
    storage: HashMap<(Address, U256), U256>,
    contracts: HashSet<Address>,
}

impl World {
    pub fn set(&mut self, target: Address, slot: U256, value: U256) -> &mut Self {
        self.contracts.insert(target);
        self.storage.insert((target, slot), value);
        self
    }

    /// Stores `value` with Solidity's `bytes`/`string` layout.
    pub fn set_bytes(&mut self, target: Address, slot: U256, value: &[u8]) -> &mut Self {
        if value.len() < 32 {
            let mut word = [0u8; 32];
            word[..value.len()].copy_from_slice(value);
            word[31] = (value.len() * 2) as u8;
            return self.set(target, slot, U256::from_be_bytes(word));
        }
        self.set(target, slot, U256::from(value.len() * 2 + 1));
        let start = U256::from_be_bytes(keccak256(slot.to_be_bytes::<32>()).0);
        for (i, chunk) in value.chunks(32).enumerate() {
            let mut word = [0u8; 32];
            word[..chunk.len()].copy_from_slice(chunk);
            self.set(target, start + U256::from(i), U256::from_be_bytes(word));
        }
        self
    }

    pub fn deploy(&mut self, target: Address) -> &mut Self {
        self.contracts.insert(target);
        self
    }
}

impl StateView for World {
    fn storage(&self, target: Address, slot: U256) -> Option<U256> {
        Some(self.storage.get(&(target, slot)).copied().unwrap_or_default())
    }

    fn is_contract(&self, target: Address) -> Option<bool> {
        Some(self.contracts.contains(&target))
    }
}

pub fn evaluate_with(
    config: MachineConfig,
    req: &GatewayRequest,
    world: &World,
) -> Result<MachineResult, MachineError> {
    match Machine::new(config).evaluate(req, world)? {
        Outcome::Done(result) => Ok(result),
        Outcome::Suspended { missing, .. } => panic!("a full world never suspends: {missing:?}"),
    }
}

pub fn evaluate(req: &GatewayRequest, world: &World) -> Result<MachineResult, MachineError> {
    evaluate_with(MachineConfig::default(), req, world)
}

/// Outputs with every deferred read materialized.
pub fn outputs(result: &MachineResult, world: &World) -> Vec<Bytes> {
    result
        .outputs
        .iter()
        .map(|v| v.materialize(world).unwrap())
        .collect()
}
