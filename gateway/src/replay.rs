//! Re-executes a request against a [`ProofSequence`] instead of live state,
//! the way an on-chain verifier does.

use std::collections::HashMap;

use alloy::primitives::{Address, Bytes, B256, U256};
use gateway_common::EMPTY_TRIE_HASH;
use gateway_vm::{GatewayRequest, Machine, MachineConfig, MachineError, Need, Outcome, Snapshot};
use thiserror::Error;

use crate::prover::ProofSequence;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VerifiedAccount {
    pub is_contract: bool,
    pub storage_root: B256,
}

impl VerifiedAccount {
    /// An account absent from the state trie.
    pub const EMPTY: Self = Self {
        is_contract: false,
        storage_root: EMPTY_TRIE_HASH,
    };
}

/// Checks proof blobs against their roots.
pub trait ProofVerifier {
    fn verify_account(
        &self,
        state_root: B256,
        target: Address,
        proof: &[u8],
    ) -> anyhow::Result<VerifiedAccount>;

    fn verify_storage(&self, storage_root: B256, slot: U256, proof: &[u8]) -> anyhow::Result<U256>;
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error("order has {order} entries for {needs} needs")]
    OrderLength { order: usize, needs: usize },

    #[error("order entry {position} references proof {index} of {count}")]
    ProofIndex {
        position: usize,
        index: usize,
        count: usize,
    },

    #[error("storage of {0} read before its account was proven")]
    MissingAccount(Address),

    #[error("invalid proof for {need}")]
    Verify {
        need: Need,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("replay suspended without new needs")]
    Stalled,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Replayed {
    pub outputs: Vec<Bytes>,
    pub exit_code: u8,
}

/// Runs `request` using only the state proven by `sequence`.
///
/// Every need is checked against `order` in the order the machine records
/// it, so a sequence built from a different need order is rejected even if
/// it contains the right proofs.
pub fn replay(
    verifier: &impl ProofVerifier,
    state_root: B256,
    request: &GatewayRequest,
    sequence: &ProofSequence,
    config: MachineConfig,
) -> Result<Replayed, ReplayError> {
    let machine = Machine::new(config);
    let mut snapshot = Snapshot::default();
    let mut storage_roots: HashMap<Address, B256> = HashMap::new();
    let mut verified = 0;
    loop {
        let (needs, done) = match machine.evaluate(request, &snapshot)? {
            Outcome::Done(result) => (result.needs.clone(), Some(result)),
            Outcome::Suspended { needs, .. } => (needs, None),
        };
        if needs.len() > sequence.order.len() {
            return Err(ReplayError::OrderLength {
                order: sequence.order.len(),
                needs: needs.len(),
            });
        }
        let progress = needs.len() > verified;
        for (position, need) in needs.iter().enumerate().skip(verified) {
            let index = usize::from(sequence.order[position]);
            let proof = sequence.proofs.get(index).ok_or(ReplayError::ProofIndex {
                position,
                index,
                count: sequence.proofs.len(),
            })?;
            let verify_error = |source: anyhow::Error| ReplayError::Verify {
                need: *need,
                source: source.into(),
            };
            match need.slot {
                None => {
                    let account = verifier
                        .verify_account(state_root, need.target, proof)
                        .map_err(verify_error)?;
                    storage_roots.insert(need.target, account.storage_root);
                    snapshot.insert_contract(need.target, account.is_contract);
                }
                Some(slot) => {
                    let root = *storage_roots
                        .get(&need.target)
                        .ok_or(ReplayError::MissingAccount(need.target))?;
                    let value = verifier
                        .verify_storage(root, slot, proof)
                        .map_err(verify_error)?;
                    snapshot.insert_storage(need.target, slot, value);
                }
            }
        }
        verified = needs.len();

        if let Some(result) = done {
            if sequence.order.len() != needs.len() {
                return Err(ReplayError::OrderLength {
                    order: sequence.order.len(),
                    needs: needs.len(),
                });
            }
            let outputs = result
                .outputs
                .iter()
                .map(|value| value.materialize(&snapshot).ok_or(ReplayError::Stalled))
                .collect::<Result<_, _>>()?;
            return Ok(Replayed {
                outputs,
                exit_code: result.exit_code,
            });
        }
        if !progress {
            return Err(ReplayError::Stalled);
        }
    }
}
