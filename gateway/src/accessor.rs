//! The state capability a [`Prover`](crate::prover::Prover) is bound to.

use std::future::Future;

use alloy::primitives::{Address, Bytes, B256, U256};

/// Inclusion (or exclusion) proof of an account against a state root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountProof {
    pub is_contract: bool,
    pub proof: Bytes,
}

/// Proof of one storage slot against the account's storage root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorageProof {
    pub value: U256,
    pub proof: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccountProofs {
    pub account: AccountProof,
    /// One proof per requested slot, in request order.
    pub storage: Vec<StorageProof>,
}

/// Reads and proofs against one fixed block of one chain.
///
/// Implementations own their transport policy (timeouts, retries, batching).
/// An error returned here has already exhausted that policy.
pub trait StateAccessor: Send + Sync + 'static {
    /// Root every proof returned by this accessor verifies against.
    fn state_root(&self) -> B256;

    fn is_contract(&self, target: Address) -> impl Future<Output = anyhow::Result<bool>> + Send;

    fn get_storage(
        &self,
        target: Address,
        slot: U256,
    ) -> impl Future<Output = anyhow::Result<U256>> + Send;

    fn get_proofs(
        &self,
        target: Address,
        slots: Vec<U256>,
    ) -> impl Future<Output = anyhow::Result<AccountProofs>> + Send;
}
