//! A single always-current commit at the chain head, with no finality at all.
//! Only useful for debugging verifiers.

use alloy::primitives::Bytes;

use super::self_chain::{SelfCommit, SelfConfig, SelfRollup};
use super::Rollup;
use crate::provider::{BlockHeader, ChainProvider};
use crate::prover::ProofSequence;

pub struct UnfinalizedRollup<P: ChainProvider>(SelfRollup<P>);

impl<P: ChainProvider> UnfinalizedRollup<P> {
    pub fn new(provider: P, config: SelfConfig) -> Self {
        Self(SelfRollup::new(provider, config))
    }
}

impl<P: ChainProvider> Rollup for UnfinalizedRollup<P> {
    type Accessor = P::Accessor;
    type Meta = BlockHeader;

    async fn fetch_latest_commit_index(&self) -> anyhow::Result<u64> {
        self.0.fetch_latest_commit_index().await
    }

    async fn fetch_parent_commit_index(
        &self,
        _commit: &SelfCommit<P::Accessor>,
    ) -> anyhow::Result<Option<u64>> {
        Ok(None)
    }

    async fn fetch_commit(&self, index: u64) -> anyhow::Result<SelfCommit<P::Accessor>> {
        self.0.fetch_commit(index).await
    }

    fn encode_witness(&self, commit: &SelfCommit<P::Accessor>, proofs: &ProofSequence) -> Bytes {
        self.0.encode_witness(commit, proofs)
    }

    fn is_earliest(&self, _commit: &SelfCommit<P::Accessor>) -> bool {
        true
    }

    fn window_from_sec(&self, _sec: u64) -> u64 {
        0
    }
}
