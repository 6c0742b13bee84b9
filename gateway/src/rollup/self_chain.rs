//! Proving against the chain the verifier itself lives on.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::witness::IndexedWitness;
use super::{Commit, Rollup};
use crate::cache::{KeyedCache, Ttl, ValueCache};
use crate::provider::{BlockHeader, ChainProvider};
use crate::prover::{ProofSequence, Prover, ProverConfig};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SelfConfig {
    /// Commits are only taken at block numbers divisible by `step`, so
    /// concurrent callers land on the same commit and share its caches.
    pub step: u64,
    pub block_time_sec: u64,
    /// How long the latest block number is reused.
    pub latest_ttl_ms: u64,
    /// Commits (and their provers) kept alive.
    pub commit_cache_size: usize,
    pub prover: ProverConfig,
}

impl Default for SelfConfig {
    fn default() -> Self {
        Self {
            step: 1,
            block_time_sec: 12,
            latest_ttl_ms: 1_000,
            commit_cache_size: 8,
            prover: ProverConfig::default(),
        }
    }
}

pub type SelfCommit<A> = Commit<A, BlockHeader>;

pub struct SelfRollup<P: ChainProvider> {
    provider: Arc<P>,
    config: SelfConfig,
    latest: ValueCache<u64>,
    commits: KeyedCache<u64, SelfCommit<P::Accessor>>,
}

impl<P: ChainProvider> SelfRollup<P> {
    pub fn new(provider: P, config: SelfConfig) -> Self {
        let capacity = NonZeroUsize::new(config.commit_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            provider: Arc::new(provider),
            latest: ValueCache::new(Duration::from_millis(config.latest_ttl_ms)),
            commits: KeyedCache::bounded(Ttl::Infinite, capacity),
            config,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> &SelfConfig {
        &self.config
    }

    /// Rounds `index` down to a multiple of the configured step.
    pub fn align(&self, index: u64) -> u64 {
        let step = self.config.step.max(1);
        index - index % step
    }
}

impl<P: ChainProvider> Rollup for SelfRollup<P> {
    type Accessor = P::Accessor;
    type Meta = BlockHeader;

    async fn fetch_latest_commit_index(&self) -> anyhow::Result<u64> {
        let provider = self.provider.clone();
        let latest = self
            .latest
            .get(move || async move { provider.latest_block_number().await })
            .await?;
        Ok(self.align(latest))
    }

    async fn fetch_parent_commit_index(
        &self,
        commit: &SelfCommit<P::Accessor>,
    ) -> anyhow::Result<Option<u64>> {
        Ok(commit.index.checked_sub(1).map(|index| self.align(index)))
    }

    async fn fetch_commit(&self, index: u64) -> anyhow::Result<SelfCommit<P::Accessor>> {
        let provider = self.provider.clone();
        let config = self.config.prover.clone();
        let commit = self
            .commits
            .get(index, move || async move {
                let header = provider.block_header(index).await?;
                debug!(index, state_root = %header.state_root, "new commit");
                Ok(Commit {
                    index,
                    state_root: header.state_root,
                    prover: Arc::new(Prover::new(provider.accessor(&header), config)),
                    meta: header,
                })
            })
            .await?;
        Ok(commit)
    }

    fn encode_witness(&self, commit: &SelfCommit<P::Accessor>, proofs: &ProofSequence) -> Bytes {
        IndexedWitness::encode(commit.index, proofs)
    }

    fn window_from_sec(&self, sec: u64) -> u64 {
        sec.div_ceil(self.config.block_time_sec.max(1))
    }
}
