//! Commits: a provable block of some chain, bound to a [`Prover`] for it.
//!
//! Each chain family implements [`Rollup`] with four lookups (latest index,
//! parent index, commit by index, witness encoding). Walking commits,
//! staleness windows and proving a request are shared provided methods.

pub mod self_chain;
pub mod trusted;
pub mod unfinalized;
pub mod witness;

use std::future::Future;
use std::sync::Arc;

use alloy::primitives::{Bytes, B256};
use gateway_vm::GatewayRequest;
use thiserror::Error;
use tracing::{debug, info};

use crate::accessor::StateAccessor;
use crate::error::GatewayError;
use crate::prover::{ProofSequence, Prover};

pub use self_chain::{SelfConfig, SelfRollup};
pub use trusted::{TrustedConfig, TrustedMeta, TrustedRollup};
pub use unfinalized::UnfinalizedRollup;

/// Staleness callers accept when they do not say otherwise: one day.
pub const DEFAULT_WINDOW_SEC: u64 = 86_400;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A provable point of a chain.
pub struct Commit<A, M> {
    pub index: u64,
    pub state_root: B256,
    pub prover: Arc<Prover<A>>,
    /// Chain-family data the witness needs besides the proofs.
    pub meta: M,
}

impl<A, M: Clone> Clone for Commit<A, M> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            state_root: self.state_root,
            prover: self.prover.clone(),
            meta: self.meta.clone(),
        }
    }
}

impl<A, M: std::fmt::Debug> std::fmt::Debug for Commit<A, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commit")
            .field("index", &self.index)
            .field("state_root", &self.state_root)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("no earlier commit available for index {0}")]
    NoEarlierCommit(u64),

    #[error("no parent found for non-genesis commit {0}")]
    MissingParent(u64),

    #[error("parent index {parent} is not below commit index {index}")]
    InvalidParent { index: u64, parent: u64 },

    #[error("failed to find parent of commit {index}")]
    Adapter {
        index: u64,
        #[source]
        source: BoxError,
    },

    #[error("failed to fetch commit {index}")]
    Fetch {
        index: u64,
        #[source]
        source: BoxError,
    },

    #[error("failed to fetch latest commit")]
    Latest(#[source] BoxError),
}

pub type RollupCommit<R> = Commit<<R as Rollup>::Accessor, <R as Rollup>::Meta>;

pub trait Rollup: Send + Sync {
    type Accessor: StateAccessor;
    type Meta: Clone + Send + Sync + 'static;

    fn fetch_latest_commit_index(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    /// Index of the commit before `commit`, or `None` if there is none.
    fn fetch_parent_commit_index(
        &self,
        commit: &Commit<Self::Accessor, Self::Meta>,
    ) -> impl Future<Output = anyhow::Result<Option<u64>>> + Send;

    fn fetch_commit(
        &self,
        index: u64,
    ) -> impl Future<Output = anyhow::Result<Commit<Self::Accessor, Self::Meta>>> + Send;

    /// Packs a proof sequence the way this family's verifier decodes it.
    fn encode_witness(
        &self,
        commit: &Commit<Self::Accessor, Self::Meta>,
        proofs: &ProofSequence,
    ) -> Bytes;

    /// Converts a staleness in seconds to this family's finality unit.
    fn window_from_sec(&self, sec: u64) -> u64;

    /// Whether `commit` is the first this adapter can reach, so a missing
    /// parent is expected rather than an adapter bug.
    fn is_earliest(&self, commit: &Commit<Self::Accessor, Self::Meta>) -> bool {
        commit.index == 0
    }

    fn default_window(&self) -> u64 {
        self.window_from_sec(DEFAULT_WINDOW_SEC)
    }

    fn fetch_latest_commit(
        &self,
    ) -> impl Future<Output = Result<Commit<Self::Accessor, Self::Meta>, RollupError>> + Send {
        async move {
            let index = self
                .fetch_latest_commit_index()
                .await
                .map_err(|e| RollupError::Latest(e.into()))?;
            self.fetch_commit(index)
                .await
                .map_err(|e| RollupError::Fetch {
                    index,
                    source: e.into(),
                })
        }
    }

    fn fetch_parent_commit(
        &self,
        commit: &Commit<Self::Accessor, Self::Meta>,
    ) -> impl Future<Output = Result<Commit<Self::Accessor, Self::Meta>, RollupError>> + Send {
        async move {
            let index = commit.index;
            let parent = match self.fetch_parent_commit_index(commit).await {
                Ok(Some(parent)) if parent < index => parent,
                Ok(Some(parent)) => return Err(RollupError::InvalidParent { index, parent }),
                Ok(None) if self.is_earliest(commit) => {
                    return Err(RollupError::NoEarlierCommit(index))
                }
                Ok(None) => return Err(RollupError::MissingParent(index)),
                Err(e) => {
                    return Err(RollupError::Adapter {
                        index,
                        source: e.into(),
                    })
                }
            };
            self.fetch_commit(parent)
                .await
                .map_err(|e| RollupError::Fetch {
                    index: parent,
                    source: e.into(),
                })
        }
    }

    /// Up to `count` commits from the latest backwards. Reaching the earliest
    /// commit ends the walk early.
    fn fetch_recent_commits(
        &self,
        count: usize,
    ) -> impl Future<Output = Result<Vec<Commit<Self::Accessor, Self::Meta>>, RollupError>> + Send
    {
        async move {
            let mut commits = Vec::with_capacity(count);
            if count == 0 {
                return Ok(commits);
            }
            let mut commit = self.fetch_latest_commit().await?;
            while commits.len() + 1 < count {
                match self.fetch_parent_commit(&commit).await {
                    Ok(parent) => commits.push(std::mem::replace(&mut commit, parent)),
                    Err(RollupError::NoEarlierCommit(index)) => {
                        debug!(index, "reached earliest commit");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            commits.push(commit);
            Ok(commits)
        }
    }

    /// Evaluates `request` at `commit`, proves its needs and returns the
    /// encoded witness.
    fn prove_request(
        &self,
        commit: &Commit<Self::Accessor, Self::Meta>,
        request: &GatewayRequest,
    ) -> impl Future<Output = Result<Bytes, GatewayError>> + Send {
        async move {
            let result = commit.prover.evaluate(request).await?;
            let proofs = commit.prover.prove(&result.needs).await?;
            info!(
                commit = commit.index,
                exit_code = result.exit_code,
                proofs = proofs.proofs.len(),
                "proved request"
            );
            Ok(self.encode_witness(commit, &proofs))
        }
    }
}
