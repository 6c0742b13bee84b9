//! Commits attested by a trusted signer instead of any on-chain finality.
//!
//! The latest state root is signed and reused for `ttl_sec`; after that a new
//! commit is signed. Commit indices are the signing timestamps and strictly
//! increase between signings.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::primitives::{keccak256, Address, Bytes, B256};
use alloy::signers::{local::PrivateKeySigner, SignerSync};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::witness::SignedWitness;
use super::{Commit, Rollup};
use crate::cache::{KeyedCache, Ttl, ValueCache};
use crate::provider::{BlockHeader, ChainProvider};
use crate::prover::{ProofSequence, Prover, ProverConfig};

/// Recently signed commits kept for lookup by index.
const RECENT_COMMITS: usize = 16;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct TrustedConfig {
    /// How long a signed commit stays the latest.
    pub ttl_sec: u64,
    pub prover: ProverConfig,
}

impl Default for TrustedConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 60,
            prover: ProverConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrustedMeta {
    pub signed_at: u64,
    pub signature: Bytes,
    pub block: BlockHeader,
}

pub type TrustedCommit<A> = Commit<A, TrustedMeta>;

/// The digest a trusted signer signs:
/// `keccak256(0x1900 ++ address(0) ++ uint64 signedAt ++ bytes32 stateRoot)`.
pub fn signed_digest(signed_at: u64, state_root: B256) -> B256 {
    let mut message = Vec::with_capacity(2 + 20 + 8 + 32);
    message.extend_from_slice(&[0x19, 0x00]);
    message.extend_from_slice(Address::ZERO.as_slice());
    message.extend_from_slice(&signed_at.to_be_bytes());
    message.extend_from_slice(state_root.as_slice());
    keccak256(message)
}

struct Signing<P> {
    provider: Arc<P>,
    signer: PrivateKeySigner,
    prover: ProverConfig,
    last_index: AtomicU64,
}

impl<P: ChainProvider> Signing<P> {
    async fn sign_latest(&self) -> anyhow::Result<TrustedCommit<P::Accessor>> {
        let number = self.provider.latest_block_number().await?;
        let block = self.provider.block_header(number).await?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let last = self.last_index.load(Ordering::Acquire);
        let signed_at = now.max(last.saturating_add(1));
        self.last_index.fetch_max(signed_at, Ordering::AcqRel);

        let signature = self
            .signer
            .sign_hash_sync(&signed_digest(signed_at, block.state_root))
            .context("failed to sign state root")?;
        info!(
            signed_at,
            block = block.number,
            state_root = %block.state_root,
            signer = %self.signer.address(),
            "signed commit"
        );
        Ok(Commit {
            index: signed_at,
            state_root: block.state_root,
            prover: Arc::new(Prover::new(
                self.provider.accessor(&block),
                self.prover.clone(),
            )),
            meta: TrustedMeta {
                signed_at,
                signature: Bytes::copy_from_slice(&signature.as_bytes()),
                block,
            },
        })
    }
}

pub struct TrustedRollup<P: ChainProvider> {
    signing: Arc<Signing<P>>,
    latest: ValueCache<TrustedCommit<P::Accessor>>,
    recent: KeyedCache<u64, TrustedCommit<P::Accessor>>,
}

impl<P: ChainProvider> TrustedRollup<P> {
    pub fn new(provider: P, signer: PrivateKeySigner, config: TrustedConfig) -> Self {
        Self {
            signing: Arc::new(Signing {
                provider: Arc::new(provider),
                signer,
                prover: config.prover,
                last_index: AtomicU64::new(0),
            }),
            latest: ValueCache::new(Duration::from_secs(config.ttl_sec)),
            recent: KeyedCache::bounded(
                Ttl::Infinite,
                NonZeroUsize::new(RECENT_COMMITS).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    pub fn signer_address(&self) -> Address {
        self.signing.signer.address()
    }
}

impl<P: ChainProvider> Rollup for TrustedRollup<P> {
    type Accessor = P::Accessor;
    type Meta = TrustedMeta;

    async fn fetch_latest_commit_index(&self) -> anyhow::Result<u64> {
        let signing = self.signing.clone();
        let recent = self.recent.clone();
        let commit = self
            .latest
            .get(move || async move {
                let commit = signing.sign_latest().await?;
                recent.set(commit.index, commit.clone());
                Ok(commit)
            })
            .await?;
        Ok(commit.index)
    }

    async fn fetch_parent_commit_index(
        &self,
        _commit: &TrustedCommit<P::Accessor>,
    ) -> anyhow::Result<Option<u64>> {
        Ok(None)
    }

    async fn fetch_commit(&self, index: u64) -> anyhow::Result<TrustedCommit<P::Accessor>> {
        self.recent
            .peek(&index)
            .with_context(|| format!("commit {index} was never signed or has expired"))
    }

    fn encode_witness(
        &self,
        commit: &TrustedCommit<P::Accessor>,
        proofs: &ProofSequence,
    ) -> Bytes {
        SignedWitness::encode(
            &commit.meta.signature,
            commit.meta.signed_at,
            commit.state_root,
            proofs,
        )
    }

    /// Only the latest signing is ever offered.
    fn is_earliest(&self, _commit: &TrustedCommit<P::Accessor>) -> bool {
        true
    }

    fn window_from_sec(&self, sec: u64) -> u64 {
        sec
    }
}
