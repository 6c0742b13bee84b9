pub mod cli;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use clap::ValueEnum;
use futures::future::{try_join, try_join_all};
use futures::{StreamExt, TryStreamExt};
use gateway_vm::{
    GatewayRequest, Machine, MachineConfig, MachineResult, Missing, Need, NeedSet, Outcome,
    Snapshot, Value,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::accessor::{AccountProof, StateAccessor, StorageProof};
use crate::cache::{KeyedCache, Ttl};
use crate::error::GatewayError;

/// Proof indices in `order` are single bytes.
pub const MAX_PROOFS: usize = 256;

/// How [`Prover::evaluate`] reads the state it suspends on.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Plain storage and code reads. A later `prove` still has to fetch a
    /// proof for every slot that was read.
    #[default]
    Values,
    /// Reads are served from `get_proofs` batches, so a later `prove` of the
    /// same needs fetches nothing. Values then live as long as their proofs
    /// and `storage_ttl_ms` does not apply.
    Proofs,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ProverConfig {
    pub limits: MachineConfig,
    pub read_mode: ReadMode,
    /// Slots requested per `get_proofs` call.
    pub proof_batch_size: usize,
    /// Targets (or slots, while evaluating) fetched concurrently.
    pub fetch_concurrency: usize,
    /// Entries kept per prover in each of the contract, storage value,
    /// account proof and storage proof caches.
    pub proof_cache_size: usize,
    /// Lifetime of cached storage values. `None` keeps them for the lifetime
    /// of the prover, which is only correct for finalized state.
    pub storage_ttl_ms: Option<u64>,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            limits: MachineConfig::default(),
            read_mode: ReadMode::Values,
            proof_batch_size: 32,
            fetch_concurrency: 16,
            proof_cache_size: 10_000,
            storage_ttl_ms: None,
        }
    }
}

impl ProverConfig {
    pub fn storage_ttl(&self) -> Ttl {
        self.storage_ttl_ms.map(Duration::from_millis).into()
    }
}

/// Deduplicated proofs plus, for every need in evaluation order, the index of
/// the proof that backs it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProofSequence {
    pub proofs: Vec<Bytes>,
    pub order: Bytes,
}

/// A finished evaluation with every output materialized.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResult {
    pub values: Vec<Bytes>,
    pub exit_code: u8,
    #[serde(skip)]
    pub needs: NeedSet,
}

/// Evaluates requests and proves their needs against one [`StateAccessor`].
pub struct Prover<A> {
    accessor: Arc<A>,
    config: ProverConfig,
    contracts: KeyedCache<Address, bool>,
    slots: KeyedCache<(Address, U256), U256>,
    account_proofs: KeyedCache<Address, AccountProof>,
    storage_proofs: KeyedCache<(Address, U256), StorageProof>,
}

impl<A: StateAccessor> Prover<A> {
    pub fn new(accessor: A, config: ProverConfig) -> Self {
        let capacity = NonZeroUsize::new(config.proof_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            accessor: Arc::new(accessor),
            contracts: KeyedCache::bounded(Ttl::Infinite, capacity),
            slots: KeyedCache::bounded(config.storage_ttl(), capacity),
            account_proofs: KeyedCache::bounded(Ttl::Infinite, capacity),
            storage_proofs: KeyedCache::bounded(Ttl::Infinite, capacity),
            config,
        }
    }

    pub fn accessor(&self) -> &A {
        &self.accessor
    }

    pub fn config(&self) -> &ProverConfig {
        &self.config
    }

    pub fn state_root(&self) -> B256 {
        self.accessor.state_root()
    }

    /// Answered from a cached account proof when there is one.
    pub async fn is_contract(&self, target: Address) -> Result<bool, GatewayError> {
        if let Some(account) = self.account_proofs.peek(&target) {
            return Ok(account.is_contract);
        }
        match self.config.read_mode {
            ReadMode::Values => {
                let accessor = self.accessor.clone();
                Ok(self
                    .contracts
                    .get(target, move || async move { accessor.is_contract(target).await })
                    .await?)
            }
            ReadMode::Proofs => Ok(self.account_proof(target).await?.is_contract),
        }
    }

    /// Answered from a cached storage proof when there is one.
    pub async fn get_storage(&self, target: Address, slot: U256) -> Result<U256, GatewayError> {
        if let Some(proof) = self.storage_proofs.peek(&(target, slot)) {
            return Ok(proof.value);
        }
        match self.config.read_mode {
            ReadMode::Values => {
                let accessor = self.accessor.clone();
                Ok(self
                    .slots
                    .get((target, slot), move || async move {
                        accessor.get_storage(target, slot).await
                    })
                    .await?)
            }
            ReadMode::Proofs => self
                .storage_proofs_for(target, &[slot])
                .await?
                .pop()
                .map(|proof| proof.value)
                .ok_or(GatewayError::MissingProof(Need::storage(target, slot))),
        }
    }

    /// Runs the request to completion, fetching whatever each pass reports
    /// missing. Outputs may still be deferred; see [`resolve`](Self::resolve).
    pub async fn evaluate(&self, request: &GatewayRequest) -> Result<MachineResult, GatewayError> {
        let machine = Machine::new(self.config.limits);
        let mut snapshot = Snapshot::default();
        let mut passes = 0usize;
        loop {
            passes += 1;
            match machine.evaluate(request, &snapshot)? {
                Outcome::Done(result) => {
                    debug!(
                        passes,
                        needs = result.needs.len(),
                        exit_code = result.exit_code,
                        "evaluated request"
                    );
                    return Ok(result);
                }
                Outcome::Suspended { missing, .. } => {
                    if missing.is_empty() {
                        return Err(GatewayError::Stalled);
                    }
                    trace!(
                        slots = missing.slots.len(),
                        contracts = missing.contracts.len(),
                        "evaluation suspended"
                    );
                    self.fill(&mut snapshot, &missing).await?;
                }
            }
        }
    }

    async fn fill(&self, snapshot: &mut Snapshot, missing: &Missing) -> Result<(), GatewayError> {
        let contracts = try_join_all(missing.contracts.iter().map(|t| self.is_contract(*t)));
        let (contracts, values) = match self.config.read_mode {
            ReadMode::Values => try_join(contracts, self.read_values(&missing.slots)).await?,
            ReadMode::Proofs => {
                // Account proofs arrive with the storage batches.
                let values = self.read_proven_values(&missing.slots).await?;
                (contracts.await?, values)
            }
        };
        for (target, is_contract) in missing.contracts.iter().zip(contracts) {
            snapshot.insert_contract(*target, is_contract);
        }
        for ((target, slot), value) in missing.slots.iter().zip(values) {
            snapshot.insert_storage(*target, *slot, value);
        }
        Ok(())
    }

    async fn read_values(&self, slots: &[(Address, U256)]) -> Result<Vec<U256>, GatewayError> {
        futures::stream::iter(
            slots
                .iter()
                .copied()
                .map(|(target, slot)| self.get_storage(target, slot)),
        )
        .buffered(self.config.fetch_concurrency.max(1))
        .try_collect()
        .await
    }

    /// Reads `slots` through batched storage proofs, one batch stream per
    /// target.
    async fn read_proven_values(
        &self,
        slots: &[(Address, U256)],
    ) -> Result<Vec<U256>, GatewayError> {
        let fetched: Vec<Vec<((Address, U256), U256)>> = futures::stream::iter(
            slots
                .iter()
                .copied()
                .into_group_map()
                .into_iter()
                .map(|(target, slots)| async move {
                    let proofs = self.storage_proofs_for(target, &slots).await?;
                    Ok::<_, GatewayError>(
                        slots
                            .into_iter()
                            .zip(proofs)
                            .map(|(slot, proof)| ((target, slot), proof.value))
                            .collect::<Vec<_>>(),
                    )
                }),
        )
        .buffer_unordered(self.config.fetch_concurrency.max(1))
        .try_collect()
        .await?;
        let values: HashMap<(Address, U256), U256> = fetched.into_iter().flatten().collect();
        slots
            .iter()
            .map(|&(target, slot)| {
                values
                    .get(&(target, slot))
                    .copied()
                    .ok_or(GatewayError::MissingProof(Need::storage(target, slot)))
            })
            .collect()
    }

    /// Materializes every output of a finished evaluation.
    pub async fn resolve(&self, result: &MachineResult) -> Result<Vec<Bytes>, GatewayError> {
        let missing = Missing {
            slots: result
                .outputs
                .iter()
                .flat_map(Value::slots)
                .unique()
                .collect(),
            contracts: Vec::new(),
        };
        let mut snapshot = Snapshot::default();
        self.fill(&mut snapshot, &missing).await?;
        result
            .outputs
            .iter()
            .map(|value| value.materialize(&snapshot).ok_or(GatewayError::Stalled))
            .collect()
    }

    /// [`evaluate`](Self::evaluate) followed by [`resolve`](Self::resolve).
    pub async fn execute(&self, request: &GatewayRequest) -> Result<ResolvedResult, GatewayError> {
        let result = self.evaluate(request).await?;
        let values = self.resolve(&result).await?;
        Ok(ResolvedResult {
            values,
            exit_code: result.exit_code,
            needs: result.needs,
        })
    }

    /// Fetches one proof per distinct need and maps every need onto it.
    ///
    /// Proofs are numbered in first-seen order, so the sequence depends only
    /// on `needs`, never on which fetch finished first. Either every proof is
    /// fetched or an error is returned.
    pub async fn prove(&self, needs: &NeedSet) -> Result<ProofSequence, GatewayError> {
        let unique: Vec<Need> = needs.iter().copied().unique().collect();
        if unique.len() > MAX_PROOFS {
            return Err(GatewayError::TooManyProofs(unique.len()));
        }
        let index: HashMap<Need, u8> = unique
            .iter()
            .enumerate()
            .map(|(i, need)| (*need, i as u8))
            .collect();
        let order: Vec<u8> = needs.iter().map(|need| index[need]).collect();

        let mut slots = unique
            .iter()
            .filter_map(|need| need.slot.map(|slot| (need.target, slot)))
            .into_group_map();
        let targets: Vec<(Address, Vec<U256>)> = unique
            .iter()
            .map(|need| need.target)
            .unique()
            .map(|target| (target, slots.remove(&target).unwrap_or_default()))
            .collect();
        debug!(
            needs = needs.len(),
            proofs = unique.len(),
            targets = targets.len(),
            "proving"
        );

        let fetched: Vec<_> = futures::stream::iter(
            targets
                .into_iter()
                .map(|(target, slots)| self.prove_target(target, slots)),
        )
        .buffered(self.config.fetch_concurrency.max(1))
        .try_collect()
        .await?;

        let mut accounts = HashMap::new();
        let mut storage = HashMap::new();
        for (target, account, proofs) in fetched {
            self.contracts.set(target, account.is_contract);
            for (slot, proof) in proofs {
                self.slots.set((target, slot), proof.value);
                storage.insert((target, slot), proof.proof);
            }
            accounts.insert(target, account.proof);
        }

        let proofs = unique
            .iter()
            .map(|need| {
                let proof = match need.slot {
                    None => accounts.get(&need.target),
                    Some(slot) => storage.get(&(need.target, slot)),
                };
                proof.cloned().ok_or(GatewayError::MissingProof(*need))
            })
            .collect::<Result<_, _>>()?;
        Ok(ProofSequence {
            proofs,
            order: order.into(),
        })
    }

    async fn prove_target(
        &self,
        target: Address,
        slots: Vec<U256>,
    ) -> Result<(Address, AccountProof, Vec<(U256, StorageProof)>), GatewayError> {
        let storage = self.storage_proofs_for(target, &slots).await?;
        let account = self.account_proof(target).await?;
        trace!(%target, slots = slots.len(), "fetched proofs");
        Ok((target, account, slots.into_iter().zip(storage).collect()))
    }

    /// Storage proofs for `slots` in request order, fetched in batches of
    /// `proof_batch_size`. Every batch also refreshes the account proof.
    async fn storage_proofs_for(
        &self,
        target: Address,
        slots: &[U256],
    ) -> Result<Vec<StorageProof>, GatewayError> {
        let batches = slots
            .chunks(self.config.proof_batch_size.max(1))
            .map(|chunk| {
                let keys = chunk.iter().map(|slot| (target, *slot)).collect();
                let accessor = self.accessor.clone();
                let account_proofs = self.account_proofs.clone();
                self.storage_proofs.get_many(keys, move |keys| async move {
                    let slots = keys.into_iter().map(|(_, slot)| slot).collect();
                    let proofs = accessor.get_proofs(target, slots).await?;
                    account_proofs.set(target, proofs.account);
                    Ok(proofs.storage)
                })
            });
        Ok(try_join_all(batches).await?.into_iter().flatten().collect())
    }

    async fn account_proof(&self, target: Address) -> Result<AccountProof, GatewayError> {
        let accessor = self.accessor.clone();
        Ok(self
            .account_proofs
            .get(target, move || async move {
                Ok(accessor.get_proofs(target, Vec::new()).await?.account)
            })
            .await?)
    }
}
