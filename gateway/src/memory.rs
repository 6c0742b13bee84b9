//! An in-memory chain with self-describing proofs.
//!
//! Proof blobs here are not Merkle proofs: each one is the ABI encoding of
//! the root it claims to verify against plus the proven fact. That is enough
//! to exercise proof ordering, deduplication and replay without a trie.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::sol_types::SolValue;
use anyhow::{bail, ensure, Context as _};
use gateway_common::EMPTY_TRIE_HASH;
use parking_lot::{Mutex, RwLock};

use crate::accessor::{AccountProof, AccountProofs, StateAccessor, StorageProof};
use crate::provider::{BlockHeader, ChainProvider};
use crate::replay::{ProofVerifier, VerifiedAccount};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
struct Account {
    is_contract: bool,
    storage: BTreeMap<U256, U256>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryState {
    accounts: BTreeMap<Address, Account>,
}

impl MemoryState {
    pub fn deploy(&mut self, target: Address) -> &mut Self {
        self.accounts.entry(target).or_default().is_contract = true;
        self
    }

    /// Writes one slot, deploying `target` if needed. Writing zero clears it.
    pub fn set_storage(&mut self, target: Address, slot: U256, value: U256) -> &mut Self {
        let account = self.accounts.entry(target).or_default();
        account.is_contract = true;
        if value.is_zero() {
            account.storage.remove(&slot);
        } else {
            account.storage.insert(slot, value);
        }
        self
    }

    /// Stores `value` at `slot` with Solidity's `bytes`/`string` layout.
    pub fn set_bytes(&mut self, target: Address, slot: U256, value: &[u8]) -> &mut Self {
        if value.len() < 32 {
            let mut word = [0u8; 32];
            word[..value.len()].copy_from_slice(value);
            word[31] = (value.len() * 2) as u8;
            return self.set_storage(target, slot, U256::from_be_bytes(word));
        }
        self.set_storage(target, slot, U256::from(value.len() * 2 + 1));
        let start = gateway_vm::machine::data_slot(slot);
        for (i, chunk) in value.chunks(32).enumerate() {
            let mut word = [0u8; 32];
            word[..chunk.len()].copy_from_slice(chunk);
            self.set_storage(target, start + U256::from(i), U256::from_be_bytes(word));
        }
        self
    }

    pub fn is_contract(&self, target: Address) -> bool {
        self.accounts.get(&target).is_some_and(|a| a.is_contract)
    }

    pub fn storage(&self, target: Address, slot: U256) -> U256 {
        self.accounts
            .get(&target)
            .and_then(|a| a.storage.get(&slot).copied())
            .unwrap_or_default()
    }

    pub fn storage_root(&self, target: Address) -> B256 {
        match self.accounts.get(&target) {
            Some(account) if !account.storage.is_empty() => {
                let entries: Vec<(U256, U256)> =
                    account.storage.iter().map(|(k, v)| (*k, *v)).collect();
                keccak256(entries.abi_encode())
            }
            _ => EMPTY_TRIE_HASH,
        }
    }

    pub fn state_root(&self) -> B256 {
        let accounts: Vec<(Address, bool, B256)> = self
            .accounts
            .iter()
            .map(|(target, account)| (*target, account.is_contract, self.storage_root(*target)))
            .collect();
        keccak256(accounts.abi_encode())
    }

    fn account_proof(&self, state_root: B256, target: Address) -> AccountProof {
        let is_contract = self.is_contract(target);
        AccountProof {
            is_contract,
            proof: (state_root, target, is_contract, self.storage_root(target))
                .abi_encode_params()
                .into(),
        }
    }

    fn storage_proof(&self, target: Address, slot: U256) -> StorageProof {
        let value = self.storage(target, slot);
        StorageProof {
            value,
            proof: (self.storage_root(target), slot, value)
                .abi_encode_params()
                .into(),
        }
    }
}

/// Fetches served by a [`MemoryAccessor`], by kind.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FetchCounts {
    pub contracts: usize,
    pub storage: usize,
    pub proofs: usize,
}

#[derive(Debug, Default)]
struct Counters {
    contracts: AtomicUsize,
    storage: AtomicUsize,
    proofs: AtomicUsize,
}

/// [`StateAccessor`] over a [`MemoryState`] that counts every fetch.
#[derive(Debug)]
pub struct MemoryAccessor {
    state: Arc<MemoryState>,
    state_root: B256,
    counters: Counters,
    failing: Mutex<HashSet<Address>>,
}

impl MemoryAccessor {
    pub fn new(state: Arc<MemoryState>) -> Self {
        Self {
            state_root: state.state_root(),
            state,
            counters: Counters::default(),
            failing: Mutex::default(),
        }
    }

    pub fn state(&self) -> &MemoryState {
        &self.state
    }

    pub fn counts(&self) -> FetchCounts {
        FetchCounts {
            contracts: self.counters.contracts.load(Ordering::Relaxed),
            storage: self.counters.storage.load(Ordering::Relaxed),
            proofs: self.counters.proofs.load(Ordering::Relaxed),
        }
    }

    /// Makes every later fetch touching `target` fail.
    pub fn fail_on(&self, target: Address) {
        self.failing.lock().insert(target);
    }

    fn check(&self, target: Address) -> anyhow::Result<()> {
        if self.failing.lock().contains(&target) {
            bail!("{target} is unavailable");
        }
        Ok(())
    }
}

impl StateAccessor for MemoryAccessor {
    fn state_root(&self) -> B256 {
        self.state_root
    }

    async fn is_contract(&self, target: Address) -> anyhow::Result<bool> {
        self.counters.contracts.fetch_add(1, Ordering::Relaxed);
        self.check(target)?;
        Ok(self.state.is_contract(target))
    }

    async fn get_storage(&self, target: Address, slot: U256) -> anyhow::Result<U256> {
        self.counters.storage.fetch_add(1, Ordering::Relaxed);
        self.check(target)?;
        Ok(self.state.storage(target, slot))
    }

    async fn get_proofs(&self, target: Address, slots: Vec<U256>) -> anyhow::Result<AccountProofs> {
        self.counters.proofs.fetch_add(1, Ordering::Relaxed);
        self.check(target)?;
        tokio::task::yield_now().await;
        Ok(AccountProofs {
            account: self.state.account_proof(self.state_root, target),
            storage: slots
                .into_iter()
                .map(|slot| self.state.storage_proof(target, slot))
                .collect(),
        })
    }
}

/// Verifies the blobs produced by [`MemoryAccessor`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryProofVerifier;

impl ProofVerifier for MemoryProofVerifier {
    fn verify_account(
        &self,
        state_root: B256,
        target: Address,
        proof: &[u8],
    ) -> anyhow::Result<VerifiedAccount> {
        let (root, proven, is_contract, storage_root) =
            <(B256, Address, bool, B256)>::abi_decode_params(proof, true)
                .context("malformed account proof")?;
        ensure!(root == state_root, "account proof is for root {root}");
        ensure!(proven == target, "account proof is for {proven}");
        Ok(VerifiedAccount {
            is_contract,
            storage_root,
        })
    }

    fn verify_storage(&self, storage_root: B256, slot: U256, proof: &[u8]) -> anyhow::Result<U256> {
        let (root, proven, value) = <(B256, U256, U256)>::abi_decode_params(proof, true)
            .context("malformed storage proof")?;
        ensure!(root == storage_root, "storage proof is for root {root}");
        ensure!(proven == slot, "storage proof is for slot {proven:#x}");
        Ok(value)
    }
}

/// A chain of [`MemoryState`] blocks, `block_time` seconds apart.
#[derive(Debug)]
pub struct MemoryChain {
    block_time: u64,
    blocks: RwLock<Vec<(BlockHeader, Arc<MemoryState>)>>,
}

impl MemoryChain {
    pub fn new(block_time: u64) -> Self {
        Self {
            block_time,
            blocks: RwLock::default(),
        }
    }

    /// Appends a block holding `state` and returns its number.
    pub fn push_block(&self, state: MemoryState) -> u64 {
        let mut blocks = self.blocks.write();
        let number = blocks.len() as u64;
        let state_root = state.state_root();
        let header = BlockHeader {
            number,
            hash: keccak256((U256::from(number), state_root).abi_encode_params()),
            state_root,
            timestamp: number * self.block_time,
        };
        blocks.push((header, Arc::new(state)));
        number
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self, number: u64) -> Option<Arc<MemoryState>> {
        let blocks = self.blocks.read();
        let (_, state) = blocks.get(usize::try_from(number).ok()?)?;
        Some(state.clone())
    }
}

impl ChainProvider for MemoryChain {
    type Accessor = MemoryAccessor;

    async fn latest_block_number(&self) -> anyhow::Result<u64> {
        let len = self.len() as u64;
        len.checked_sub(1).context("chain has no blocks")
    }

    async fn block_header(&self, number: u64) -> anyhow::Result<BlockHeader> {
        self.blocks
            .read()
            .get(usize::try_from(number)?)
            .map(|(header, _)| *header)
            .with_context(|| format!("target block {number} does not exist"))
    }

    fn accessor(&self, header: &BlockHeader) -> Self::Accessor {
        let state = self.state(header.number).unwrap_or_default();
        MemoryAccessor::new(state)
    }
}
