//! [`StateAccessor`] over an Ethereum JSON-RPC node.

pub mod retry;

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::BlockId;
use alloy::sol_types::SolValue;
use alloy::{providers::Provider, transports::Transport};
use anyhow::{ensure, Context as _};
use gateway_common::has_code;
use tracing::trace;

use crate::accessor::{AccountProof, AccountProofs, StateAccessor, StorageProof};
use crate::provider::{BlockHeader, CachedProvider};

/// Reads and `eth_getProof` proofs pinned to a single block.
///
/// Proof blobs are the ABI encoding of the node's RLP node list (`bytes[]`).
pub struct RpcAccessor<ProviderT, TransportT> {
    provider: CachedProvider<ProviderT, TransportT>,
    block: BlockHeader,
}

impl<ProviderT, TransportT> RpcAccessor<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    pub fn new(provider: CachedProvider<ProviderT, TransportT>, block: BlockHeader) -> Self {
        Self { provider, block }
    }

    pub fn block(&self) -> &BlockHeader {
        &self.block
    }

    fn block_id(&self) -> BlockId {
        self.block.number.into()
    }
}

impl<ProviderT, TransportT> StateAccessor for RpcAccessor<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT> + 'static,
    TransportT: Transport + Clone,
{
    fn state_root(&self) -> B256 {
        self.block.state_root
    }

    async fn is_contract(&self, target: Address) -> anyhow::Result<bool> {
        let code = self
            .provider
            .get_provider()
            .await?
            .get_code_at(target)
            .block_id(self.block_id())
            .await
            .context(format!("failed to get code of {target}"))?;
        Ok(!code.is_empty())
    }

    async fn get_storage(&self, target: Address, slot: U256) -> anyhow::Result<U256> {
        Ok(self
            .provider
            .get_provider()
            .await?
            .get_storage_at(target, slot)
            .block_id(self.block_id())
            .await
            .context(format!("failed to get storage {slot:#x} of {target}"))?)
    }

    async fn get_proofs(&self, target: Address, slots: Vec<U256>) -> anyhow::Result<AccountProofs> {
        let keys = slots
            .iter()
            .map(|slot| B256::from(slot.to_be_bytes::<32>()))
            .collect();
        let proof = self
            .provider
            .get_provider()
            .await?
            .get_proof(target, keys)
            .block_id(self.block_id())
            .await
            .context(format!("failed to get proof for {target}"))?;
        ensure!(
            proof.storage_proof.len() == slots.len(),
            "node returned {} storage proofs for {} slots of {target}",
            proof.storage_proof.len(),
            slots.len()
        );
        trace!(%target, block = self.block.number, slots = slots.len(), "eth_getProof");
        Ok(AccountProofs {
            account: AccountProof {
                is_contract: has_code(proof.code_hash),
                proof: proof.account_proof.abi_encode().into(),
            },
            storage: proof
                .storage_proof
                .into_iter()
                .map(|storage| StorageProof {
                    value: storage.value,
                    proof: storage.proof.abi_encode().into(),
                })
                .collect(),
        })
    }
}
