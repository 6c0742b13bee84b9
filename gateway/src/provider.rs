use std::future::Future;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::Arc;

use alloy::primitives::B256;
use alloy::rpc::types::{BlockId, BlockNumberOrTag, BlockTransactionsKind};
use alloy::{providers::Provider, transports::Transport};
use anyhow::Context;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tracing::trace;

use crate::accessor::StateAccessor;
use crate::rpc::RpcAccessor;

const CACHE_SIZE: usize = 1024;
pub const MAX_NUMBER_OF_PARALLEL_REQUESTS: usize = 128;

/// The parts of a block header a commit is built from.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub state_root: B256,
    pub timestamp: u64,
}

/// A chain that can hand out a [`StateAccessor`] pinned to any of its blocks.
pub trait ChainProvider: Send + Sync + 'static {
    type Accessor: StateAccessor;

    fn latest_block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    fn block_header(
        &self,
        number: u64,
    ) -> impl Future<Output = anyhow::Result<BlockHeader>> + Send;

    fn accessor(&self, header: &BlockHeader) -> Self::Accessor;
}

/// Wrapper around alloy provider to cache block headers and bound the number
/// of requests in flight.
pub struct CachedProvider<ProviderT, TransportT> {
    provider: Arc<ProviderT>,
    // `Alloy` provider is using `Reqwest` http client under the hood. It has an unbounded
    // connection pool. We need to limit the number of parallel connections by ourselves, so we
    // use semaphore to count the number of parallel RPC requests happening at any moment with
    // CachedProvider.
    semaphore: Arc<Semaphore>,
    headers: Arc<Mutex<lru::LruCache<u64, BlockHeader>>>,
    _phantom: std::marker::PhantomData<fn() -> TransportT>,
}

impl<ProviderT, TransportT> Clone for CachedProvider<ProviderT, TransportT> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            semaphore: self.semaphore.clone(),
            headers: self.headers.clone(),
            _phantom: std::marker::PhantomData,
        }
    }
}

pub struct ProviderGuard<'a, ProviderT> {
    provider: Arc<ProviderT>,
    _permit: SemaphorePermit<'a>,
}

impl<ProviderT> Deref for ProviderGuard<'_, ProviderT> {
    type Target = Arc<ProviderT>;

    fn deref(&self) -> &Self::Target {
        &self.provider
    }
}

impl<ProviderT, TransportT> CachedProvider<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    pub fn new(provider: ProviderT, max_parallel_requests: usize) -> Self {
        Self {
            provider: provider.into(),
            semaphore: Arc::new(Semaphore::new(max_parallel_requests.max(1))),
            headers: Arc::new(Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ))),
            _phantom: std::marker::PhantomData,
        }
    }

    pub async fn get_provider(&self) -> Result<ProviderGuard<ProviderT>, anyhow::Error> {
        Ok(ProviderGuard {
            provider: self.provider.clone(),
            _permit: self.semaphore.acquire().await?,
        })
    }

    /// Retrieves the header of block `number`, caching it if it's not already
    /// cached.
    pub async fn get_header(&self, number: u64) -> anyhow::Result<BlockHeader> {
        if let Some(header) = self.headers.lock().await.get(&number).copied() {
            return Ok(header);
        }
        let id = BlockId::Number(BlockNumberOrTag::Number(number));
        let block = self
            .get_provider()
            .await?
            .get_block(id, BlockTransactionsKind::Hashes)
            .await?
            .context(format!("target block {:?} does not exist", id))?;
        let header = BlockHeader {
            number: block.header.number,
            hash: block.header.hash,
            state_root: block.header.state_root,
            timestamp: block.header.timestamp,
        };
        trace!(number, hash = %header.hash, "fetched block header");
        self.headers.lock().await.put(number, header);
        Ok(header)
    }
}

impl<ProviderT, TransportT> ChainProvider for CachedProvider<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT> + 'static,
    TransportT: Transport + Clone,
{
    type Accessor = RpcAccessor<ProviderT, TransportT>;

    async fn latest_block_number(&self) -> anyhow::Result<u64> {
        Ok(self.get_provider().await?.get_block_number().await?)
    }

    async fn block_header(&self, number: u64) -> anyhow::Result<BlockHeader> {
        self.get_header(number).await
    }

    fn accessor(&self, header: &BlockHeader) -> Self::Accessor {
        RpcAccessor::new(self.clone(), *header)
    }
}
