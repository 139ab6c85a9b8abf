use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    sync::Arc,
};

use chainscan_common::{
    models::{AccountId, BlockHash, CanonicalAccountAddress},
    node::NodeGateway,
    storage::ImporterGateway,
};
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::trace;

use crate::importer::ImportError;

/// Read-through resolution of canonical addresses to account ids.
///
/// Three tiers: an in-process LRU, one batched store query for the misses,
/// and finally the node itself for accounts created in the block currently
/// being imported, whose rows are not committed yet. Unknown addresses are
/// not an error here; callers decide whether absence is fatal.
pub struct AddressResolver<G, N> {
    gateway: Arc<G>,
    node: Arc<N>,
    cache: Mutex<LruCache<CanonicalAccountAddress, AccountId>>,
}

impl<G, N> AddressResolver<G, N>
where
    G: ImporterGateway,
    N: NodeGateway,
{
    pub fn new(gateway: Arc<G>, node: Arc<N>, cache_size: NonZeroUsize) -> Self {
        Self { gateway, node, cache: Mutex::new(LruCache::new(cache_size)) }
    }

    pub async fn lookup(
        &self,
        addresses: &HashSet<CanonicalAccountAddress>,
        block: &BlockHash,
    ) -> Result<HashMap<CanonicalAccountAddress, Option<AccountId>>, ImportError> {
        let mut resolved = HashMap::with_capacity(addresses.len());

        let mut misses = Vec::new();
        {
            let mut cache = self.cache.lock().await;
            for address in addresses {
                match cache.get(address) {
                    Some(id) => {
                        resolved.insert(*address, Some(*id));
                    }
                    None => misses.push(*address),
                }
            }
        }
        if misses.is_empty() {
            return Ok(resolved);
        }

        let stored = self
            .gateway
            .account_ids_by_address(&misses)
            .await?;
        let mut cache = self.cache.lock().await;
        for address in misses {
            if let Some(id) = stored.get(&address) {
                cache.put(address, *id);
                resolved.insert(address, Some(*id));
                continue;
            }
            // Not persisted yet; the node may already know it (accounts
            // created earlier in the block being imported).
            match self
                .node
                .account_info(&address.into(), block)
                .await?
            {
                Some(info) => {
                    cache.put(address, info.index);
                    resolved.insert(address, Some(info.index));
                }
                None => {
                    trace!(%address, "Address does not resolve to any account");
                    resolved.insert(address, None);
                }
            }
        }
        Ok(resolved)
    }
}
