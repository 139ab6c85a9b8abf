//! Node-facing traits. The concrete client in `chainscan-indexer` speaks the
//! node's JSON API; everything past that boundary is already decoded into
//! the closed sum types of [`crate::models`].

use async_trait::async_trait;
#[cfg(feature = "test-utils")]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    blockchain::{BakerPoolStatus, BlockPayload, PassiveDelegationStatus},
    contracts::ContractActivity,
    AccountAddress, AccountId, Amount, BakerId, BlockHash, BlockHeight,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Node connection failed: {0}")]
    Connection(String),
    #[error("Failed to decode node response: {0}")]
    Decode(String),
    #[error("Node reported an unknown variant: {0}")]
    UnknownVariant(String),
    #[error("Node has no {0}")]
    NotFound(String),
}

impl NodeError {
    /// Connection problems are retried; decode problems never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Connection(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusStatus {
    pub genesis_block_hash: BlockHash,
    pub best_block_height: BlockHeight,
    pub last_finalized_height: BlockHeight,
    pub epoch_duration_millis: i64,
}

/// Account data as the node reports it. The index is authoritative; locally
/// not-yet-committed accounts are still resolvable through this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAccountInfo {
    pub index: AccountId,
    pub address: AccountAddress,
    pub balance: Amount,
}

#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
pub trait NodeGateway: Send + Sync {
    async fn consensus_status(&self) -> Result<ConsensusStatus, NodeError>;

    /// The full decoded payload for the block at `height`. The height must
    /// be at or below the last finalized height.
    async fn block_payload(&self, height: BlockHeight) -> Result<BlockPayload, NodeError>;

    /// Point query for one account as of `block`. Returns `None` for
    /// addresses the chain has never seen.
    async fn account_info(
        &self,
        address: &AccountAddress,
        block: &BlockHash,
    ) -> Result<Option<NodeAccountInfo>, NodeError>;

    /// Resolves an account index to its canonical address as of `block`.
    async fn account_address_by_index(
        &self,
        index: u64,
        block: &BlockHash,
    ) -> Result<AccountAddress, NodeError>;

    async fn baker_pool_status(
        &self,
        baker: BakerId,
        block: &BlockHash,
    ) -> Result<BakerPoolStatus, NodeError>;

    async fn passive_delegation_status(
        &self,
        block: &BlockHash,
    ) -> Result<PassiveDelegationStatus, NodeError>;

    /// Contract and token events for all blocks in `[from, to]`.
    async fn contract_activity(
        &self,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<ContractActivity>, NodeError>;
}
