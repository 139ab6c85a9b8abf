//! Storage gateway traits. The postgres implementation lives in
//! `chainscan-storage`; the import pipeline only ever sees these traits, and
//! tests substitute mocks for them.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
#[cfg(feature = "test-utils")]
use mockall::automock;
use thiserror::Error;

use crate::models::{
    account::{Account, AccountUpdate},
    baker::Baker,
    blockchain::{Block, PassiveDelegationStatus},
    contracts::ContractActivity,
    delegation::{Delegator, DelegatorCountDelta},
    parameters::ChainParametersVersion,
    AccountId, BakerId, BlockHash, BlockHeight, CanonicalAccountAddress, ImportState,
};

#[derive(Error, Debug, PartialEq, Clone)]
pub enum StorageError {
    #[error("Could not find {0} with id `{1}`")]
    NotFound(String, String),
    #[error("The entity {0} with id `{1}` already exists")]
    DuplicateEntry(String, String),
    #[error("Storage temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("Persisted data is malformed: {0}")]
    InvalidData(String),
    #[error("Unexpected storage error: {0}")]
    Unexpected(String),
}

/// Read side of the import projection. All reads observe committed rows
/// only; in-flight block transactions are invisible here.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
pub trait ImporterGateway: Send + Sync {
    /// Opens the atomic transaction covering all writes of one block.
    async fn begin_block_transaction(
        &self,
    ) -> Result<Box<dyn ImportTransaction>, StorageError>;

    async fn get_import_state(&self) -> Result<Option<ImportState>, StorageError>;

    /// Batched canonical-address lookup. Missing addresses are simply absent
    /// from the result map.
    async fn account_ids_by_address(
        &self,
        addresses: &[CanonicalAccountAddress],
    ) -> Result<HashMap<CanonicalAccountAddress, AccountId>, StorageError>;

    async fn get_baker(&self, id: BakerId) -> Result<Option<Baker>, StorageError>;

    /// All bakers currently in the `Active` state.
    async fn active_bakers(&self) -> Result<Vec<Baker>, StorageError>;

    /// Active bakers whose pending change is due at or before `at`.
    async fn bakers_with_pending_change_due(
        &self,
        at: NaiveDateTime,
    ) -> Result<Vec<Baker>, StorageError>;

    async fn get_delegator(&self, id: AccountId) -> Result<Option<Delegator>, StorageError>;

    async fn delegators_with_pending_change_due(
        &self,
        at: NaiveDateTime,
    ) -> Result<Vec<Delegator>, StorageError>;

    async fn get_chain_parameters(
        &self,
        version: i64,
    ) -> Result<ChainParametersVersion, StorageError>;

    async fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>, StorageError>;
}

/// Explicit handle for the writes of one block. Dropping the handle without
/// `commit` rolls the whole batch back; every write is an
/// upsert-by-primary-key so committed batches replay safely after restart.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
pub trait ImportTransaction: Send {
    async fn upsert_block(&mut self, block: &Block) -> Result<(), StorageError>;

    async fn insert_accounts(&mut self, accounts: &[Account]) -> Result<(), StorageError>;

    async fn apply_account_updates(
        &mut self,
        updates: &[AccountUpdate],
    ) -> Result<(), StorageError>;

    async fn upsert_baker(&mut self, baker: &Baker) -> Result<(), StorageError>;

    async fn upsert_delegator(&mut self, delegator: &Delegator) -> Result<(), StorageError>;

    async fn delete_delegator(&mut self, id: AccountId) -> Result<(), StorageError>;

    async fn apply_delegator_count_deltas(
        &mut self,
        deltas: &[DelegatorCountDelta],
    ) -> Result<(), StorageError>;

    async fn upsert_passive_delegation(
        &mut self,
        status: &PassiveDelegationStatus,
    ) -> Result<(), StorageError>;

    async fn insert_chain_parameters(
        &mut self,
        version: &ChainParametersVersion,
    ) -> Result<(), StorageError>;

    /// Sets `finalization_time_secs` for every block with height in
    /// `(from_exclusive, to_inclusive]` that does not have one yet, relative
    /// to `finalized_at`.
    async fn apply_finalization_times(
        &mut self,
        from_exclusive: Option<BlockHeight>,
        to_inclusive: BlockHeight,
        finalized_at: NaiveDateTime,
    ) -> Result<(), StorageError>;

    async fn save_import_state(&mut self, state: &ImportState) -> Result<(), StorageError>;

    async fn commit(&mut self) -> Result<(), StorageError>;

    async fn rollback(&mut self) -> Result<(), StorageError>;
}

/// Checkpointed persistence for the auxiliary contract/token event stream.
/// Batch writes commit in their own transactions; the read height is the
/// gapless watermark of fully committed batches.
#[cfg_attr(feature = "test-utils", automock)]
#[async_trait]
pub trait ContractCatchupGateway: Send + Sync {
    async fn read_height(&self, job: &str) -> Result<Option<BlockHeight>, StorageError>;

    async fn persist_activity(
        &self,
        job: &str,
        batch: &[ContractActivity],
    ) -> Result<(), StorageError>;

    /// Monotonic: a height at or below the stored one is a no-op.
    async fn advance_read_height(
        &self,
        job: &str,
        height: BlockHeight,
    ) -> Result<(), StorageError>;
}
