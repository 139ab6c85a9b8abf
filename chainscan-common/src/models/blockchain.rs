use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{
    account::Account,
    baker::{BakerPoolOpenStatus, CommissionRates, PaydayPoolStatus},
    contracts::ContractEvent,
    delegation::DelegationTarget,
    parameters::ObservedChainParameters,
    AccountAddress, AccountId, Amount, BakerId, BlockHash, BlockHeight, Commission,
    TransactionIndex, TxHash,
};

/// A block row of the projection. The finalization time is filled in lazily
/// once a later block carries a proof covering this height; it may stay
/// unset indefinitely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub height: BlockHeight,
    pub hash: BlockHash,
    pub slot_time: NaiveDateTime,
    pub baker_id: Option<BakerId>,
    pub finalized: bool,
    /// Seconds between this block's slot time and the slot time of the block
    /// whose proof finalized it, rounded to one decimal.
    pub finalization_time_secs: Option<f64>,
}

/// Seconds from `slot_time` to `finalized_at`, rounded to one decimal place.
pub fn finalization_delay_secs(finalized_at: NaiveDateTime, slot_time: NaiveDateTime) -> f64 {
    let millis = finalized_at
        .signed_duration_since(slot_time)
        .num_milliseconds();
    (millis as f64 / 100.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub height: BlockHeight,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub slot_time: NaiveDateTime,
    pub baker_id: Option<BakerId>,
    pub finalized: bool,
    /// Proof that an earlier block reached finality, carried by this block.
    pub finalization_proof: Option<FinalizationProof>,
}

/// Evidence that the referenced block has been finalized by consensus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizationProof {
    pub finalized_block: BlockHash,
}

/// Everything the node reports for one block, already decoded into closed
/// sum types. This is the unit the import pipeline consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPayload {
    pub block_info: BlockInfo,
    pub item_summaries: Vec<BlockItemSummary>,
    pub special_events: Vec<SpecialEvent>,
    pub accounts_created: Vec<Account>,
    pub reward_status: RewardStatus,
    pub chain_parameters: ObservedChainParameters,
    /// Pool snapshots, present on payday blocks only.
    pub baker_pool_statuses: Option<Vec<BakerPoolStatus>>,
    pub passive_delegation_status: Option<PassiveDelegationStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardStatus {
    pub total_amount: Amount,
    pub total_staked_capital: Amount,
    pub next_payday_time: Option<NaiveDateTime>,
}

/// Pool status as the node reports it at a payday boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BakerPoolStatus {
    pub baker_id: BakerId,
    pub payday_status: PaydayPoolStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassiveDelegationStatus {
    pub delegated_capital: Amount,
    pub commission_rates: CommissionRates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockItemSummary {
    pub index: TransactionIndex,
    pub hash: TxHash,
    pub sender: Option<AccountAddress>,
    /// Fee charged to the sender, zero for credential deployments and chain
    /// updates.
    pub cost: Amount,
    pub details: BlockItemDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BlockItemDetails {
    #[serde(rename_all = "camelCase")]
    AccountTransaction { effects: AccountTransactionEffects },
    #[serde(rename_all = "camelCase")]
    AccountCreation { address: AccountAddress },
    #[serde(rename_all = "camelCase")]
    ChainUpdate { effective_time: NaiveDateTime },
}

/// Effects of one successful or rejected account transaction. Closed sum
/// type; an unrecognised discriminator fails decoding at the node boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum AccountTransactionEffects {
    #[serde(rename_all = "camelCase")]
    Transferred {
        from: AccountAddress,
        to: AccountAddress,
        amount: Amount,
    },
    #[serde(rename_all = "camelCase")]
    TransferredWithSchedule {
        from: AccountAddress,
        to: AccountAddress,
        releases: Vec<ScheduledRelease>,
    },
    #[serde(rename_all = "camelCase")]
    BakerConfigured { events: Vec<BakerEvent> },
    #[serde(rename_all = "camelCase")]
    DelegationConfigured { events: Vec<DelegationEvent> },
    #[serde(rename_all = "camelCase")]
    ContractInitialized {
        events: Vec<ContractEvent>,
    },
    #[serde(rename_all = "camelCase")]
    ContractUpdated {
        events: Vec<ContractEvent>,
    },
    #[serde(rename_all = "camelCase")]
    DataRegistered,
    #[serde(rename_all = "camelCase")]
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledRelease {
    pub timestamp: NaiveDateTime,
    pub amount: Amount,
}

/// Validator protocol events, one variant per discriminator tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum BakerEvent {
    #[serde(rename_all = "camelCase")]
    Added {
        baker_id: BakerId,
        staked_amount: Amount,
        restake_earnings: bool,
    },
    /// Removal is scheduled, not immediate; the cooldown derives from the
    /// chain parameters current at this block.
    #[serde(rename_all = "camelCase")]
    Removed { baker_id: BakerId },
    #[serde(rename_all = "camelCase")]
    StakeIncreased { baker_id: BakerId, new_stake: Amount },
    #[serde(rename_all = "camelCase")]
    StakeDecreased { baker_id: BakerId, new_stake: Amount },
    #[serde(rename_all = "camelCase")]
    SetRestakeEarnings { baker_id: BakerId, restake_earnings: bool },
    #[serde(rename_all = "camelCase")]
    SetOpenStatus {
        baker_id: BakerId,
        open_status: BakerPoolOpenStatus,
    },
    #[serde(rename_all = "camelCase")]
    SetMetadataUrl { baker_id: BakerId, metadata_url: String },
    #[serde(rename_all = "camelCase")]
    SetTransactionFeeCommission { baker_id: BakerId, commission: Commission },
    #[serde(rename_all = "camelCase")]
    SetBakingRewardCommission { baker_id: BakerId, commission: Commission },
    #[serde(rename_all = "camelCase")]
    SetFinalizationRewardCommission { baker_id: BakerId, commission: Commission },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum DelegationEvent {
    #[serde(rename_all = "camelCase")]
    Added { delegator_id: AccountId },
    #[serde(rename_all = "camelCase")]
    Removed { delegator_id: AccountId },
    #[serde(rename_all = "camelCase")]
    StakeIncreased { delegator_id: AccountId, new_stake: Amount },
    #[serde(rename_all = "camelCase")]
    StakeDecreased { delegator_id: AccountId, new_stake: Amount },
    #[serde(rename_all = "camelCase")]
    SetRestakeEarnings {
        delegator_id: AccountId,
        restake_earnings: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetDelegationTarget {
        delegator_id: AccountId,
        target: DelegationTarget,
    },
}

/// Reject reasons the importer cares about. Rejected transactions still pay
/// their fee; reasons naming accounts produce best-effort transaction links
/// only, since a reject payload may legitimately reference a never-created
/// account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum RejectReason {
    #[serde(rename_all = "camelCase")]
    InvalidAccountReference { address: AccountAddress },
    #[serde(rename_all = "camelCase")]
    AmountTooLarge { address: AccountAddress, amount: Amount },
    #[serde(rename_all = "camelCase")]
    ScheduledSelfTransfer { address: AccountAddress },
    #[serde(rename_all = "camelCase")]
    NotABaker { address: AccountAddress },
    AlreadyABaker,
    InsufficientBalanceForBakerStake,
    StakeUnderMinimumThresholdForBaking,
    BakerInCooldown,
    DelegatorInCooldown,
    OutOfEnergy,
    SerializationFailure,
    RejectedReceive,
}

impl RejectReason {
    /// The account the reason references, if any. Best-effort linking input.
    pub fn referenced_account(&self) -> Option<AccountAddress> {
        match self {
            RejectReason::InvalidAccountReference { address } |
            RejectReason::AmountTooLarge { address, .. } |
            RejectReason::ScheduledSelfTransfer { address } |
            RejectReason::NotABaker { address } => Some(*address),
            _ => None,
        }
    }
}

/// Protocol-generated outcomes outside any transaction: reward
/// distributions and minting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum SpecialEvent {
    #[serde(rename_all = "camelCase")]
    BakingRewards { rewards: Vec<AccountReward> },
    #[serde(rename_all = "camelCase")]
    FinalizationRewards { rewards: Vec<AccountReward> },
    #[serde(rename_all = "camelCase")]
    Mint {
        foundation_account: AccountAddress,
        amount: Amount,
    },
    #[serde(rename_all = "camelCase")]
    BlockReward {
        baker: AccountAddress,
        baker_reward: Amount,
        foundation_account: AccountAddress,
        foundation_charge: Amount,
    },
    #[serde(rename_all = "camelCase")]
    PaydayFoundationReward {
        foundation_account: AccountAddress,
        development_charge: Amount,
    },
    #[serde(rename_all = "camelCase")]
    PaydayAccountReward {
        account: AccountAddress,
        transaction_fees: Amount,
        baker_reward: Amount,
        finalization_reward: Amount,
    },
    #[serde(rename_all = "camelCase")]
    PaydayPoolReward {
        pool_owner: Option<BakerId>,
        transaction_fees: Amount,
        baker_reward: Amount,
        finalization_reward: Amount,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountReward {
    pub account: AccountAddress,
    pub amount: Amount,
}
