use serde::{Deserialize, Serialize};

use super::{Amount, CanonicalAccountAddress, Commission, ExchangeRate};

/// Inclusive bound on a commission rate, protocol defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionRange {
    pub min: Commission,
    pub max: Commission,
}

impl CommissionRange {
    pub fn clamp(&self, value: Commission) -> Commission {
        value.max(self.min).min(self.max)
    }

    pub fn contains(&self, value: Commission) -> bool {
        self.min <= value && value <= self.max
    }

    /// Whether this range excludes values the other admits on either side.
    pub fn narrows(&self, other: &CommissionRange) -> bool {
        self.min > other.min || self.max < other.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionRanges {
    pub transaction: CommissionRange,
    pub baking: CommissionRange,
    pub finalization: CommissionRange,
}

impl CommissionRanges {
    pub fn narrows(&self, other: &CommissionRanges) -> bool {
        self.transaction.narrows(&other.transaction) ||
            self.baking.narrows(&other.baking) ||
            self.finalization.narrows(&other.finalization)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardParameters {
    pub mint_per_payday: Commission,
    pub baker_fee_share: Commission,
    pub gas_account_fee_share: Commission,
    pub gas_baker_reward: Commission,
    pub gas_finalization_proof_reward: Commission,
    pub gas_account_creation_reward: Commission,
    pub gas_chain_update_reward: Commission,
}

/// A full, immutable snapshot of the protocol's economic parameters. The
/// foundation account is stored as a resolved canonical address, not the raw
/// account index the node reports, so value equality covers resolved data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainParameters {
    pub election_difficulty: Commission,
    pub euro_per_energy: ExchangeRate,
    pub micro_ccd_per_euro: ExchangeRate,
    pub pool_owner_cooldown_secs: u64,
    pub delegator_cooldown_secs: u64,
    pub account_creation_limit: u16,
    pub foundation_account: CanonicalAccountAddress,
    pub minimum_equity_capital: Amount,
    pub commission_ranges: CommissionRanges,
    pub reward_parameters: RewardParameters,
}

/// One appended row of the parameter history. Versions start at 1 and are
/// never updated or deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainParametersVersion {
    pub version: i64,
    pub parameters: ChainParameters,
}

/// Parameter values as the node reports them, before account-index
/// resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedChainParameters {
    pub election_difficulty: Commission,
    pub euro_per_energy: ExchangeRate,
    pub micro_ccd_per_euro: ExchangeRate,
    pub pool_owner_cooldown_secs: u64,
    pub delegator_cooldown_secs: u64,
    pub account_creation_limit: u16,
    pub foundation_account_index: u64,
    pub minimum_equity_capital: Amount,
    pub commission_ranges: CommissionRanges,
    pub reward_parameters: RewardParameters,
}

impl ObservedChainParameters {
    pub fn resolve(&self, foundation_account: CanonicalAccountAddress) -> ChainParameters {
        ChainParameters {
            election_difficulty: self.election_difficulty,
            euro_per_energy: self.euro_per_energy,
            micro_ccd_per_euro: self.micro_ccd_per_euro,
            pool_owner_cooldown_secs: self.pool_owner_cooldown_secs,
            delegator_cooldown_secs: self.delegator_cooldown_secs,
            account_creation_limit: self.account_creation_limit,
            foundation_account,
            minimum_equity_capital: self.minimum_equity_capital,
            commission_ranges: self.commission_ranges,
            reward_parameters: self.reward_parameters,
        }
    }
}
