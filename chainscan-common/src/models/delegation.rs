use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{AccountId, Amount, BakerId};

/// Where a delegator's stake is directed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "camelCase")]
pub enum DelegationTarget {
    #[serde(rename_all = "camelCase")]
    Baker { baker_id: BakerId },
    Passive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegator {
    pub account_id: AccountId,
    pub staked_amount: Amount,
    pub restake_earnings: bool,
    pub target: DelegationTarget,
    pub pending_change: Option<PendingDelegationChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum PendingDelegationChange {
    #[serde(rename_all = "camelCase")]
    Removal { effective_time: NaiveDateTime },
    #[serde(rename_all = "camelCase")]
    ReduceStake { effective_time: NaiveDateTime, new_stake: Amount },
}

impl PendingDelegationChange {
    pub fn effective_time(&self) -> NaiveDateTime {
        match self {
            PendingDelegationChange::Removal { effective_time } => *effective_time,
            PendingDelegationChange::ReduceStake { effective_time, .. } => *effective_time,
        }
    }
}

/// Signed per-block adjustment to one delegation pool. Counts and stake are
/// deltas, never absolute overwrites, so add/remove events observed within
/// one block cannot race each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegatorCountDelta {
    pub target: DelegationTarget,
    pub count_delta: i64,
    pub stake_delta: i64,
}

impl DelegatorCountDelta {
    pub fn is_zero(&self) -> bool {
        self.count_delta == 0 && self.stake_delta == 0
    }
}
