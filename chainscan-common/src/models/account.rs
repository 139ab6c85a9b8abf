use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{AccountId, Amount, AmountDelta, CanonicalAccountAddress};

/// An account row of the projection. Keyed by the canonical address; never
/// deleted once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub address: CanonicalAccountAddress,
    pub balance: Amount,
    pub transaction_count: u64,
    pub created_at: NaiveDateTime,
}

impl Account {
    pub fn new(
        id: AccountId,
        address: CanonicalAccountAddress,
        balance: Amount,
        created_at: NaiveDateTime,
    ) -> Self {
        Self { id, address, balance, transaction_count: 0, created_at }
    }
}

/// Aggregated per-block change to one account. Ephemeral, produced by the
/// account change calculation and consumed by the block transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountUpdate {
    pub account_id: AccountId,
    pub balance_delta: AmountDelta,
    pub tx_count_delta: u64,
}
