use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{Amount, BakerId, Commission};
use crate::models::parameters::CommissionRanges;

/// A validator of the projection. The id matches the owning account's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baker {
    pub id: BakerId,
    pub state: BakerState,
}

/// Mutually exclusive baker lifecycle states. A removed baker cannot carry a
/// live pool or a pending change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BakerState {
    Active(ActiveBakerState),
    #[serde(rename_all = "camelCase")]
    Removed { removed_at: NaiveDateTime },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBakerState {
    pub staked_amount: Amount,
    pub restake_earnings: bool,
    pub pending_change: Option<PendingBakerChange>,
    pub pool: Option<BakerPool>,
}

/// A scheduled, not-yet-applied stake mutation gated by a cooldown. At most
/// one per baker; cleared exactly once applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum PendingBakerChange {
    #[serde(rename_all = "camelCase")]
    Removal { effective_time: NaiveDateTime },
    #[serde(rename_all = "camelCase")]
    ReduceStake { effective_time: NaiveDateTime, new_stake: Amount },
}

impl PendingBakerChange {
    pub fn effective_time(&self) -> NaiveDateTime {
        match self {
            PendingBakerChange::Removal { effective_time } => *effective_time,
            PendingBakerChange::ReduceStake { effective_time, .. } => *effective_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BakerPoolOpenStatus {
    OpenForAll,
    ClosedForNew,
    ClosedForAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionRates {
    pub transaction: Commission,
    pub baking: Commission,
    pub finalization: Commission,
}

impl CommissionRates {
    /// Clamps every rate into the given ranges. Returns whether any rate
    /// moved.
    pub fn clamp_to(&mut self, ranges: &CommissionRanges) -> bool {
        let before = *self;
        self.transaction = ranges.transaction.clamp(self.transaction);
        self.baking = ranges.baking.clamp(self.baking);
        self.finalization = ranges.finalization.clamp(self.finalization);
        *self != before
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BakerPool {
    pub open_status: BakerPoolOpenStatus,
    pub metadata_url: String,
    pub commission_rates: CommissionRates,
    pub delegated_stake: Amount,
    pub delegator_count: u64,
    /// Snapshot taken at the last payday boundary. Replaced wholesale each
    /// payday, never merged field by field.
    pub payday_status: Option<PaydayPoolStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaydayPoolStatus {
    pub baker_equity_capital: Amount,
    pub delegated_capital: Amount,
    pub effective_stake: Amount,
    pub lottery_power: f64,
    pub commission_rates: CommissionRates,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::parameters::CommissionRange;

    fn ranges(min: u32, max: u32) -> CommissionRanges {
        let range = CommissionRange { min: Commission(min), max: Commission(max) };
        CommissionRanges { transaction: range, baking: range, finalization: range }
    }

    #[test]
    fn clamp_moves_out_of_range_rates_only() {
        let mut rates = CommissionRates {
            transaction: Commission(1_000),
            baking: Commission(50_000),
            finalization: Commission(99_000),
        };
        assert!(rates.clamp_to(&ranges(5_000, 80_000)));
        assert_eq!(rates.transaction, Commission(5_000));
        assert_eq!(rates.baking, Commission(50_000));
        assert_eq!(rates.finalization, Commission(80_000));

        // Already inside the range, nothing moves.
        assert!(!rates.clamp_to(&ranges(0, 100_000)));
    }
}
