//! Row structs mirroring the schema, plus conversions from and to the
//! shared models. Conversions fail with `StorageError::InvalidData` when a
//! row violates the model invariants (e.g. an active baker without a
//! stake).

use chainscan_common::{
    models::{
        account::Account,
        baker::{ActiveBakerState, Baker, BakerPool, BakerPoolOpenStatus, BakerState,
            CommissionRates},
        blockchain::Block,
        contracts::ContractActivity,
        delegation::{DelegationTarget, Delegator},
        parameters::ChainParametersVersion,
        BlockHash, CanonicalAccountAddress, Commission, ImportState, TxHash,
    },
    storage::StorageError,
};
use chrono::NaiveDateTime;
use diesel::prelude::*;

use super::schema;

pub(crate) fn invalid(context: impl std::fmt::Display) -> StorageError {
    StorageError::InvalidData(context.to_string())
}

fn non_negative(value: i64, what: &str) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| invalid(format!("negative {what}: {value}")))
}

fn fixed_bytes<const N: usize>(bytes: Vec<u8>, what: &str) -> Result<[u8; N], StorageError> {
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| invalid(format!("{what} has {len} bytes, expected {N}")))
}

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::account)]
pub(crate) struct AccountRow {
    pub id: i64,
    pub address: Vec<u8>,
    pub balance: i64,
    pub transaction_count: i64,
    pub created_at: NaiveDateTime,
}

impl TryFrom<&Account> for AccountRow {
    type Error = StorageError;

    fn try_from(account: &Account) -> Result<Self, Self::Error> {
        Ok(Self {
            id: account.id,
            address: account.address.0.to_vec(),
            balance: i64::try_from(account.balance)
                .map_err(|_| invalid("account balance out of range"))?,
            transaction_count: i64::try_from(account.transaction_count)
                .map_err(|_| invalid("transaction count out of range"))?,
            created_at: account.created_at,
        })
    }
}

impl TryFrom<AccountRow> for Account {
    type Error = StorageError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: row.id,
            address: CanonicalAccountAddress(fixed_bytes(row.address, "account address")?),
            balance: non_negative(row.balance, "account balance")?,
            transaction_count: non_negative(row.transaction_count, "transaction count")?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::block)]
#[diesel(treat_none_as_null = true)]
pub(crate) struct BlockRow {
    pub height: i64,
    pub hash: Vec<u8>,
    pub slot_time: NaiveDateTime,
    pub baker_id: Option<i64>,
    pub finalized: bool,
    pub finalization_time_secs: Option<f64>,
}

impl TryFrom<&Block> for BlockRow {
    type Error = StorageError;

    fn try_from(block: &Block) -> Result<Self, Self::Error> {
        Ok(Self {
            height: i64::try_from(block.height)
                .map_err(|_| invalid("block height out of range"))?,
            hash: block.hash.0.to_vec(),
            slot_time: block.slot_time,
            baker_id: block.baker_id,
            finalized: block.finalized,
            finalization_time_secs: block.finalization_time_secs,
        })
    }
}

impl TryFrom<BlockRow> for Block {
    type Error = StorageError;

    fn try_from(row: BlockRow) -> Result<Self, Self::Error> {
        Ok(Block {
            height: non_negative(row.height, "block height")?,
            hash: BlockHash(fixed_bytes(row.hash, "block hash")?),
            slot_time: row.slot_time,
            baker_id: row.baker_id,
            finalized: row.finalized,
            finalization_time_secs: row.finalization_time_secs,
        })
    }
}

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::baker)]
#[diesel(treat_none_as_null = true)]
pub(crate) struct BakerRow {
    pub id: i64,
    pub removed_at: Option<NaiveDateTime>,
    pub staked_amount: Option<i64>,
    pub restake_earnings: Option<bool>,
    pub pending_change: Option<serde_json::Value>,
    pub pending_change_effective_time: Option<NaiveDateTime>,
    pub pool_open_status: Option<String>,
    pub pool_metadata_url: Option<String>,
    pub pool_transaction_commission: Option<i32>,
    pub pool_baking_commission: Option<i32>,
    pub pool_finalization_commission: Option<i32>,
    pub pool_delegated_stake: Option<i64>,
    pub pool_delegator_count: Option<i64>,
    pub pool_payday_status: Option<serde_json::Value>,
}

impl TryFrom<&Baker> for BakerRow {
    type Error = StorageError;

    fn try_from(baker: &Baker) -> Result<Self, Self::Error> {
        let mut row = BakerRow {
            id: baker.id,
            removed_at: None,
            staked_amount: None,
            restake_earnings: None,
            pending_change: None,
            pending_change_effective_time: None,
            pool_open_status: None,
            pool_metadata_url: None,
            pool_transaction_commission: None,
            pool_baking_commission: None,
            pool_finalization_commission: None,
            pool_delegated_stake: None,
            pool_delegator_count: None,
            pool_payday_status: None,
        };
        match &baker.state {
            BakerState::Removed { removed_at } => {
                row.removed_at = Some(*removed_at);
            }
            BakerState::Active(active) => {
                row.staked_amount = Some(
                    i64::try_from(active.staked_amount)
                        .map_err(|_| invalid("staked amount out of range"))?,
                );
                row.restake_earnings = Some(active.restake_earnings);
                if let Some(change) = &active.pending_change {
                    row.pending_change =
                        Some(serde_json::to_value(change).map_err(invalid)?);
                    row.pending_change_effective_time = Some(change.effective_time());
                }
                if let Some(pool) = &active.pool {
                    row.pool_open_status =
                        Some(open_status_to_str(pool.open_status).to_string());
                    row.pool_metadata_url = Some(pool.metadata_url.clone());
                    row.pool_transaction_commission =
                        Some(pool.commission_rates.transaction.0 as i32);
                    row.pool_baking_commission = Some(pool.commission_rates.baking.0 as i32);
                    row.pool_finalization_commission =
                        Some(pool.commission_rates.finalization.0 as i32);
                    row.pool_delegated_stake = Some(
                        i64::try_from(pool.delegated_stake)
                            .map_err(|_| invalid("delegated stake out of range"))?,
                    );
                    row.pool_delegator_count = Some(
                        i64::try_from(pool.delegator_count)
                            .map_err(|_| invalid("delegator count out of range"))?,
                    );
                    if let Some(payday) = &pool.payday_status {
                        row.pool_payday_status =
                            Some(serde_json::to_value(payday).map_err(invalid)?);
                    }
                }
            }
        }
        Ok(row)
    }
}

impl TryFrom<BakerRow> for Baker {
    type Error = StorageError;

    fn try_from(row: BakerRow) -> Result<Self, Self::Error> {
        let state = match row.removed_at {
            Some(removed_at) => BakerState::Removed { removed_at },
            None => {
                let staked_amount = row
                    .staked_amount
                    .ok_or_else(|| invalid(format!("active baker {} without stake", row.id)))?;
                let pool = match row.pool_open_status {
                    Some(open_status) => Some(BakerPool {
                        open_status: open_status_from_str(&open_status)?,
                        metadata_url: row.pool_metadata_url.unwrap_or_default(),
                        commission_rates: CommissionRates {
                            transaction: commission(row.pool_transaction_commission, row.id)?,
                            baking: commission(row.pool_baking_commission, row.id)?,
                            finalization: commission(row.pool_finalization_commission, row.id)?,
                        },
                        delegated_stake: non_negative(
                            row.pool_delegated_stake.unwrap_or(0),
                            "delegated stake",
                        )?,
                        delegator_count: non_negative(
                            row.pool_delegator_count.unwrap_or(0),
                            "delegator count",
                        )?,
                        payday_status: row
                            .pool_payday_status
                            .map(serde_json::from_value)
                            .transpose()
                            .map_err(invalid)?,
                    }),
                    None => None,
                };
                BakerState::Active(ActiveBakerState {
                    staked_amount: non_negative(staked_amount, "staked amount")?,
                    restake_earnings: row.restake_earnings.unwrap_or(false),
                    pending_change: row
                        .pending_change
                        .map(serde_json::from_value)
                        .transpose()
                        .map_err(invalid)?,
                    pool,
                })
            }
        };
        Ok(Baker { id: row.id, state })
    }
}

fn open_status_to_str(status: BakerPoolOpenStatus) -> &'static str {
    match status {
        BakerPoolOpenStatus::OpenForAll => "openForAll",
        BakerPoolOpenStatus::ClosedForNew => "closedForNew",
        BakerPoolOpenStatus::ClosedForAll => "closedForAll",
    }
}

fn open_status_from_str(raw: &str) -> Result<BakerPoolOpenStatus, StorageError> {
    match raw {
        "openForAll" => Ok(BakerPoolOpenStatus::OpenForAll),
        "closedForNew" => Ok(BakerPoolOpenStatus::ClosedForNew),
        "closedForAll" => Ok(BakerPoolOpenStatus::ClosedForAll),
        other => Err(invalid(format!("unknown pool open status `{other}`"))),
    }
}

fn commission(raw: Option<i32>, baker: i64) -> Result<Commission, StorageError> {
    let raw = raw.ok_or_else(|| invalid(format!("pool of baker {baker} without commission")))?;
    u32::try_from(raw)
        .map(Commission)
        .map_err(|_| invalid(format!("negative commission for baker {baker}")))
}

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::delegator)]
#[diesel(treat_none_as_null = true)]
pub(crate) struct DelegatorRow {
    pub account_id: i64,
    pub staked_amount: i64,
    pub restake_earnings: bool,
    pub target_baker_id: Option<i64>,
    pub pending_change: Option<serde_json::Value>,
    pub pending_change_effective_time: Option<NaiveDateTime>,
}

impl TryFrom<&Delegator> for DelegatorRow {
    type Error = StorageError;

    fn try_from(delegator: &Delegator) -> Result<Self, Self::Error> {
        Ok(Self {
            account_id: delegator.account_id,
            staked_amount: i64::try_from(delegator.staked_amount)
                .map_err(|_| invalid("staked amount out of range"))?,
            restake_earnings: delegator.restake_earnings,
            target_baker_id: match delegator.target {
                DelegationTarget::Baker { baker_id } => Some(baker_id),
                DelegationTarget::Passive => None,
            },
            pending_change: delegator
                .pending_change
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(invalid)?,
            pending_change_effective_time: delegator
                .pending_change
                .as_ref()
                .map(|change| change.effective_time()),
        })
    }
}

impl TryFrom<DelegatorRow> for Delegator {
    type Error = StorageError;

    fn try_from(row: DelegatorRow) -> Result<Self, Self::Error> {
        Ok(Delegator {
            account_id: row.account_id,
            staked_amount: non_negative(row.staked_amount, "staked amount")?,
            restake_earnings: row.restake_earnings,
            target: match row.target_baker_id {
                Some(baker_id) => DelegationTarget::Baker { baker_id },
                None => DelegationTarget::Passive,
            },
            pending_change: row
                .pending_change
                .map(serde_json::from_value)
                .transpose()
                .map_err(invalid)?,
        })
    }
}

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::chain_parameters)]
pub(crate) struct ChainParametersRow {
    pub version: i64,
    pub parameters: serde_json::Value,
}

impl TryFrom<&ChainParametersVersion> for ChainParametersRow {
    type Error = StorageError;

    fn try_from(version: &ChainParametersVersion) -> Result<Self, Self::Error> {
        Ok(Self {
            version: version.version,
            parameters: serde_json::to_value(&version.parameters).map_err(invalid)?,
        })
    }
}

impl TryFrom<ChainParametersRow> for ChainParametersVersion {
    type Error = StorageError;

    fn try_from(row: ChainParametersRow) -> Result<Self, Self::Error> {
        Ok(ChainParametersVersion {
            version: row.version,
            parameters: serde_json::from_value(row.parameters).map_err(invalid)?,
        })
    }
}

#[derive(Debug, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = schema::import_state)]
#[diesel(treat_none_as_null = true)]
pub(crate) struct ImportStateRow {
    pub id: i32,
    pub genesis_block_hash: Vec<u8>,
    pub max_imported_block_height: i64,
    pub last_block_slot_time: NaiveDateTime,
    pub max_height_with_finalization_time: Option<i64>,
    pub latest_chain_parameters_version: Option<i64>,
    pub total_baker_count: i64,
    pub epoch_duration_millis: i64,
    pub next_payday_time: Option<NaiveDateTime>,
}

/// The import state is a singleton row.
pub(crate) const IMPORT_STATE_ROW_ID: i32 = 1;

impl TryFrom<&ImportState> for ImportStateRow {
    type Error = StorageError;

    fn try_from(state: &ImportState) -> Result<Self, Self::Error> {
        Ok(Self {
            id: IMPORT_STATE_ROW_ID,
            genesis_block_hash: state.genesis_block_hash.0.to_vec(),
            max_imported_block_height: i64::try_from(state.max_imported_block_height)
                .map_err(|_| invalid("block height out of range"))?,
            last_block_slot_time: state.last_block_slot_time,
            max_height_with_finalization_time: state
                .max_height_with_finalization_time
                .map(|h| i64::try_from(h).map_err(|_| invalid("watermark out of range")))
                .transpose()?,
            latest_chain_parameters_version: state.latest_chain_parameters_version,
            total_baker_count: i64::try_from(state.total_baker_count)
                .map_err(|_| invalid("baker count out of range"))?,
            epoch_duration_millis: state.epoch_duration_millis,
            next_payday_time: state.next_payday_time,
        })
    }
}

impl TryFrom<ImportStateRow> for ImportState {
    type Error = StorageError;

    fn try_from(row: ImportStateRow) -> Result<Self, Self::Error> {
        Ok(ImportState {
            genesis_block_hash: BlockHash(fixed_bytes(row.genesis_block_hash, "genesis hash")?),
            max_imported_block_height: non_negative(
                row.max_imported_block_height,
                "block height",
            )?,
            last_block_slot_time: row.last_block_slot_time,
            max_height_with_finalization_time: row
                .max_height_with_finalization_time
                .map(|h| non_negative(h, "watermark"))
                .transpose()?,
            latest_chain_parameters_version: row.latest_chain_parameters_version,
            total_baker_count: non_negative(row.total_baker_count, "baker count")?,
            epoch_duration_millis: row.epoch_duration_millis,
            next_payday_time: row.next_payday_time,
        })
    }
}

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = schema::contract_event)]
pub(crate) struct ContractEventRow {
    pub block_height: i64,
    pub transaction_index: i64,
    pub event_index: i32,
    pub slot_time: NaiveDateTime,
    pub transaction_hash: Vec<u8>,
    pub payload: serde_json::Value,
}

impl TryFrom<&ContractActivity> for ContractEventRow {
    type Error = StorageError;

    fn try_from(activity: &ContractActivity) -> Result<Self, Self::Error> {
        Ok(Self {
            block_height: i64::try_from(activity.block_height)
                .map_err(|_| invalid("block height out of range"))?,
            transaction_index: i64::try_from(activity.transaction_index)
                .map_err(|_| invalid("transaction index out of range"))?,
            event_index: i32::try_from(activity.event_index)
                .map_err(|_| invalid("event index out of range"))?,
            slot_time: activity.slot_time,
            transaction_hash: activity.transaction_hash.0.to_vec(),
            payload: serde_json::to_value(&activity.event).map_err(invalid)?,
        })
    }
}

impl TryFrom<ContractEventRow> for ContractActivity {
    type Error = StorageError;

    fn try_from(row: ContractEventRow) -> Result<Self, Self::Error> {
        Ok(ContractActivity {
            block_height: non_negative(row.block_height, "block height")?,
            slot_time: row.slot_time,
            transaction_hash: TxHash(fixed_bytes(row.transaction_hash, "transaction hash")?),
            transaction_index: non_negative(row.transaction_index, "transaction index")?,
            event_index: u32::try_from(row.event_index)
                .map_err(|_| invalid("negative event index"))?,
            event: serde_json::from_value(row.payload).map_err(invalid)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chainscan_common::models::baker::{PaydayPoolStatus, PendingBakerChange};
    use chrono::DateTime;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn ts(secs: i64) -> NaiveDateTime {
        DateTime::from_timestamp(secs, 0)
            .unwrap()
            .naive_utc()
    }

    fn rates(value: u32) -> CommissionRates {
        CommissionRates {
            transaction: Commission(value),
            baking: Commission(value),
            finalization: Commission(value),
        }
    }

    #[test]
    fn active_baker_round_trips() {
        let baker = Baker {
            id: 5,
            state: BakerState::Active(ActiveBakerState {
                staked_amount: 14_000_000_000,
                restake_earnings: true,
                pending_change: Some(PendingBakerChange::ReduceStake {
                    effective_time: ts(1_000),
                    new_stake: 7_000_000_000,
                }),
                pool: Some(BakerPool {
                    open_status: BakerPoolOpenStatus::ClosedForNew,
                    metadata_url: "https://pool.example".to_string(),
                    commission_rates: rates(12_000),
                    delegated_stake: 42,
                    delegator_count: 3,
                    payday_status: Some(PaydayPoolStatus {
                        baker_equity_capital: 1,
                        delegated_capital: 2,
                        effective_stake: 3,
                        lottery_power: 0.1,
                        commission_rates: rates(11_000),
                    }),
                }),
            }),
        };
        let row = BakerRow::try_from(&baker).unwrap();
        assert_eq!(row.pending_change_effective_time, Some(ts(1_000)));
        let back = Baker::try_from(row).unwrap();
        assert_eq!(back, baker);
    }

    #[test]
    fn removed_baker_round_trips() {
        let baker = Baker { id: 9, state: BakerState::Removed { removed_at: ts(77) } };
        let row = BakerRow::try_from(&baker).unwrap();
        assert_eq!(row.staked_amount, None);
        assert_eq!(Baker::try_from(row).unwrap(), baker);
    }

    #[test]
    fn an_active_baker_row_without_stake_is_invalid() {
        let row = BakerRow::try_from(&Baker {
            id: 1,
            state: BakerState::Removed { removed_at: ts(1) },
        })
        .map(|mut row| {
            row.removed_at = None;
            row
        })
        .unwrap();
        assert!(matches!(Baker::try_from(row), Err(StorageError::InvalidData(_))));
    }

    #[rstest]
    #[case(DelegationTarget::Passive)]
    #[case(DelegationTarget::Baker { baker_id: 12 })]
    fn delegator_round_trips_both_targets(#[case] target: DelegationTarget) {
        let delegator = Delegator {
            account_id: 8,
            staked_amount: 100,
            restake_earnings: false,
            target,
            pending_change: None,
        };
        let row = DelegatorRow::try_from(&delegator).unwrap();
        assert_eq!(Delegator::try_from(row).unwrap(), delegator);
    }

    #[test]
    fn import_state_round_trips() {
        let state = ImportState {
            genesis_block_hash: BlockHash([1; 32]),
            max_imported_block_height: 100,
            last_block_slot_time: ts(500),
            max_height_with_finalization_time: Some(90),
            latest_chain_parameters_version: Some(2),
            total_baker_count: 10,
            epoch_duration_millis: 3_600_000,
            next_payday_time: None,
        };
        let row = ImportStateRow::try_from(&state).unwrap();
        assert_eq!(row.id, IMPORT_STATE_ROW_ID);
        assert_eq!(ImportState::try_from(row).unwrap(), state);
    }

    #[test]
    fn truncated_hashes_are_rejected() {
        let mut row = ImportStateRow::try_from(&ImportState {
            genesis_block_hash: BlockHash([1; 32]),
            max_imported_block_height: 0,
            last_block_slot_time: ts(0),
            max_height_with_finalization_time: None,
            latest_chain_parameters_version: None,
            total_baker_count: 0,
            epoch_duration_millis: 1,
            next_payday_time: None,
        })
        .unwrap();
        row.genesis_block_hash.truncate(5);
        assert!(matches!(ImportState::try_from(row), Err(StorageError::InvalidData(_))));
    }
}
