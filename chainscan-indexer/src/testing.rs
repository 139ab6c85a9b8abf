//! Shared fixtures for the importer test suites.

use chainscan_common::models::{
    baker::{ActiveBakerState, Baker, BakerPool, BakerPoolOpenStatus, BakerState, CommissionRates},
    blockchain::{BlockInfo, BlockPayload, RewardStatus},
    parameters::{
        CommissionRange, CommissionRanges, ObservedChainParameters, RewardParameters,
    },
    AccountAddress, Amount, BakerId, BlockHash, BlockHeight, Commission, ExchangeRate,
    ImportState, ADDRESS_BYTES, ALIAS_BYTES,
};
use chrono::{DateTime, NaiveDateTime};

pub fn ts(secs: i64) -> NaiveDateTime {
    DateTime::from_timestamp(secs, 0)
        .expect("timestamp in range")
        .naive_utc()
}

pub fn account_address(tag: u8, alias: u8) -> AccountAddress {
    let mut bytes = [0u8; ADDRESS_BYTES];
    bytes[0] = tag;
    bytes[ADDRESS_BYTES - ALIAS_BYTES] = alias;
    AccountAddress(bytes)
}

pub fn block_hash(height: BlockHeight) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&height.to_be_bytes());
    BlockHash(bytes)
}

pub fn commission_ranges(min: u32, max: u32) -> CommissionRanges {
    let range = CommissionRange { min: Commission(min), max: Commission(max) };
    CommissionRanges { transaction: range, baking: range, finalization: range }
}

pub fn observed_parameters() -> ObservedChainParameters {
    ObservedChainParameters {
        election_difficulty: Commission(2_500),
        euro_per_energy: ExchangeRate { numerator: 1, denominator: 50_000 },
        micro_ccd_per_euro: ExchangeRate { numerator: 50_000_000, denominator: 1 },
        pool_owner_cooldown_secs: 3_600,
        delegator_cooldown_secs: 1_800,
        account_creation_limit: 10,
        foundation_account_index: 1,
        minimum_equity_capital: 14_000_000_000,
        commission_ranges: commission_ranges(0, 100_000),
        reward_parameters: RewardParameters {
            mint_per_payday: Commission(261),
            baker_fee_share: Commission(45_000),
            gas_account_fee_share: Commission(45_000),
            gas_baker_reward: Commission(25_000),
            gas_finalization_proof_reward: Commission(500),
            gas_account_creation_reward: Commission(200),
            gas_chain_update_reward: Commission(50),
        },
    }
}

pub fn block_payload(height: BlockHeight, slot_secs: i64) -> BlockPayload {
    BlockPayload {
        block_info: BlockInfo {
            height,
            hash: block_hash(height),
            parent_hash: block_hash(height.saturating_sub(1)),
            slot_time: ts(slot_secs),
            baker_id: Some(1),
            finalized: true,
            finalization_proof: None,
        },
        item_summaries: vec![],
        special_events: vec![],
        accounts_created: vec![],
        reward_status: RewardStatus {
            total_amount: 0,
            total_staked_capital: 0,
            next_payday_time: None,
        },
        chain_parameters: observed_parameters(),
        baker_pool_statuses: None,
        passive_delegation_status: None,
    }
}

pub fn import_state(max_height: BlockHeight, slot_secs: i64) -> ImportState {
    ImportState {
        genesis_block_hash: block_hash(0),
        max_imported_block_height: max_height,
        last_block_slot_time: ts(slot_secs),
        max_height_with_finalization_time: None,
        latest_chain_parameters_version: Some(1),
        total_baker_count: 0,
        epoch_duration_millis: 3_600_000,
        next_payday_time: None,
    }
}

pub fn rates(value: u32) -> CommissionRates {
    CommissionRates {
        transaction: Commission(value),
        baking: Commission(value),
        finalization: Commission(value),
    }
}

pub fn active_baker(id: BakerId, staked: Amount) -> Baker {
    Baker {
        id,
        state: BakerState::Active(ActiveBakerState {
            staked_amount: staked,
            restake_earnings: true,
            pending_change: None,
            pool: Some(BakerPool {
                open_status: BakerPoolOpenStatus::OpenForAll,
                metadata_url: String::new(),
                commission_rates: rates(10_000),
                delegated_stake: 0,
                delegator_count: 0,
                payday_status: None,
            }),
        }),
    }
}
