diesel::table! {
    account (id) {
        id -> Int8,
        address -> Bytea,
        balance -> Int8,
        transaction_count -> Int8,
        created_at -> Timestamp,
    }
}

diesel::table! {
    block (height) {
        height -> Int8,
        hash -> Bytea,
        slot_time -> Timestamp,
        baker_id -> Nullable<Int8>,
        finalized -> Bool,
        finalization_time_secs -> Nullable<Float8>,
    }
}

diesel::table! {
    baker (id) {
        id -> Int8,
        removed_at -> Nullable<Timestamp>,
        staked_amount -> Nullable<Int8>,
        restake_earnings -> Nullable<Bool>,
        pending_change -> Nullable<Jsonb>,
        pending_change_effective_time -> Nullable<Timestamp>,
        pool_open_status -> Nullable<Text>,
        pool_metadata_url -> Nullable<Text>,
        pool_transaction_commission -> Nullable<Int4>,
        pool_baking_commission -> Nullable<Int4>,
        pool_finalization_commission -> Nullable<Int4>,
        pool_delegated_stake -> Nullable<Int8>,
        pool_delegator_count -> Nullable<Int8>,
        pool_payday_status -> Nullable<Jsonb>,
    }
}

diesel::table! {
    delegator (account_id) {
        account_id -> Int8,
        staked_amount -> Int8,
        restake_earnings -> Bool,
        target_baker_id -> Nullable<Int8>,
        pending_change -> Nullable<Jsonb>,
        pending_change_effective_time -> Nullable<Timestamp>,
    }
}

diesel::table! {
    chain_parameters (version) {
        version -> Int8,
        parameters -> Jsonb,
    }
}

diesel::table! {
    import_state (id) {
        id -> Int4,
        genesis_block_hash -> Bytea,
        max_imported_block_height -> Int8,
        last_block_slot_time -> Timestamp,
        max_height_with_finalization_time -> Nullable<Int8>,
        latest_chain_parameters_version -> Nullable<Int8>,
        total_baker_count -> Int8,
        epoch_duration_millis -> Int8,
        next_payday_time -> Nullable<Timestamp>,
    }
}

diesel::table! {
    passive_delegation (id) {
        id -> Int4,
        delegated_capital -> Int8,
        transaction_commission -> Int4,
        baking_commission -> Int4,
        finalization_commission -> Int4,
    }
}

diesel::table! {
    contract_read_height (job) {
        job -> Text,
        height -> Int8,
    }
}

diesel::table! {
    contract_event (block_height, transaction_index, event_index) {
        block_height -> Int8,
        transaction_index -> Int8,
        event_index -> Int4,
        slot_time -> Timestamp,
        transaction_hash -> Bytea,
        payload -> Jsonb,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    account,
    block,
    baker,
    delegator,
    chain_parameters,
    import_state,
    passive_delegation,
    contract_read_height,
    contract_event,
);
