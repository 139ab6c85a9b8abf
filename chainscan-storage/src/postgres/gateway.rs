use std::collections::HashMap;

use async_trait::async_trait;
use chainscan_common::{
    models::{
        account::{Account, AccountUpdate},
        baker::Baker,
        blockchain::{Block, PassiveDelegationStatus},
        contracts::ContractActivity,
        delegation::{DelegationTarget, Delegator, DelegatorCountDelta},
        parameters::ChainParametersVersion,
        AccountId, BakerId, BlockHash, BlockHeight, CanonicalAccountAddress, ImportState,
    },
    storage::{
        ContractCatchupGateway, ImportTransaction, ImporterGateway, StorageError,
    },
};
use chrono::NaiveDateTime;
use diesel::{prelude::*, sql_types::{BigInt, Text, Timestamp}, upsert::excluded};
use diesel_async::{
    pooled_connection::deadpool::Pool, scoped_futures::ScopedFutureExt, AsyncConnection,
    AsyncPgConnection, RunQueryDsl, TransactionManager,
};
use tracing::instrument;

use super::{
    orm::{
        self, AccountRow, BakerRow, BlockRow, ChainParametersRow, ContractEventRow,
        DelegatorRow, ImportStateRow, IMPORT_STATE_ROW_ID,
    },
    schema, PooledConnection, PostgresError,
};

type PgTransactionManager = <PooledConnection as AsyncConnection>::TransactionManager;

#[derive(Clone)]
pub struct PgImporterGateway {
    pool: Pool<AsyncPgConnection>,
}

impl PgImporterGateway {
    pub fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection, StorageError> {
        Ok(self
            .pool
            .get()
            .await
            .map_err(PostgresError::from)?)
    }
}

#[async_trait]
impl ImporterGateway for PgImporterGateway {
    async fn begin_block_transaction(
        &self,
    ) -> Result<Box<dyn ImportTransaction>, StorageError> {
        let mut conn = self.conn().await?;
        PgTransactionManager::begin_transaction(&mut conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(Box::new(PgImportTransaction { conn }))
    }

    #[instrument(skip_all)]
    async fn get_import_state(&self) -> Result<Option<ImportState>, StorageError> {
        let mut conn = self.conn().await?;
        schema::import_state::table
            .find(IMPORT_STATE_ROW_ID)
            .first::<ImportStateRow>(&mut conn)
            .await
            .optional()
            .map_err(PostgresError::from)?
            .map(ImportState::try_from)
            .transpose()
    }

    #[instrument(skip_all, fields(count = addresses.len()))]
    async fn account_ids_by_address(
        &self,
        addresses: &[CanonicalAccountAddress],
    ) -> Result<HashMap<CanonicalAccountAddress, AccountId>, StorageError> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn().await?;
        let raw: Vec<Vec<u8>> = addresses
            .iter()
            .map(|address| address.0.to_vec())
            .collect();
        let rows: Vec<(Vec<u8>, i64)> = schema::account::table
            .filter(schema::account::address.eq_any(raw))
            .select((schema::account::address, schema::account::id))
            .load(&mut conn)
            .await
            .map_err(PostgresError::from)?;
        rows.into_iter()
            .map(|(address, id)| {
                let address: [u8; 32] = address
                    .try_into()
                    .map_err(|_| orm::invalid("account address width"))?;
                Ok((CanonicalAccountAddress(address), id))
            })
            .collect()
    }

    #[instrument(skip_all, fields(baker_id = id))]
    async fn get_baker(&self, id: BakerId) -> Result<Option<Baker>, StorageError> {
        let mut conn = self.conn().await?;
        schema::baker::table
            .find(id)
            .first::<BakerRow>(&mut conn)
            .await
            .optional()
            .map_err(PostgresError::from)?
            .map(Baker::try_from)
            .transpose()
    }

    #[instrument(skip_all)]
    async fn active_bakers(&self) -> Result<Vec<Baker>, StorageError> {
        let mut conn = self.conn().await?;
        schema::baker::table
            .filter(schema::baker::removed_at.is_null())
            .order(schema::baker::id.asc())
            .load::<BakerRow>(&mut conn)
            .await
            .map_err(PostgresError::from)?
            .into_iter()
            .map(Baker::try_from)
            .collect()
    }

    #[instrument(skip_all)]
    async fn bakers_with_pending_change_due(
        &self,
        at: NaiveDateTime,
    ) -> Result<Vec<Baker>, StorageError> {
        let mut conn = self.conn().await?;
        schema::baker::table
            .filter(schema::baker::pending_change_effective_time.le(at))
            .order(schema::baker::id.asc())
            .load::<BakerRow>(&mut conn)
            .await
            .map_err(PostgresError::from)?
            .into_iter()
            .map(Baker::try_from)
            .collect()
    }

    #[instrument(skip_all, fields(delegator_id = id))]
    async fn get_delegator(&self, id: AccountId) -> Result<Option<Delegator>, StorageError> {
        let mut conn = self.conn().await?;
        schema::delegator::table
            .find(id)
            .first::<DelegatorRow>(&mut conn)
            .await
            .optional()
            .map_err(PostgresError::from)?
            .map(Delegator::try_from)
            .transpose()
    }

    #[instrument(skip_all)]
    async fn delegators_with_pending_change_due(
        &self,
        at: NaiveDateTime,
    ) -> Result<Vec<Delegator>, StorageError> {
        let mut conn = self.conn().await?;
        schema::delegator::table
            .filter(schema::delegator::pending_change_effective_time.le(at))
            .order(schema::delegator::account_id.asc())
            .load::<DelegatorRow>(&mut conn)
            .await
            .map_err(PostgresError::from)?
            .into_iter()
            .map(Delegator::try_from)
            .collect()
    }

    #[instrument(skip_all, fields(version))]
    async fn get_chain_parameters(
        &self,
        version: i64,
    ) -> Result<ChainParametersVersion, StorageError> {
        let mut conn = self.conn().await?;
        schema::chain_parameters::table
            .find(version)
            .first::<ChainParametersRow>(&mut conn)
            .await
            .optional()
            .map_err(PostgresError::from)?
            .ok_or_else(|| {
                StorageError::NotFound("ChainParameters".to_string(), version.to_string())
            })?
            .try_into()
    }

    #[instrument(skip_all)]
    async fn get_block_by_hash(&self, hash: &BlockHash) -> Result<Option<Block>, StorageError> {
        let mut conn = self.conn().await?;
        schema::block::table
            .filter(schema::block::hash.eq(hash.0.to_vec()))
            .first::<BlockRow>(&mut conn)
            .await
            .optional()
            .map_err(PostgresError::from)?
            .map(Block::try_from)
            .transpose()
    }
}

/// One open database transaction covering all writes of one block. Writes
/// run on the dedicated connection holding the transaction; `commit` or
/// `rollback` release it.
pub struct PgImportTransaction {
    conn: PooledConnection,
}

#[async_trait]
impl ImportTransaction for PgImportTransaction {
    async fn upsert_block(&mut self, block: &Block) -> Result<(), StorageError> {
        let row = BlockRow::try_from(block)?;
        diesel::insert_into(schema::block::table)
            .values(&row)
            .on_conflict(schema::block::height)
            .do_update()
            // The finalization time is deliberately left out: once set it is
            // never overwritten, not even by a replayed insert.
            .set((
                schema::block::hash.eq(excluded(schema::block::hash)),
                schema::block::slot_time.eq(excluded(schema::block::slot_time)),
                schema::block::baker_id.eq(excluded(schema::block::baker_id)),
                schema::block::finalized.eq(excluded(schema::block::finalized)),
            ))
            .execute(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn insert_accounts(&mut self, accounts: &[Account]) -> Result<(), StorageError> {
        let rows = accounts
            .iter()
            .map(AccountRow::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        diesel::insert_into(schema::account::table)
            .values(&rows)
            .on_conflict(schema::account::id)
            .do_nothing()
            .execute(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn apply_account_updates(
        &mut self,
        updates: &[AccountUpdate],
    ) -> Result<(), StorageError> {
        for update in updates {
            let changed = diesel::update(schema::account::table.find(update.account_id))
                .set((
                    schema::account::balance
                        .eq(schema::account::balance + update.balance_delta),
                    schema::account::transaction_count
                        .eq(schema::account::transaction_count + update.tx_count_delta as i64),
                ))
                .execute(&mut self.conn)
                .await
                .map_err(PostgresError::from)?;
            if changed == 0 {
                return Err(StorageError::NotFound(
                    "Account".to_string(),
                    update.account_id.to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn upsert_baker(&mut self, baker: &Baker) -> Result<(), StorageError> {
        let row = BakerRow::try_from(baker)?;
        diesel::insert_into(schema::baker::table)
            .values(&row)
            .on_conflict(schema::baker::id)
            .do_update()
            .set(&row)
            .execute(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn upsert_delegator(&mut self, delegator: &Delegator) -> Result<(), StorageError> {
        let row = DelegatorRow::try_from(delegator)?;
        diesel::insert_into(schema::delegator::table)
            .values(&row)
            .on_conflict(schema::delegator::account_id)
            .do_update()
            .set(&row)
            .execute(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn delete_delegator(&mut self, id: AccountId) -> Result<(), StorageError> {
        diesel::delete(schema::delegator::table.find(id))
            .execute(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn apply_delegator_count_deltas(
        &mut self,
        deltas: &[DelegatorCountDelta],
    ) -> Result<(), StorageError> {
        for delta in deltas {
            match delta.target {
                DelegationTarget::Baker { baker_id } => {
                    diesel::sql_query(
                        "UPDATE baker SET \
                         pool_delegated_stake = COALESCE(pool_delegated_stake, 0) + $1, \
                         pool_delegator_count = COALESCE(pool_delegator_count, 0) + $2 \
                         WHERE id = $3",
                    )
                    .bind::<BigInt, _>(delta.stake_delta)
                    .bind::<BigInt, _>(delta.count_delta)
                    .bind::<BigInt, _>(baker_id)
                    .execute(&mut self.conn)
                    .await
                    .map_err(PostgresError::from)?;
                }
                DelegationTarget::Passive => {
                    diesel::sql_query(
                        "INSERT INTO passive_delegation \
                         (id, delegated_capital, transaction_commission, baking_commission, \
                          finalization_commission) \
                         VALUES (1, $1, 0, 0, 0) \
                         ON CONFLICT (id) DO UPDATE SET delegated_capital = \
                         passive_delegation.delegated_capital + EXCLUDED.delegated_capital",
                    )
                    .bind::<BigInt, _>(delta.stake_delta)
                    .execute(&mut self.conn)
                    .await
                    .map_err(PostgresError::from)?;
                }
            }
        }
        Ok(())
    }

    async fn upsert_passive_delegation(
        &mut self,
        status: &PassiveDelegationStatus,
    ) -> Result<(), StorageError> {
        let capital = i64::try_from(status.delegated_capital)
            .map_err(|_| orm::invalid("delegated capital out of range"))?;
        diesel::insert_into(schema::passive_delegation::table)
            .values((
                schema::passive_delegation::id.eq(1),
                schema::passive_delegation::delegated_capital.eq(capital),
                schema::passive_delegation::transaction_commission
                    .eq(status.commission_rates.transaction.0 as i32),
                schema::passive_delegation::baking_commission
                    .eq(status.commission_rates.baking.0 as i32),
                schema::passive_delegation::finalization_commission
                    .eq(status.commission_rates.finalization.0 as i32),
            ))
            .on_conflict(schema::passive_delegation::id)
            .do_update()
            .set((
                schema::passive_delegation::delegated_capital.eq(capital),
                schema::passive_delegation::transaction_commission
                    .eq(status.commission_rates.transaction.0 as i32),
                schema::passive_delegation::baking_commission
                    .eq(status.commission_rates.baking.0 as i32),
                schema::passive_delegation::finalization_commission
                    .eq(status.commission_rates.finalization.0 as i32),
            ))
            .execute(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn insert_chain_parameters(
        &mut self,
        version: &ChainParametersVersion,
    ) -> Result<(), StorageError> {
        let row = ChainParametersRow::try_from(version)?;
        // Immutable rows: a replayed block re-inserts the same content, so
        // conflicts are simply ignored.
        diesel::insert_into(schema::chain_parameters::table)
            .values(&row)
            .on_conflict(schema::chain_parameters::version)
            .do_nothing()
            .execute(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn apply_finalization_times(
        &mut self,
        from_exclusive: Option<BlockHeight>,
        to_inclusive: BlockHeight,
        finalized_at: NaiveDateTime,
    ) -> Result<(), StorageError> {
        let from = from_exclusive
            .map(|height| height as i64)
            .unwrap_or(-1);
        diesel::sql_query(
            "UPDATE block SET finalization_time_secs = \
             ROUND(EXTRACT(EPOCH FROM ($1::timestamp - slot_time))::numeric, 1)::float8 \
             WHERE height > $2 AND height <= $3 AND finalization_time_secs IS NULL",
        )
        .bind::<Timestamp, _>(finalized_at)
        .bind::<BigInt, _>(from)
        .bind::<BigInt, _>(to_inclusive as i64)
        .execute(&mut self.conn)
        .await
        .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn save_import_state(&mut self, state: &ImportState) -> Result<(), StorageError> {
        let row = ImportStateRow::try_from(state)?;
        diesel::insert_into(schema::import_state::table)
            .values(&row)
            .on_conflict(schema::import_state::id)
            .do_update()
            .set(&row)
            .execute(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        PgTransactionManager::commit_transaction(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        PgTransactionManager::rollback_transaction(&mut self.conn)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }
}

#[async_trait]
impl ContractCatchupGateway for PgImporterGateway {
    #[instrument(skip_all, fields(job))]
    async fn read_height(&self, job: &str) -> Result<Option<BlockHeight>, StorageError> {
        let mut conn = self.conn().await?;
        let height: Option<i64> = schema::contract_read_height::table
            .find(job)
            .select(schema::contract_read_height::height)
            .first(&mut conn)
            .await
            .optional()
            .map_err(PostgresError::from)?;
        height
            .map(|height| {
                u64::try_from(height).map_err(|_| orm::invalid("negative read height"))
            })
            .transpose()
    }

    #[instrument(skip_all, fields(job, events = batch.len()))]
    async fn persist_activity(
        &self,
        job: &str,
        batch: &[ContractActivity],
    ) -> Result<(), StorageError> {
        let rows = batch
            .iter()
            .map(ContractEventRow::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let mut conn = self.conn().await?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                diesel::insert_into(schema::contract_event::table)
                    .values(&rows)
                    .on_conflict((
                        schema::contract_event::block_height,
                        schema::contract_event::transaction_index,
                        schema::contract_event::event_index,
                    ))
                    .do_nothing()
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(PostgresError::from)?;
        Ok(())
    }

    #[instrument(skip_all, fields(job, height))]
    async fn advance_read_height(
        &self,
        job: &str,
        height: BlockHeight,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn().await?;
        diesel::sql_query(
            "INSERT INTO contract_read_height (job, height) VALUES ($1, $2) \
             ON CONFLICT (job) DO UPDATE SET height = EXCLUDED.height \
             WHERE contract_read_height.height < EXCLUDED.height",
        )
        .bind::<Text, _>(job)
        .bind::<BigInt, _>(height as i64)
        .execute(&mut conn)
        .await
        .map_err(PostgresError::from)?;
        Ok(())
    }
}
