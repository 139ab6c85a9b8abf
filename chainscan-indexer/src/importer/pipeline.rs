use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use chainscan_common::{
    models::{
        blockchain::{Block, BlockPayload},
        BlockHeight, ImportState,
    },
    node::NodeGateway,
    storage::{ImportTransaction, ImporterGateway},
};
use metrics::{counter, gauge, histogram};
use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::importer::{
    account::{collect_account_activity, AccountActivity, AccountChangeCalculator},
    address::AddressResolver,
    baker::BakerStateReconciler,
    delegation::DelegationStateReconciler,
    finalization::FinalizationBackfiller,
    parameters::ChainParameterVersionStore,
    state::ImportStateCursor,
    with_retries, ImportError, ImportPhase, RetryPolicy,
};

#[derive(Clone, Debug)]
pub struct ImporterConfig {
    pub retry: RetryPolicy,
    /// How long to wait before re-polling the node when the chain head has
    /// not advanced past the import cursor.
    pub head_poll_interval: Duration,
    pub address_cache_size: NonZeroUsize,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            head_poll_interval: Duration::from_secs(2),
            address_cache_size: NonZeroUsize::new(10_000).expect("non-zero"),
        }
    }
}

/// The sequential per-block orchestrator.
///
/// Blocks are imported strictly in height order; block N+1 is not started
/// until block N is checkpointed, since later reconcilers read state mutated
/// by earlier blocks. All writes of one block share one transaction, which
/// commits only after every sub-step succeeded.
pub struct BlockImportPipeline<G, N> {
    gateway: Arc<G>,
    node: Arc<N>,
    accounts: AccountChangeCalculator<G, N>,
    parameters: ChainParameterVersionStore<G, N>,
    bakers: BakerStateReconciler<G, N>,
    delegation: DelegationStateReconciler<G>,
    finalization: FinalizationBackfiller<G>,
    cursor: ImportStateCursor<G>,
    config: ImporterConfig,
    progress: Mutex<SyncProgress>,
}

struct SyncProgress {
    last_report: Option<Instant>,
    last_report_height: BlockHeight,
}

impl<G, N> BlockImportPipeline<G, N>
where
    G: ImporterGateway + 'static,
    N: NodeGateway + 'static,
{
    pub fn new(gateway: Arc<G>, node: Arc<N>, config: ImporterConfig) -> Self {
        let resolver = Arc::new(AddressResolver::new(
            gateway.clone(),
            node.clone(),
            config.address_cache_size,
        ));
        Self {
            accounts: AccountChangeCalculator::new(resolver),
            parameters: ChainParameterVersionStore::new(gateway.clone(), node.clone()),
            bakers: BakerStateReconciler::new(gateway.clone(), node.clone()),
            delegation: DelegationStateReconciler::new(gateway.clone()),
            finalization: FinalizationBackfiller::new(gateway.clone()),
            cursor: ImportStateCursor::new(gateway.clone()),
            gateway,
            node,
            config,
            progress: Mutex::new(SyncProgress { last_report: None, last_report_height: 0 }),
        }
    }

    /// Logs throughput and an estimated time to the chain head, once a
    /// minute while syncing.
    async fn report_sync_progress(&self, height: BlockHeight, head: BlockHeight) {
        let mut progress = self.progress.lock().await;
        let now = Instant::now();
        let Some(last_report) = progress.last_report else {
            progress.last_report = Some(now);
            progress.last_report_height = height;
            return;
        };
        let elapsed = now.duration_since(last_report).as_secs_f64();
        if elapsed < 60.0 {
            return;
        }
        let blocks_processed = height.saturating_sub(progress.last_report_height);
        let blocks_per_minute = blocks_processed as f64 * 60.0 / elapsed;
        gauge!("importer_sync_block_rate").set(blocks_per_minute);
        let distance = head.saturating_sub(height);
        let minutes_remaining = if blocks_per_minute > 0.0 {
            (distance as f64 / blocks_per_minute) as u64
        } else {
            0
        };
        info!(
            height,
            blocks_per_minute = format!("{blocks_per_minute:.2}"),
            distance_to_head = distance,
            time_remaining = format!("{:02}h{:02}m", minutes_remaining / 60, minutes_remaining % 60),
            name = "SyncProgress"
        );
        progress.last_report = Some(now);
        progress.last_report_height = height;
    }

    /// Imports blocks until `shutdown` flips or an unrecoverable error
    /// occurs. The caller must treat an error as fatal for the whole
    /// process: sequencing cannot skip a block, so the only safe reaction is
    /// a restart from the committed checkpoint.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ImportError> {
        let mut next_height = match self.cursor.get_state().await? {
            Some(state) => state.max_imported_block_height + 1,
            None => 0,
        };
        info!(height = next_height, "Block import starting");

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, block import stopping");
                return Ok(());
            }
            let status = with_retries(&self.config.retry, "consensus_status", || async {
                Ok(self.node.consensus_status().await?)
            })
            .await?;
            gauge!("importer_chain_head_height").set(status.last_finalized_height as f64);

            if status.last_finalized_height < next_height {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.head_poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            while next_height <= status.last_finalized_height {
                if *shutdown.borrow() {
                    info!("Shutdown requested, block import stopping");
                    return Ok(());
                }
                with_retries(&self.config.retry, "import_block", || {
                    self.import_block(next_height)
                })
                .await?;
                self.report_sync_progress(next_height, status.last_finalized_height)
                    .await;
                next_height += 1;
            }
        }
    }

    /// Runs one block through `Fetching → Decoding → Reconciling →
    /// Committing → Checkpointed`.
    #[instrument(skip(self))]
    pub async fn import_block(&self, height: BlockHeight) -> Result<(), ImportError> {
        let started = Instant::now();

        trace!(phase = %ImportPhase::Fetching, "Import phase");
        let payload = self.node.block_payload(height).await?;
        if payload.block_info.height != height {
            return Err(ImportError::DataInconsistency(format!(
                "requested block {height} but the node returned {}",
                payload.block_info.height
            )));
        }

        trace!(phase = %ImportPhase::Decoding, "Import phase");
        let activity = collect_account_activity(&payload);

        trace!(phase = %ImportPhase::Reconciling, "Import phase");
        let mut state = match self.cursor.get_state().await? {
            Some(state) => {
                if height <= state.max_imported_block_height {
                    warn!(height, "Block already imported, skipping");
                    return Ok(());
                }
                if height != state.max_imported_block_height + 1 {
                    return Err(ImportError::Setup(format!(
                        "cannot import block {height}: last imported height is {}",
                        state.max_imported_block_height
                    )));
                }
                state
            }
            None => {
                if height != 0 {
                    return Err(ImportError::Setup(format!(
                        "no import state but block {height} was requested first"
                    )));
                }
                self.genesis_state(&payload).await?
            }
        };

        let mut tx = self
            .gateway
            .begin_block_transaction()
            .await?;
        if let Err(err) = self
            .reconcile(tx.as_mut(), &payload, &activity, &mut state)
            .await
        {
            self.cursor.discard_pending().await;
            if let Err(rollback_err) = tx.rollback().await {
                warn!(%rollback_err, "Rollback failed after import error");
            }
            return Err(err);
        }

        trace!(phase = %ImportPhase::Committing, "Import phase");
        if let Err(err) = tx.commit().await {
            self.cursor.discard_pending().await;
            return Err(err.into());
        }
        self.cursor.saved_changes_committed().await;

        trace!(phase = %ImportPhase::Checkpointed, "Import phase");
        counter!("importer_blocks_total").increment(1);
        histogram!("importer_block_import_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        debug!(
            transactions = payload.item_summaries.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Block imported"
        );
        Ok(())
    }

    async fn genesis_state(&self, payload: &BlockPayload) -> Result<ImportState, ImportError> {
        let status = self.node.consensus_status().await?;
        info!(genesis = %payload.block_info.hash, "No import state found, importing from genesis");
        Ok(ImportState {
            genesis_block_hash: payload.block_info.hash,
            max_imported_block_height: 0,
            last_block_slot_time: payload.block_info.slot_time,
            max_height_with_finalization_time: None,
            latest_chain_parameters_version: None,
            total_baker_count: 0,
            epoch_duration_millis: status.epoch_duration_millis,
            next_payday_time: payload.reward_status.next_payday_time,
        })
    }

    async fn reconcile(
        &self,
        tx: &mut dyn ImportTransaction,
        payload: &BlockPayload,
        activity: &AccountActivity,
        state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let info = &payload.block_info;
        tx.upsert_block(&Block {
            height: info.height,
            hash: info.hash,
            slot_time: info.slot_time,
            baker_id: info.baker_id,
            finalized: info.finalized,
            finalization_time_secs: None,
        })
        .await?;

        if !payload.accounts_created.is_empty() {
            tx.insert_accounts(&payload.accounts_created)
                .await?;
        }

        let updates = self
            .accounts
            .aggregate(activity, &info.hash)
            .await?;
        if !updates.is_empty() {
            tx.apply_account_updates(&updates).await?;
        }

        let (current, previous) = self
            .parameters
            .get_or_create(tx, &payload.chain_parameters, state, &info.hash)
            .await?;

        self.bakers
            .reconcile(
                tx,
                payload,
                &current.parameters,
                previous.as_ref().map(|p| &p.parameters),
                state,
            )
            .await?;
        self.delegation
            .reconcile(tx, payload, &current.parameters, state)
            .await?;
        self.finalization
            .backfill(tx, info, state)
            .await?;

        // The payday boundary check above reads the previous payday time, so
        // the state advance happens last.
        state.max_imported_block_height = info.height;
        state.last_block_slot_time = info.slot_time;
        state.next_payday_time = payload.reward_status.next_payday_time;
        self.cursor
            .save_changes(tx, state.clone())
            .await?;
        Ok(())
    }
}
