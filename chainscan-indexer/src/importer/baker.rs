use std::{collections::HashMap, sync::Arc};

use chainscan_common::{
    models::{
        baker::{
            ActiveBakerState, Baker, BakerPool, BakerPoolOpenStatus, BakerState,
            CommissionRates, PendingBakerChange,
        },
        blockchain::{
            AccountTransactionEffects, BakerEvent, BakerPoolStatus, BlockItemDetails,
            BlockPayload,
        },
        parameters::{ChainParameters, CommissionRanges},
        BakerId, ImportState,
    },
    node::NodeGateway,
    storage::{ImportTransaction, ImporterGateway},
};
use chrono::{Duration, NaiveDateTime};
use tracing::{debug, info, instrument};

use crate::importer::ImportError;

/// Whether `slot_time` crossed the payday boundary recorded on the import
/// state.
pub(crate) fn is_payday_boundary(state: &ImportState, slot_time: NaiveDateTime) -> bool {
    state
        .next_payday_time
        .is_some_and(|payday| slot_time >= payday)
}

/// Applies validator protocol events and cooldown expiries to the baker
/// projection, one block at a time.
///
/// Per block, in order: apply incoming events, resolve due pending changes
/// (this runs even on blocks without baker events, cooldowns expire on their
/// own), clamp commissions when a parameter transition narrowed a range, and
/// refresh payday snapshots on payday boundaries. All touched bakers are
/// flushed once, in id order.
pub struct BakerStateReconciler<G, N> {
    gateway: Arc<G>,
    node: Arc<N>,
}

impl<G, N> BakerStateReconciler<G, N>
where
    G: ImporterGateway,
    N: NodeGateway,
{
    pub fn new(gateway: Arc<G>, node: Arc<N>) -> Self {
        Self { gateway, node }
    }

    #[instrument(skip_all, fields(height = payload.block_info.height))]
    pub async fn reconcile(
        &self,
        tx: &mut dyn ImportTransaction,
        payload: &BlockPayload,
        parameters: &ChainParameters,
        previous_parameters: Option<&ChainParameters>,
        import_state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let slot_time = payload.block_info.slot_time;
        let mut touched: HashMap<BakerId, Baker> = HashMap::new();

        for event in baker_events(payload) {
            self.apply_event(&mut touched, event, slot_time, parameters, import_state)
                .await?;
        }

        self.resolve_due_pending_changes(&mut touched, slot_time, import_state)
            .await?;

        if let Some(previous) = previous_parameters {
            if parameters
                .commission_ranges
                .narrows(&previous.commission_ranges)
            {
                info!("Commission ranges narrowed, clamping baker commissions");
                self.clamp_commissions(&mut touched, &parameters.commission_ranges)
                    .await?;
            }
        }

        if is_payday_boundary(import_state, slot_time) {
            self.refresh_payday_snapshots(tx, &mut touched, payload)
                .await?;
        }

        let mut ids: Vec<BakerId> = touched.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            tx.upsert_baker(&touched[id]).await?;
        }
        Ok(())
    }

    /// Loads a baker into the in-block working set, failing if the id is
    /// unknown: protocol events always follow the creation of what they
    /// reference in the ordered stream.
    async fn entry<'a>(
        &self,
        touched: &'a mut HashMap<BakerId, Baker>,
        id: BakerId,
    ) -> Result<&'a mut Baker, ImportError> {
        if !touched.contains_key(&id) {
            let baker = self
                .gateway
                .get_baker(id)
                .await?
                .ok_or_else(|| {
                    ImportError::DataInconsistency(format!("event references unknown baker {id}"))
                })?;
            touched.insert(id, baker);
        }
        Ok(touched
            .get_mut(&id)
            .expect("inserted above"))
    }

    async fn apply_event(
        &self,
        touched: &mut HashMap<BakerId, Baker>,
        event: &BakerEvent,
        slot_time: NaiveDateTime,
        parameters: &ChainParameters,
        import_state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let cooldown = Duration::seconds(parameters.pool_owner_cooldown_secs as i64);
        match event {
            BakerEvent::Added { baker_id, staked_amount, restake_earnings } => {
                let existing = match touched.get(baker_id) {
                    Some(baker) => Some(baker.clone()),
                    None => self.gateway.get_baker(*baker_id).await?,
                };
                if matches!(existing, Some(Baker { state: BakerState::Active(_), .. })) {
                    return Err(ImportError::DataInconsistency(format!(
                        "baker {baker_id} added twice"
                    )));
                }
                touched.insert(
                    *baker_id,
                    Baker {
                        id: *baker_id,
                        state: BakerState::Active(ActiveBakerState {
                            staked_amount: *staked_amount,
                            restake_earnings: *restake_earnings,
                            pending_change: None,
                            pool: Some(default_pool(&parameters.commission_ranges)),
                        }),
                    },
                );
                import_state.total_baker_count += 1;
            }
            BakerEvent::Removed { baker_id } => {
                let baker = self.entry(touched, *baker_id).await?;
                let active = active_mut(baker)?;
                active.pending_change = Some(PendingBakerChange::Removal {
                    effective_time: slot_time + cooldown,
                });
            }
            BakerEvent::StakeIncreased { baker_id, new_stake } => {
                let baker = self.entry(touched, *baker_id).await?;
                active_mut(baker)?.staked_amount = *new_stake;
            }
            BakerEvent::StakeDecreased { baker_id, new_stake } => {
                let baker = self.entry(touched, *baker_id).await?;
                let active = active_mut(baker)?;
                active.pending_change = Some(PendingBakerChange::ReduceStake {
                    effective_time: slot_time + cooldown,
                    new_stake: *new_stake,
                });
            }
            BakerEvent::SetRestakeEarnings { baker_id, restake_earnings } => {
                let baker = self.entry(touched, *baker_id).await?;
                active_mut(baker)?.restake_earnings = *restake_earnings;
            }
            BakerEvent::SetOpenStatus { baker_id, open_status } => {
                let baker = self.entry(touched, *baker_id).await?;
                pool_mut(baker, &parameters.commission_ranges)?.open_status = *open_status;
            }
            BakerEvent::SetMetadataUrl { baker_id, metadata_url } => {
                let baker = self.entry(touched, *baker_id).await?;
                pool_mut(baker, &parameters.commission_ranges)?.metadata_url =
                    metadata_url.clone();
            }
            BakerEvent::SetTransactionFeeCommission { baker_id, commission } => {
                let baker = self.entry(touched, *baker_id).await?;
                pool_mut(baker, &parameters.commission_ranges)?
                    .commission_rates
                    .transaction = *commission;
            }
            BakerEvent::SetBakingRewardCommission { baker_id, commission } => {
                let baker = self.entry(touched, *baker_id).await?;
                pool_mut(baker, &parameters.commission_ranges)?
                    .commission_rates
                    .baking = *commission;
            }
            BakerEvent::SetFinalizationRewardCommission { baker_id, commission } => {
                let baker = self.entry(touched, *baker_id).await?;
                pool_mut(baker, &parameters.commission_ranges)?
                    .commission_rates
                    .finalization = *commission;
            }
        }
        Ok(())
    }

    /// Applies every pending change due at `slot_time`, ordered by effective
    /// time then baker id for determinism. The change is cleared exactly
    /// once applied.
    async fn resolve_due_pending_changes(
        &self,
        touched: &mut HashMap<BakerId, Baker>,
        slot_time: NaiveDateTime,
        import_state: &mut ImportState,
    ) -> Result<(), ImportError> {
        for baker in self
            .gateway
            .bakers_with_pending_change_due(slot_time)
            .await?
        {
            // The in-block state is fresher than the store's.
            touched.entry(baker.id).or_insert(baker);
        }

        let mut due: Vec<(NaiveDateTime, BakerId)> = touched
            .values()
            .filter_map(|baker| match &baker.state {
                BakerState::Active(active) => active
                    .pending_change
                    .as_ref()
                    .filter(|change| change.effective_time() <= slot_time)
                    .map(|change| (change.effective_time(), baker.id)),
                BakerState::Removed { .. } => None,
            })
            .collect();
        due.sort_unstable();

        for (effective_time, id) in due {
            let baker = touched
                .get_mut(&id)
                .expect("collected from the same map");
            let change = match &mut baker.state {
                BakerState::Active(active) => active.pending_change.take(),
                BakerState::Removed { .. } => None,
            };
            match change {
                Some(PendingBakerChange::Removal { .. }) => {
                    debug!(baker_id = id, "Pending removal is due, baker removed");
                    baker.state = BakerState::Removed { removed_at: effective_time };
                    import_state.total_baker_count =
                        import_state.total_baker_count.saturating_sub(1);
                }
                Some(PendingBakerChange::ReduceStake { new_stake, .. }) => {
                    debug!(baker_id = id, new_stake, "Pending stake reduction is due");
                    if let BakerState::Active(active) = &mut baker.state {
                        active.staked_amount = new_stake;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Clamps every existing commission into the new, narrower ranges.
    /// Bakers already inside the ranges are left untouched and unwritten.
    async fn clamp_commissions(
        &self,
        touched: &mut HashMap<BakerId, Baker>,
        ranges: &CommissionRanges,
    ) -> Result<(), ImportError> {
        for mut baker in self.gateway.active_bakers().await? {
            if touched.contains_key(&baker.id) {
                continue;
            }
            if clamp_pool(&mut baker, ranges) {
                touched.insert(baker.id, baker);
            }
        }
        for baker in touched.values_mut() {
            clamp_pool(baker, ranges);
        }
        Ok(())
    }

    /// Replaces each pool's payday snapshot with the node's, wholesale. The
    /// payload carries the snapshots on payday blocks; when it does not, the
    /// pools are point-queried as of this block.
    async fn refresh_payday_snapshots(
        &self,
        tx: &mut dyn ImportTransaction,
        touched: &mut HashMap<BakerId, Baker>,
        payload: &BlockPayload,
    ) -> Result<(), ImportError> {
        let block_hash = payload.block_info.hash;
        let statuses: Vec<BakerPoolStatus> = match &payload.baker_pool_statuses {
            Some(statuses) => statuses.clone(),
            None => {
                let mut ids: Vec<BakerId> = self
                    .gateway
                    .active_bakers()
                    .await?
                    .into_iter()
                    .map(|b| b.id)
                    .collect();
                ids.extend(touched.values().filter_map(|b| {
                    matches!(b.state, BakerState::Active(_)).then_some(b.id)
                }));
                ids.sort_unstable();
                ids.dedup();
                let mut statuses = Vec::with_capacity(ids.len());
                for id in ids {
                    statuses.push(
                        self.node
                            .baker_pool_status(id, &block_hash)
                            .await?,
                    );
                }
                statuses
            }
        };

        info!(pools = statuses.len(), "Payday boundary, refreshing pool snapshots");
        for status in statuses {
            if !touched.contains_key(&status.baker_id) {
                let baker = self
                    .gateway
                    .get_baker(status.baker_id)
                    .await?
                    .ok_or_else(|| {
                        ImportError::DataInconsistency(format!(
                            "payday snapshot for unknown baker {}",
                            status.baker_id
                        ))
                    })?;
                touched.insert(status.baker_id, baker);
            }
            let baker = touched
                .get_mut(&status.baker_id)
                .expect("inserted above");
            if let BakerState::Active(active) = &mut baker.state {
                let pool = active.pool.get_or_insert_with(|| BakerPool {
                    open_status: BakerPoolOpenStatus::ClosedForAll,
                    metadata_url: String::new(),
                    commission_rates: status.payday_status.commission_rates,
                    delegated_stake: 0,
                    delegator_count: 0,
                    payday_status: None,
                });
                pool.payday_status = Some(status.payday_status.clone());
            }
        }

        let passive = match &payload.passive_delegation_status {
            Some(status) => status.clone(),
            None => {
                self.node
                    .passive_delegation_status(&block_hash)
                    .await?
            }
        };
        tx.upsert_passive_delegation(&passive)
            .await?;
        Ok(())
    }
}

fn baker_events(payload: &BlockPayload) -> impl Iterator<Item = &BakerEvent> {
    payload
        .item_summaries
        .iter()
        .filter_map(|summary| match &summary.details {
            BlockItemDetails::AccountTransaction {
                effects: AccountTransactionEffects::BakerConfigured { events },
            } => Some(events.iter()),
            _ => None,
        })
        .flatten()
}

fn active_mut(baker: &mut Baker) -> Result<&mut ActiveBakerState, ImportError> {
    match &mut baker.state {
        BakerState::Active(active) => Ok(active),
        BakerState::Removed { .. } => Err(ImportError::DataInconsistency(format!(
            "event targets removed baker {}",
            baker.id
        ))),
    }
}

fn pool_mut<'a>(
    baker: &'a mut Baker,
    ranges: &CommissionRanges,
) -> Result<&'a mut BakerPool, ImportError> {
    let id = baker.id;
    let active = active_mut(baker)?;
    Ok(active
        .pool
        .get_or_insert_with(|| {
            debug!(baker_id = id, "Pool configured before explicit creation");
            default_pool(ranges)
        }))
}

fn default_pool(ranges: &CommissionRanges) -> BakerPool {
    BakerPool {
        open_status: BakerPoolOpenStatus::ClosedForAll,
        metadata_url: String::new(),
        commission_rates: CommissionRates {
            transaction: ranges.transaction.min,
            baking: ranges.baking.min,
            finalization: ranges.finalization.min,
        },
        delegated_stake: 0,
        delegator_count: 0,
        payday_status: None,
    }
}

fn clamp_pool(baker: &mut Baker, ranges: &CommissionRanges) -> bool {
    match &mut baker.state {
        BakerState::Active(ActiveBakerState { pool: Some(pool), .. }) => {
            pool.commission_rates.clamp_to(ranges)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use chainscan_common::{
        models::{
            baker::PaydayPoolStatus,
            blockchain::{BlockItemSummary, PassiveDelegationStatus},
            Commission, TxHash,
        },
        node::MockNodeGateway,
        storage::{MockImportTransaction, MockImporterGateway},
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{
        account_address, active_baker, block_payload, commission_ranges, import_state,
        observed_parameters, rates, ts,
    };

    fn reconciler(
        gateway: MockImporterGateway,
        node: MockNodeGateway,
    ) -> BakerStateReconciler<MockImporterGateway, MockNodeGateway> {
        BakerStateReconciler::new(Arc::new(gateway), Arc::new(node))
    }

    fn parameters() -> ChainParameters {
        observed_parameters().resolve(account_address(1, 0).canonical())
    }

    fn payload_with_events(slot_secs: i64, events: Vec<BakerEvent>) -> BlockPayload {
        let mut payload = block_payload(10, slot_secs);
        payload.item_summaries = vec![BlockItemSummary {
            index: 0,
            hash: TxHash([2; 32]),
            sender: Some(account_address(5, 0)),
            cost: 0,
            details: BlockItemDetails::AccountTransaction {
                effects: AccountTransactionEffects::BakerConfigured { events },
            },
        }];
        payload
    }

    fn pending_removal_baker(id: BakerId, effective_secs: i64) -> Baker {
        let mut baker = active_baker(id, 1_000);
        if let BakerState::Active(active) = &mut baker.state {
            active.pending_change =
                Some(PendingBakerChange::Removal { effective_time: ts(effective_secs) });
        }
        baker
    }

    fn quiet_gateway() -> MockImporterGateway {
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_bakers_with_pending_change_due()
            .returning(|_| Ok(vec![]));
        gateway
    }

    #[tokio::test]
    async fn pending_removal_is_not_applied_before_its_effective_time() {
        let effective = 3_600;
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_bakers_with_pending_change_due()
            .returning(move |at| {
                if at >= ts(effective) {
                    Ok(vec![pending_removal_baker(1, effective)])
                } else {
                    Ok(vec![])
                }
            });
        let reconciler = reconciler(gateway, MockNodeGateway::new());

        let mut tx = MockImportTransaction::new();
        tx.expect_upsert_baker().times(0);
        let mut state = import_state(9, 0);
        state.total_baker_count = 1;
        reconciler
            .reconcile(
                &mut tx,
                &block_payload(10, effective - 60),
                &parameters(),
                None,
                &mut state,
            )
            .await
            .unwrap();
        assert_eq!(state.total_baker_count, 1);
    }

    #[tokio::test]
    async fn due_pending_removal_removes_the_baker_and_clears_the_change() {
        let effective = 3_600;
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_bakers_with_pending_change_due()
            .returning(move |_| Ok(vec![pending_removal_baker(1, effective)]));
        let reconciler = reconciler(gateway, MockNodeGateway::new());

        let mut tx = MockImportTransaction::new();
        tx.expect_upsert_baker()
            .times(1)
            .withf(move |baker| {
                baker.id == 1 &&
                    baker.state == BakerState::Removed { removed_at: ts(effective) }
            })
            .returning(|_| Ok(()));
        let mut state = import_state(9, 0);
        state.total_baker_count = 3;
        reconciler
            .reconcile(&mut tx, &block_payload(10, effective), &parameters(), None, &mut state)
            .await
            .unwrap();
        assert_eq!(state.total_baker_count, 2);
    }

    #[tokio::test]
    async fn stake_decrease_schedules_a_cooldown_gated_reduction() {
        let slot = 1_000;
        let cooldown = parameters().pool_owner_cooldown_secs as i64;
        let mut tx = MockImportTransaction::new();
        tx.expect_upsert_baker()
            .times(1)
            .withf(move |baker| match &baker.state {
                BakerState::Active(active) => {
                    // Stake unchanged until the cooldown expires.
                    active.staked_amount == 1_000 &&
                        active.pending_change ==
                            Some(PendingBakerChange::ReduceStake {
                                effective_time: ts(slot + cooldown),
                                new_stake: 400,
                            })
                }
                _ => false,
            })
            .returning(|_| Ok(()));

        let mut gateway = quiet_gateway();
        gateway
            .expect_get_baker()
            .returning(|id| Ok(Some(active_baker(id, 1_000))));
        let reconciler =
            BakerStateReconciler::new(Arc::new(gateway), Arc::new(MockNodeGateway::new()));
        reconciler
            .reconcile(
                &mut tx,
                &payload_with_events(
                    slot,
                    vec![BakerEvent::StakeDecreased { baker_id: 1, new_stake: 400 }],
                ),
                &parameters(),
                None,
                &mut import_state(9, 0),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn added_baker_is_counted_and_gets_a_default_pool() {
        let mut gateway = quiet_gateway();
        gateway
            .expect_get_baker()
            .returning(|_| Ok(None));
        let reconciler = reconciler(gateway, MockNodeGateway::new());

        let mut tx = MockImportTransaction::new();
        tx.expect_upsert_baker()
            .times(1)
            .withf(|baker| match &baker.state {
                BakerState::Active(active) => {
                    active.staked_amount == 500 && !active.restake_earnings &&
                        active.pool.is_some()
                }
                _ => false,
            })
            .returning(|_| Ok(()));
        let mut state = import_state(9, 0);
        reconciler
            .reconcile(
                &mut tx,
                &payload_with_events(
                    100,
                    vec![BakerEvent::Added {
                        baker_id: 7,
                        staked_amount: 500,
                        restake_earnings: false,
                    }],
                ),
                &parameters(),
                None,
                &mut state,
            )
            .await
            .unwrap();
        assert_eq!(state.total_baker_count, 1);
    }

    #[tokio::test]
    async fn event_for_unknown_baker_is_a_data_inconsistency() {
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_get_baker()
            .returning(|_| Ok(None));
        let reconciler = reconciler(gateway, MockNodeGateway::new());

        let mut tx = MockImportTransaction::new();
        let res = reconciler
            .reconcile(
                &mut tx,
                &payload_with_events(
                    100,
                    vec![BakerEvent::StakeIncreased { baker_id: 9, new_stake: 1 }],
                ),
                &parameters(),
                None,
                &mut import_state(9, 0),
            )
            .await;
        assert!(matches!(res, Err(ImportError::DataInconsistency(_))));
    }

    #[tokio::test]
    async fn narrowed_ranges_clamp_out_of_range_commissions_only() {
        let mut gateway = quiet_gateway();
        gateway.expect_active_bakers().returning(|| {
            let mut low = active_baker(1, 100);
            if let BakerState::Active(active) = &mut low.state {
                active.pool.as_mut().unwrap().commission_rates = rates(1_000);
            }
            let mut inside = active_baker(2, 100);
            if let BakerState::Active(active) = &mut inside.state {
                inside_rates(&mut active.pool.as_mut().unwrap().commission_rates);
            }
            Ok(vec![low, inside])
        });
        fn inside_rates(rates: &mut CommissionRates) {
            rates.transaction = Commission(30_000);
            rates.baking = Commission(30_000);
            rates.finalization = Commission(30_000);
        }
        let reconciler = reconciler(gateway, MockNodeGateway::new());

        let mut previous = parameters();
        previous.commission_ranges = commission_ranges(0, 100_000);
        let mut current = parameters();
        current.commission_ranges = commission_ranges(20_000, 50_000);

        let mut tx = MockImportTransaction::new();
        // Only the out-of-range baker is rewritten.
        tx.expect_upsert_baker()
            .times(1)
            .withf(|baker| {
                baker.id == 1 &&
                    matches!(
                        &baker.state,
                        BakerState::Active(active)
                            if active.pool.as_ref().unwrap().commission_rates == rates(20_000)
                    )
            })
            .returning(|_| Ok(()));
        reconciler
            .reconcile(
                &mut tx,
                &block_payload(10, 100),
                &current,
                Some(&previous),
                &mut import_state(9, 0),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn widened_ranges_do_not_touch_existing_commissions() {
        let gateway = quiet_gateway();
        let reconciler = reconciler(gateway, MockNodeGateway::new());

        let mut previous = parameters();
        previous.commission_ranges = commission_ranges(20_000, 50_000);
        let mut current = parameters();
        current.commission_ranges = commission_ranges(0, 100_000);

        let mut tx = MockImportTransaction::new();
        tx.expect_upsert_baker().times(0);
        reconciler
            .reconcile(
                &mut tx,
                &block_payload(10, 100),
                &current,
                Some(&previous),
                &mut import_state(9, 0),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn payday_replaces_pool_snapshots_wholesale() {
        let mut gateway = quiet_gateway();
        gateway
            .expect_get_baker()
            .returning(|id| {
                let mut baker = active_baker(id, 1_000);
                if let BakerState::Active(active) = &mut baker.state {
                    active.pool.as_mut().unwrap().payday_status = Some(PaydayPoolStatus {
                        baker_equity_capital: 1,
                        delegated_capital: 1,
                        effective_stake: 1,
                        lottery_power: 0.5,
                        commission_rates: rates(1),
                    });
                }
                Ok(Some(baker))
            });
        let reconciler = reconciler(gateway, MockNodeGateway::new());

        let fresh = PaydayPoolStatus {
            baker_equity_capital: 9_000,
            delegated_capital: 4_000,
            effective_stake: 13_000,
            lottery_power: 0.25,
            commission_rates: rates(12_000),
        };
        let mut payload = block_payload(10, 7_200);
        payload.baker_pool_statuses =
            Some(vec![BakerPoolStatus { baker_id: 1, payday_status: fresh.clone() }]);
        payload.passive_delegation_status = Some(PassiveDelegationStatus {
            delegated_capital: 77,
            commission_rates: rates(10_000),
        });

        let mut tx = MockImportTransaction::new();
        let expected = fresh.clone();
        tx.expect_upsert_baker()
            .times(1)
            .withf(move |baker| {
                matches!(
                    &baker.state,
                    BakerState::Active(active)
                        if active.pool.as_ref().unwrap().payday_status.as_ref() == Some(&expected)
                )
            })
            .returning(|_| Ok(()));
        tx.expect_upsert_passive_delegation()
            .times(1)
            .withf(|status| status.delegated_capital == 77)
            .returning(|_| Ok(()));

        let mut state = import_state(9, 0);
        state.next_payday_time = Some(ts(7_000));
        reconciler
            .reconcile(&mut tx, &payload, &parameters(), None, &mut state)
            .await
            .unwrap();
    }
}
