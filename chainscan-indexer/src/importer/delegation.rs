use std::{collections::HashMap, sync::Arc};

use chainscan_common::{
    models::{
        blockchain::{
            AccountTransactionEffects, BlockItemDetails, BlockPayload, DelegationEvent,
        },
        delegation::{
            DelegationTarget, Delegator, DelegatorCountDelta, PendingDelegationChange,
        },
        parameters::ChainParameters,
        AccountId, ImportState,
    },
    storage::{ImportTransaction, ImporterGateway},
};
use chrono::{Duration, NaiveDateTime};
use tracing::{debug, instrument};

use crate::importer::ImportError;

/// In-block working copy of one delegator; `None` means the delegator was
/// removed within this block.
type Workspace = HashMap<AccountId, Option<Delegator>>;

/// Mirrors the baker reconciliation for delegators, and additionally
/// maintains per-target pool deltas (delegator count and delegated stake),
/// aggregated across the block and flushed once, zero-net entries dropped.
pub struct DelegationStateReconciler<G> {
    gateway: Arc<G>,
}

impl<G> DelegationStateReconciler<G>
where
    G: ImporterGateway,
{
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    #[instrument(skip_all, fields(height = payload.block_info.height))]
    pub async fn reconcile(
        &self,
        tx: &mut dyn ImportTransaction,
        payload: &BlockPayload,
        parameters: &ChainParameters,
        _import_state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let slot_time = payload.block_info.slot_time;
        let mut touched: Workspace = HashMap::new();
        let mut pool_deltas: HashMap<DelegationTarget, DelegatorCountDelta> = HashMap::new();

        for event in delegation_events(payload) {
            self.apply_event(&mut touched, &mut pool_deltas, event, slot_time, parameters)
                .await?;
        }

        self.resolve_due_pending_changes(&mut touched, &mut pool_deltas, slot_time)
            .await?;

        let mut ids: Vec<AccountId> = touched.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            match &touched[&id] {
                Some(delegator) => tx.upsert_delegator(delegator).await?,
                None => tx.delete_delegator(id).await?,
            }
        }

        let mut deltas: Vec<DelegatorCountDelta> = pool_deltas
            .into_values()
            .filter(|delta| !delta.is_zero())
            .collect();
        if !deltas.is_empty() {
            deltas.sort_unstable_by_key(|delta| match delta.target {
                DelegationTarget::Baker { baker_id } => (0, baker_id),
                DelegationTarget::Passive => (1, 0),
            });
            tx.apply_delegator_count_deltas(&deltas)
                .await?;
        }
        Ok(())
    }

    async fn entry<'a>(
        &self,
        touched: &'a mut Workspace,
        id: AccountId,
    ) -> Result<&'a mut Delegator, ImportError> {
        if !touched.contains_key(&id) {
            let delegator = self
                .gateway
                .get_delegator(id)
                .await?
                .ok_or_else(|| {
                    ImportError::DataInconsistency(format!(
                        "event references unknown delegator {id}"
                    ))
                })?;
            touched.insert(id, Some(delegator));
        }
        touched
            .get_mut(&id)
            .expect("inserted above")
            .as_mut()
            .ok_or_else(|| {
                ImportError::DataInconsistency(format!(
                    "event targets delegator {id} removed earlier in the block"
                ))
            })
    }

    async fn apply_event(
        &self,
        touched: &mut Workspace,
        pool_deltas: &mut HashMap<DelegationTarget, DelegatorCountDelta>,
        event: &DelegationEvent,
        slot_time: NaiveDateTime,
        parameters: &ChainParameters,
    ) -> Result<(), ImportError> {
        let cooldown = Duration::seconds(parameters.delegator_cooldown_secs as i64);
        match event {
            DelegationEvent::Added { delegator_id } => {
                let exists = match touched.get(delegator_id) {
                    Some(slot) => slot.is_some(),
                    None => {
                        self.gateway
                            .get_delegator(*delegator_id)
                            .await?
                            .is_some()
                    }
                };
                if exists {
                    return Err(ImportError::DataInconsistency(format!(
                        "delegator {delegator_id} added twice"
                    )));
                }
                touched.insert(
                    *delegator_id,
                    Some(Delegator {
                        account_id: *delegator_id,
                        staked_amount: 0,
                        restake_earnings: false,
                        target: DelegationTarget::Passive,
                        pending_change: None,
                    }),
                );
                bump(pool_deltas, DelegationTarget::Passive, 1, 0);
            }
            DelegationEvent::Removed { delegator_id } => {
                let delegator = self.entry(touched, *delegator_id).await?;
                delegator.pending_change = Some(PendingDelegationChange::Removal {
                    effective_time: slot_time + cooldown,
                });
            }
            DelegationEvent::StakeIncreased { delegator_id, new_stake } => {
                let delegator = self.entry(touched, *delegator_id).await?;
                let diff = *new_stake as i64 - delegator.staked_amount as i64;
                delegator.staked_amount = *new_stake;
                let target = delegator.target;
                bump(pool_deltas, target, 0, diff);
            }
            DelegationEvent::StakeDecreased { delegator_id, new_stake } => {
                let delegator = self.entry(touched, *delegator_id).await?;
                delegator.pending_change = Some(PendingDelegationChange::ReduceStake {
                    effective_time: slot_time + cooldown,
                    new_stake: *new_stake,
                });
            }
            DelegationEvent::SetRestakeEarnings { delegator_id, restake_earnings } => {
                let delegator = self.entry(touched, *delegator_id).await?;
                delegator.restake_earnings = *restake_earnings;
            }
            DelegationEvent::SetDelegationTarget { delegator_id, target } => {
                let delegator = self.entry(touched, *delegator_id).await?;
                let previous = delegator.target;
                if previous != *target {
                    let stake = delegator.staked_amount as i64;
                    delegator.target = *target;
                    bump(pool_deltas, previous, -1, -stake);
                    bump(pool_deltas, *target, 1, stake);
                }
            }
        }
        Ok(())
    }

    async fn resolve_due_pending_changes(
        &self,
        touched: &mut Workspace,
        pool_deltas: &mut HashMap<DelegationTarget, DelegatorCountDelta>,
        slot_time: NaiveDateTime,
    ) -> Result<(), ImportError> {
        for delegator in self
            .gateway
            .delegators_with_pending_change_due(slot_time)
            .await?
        {
            touched
                .entry(delegator.account_id)
                .or_insert(Some(delegator));
        }

        let mut due: Vec<(NaiveDateTime, AccountId)> = touched
            .values()
            .filter_map(|slot| slot.as_ref())
            .filter_map(|delegator| {
                delegator
                    .pending_change
                    .as_ref()
                    .filter(|change| change.effective_time() <= slot_time)
                    .map(|change| (change.effective_time(), delegator.account_id))
            })
            .collect();
        due.sort_unstable();

        for (_, id) in due {
            let slot = touched
                .get_mut(&id)
                .expect("collected from the same map");
            let Some(delegator) = slot else { continue };
            match delegator.pending_change.take() {
                Some(PendingDelegationChange::Removal { .. }) => {
                    debug!(delegator_id = id, "Pending removal is due, delegator removed");
                    bump(
                        pool_deltas,
                        delegator.target,
                        -1,
                        -(delegator.staked_amount as i64),
                    );
                    *slot = None;
                }
                Some(PendingDelegationChange::ReduceStake { new_stake, .. }) => {
                    debug!(delegator_id = id, new_stake, "Pending stake reduction is due");
                    let diff = new_stake as i64 - delegator.staked_amount as i64;
                    delegator.staked_amount = new_stake;
                    let target = delegator.target;
                    bump(pool_deltas, target, 0, diff);
                }
                None => {}
            }
        }
        Ok(())
    }
}

fn delegation_events(payload: &BlockPayload) -> impl Iterator<Item = &DelegationEvent> {
    payload
        .item_summaries
        .iter()
        .filter_map(|summary| match &summary.details {
            BlockItemDetails::AccountTransaction {
                effects: AccountTransactionEffects::DelegationConfigured { events },
            } => Some(events.iter()),
            _ => None,
        })
        .flatten()
}

fn bump(
    pool_deltas: &mut HashMap<DelegationTarget, DelegatorCountDelta>,
    target: DelegationTarget,
    count: i64,
    stake: i64,
) {
    let delta = pool_deltas
        .entry(target)
        .or_insert(DelegatorCountDelta { target, count_delta: 0, stake_delta: 0 });
    delta.count_delta += count;
    delta.stake_delta += stake;
}

#[cfg(test)]
mod tests {
    use chainscan_common::{
        models::{blockchain::BlockItemSummary, TxHash},
        storage::{MockImportTransaction, MockImporterGateway},
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{account_address, block_payload, import_state, observed_parameters, ts};

    fn parameters() -> ChainParameters {
        observed_parameters().resolve(account_address(1, 0).canonical())
    }

    fn payload_with_events(slot_secs: i64, events: Vec<DelegationEvent>) -> BlockPayload {
        let mut payload = block_payload(10, slot_secs);
        payload.item_summaries = vec![BlockItemSummary {
            index: 0,
            hash: TxHash([3; 32]),
            sender: Some(account_address(5, 0)),
            cost: 0,
            details: BlockItemDetails::AccountTransaction {
                effects: AccountTransactionEffects::DelegationConfigured { events },
            },
        }];
        payload
    }

    fn delegator(id: AccountId, staked: u64, target: DelegationTarget) -> Delegator {
        Delegator {
            account_id: id,
            staked_amount: staked,
            restake_earnings: false,
            target,
            pending_change: None,
        }
    }

    fn quiet_gateway() -> MockImporterGateway {
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_delegators_with_pending_change_due()
            .returning(|_| Ok(vec![]));
        gateway
    }

    fn reconciler(
        gateway: MockImporterGateway,
    ) -> DelegationStateReconciler<MockImporterGateway> {
        DelegationStateReconciler::new(Arc::new(gateway))
    }

    #[tokio::test]
    async fn target_change_moves_count_and_stake_between_pools() {
        let mut gateway = quiet_gateway();
        gateway
            .expect_get_delegator()
            .returning(|id| Ok(Some(delegator(id, 300, DelegationTarget::Passive))));
        let reconciler = reconciler(gateway);

        let mut tx = MockImportTransaction::new();
        tx.expect_upsert_delegator()
            .times(1)
            .withf(|d| d.target == DelegationTarget::Baker { baker_id: 8 })
            .returning(|_| Ok(()));
        tx.expect_apply_delegator_count_deltas()
            .times(1)
            .withf(|deltas| {
                deltas ==
                    [
                        DelegatorCountDelta {
                            target: DelegationTarget::Baker { baker_id: 8 },
                            count_delta: 1,
                            stake_delta: 300,
                        },
                        DelegatorCountDelta {
                            target: DelegationTarget::Passive,
                            count_delta: -1,
                            stake_delta: -300,
                        },
                    ]
            })
            .returning(|_| Ok(()));
        reconciler
            .reconcile(
                &mut tx,
                &payload_with_events(
                    100,
                    vec![DelegationEvent::SetDelegationTarget {
                        delegator_id: 4,
                        target: DelegationTarget::Baker { baker_id: 8 },
                    }],
                ),
                &parameters(),
                &mut import_state(9, 0),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_then_remove_within_one_block_nets_out() {
        let mut gateway = quiet_gateway();
        gateway
            .expect_get_delegator()
            .returning(|_| Ok(None));
        let reconciler = reconciler(gateway);

        // Added in this block, then its removal cooldown is zero-length
        // because the pending change is already due: the pool gained and
        // lost the same delegator, so no delta row is written.
        let mut parameters = parameters();
        parameters.delegator_cooldown_secs = 0;

        let mut tx = MockImportTransaction::new();
        tx.expect_delete_delegator()
            .times(1)
            .withf(|id| *id == 4)
            .returning(|_| Ok(()));
        tx.expect_apply_delegator_count_deltas().times(0);
        reconciler
            .reconcile(
                &mut tx,
                &payload_with_events(
                    100,
                    vec![
                        DelegationEvent::Added { delegator_id: 4 },
                        DelegationEvent::Removed { delegator_id: 4 },
                    ],
                ),
                &parameters,
                &mut import_state(9, 0),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stake_increase_is_immediate_and_updates_the_pool() {
        let mut gateway = quiet_gateway();
        gateway
            .expect_get_delegator()
            .returning(|id| {
                Ok(Some(delegator(id, 100, DelegationTarget::Baker { baker_id: 2 })))
            });
        let reconciler = reconciler(gateway);

        let mut tx = MockImportTransaction::new();
        tx.expect_upsert_delegator()
            .times(1)
            .withf(|d| d.staked_amount == 250 && d.pending_change.is_none())
            .returning(|_| Ok(()));
        tx.expect_apply_delegator_count_deltas()
            .times(1)
            .withf(|deltas| {
                deltas ==
                    [DelegatorCountDelta {
                        target: DelegationTarget::Baker { baker_id: 2 },
                        count_delta: 0,
                        stake_delta: 150,
                    }]
            })
            .returning(|_| Ok(()));
        reconciler
            .reconcile(
                &mut tx,
                &payload_with_events(
                    100,
                    vec![DelegationEvent::StakeIncreased { delegator_id: 4, new_stake: 250 }],
                ),
                &parameters(),
                &mut import_state(9, 0),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn due_stake_reduction_applies_and_clears() {
        let effective = 1_800;
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_delegators_with_pending_change_due()
            .returning(move |_| {
                let mut d = delegator(6, 500, DelegationTarget::Passive);
                d.pending_change = Some(PendingDelegationChange::ReduceStake {
                    effective_time: ts(effective),
                    new_stake: 200,
                });
                Ok(vec![d])
            });
        let reconciler = reconciler(gateway);

        let mut tx = MockImportTransaction::new();
        tx.expect_upsert_delegator()
            .times(1)
            .withf(|d| d.staked_amount == 200 && d.pending_change.is_none())
            .returning(|_| Ok(()));
        tx.expect_apply_delegator_count_deltas()
            .times(1)
            .withf(|deltas| {
                deltas ==
                    [DelegatorCountDelta {
                        target: DelegationTarget::Passive,
                        count_delta: 0,
                        stake_delta: -300,
                    }]
            })
            .returning(|_| Ok(()));
        reconciler
            .reconcile(
                &mut tx,
                &block_payload(10, effective),
                &parameters(),
                &mut import_state(9, 0),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn event_for_unknown_delegator_is_a_data_inconsistency() {
        let mut gateway = quiet_gateway();
        gateway
            .expect_get_delegator()
            .returning(|_| Ok(None));
        let reconciler = reconciler(gateway);

        let mut tx = MockImportTransaction::new();
        let res = reconciler
            .reconcile(
                &mut tx,
                &payload_with_events(
                    100,
                    vec![DelegationEvent::SetRestakeEarnings {
                        delegator_id: 9,
                        restake_earnings: true,
                    }],
                ),
                &parameters(),
                &mut import_state(9, 0),
            )
            .await;
        assert!(matches!(res, Err(ImportError::DataInconsistency(_))));
    }
}
