use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chainscan_common::{
    models::{
        account::AccountUpdate,
        blockchain::{
            AccountTransactionEffects, BlockItemDetails, BlockPayload, SpecialEvent,
        },
        contracts::ContractEvent,
        AccountAddress, AccountId, AmountDelta, BlockHash,
    },
    node::NodeGateway,
    storage::ImporterGateway,
};
use tracing::debug;

use crate::importer::{address::AddressResolver, ImportError};

/// One signed balance adjustment scoped to a block. Balance movements
/// presuppose account existence, so an update whose address does not resolve
/// is a fatal data inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub address: AccountAddress,
    pub delta: AmountDelta,
}

/// Account-facing activity extracted from one block payload: balance
/// updates plus best-effort transaction links (accounts a transaction
/// touched, used only for per-account transaction counts).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountActivity {
    pub balance_updates: Vec<BalanceUpdate>,
    pub transaction_links: Vec<AccountAddress>,
}

impl AccountActivity {
    fn balance(&mut self, address: AccountAddress, delta: AmountDelta) {
        self.balance_updates
            .push(BalanceUpdate { address, delta });
    }

    fn link(&mut self, address: AccountAddress) {
        self.transaction_links.push(address);
    }
}

/// Walks one payload and derives every account-level consequence: transfer
/// legs, fees, scheduled releases, contract value flows and reward
/// distributions.
pub fn collect_account_activity(payload: &BlockPayload) -> AccountActivity {
    let mut activity = AccountActivity::default();

    for summary in &payload.item_summaries {
        if let Some(sender) = summary.sender {
            activity.link(sender);
            if summary.cost > 0 {
                activity.balance(sender, -(summary.cost as AmountDelta));
            }
        }
        match &summary.details {
            BlockItemDetails::AccountTransaction { effects } => {
                collect_transaction_effects(&mut activity, summary.sender, effects)
            }
            BlockItemDetails::AccountCreation { address } => activity.link(*address),
            BlockItemDetails::ChainUpdate { .. } => {}
        }
    }

    for event in &payload.special_events {
        collect_special_event(&mut activity, event);
    }
    activity
}

fn collect_transaction_effects(
    activity: &mut AccountActivity,
    sender: Option<AccountAddress>,
    effects: &AccountTransactionEffects,
) {
    match effects {
        AccountTransactionEffects::Transferred { from, to, amount } => {
            activity.balance(*from, -(*amount as AmountDelta));
            activity.balance(*to, *amount as AmountDelta);
            activity.link(*to);
        }
        AccountTransactionEffects::TransferredWithSchedule { from, to, releases } => {
            let total: AmountDelta = releases
                .iter()
                .map(|r| r.amount as AmountDelta)
                .sum();
            activity.balance(*from, -total);
            activity.balance(*to, total);
            activity.link(*to);
        }
        AccountTransactionEffects::ContractInitialized { events } |
        AccountTransactionEffects::ContractUpdated { events } => {
            for event in events {
                collect_contract_event(activity, sender, event);
            }
        }
        AccountTransactionEffects::Rejected { reason } => {
            // Reject payloads may legitimately reference accounts that were
            // never created; linking is best effort.
            if let Some(address) = reason.referenced_account() {
                activity.link(address);
            }
        }
        AccountTransactionEffects::BakerConfigured { .. } |
        AccountTransactionEffects::DelegationConfigured { .. } |
        AccountTransactionEffects::DataRegistered => {}
    }
}

fn collect_contract_event(
    activity: &mut AccountActivity,
    sender: Option<AccountAddress>,
    event: &ContractEvent,
) {
    match event {
        ContractEvent::Initialized { amount, .. } => {
            if let Some(sender) = sender {
                if *amount > 0 {
                    activity.balance(sender, -(*amount as AmountDelta));
                }
            }
        }
        ContractEvent::Updated { instigator, amount, .. } => {
            if *amount > 0 {
                activity.balance(*instigator, -(*amount as AmountDelta));
            }
            activity.link(*instigator);
        }
        ContractEvent::Transferred { to, amount, .. } => {
            activity.balance(*to, *amount as AmountDelta);
            activity.link(*to);
        }
        ContractEvent::TokenTransfer { from, to, .. } => {
            if let Some(from) = from {
                activity.link(*from);
            }
            if let Some(to) = to {
                activity.link(*to);
            }
        }
        ContractEvent::TokenMint { owner, .. } | ContractEvent::TokenBurn { owner, .. } => {
            activity.link(*owner);
        }
        ContractEvent::Interrupted { .. } |
        ContractEvent::Resumed { .. } |
        ContractEvent::TokenMetadata { .. } => {}
    }
}

fn collect_special_event(activity: &mut AccountActivity, event: &SpecialEvent) {
    match event {
        SpecialEvent::BakingRewards { rewards } | SpecialEvent::FinalizationRewards { rewards } => {
            for reward in rewards {
                activity.balance(reward.account, reward.amount as AmountDelta);
            }
        }
        SpecialEvent::Mint { foundation_account, amount } => {
            activity.balance(*foundation_account, *amount as AmountDelta);
        }
        SpecialEvent::BlockReward { baker, baker_reward, foundation_account, foundation_charge } => {
            if *baker_reward > 0 {
                activity.balance(*baker, *baker_reward as AmountDelta);
            }
            if *foundation_charge > 0 {
                activity.balance(*foundation_account, *foundation_charge as AmountDelta);
            }
        }
        SpecialEvent::PaydayFoundationReward { foundation_account, development_charge } => {
            activity.balance(*foundation_account, *development_charge as AmountDelta);
        }
        SpecialEvent::PaydayAccountReward {
            account,
            transaction_fees,
            baker_reward,
            finalization_reward,
        } => {
            let total = (*transaction_fees + *baker_reward + *finalization_reward) as AmountDelta;
            activity.balance(*account, total);
        }
        // Accrues to the pool's virtual account, not to any account row.
        SpecialEvent::PaydayPoolReward { .. } => {}
    }
}

/// Aggregates the activity of one block into per-account update records:
/// canonicalize, resolve, group by account id in first-occurrence order
/// across both input streams, sum within each group.
pub struct AccountChangeCalculator<G, N> {
    resolver: Arc<AddressResolver<G, N>>,
}

impl<G, N> AccountChangeCalculator<G, N>
where
    G: ImporterGateway,
    N: NodeGateway,
{
    pub fn new(resolver: Arc<AddressResolver<G, N>>) -> Self {
        Self { resolver }
    }

    pub async fn aggregate(
        &self,
        activity: &AccountActivity,
        block: &BlockHash,
    ) -> Result<Vec<AccountUpdate>, ImportError> {
        let addresses: HashSet<_> = activity
            .balance_updates
            .iter()
            .map(|u| u.address.canonical())
            .chain(
                activity
                    .transaction_links
                    .iter()
                    .map(|a| a.canonical()),
            )
            .collect();
        let resolved = self
            .resolver
            .lookup(&addresses, block)
            .await?;

        let mut updates: Vec<AccountUpdate> = Vec::new();
        let mut positions: HashMap<AccountId, usize> = HashMap::new();
        let mut slot = |id: AccountId, updates: &mut Vec<AccountUpdate>| -> usize {
            *positions.entry(id).or_insert_with(|| {
                updates.push(AccountUpdate { account_id: id, balance_delta: 0, tx_count_delta: 0 });
                updates.len() - 1
            })
        };

        for update in &activity.balance_updates {
            let canonical = update.address.canonical();
            match resolved.get(&canonical).copied().flatten() {
                Some(id) => {
                    let at = slot(id, &mut updates);
                    updates[at].balance_delta += update.delta;
                }
                None => {
                    return Err(ImportError::DataInconsistency(format!(
                        "balance update of {} for unknown account {canonical}",
                        update.delta
                    )))
                }
            }
        }
        for link in &activity.transaction_links {
            let canonical = link.canonical();
            match resolved.get(&canonical).copied().flatten() {
                Some(id) => {
                    let at = slot(id, &mut updates);
                    updates[at].tx_count_delta += 1;
                }
                None => {
                    debug!(address = %canonical, "Dropping transaction link to unknown account");
                }
            }
        }
        Ok(updates)
    }
}
