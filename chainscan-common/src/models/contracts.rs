use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{AccountAddress, Amount, BlockHeight, TransactionIndex, TxHash};

/// Address of a smart contract instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAddress {
    pub index: u64,
    pub subindex: u64,
}

impl std::fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{},{}>", self.index, self.subindex)
    }
}

/// Raw contract-level activity. The auxiliary catch-up stream persists these
/// verbatim; interpreting module-specific logs is the query side's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum ContractEvent {
    #[serde(rename_all = "camelCase")]
    Initialized {
        address: ContractAddress,
        amount: Amount,
        init_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Updated {
        address: ContractAddress,
        instigator: AccountAddress,
        amount: Amount,
        receive_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Transferred {
        from: ContractAddress,
        to: AccountAddress,
        amount: Amount,
    },
    #[serde(rename_all = "camelCase")]
    Interrupted { address: ContractAddress },
    #[serde(rename_all = "camelCase")]
    Resumed { address: ContractAddress, success: bool },
    #[serde(rename_all = "camelCase")]
    TokenTransfer {
        address: ContractAddress,
        token_id: String,
        from: Option<AccountAddress>,
        to: Option<AccountAddress>,
        amount: String,
    },
    #[serde(rename_all = "camelCase")]
    TokenMint {
        address: ContractAddress,
        token_id: String,
        owner: AccountAddress,
        amount: String,
    },
    #[serde(rename_all = "camelCase")]
    TokenBurn {
        address: ContractAddress,
        token_id: String,
        owner: AccountAddress,
        amount: String,
    },
    #[serde(rename_all = "camelCase")]
    TokenMetadata {
        address: ContractAddress,
        token_id: String,
        metadata_url: String,
    },
}

/// One decoded contract/token event positioned in the chain, the persistence
/// unit of the catch-up stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractActivity {
    pub block_height: BlockHeight,
    pub slot_time: NaiveDateTime,
    pub transaction_hash: TxHash,
    pub transaction_index: TransactionIndex,
    pub event_index: u32,
    pub event: ContractEvent,
}
