//! Thin JSON client for the node's query API. Transport and serde decoding
//! only: every payload decodes into the closed sum types of
//! `chainscan-common`, and an unrecognised discriminator tag is a fatal
//! decode error rather than a guessed default.

use async_trait::async_trait;
use chainscan_common::{
    models::{
        blockchain::{BakerPoolStatus, BlockPayload, PassiveDelegationStatus},
        contracts::ContractActivity,
        AccountAddress, BakerId, BlockHash, BlockHeight,
    },
    node::{ConsensusStatus, NodeAccountInfo, NodeError, NodeGateway},
};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::instrument;

pub struct JsonNodeClient {
    base: Url,
    client: Client,
}

impl JsonNodeClient {
    pub fn new(base_url: &str) -> Result<Self, NodeError> {
        let base = Url::parse(base_url)
            .map_err(|err| NodeError::Connection(format!("invalid node url: {err}")))?;
        Ok(Self { base, client: Client::new() })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, NodeError> {
        self.get_json_optional(path)
            .await?
            .ok_or_else(|| NodeError::NotFound(path.to_string()))
    }

    /// Like [`Self::get_json`] but maps 404 to `None`.
    async fn get_json_optional<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, NodeError> {
        let url = self
            .base
            .join(path)
            .map_err(|err| NodeError::Connection(format!("invalid request path: {err}")))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| NodeError::Connection(err.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|err| NodeError::Connection(err.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|err| NodeError::Connection(err.to_string()))?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(classify_decode_error)
    }
}

fn classify_decode_error(err: serde_json::Error) -> NodeError {
    let message = err.to_string();
    if message.contains("unknown variant") {
        NodeError::UnknownVariant(message)
    } else {
        NodeError::Decode(message)
    }
}

#[async_trait]
impl NodeGateway for JsonNodeClient {
    #[instrument(skip(self))]
    async fn consensus_status(&self) -> Result<ConsensusStatus, NodeError> {
        self.get_json("v1/consensus-status")
            .await
    }

    #[instrument(skip(self))]
    async fn block_payload(&self, height: BlockHeight) -> Result<BlockPayload, NodeError> {
        self.get_json(&format!("v1/blocks/{height}/payload"))
            .await
    }

    #[instrument(skip(self, address, block))]
    async fn account_info(
        &self,
        address: &AccountAddress,
        block: &BlockHash,
    ) -> Result<Option<NodeAccountInfo>, NodeError> {
        self.get_json_optional(&format!("v1/accounts/{address}?block={block}"))
            .await
    }

    #[instrument(skip(self, block))]
    async fn account_address_by_index(
        &self,
        index: u64,
        block: &BlockHash,
    ) -> Result<AccountAddress, NodeError> {
        self.get_json(&format!("v1/accounts/by-index/{index}?block={block}"))
            .await
    }

    #[instrument(skip(self, block))]
    async fn baker_pool_status(
        &self,
        baker: BakerId,
        block: &BlockHash,
    ) -> Result<BakerPoolStatus, NodeError> {
        self.get_json(&format!("v1/pools/{baker}?block={block}"))
            .await
    }

    #[instrument(skip(self, block))]
    async fn passive_delegation_status(
        &self,
        block: &BlockHash,
    ) -> Result<PassiveDelegationStatus, NodeError> {
        self.get_json(&format!("v1/pools/passive?block={block}"))
            .await
    }

    #[instrument(skip(self))]
    async fn contract_activity(
        &self,
        from: BlockHeight,
        to: BlockHeight,
    ) -> Result<Vec<ContractActivity>, NodeError> {
        self.get_json(&format!("v1/contracts/activity?from={from}&to={to}"))
            .await
    }
}
