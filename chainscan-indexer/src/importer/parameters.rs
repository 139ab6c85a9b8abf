use std::sync::Arc;

use chainscan_common::{
    models::{
        parameters::{ChainParametersVersion, ObservedChainParameters},
        BlockHash, ImportState,
    },
    node::NodeGateway,
    storage::{ImportTransaction, ImporterGateway},
};
use tracing::info;

use crate::importer::ImportError;

/// Content-addressed, append-only versioning of chain parameter snapshots.
///
/// Equality is checked against the latest persisted version, tracked by the
/// pointer on the import state rather than a table scan, and covers resolved
/// data: the foundation account index is resolved to its canonical address
/// before comparing. Rows are immutable once written.
pub struct ChainParameterVersionStore<G, N> {
    gateway: Arc<G>,
    node: Arc<N>,
}

impl<G, N> ChainParameterVersionStore<G, N>
where
    G: ImporterGateway,
    N: NodeGateway,
{
    pub fn new(gateway: Arc<G>, node: Arc<N>) -> Self {
        Self { gateway, node }
    }

    /// Returns the version matching `observed`, inserting a new one only if
    /// the values differ from the latest. On a transition the previous
    /// version is returned alongside, so callers can diff the two (e.g. for
    /// commission clamping).
    pub async fn get_or_create(
        &self,
        tx: &mut dyn ImportTransaction,
        observed: &ObservedChainParameters,
        import_state: &mut ImportState,
        block: &BlockHash,
    ) -> Result<(ChainParametersVersion, Option<ChainParametersVersion>), ImportError> {
        let foundation_account = self
            .node
            .account_address_by_index(observed.foundation_account_index, block)
            .await?
            .canonical();
        let resolved = observed.resolve(foundation_account);

        match import_state.latest_chain_parameters_version {
            Some(version) => {
                let latest = self
                    .gateway
                    .get_chain_parameters(version)
                    .await?;
                if latest.parameters == resolved {
                    return Ok((latest, None));
                }
                let next =
                    ChainParametersVersion { version: version + 1, parameters: resolved };
                tx.insert_chain_parameters(&next).await?;
                import_state.latest_chain_parameters_version = Some(next.version);
                info!(version = next.version, "Chain parameters changed, new version appended");
                Ok((next, Some(latest)))
            }
            None => {
                let first = ChainParametersVersion { version: 1, parameters: resolved };
                tx.insert_chain_parameters(&first)
                    .await?;
                import_state.latest_chain_parameters_version = Some(first.version);
                info!("First chain parameter version recorded");
                Ok((first, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chainscan_common::{
        node::MockNodeGateway, storage::{MockImportTransaction, MockImporterGateway},
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{account_address, block_hash, import_state, observed_parameters};

    fn node_resolving_index_to(tag: u8) -> MockNodeGateway {
        let mut node = MockNodeGateway::new();
        node.expect_account_address_by_index()
            .returning(move |_, _| Ok(account_address(tag, 4)));
        node
    }

    fn store_with_latest(
        latest: ChainParametersVersion,
        node: MockNodeGateway,
    ) -> ChainParameterVersionStore<MockImporterGateway, MockNodeGateway> {
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_get_chain_parameters()
            .returning(move |version| {
                assert_eq!(version, latest.version);
                Ok(latest.clone())
            });
        ChainParameterVersionStore::new(Arc::new(gateway), Arc::new(node))
    }

    #[tokio::test]
    async fn unchanged_parameters_insert_nothing() {
        // The stored latest version equals the observed values post
        // resolution (foundation index 1 resolves to account_address(9, _)'s
        // canonical form).
        let latest = ChainParametersVersion {
            version: 3,
            parameters: observed_parameters().resolve(account_address(9, 4).canonical()),
        };
        let store = store_with_latest(latest.clone(), node_resolving_index_to(9));

        let mut tx = MockImportTransaction::new();
        tx.expect_insert_chain_parameters().times(0);
        let mut state = import_state(10, 0);
        state.latest_chain_parameters_version = Some(3);

        let (current, previous) = store
            .get_or_create(&mut tx, &observed_parameters(), &mut state, &block_hash(10))
            .await
            .unwrap();
        assert_eq!(current, latest);
        assert_eq!(previous, None);
        assert_eq!(state.latest_chain_parameters_version, Some(3));

        // Idempotent: a second identical call returns the same version.
        let mut tx = MockImportTransaction::new();
        tx.expect_insert_chain_parameters().times(0);
        let (again, previous) = store
            .get_or_create(&mut tx, &observed_parameters(), &mut state, &block_hash(10))
            .await
            .unwrap();
        assert_eq!(again, latest);
        assert_eq!(previous, None);
    }

    #[tokio::test]
    async fn changed_parameters_append_exactly_one_version() {
        let latest = ChainParametersVersion {
            version: 3,
            parameters: observed_parameters().resolve(account_address(9, 4).canonical()),
        };
        let store = store_with_latest(latest.clone(), node_resolving_index_to(9));

        let mut observed = observed_parameters();
        observed.account_creation_limit += 1;

        let mut tx = MockImportTransaction::new();
        tx.expect_insert_chain_parameters()
            .times(1)
            .withf(|version| version.version == 4)
            .returning(|_| Ok(()));
        let mut state = import_state(10, 0);
        state.latest_chain_parameters_version = Some(3);

        let (current, previous) = store
            .get_or_create(&mut tx, &observed, &mut state, &block_hash(10))
            .await
            .unwrap();
        assert_eq!(current.version, 4);
        assert_eq!(current.parameters.account_creation_limit, 11);
        // The previous version is returned untouched for transition diffing.
        assert_eq!(previous, Some(latest));
        assert_eq!(state.latest_chain_parameters_version, Some(4));
    }

    #[tokio::test]
    async fn a_changed_foundation_index_resolution_is_a_parameter_change() {
        let latest = ChainParametersVersion {
            version: 1,
            parameters: observed_parameters().resolve(account_address(9, 4).canonical()),
        };
        // Same raw values, but the index now resolves to another account.
        let store = store_with_latest(latest, node_resolving_index_to(8));

        let mut tx = MockImportTransaction::new();
        tx.expect_insert_chain_parameters()
            .times(1)
            .returning(|_| Ok(()));
        let mut state = import_state(10, 0);
        state.latest_chain_parameters_version = Some(1);

        let (current, previous) = store
            .get_or_create(&mut tx, &observed_parameters(), &mut state, &block_hash(10))
            .await
            .unwrap();
        assert_eq!(current.version, 2);
        assert!(previous.is_some());
    }

    #[tokio::test]
    async fn the_first_observation_becomes_version_one() {
        let gateway = MockImporterGateway::new();
        let store = ChainParameterVersionStore::new(
            Arc::new(gateway),
            Arc::new(node_resolving_index_to(9)),
        );

        let mut tx = MockImportTransaction::new();
        tx.expect_insert_chain_parameters()
            .times(1)
            .withf(|version| version.version == 1)
            .returning(|_| Ok(()));
        let mut state = import_state(0, 0);
        state.latest_chain_parameters_version = None;

        let (current, previous) = store
            .get_or_create(&mut tx, &observed_parameters(), &mut state, &block_hash(0))
            .await
            .unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(previous, None);
        assert_eq!(state.latest_chain_parameters_version, Some(1));
    }
}
