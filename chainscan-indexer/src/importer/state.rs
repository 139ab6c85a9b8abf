use std::sync::Arc;

use chainscan_common::{
    models::ImportState,
    storage::{ImportTransaction, ImporterGateway, StorageError},
};
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

/// Transaction-aware cache around the singleton import-state row.
///
/// `save_changes` writes through the explicit transaction handle and stages
/// the new value; only `saved_changes_committed`, called after the enclosing
/// transaction is known to have committed, promotes it into the long-lived
/// cache. A cache update must never become visible off the back of a
/// transaction that might still roll back — a caller that skips the
/// acknowledgment merely pays one extra store round-trip on the next read,
/// which then returns whatever actually committed.
pub struct ImportStateCursor<G> {
    gateway: Arc<G>,
    committed: RwLock<Option<ImportState>>,
    pending: Mutex<Option<ImportState>>,
}

impl<G> ImportStateCursor<G>
where
    G: ImporterGateway,
{
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway, committed: RwLock::new(None), pending: Mutex::new(None) }
    }

    /// The committed import state: cached if available, loaded (and cached)
    /// otherwise. `None` until the genesis block has been imported.
    pub async fn get_state(&self) -> Result<Option<ImportState>, StorageError> {
        if let Some(state) = self.committed.read().await.clone() {
            return Ok(Some(state));
        }
        let loaded = self.gateway.get_import_state().await?;
        if let Some(state) = &loaded {
            trace!(
                height = state.max_imported_block_height,
                "Loaded import state from storage"
            );
            *self.committed.write().await = Some(state.clone());
        }
        Ok(loaded)
    }

    /// Writes `state` within the given transaction and stages it for
    /// promotion. The long-lived cache is deliberately not touched here.
    pub async fn save_changes(
        &self,
        tx: &mut dyn ImportTransaction,
        state: ImportState,
    ) -> Result<(), StorageError> {
        tx.save_import_state(&state).await?;
        *self.pending.lock().await = Some(state);
        Ok(())
    }

    /// Acknowledges that the transaction carrying the last `save_changes`
    /// committed, promoting the staged state into the cache.
    pub async fn saved_changes_committed(&self) {
        if let Some(state) = self.pending.lock().await.take() {
            *self.committed.write().await = Some(state);
        }
    }

    /// Drops any staged state, e.g. after a rollback.
    pub async fn discard_pending(&self) {
        *self.pending.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use chainscan_common::storage::{MockImportTransaction, MockImporterGateway};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::import_state;

    #[tokio::test]
    async fn save_without_commit_ack_leaves_reads_on_the_prior_state() {
        let prior = import_state(5, 50);
        let mut gateway = MockImporterGateway::new();
        let stored = prior.clone();
        // The rolled-back write never reached storage; every uncached read
        // sees the prior row.
        gateway
            .expect_get_import_state()
            .times(2)
            .returning(move || Ok(Some(stored.clone())));
        let cursor = ImportStateCursor::new(Arc::new(gateway));

        assert_eq!(cursor.get_state().await.unwrap(), Some(prior.clone()));

        let mut tx = MockImportTransaction::new();
        tx.expect_save_import_state()
            .times(1)
            .returning(|_| Ok(()));
        cursor
            .save_changes(&mut tx, import_state(6, 60))
            .await
            .unwrap();
        // Transaction rolls back; no acknowledgment. The cache must not
        // have picked up the new value, and the next read goes to storage.
        cursor.discard_pending().await;
        *cursor.committed.write().await = None;
        assert_eq!(cursor.get_state().await.unwrap(), Some(prior));
    }

    #[tokio::test]
    async fn commit_ack_makes_cached_reads_return_the_new_state() {
        let mut gateway = MockImporterGateway::new();
        let prior = import_state(5, 50);
        let stored = prior.clone();
        gateway
            .expect_get_import_state()
            .times(1)
            .returning(move || Ok(Some(stored.clone())));
        let cursor = ImportStateCursor::new(Arc::new(gateway));
        assert_eq!(cursor.get_state().await.unwrap(), Some(prior));

        let next = import_state(6, 60);
        let mut tx = MockImportTransaction::new();
        tx.expect_save_import_state()
            .times(1)
            .returning(|_| Ok(()));
        cursor
            .save_changes(&mut tx, next.clone())
            .await
            .unwrap();
        cursor.saved_changes_committed().await;

        // Served from the cache: the gateway expectation above would fail on
        // a second load.
        assert_eq!(cursor.get_state().await.unwrap(), Some(next));
    }

    #[tokio::test]
    async fn the_save_itself_does_not_update_the_cache() {
        let prior = import_state(5, 50);
        let mut gateway = MockImporterGateway::new();
        let stored = prior.clone();
        gateway
            .expect_get_import_state()
            .times(1)
            .returning(move || Ok(Some(stored.clone())));
        let cursor = ImportStateCursor::new(Arc::new(gateway));
        assert_eq!(cursor.get_state().await.unwrap(), Some(prior.clone()));

        let mut tx = MockImportTransaction::new();
        tx.expect_save_import_state()
            .returning(|_| Ok(()));
        cursor
            .save_changes(&mut tx, import_state(6, 60))
            .await
            .unwrap();

        // No acknowledgment yet: cached reads still serve the prior state.
        assert_eq!(cursor.get_state().await.unwrap(), Some(prior));
    }
}
