use std::sync::Arc;

use chainscan_common::{
    models::{blockchain::BlockInfo, ImportState},
    storage::{ImportTransaction, ImporterGateway},
};
use tracing::debug;

use crate::importer::ImportError;

/// Propagates finalization timestamps across the historical block range
/// covered by a proof.
///
/// The watermark on the import state only moves forward: a proof at or below
/// it is a no-op, and a block's finalization time, once set, is never
/// overwritten by a later, looser proof.
pub struct FinalizationBackfiller<G> {
    gateway: Arc<G>,
}

impl<G> FinalizationBackfiller<G>
where
    G: ImporterGateway,
{
    pub fn new(gateway: Arc<G>) -> Self {
        Self { gateway }
    }

    pub async fn backfill(
        &self,
        tx: &mut dyn ImportTransaction,
        block_info: &BlockInfo,
        import_state: &mut ImportState,
    ) -> Result<(), ImportError> {
        let Some(proof) = &block_info.finalization_proof else {
            return Ok(());
        };
        let finalized = self
            .gateway
            .get_block_by_hash(&proof.finalized_block)
            .await?
            .ok_or_else(|| {
                ImportError::DataInconsistency(format!(
                    "finalization proof references unimported block {}",
                    proof.finalized_block
                ))
            })?;

        let watermark = import_state.max_height_with_finalization_time;
        if watermark.is_some_and(|mark| finalized.height <= mark) {
            debug!(
                height = finalized.height,
                "Finalization proof at or below the watermark, nothing to do"
            );
            return Ok(());
        }

        tx.apply_finalization_times(watermark, finalized.height, block_info.slot_time)
            .await?;
        import_state.max_height_with_finalization_time = Some(finalized.height);
        debug!(
            up_to = finalized.height,
            from = ?watermark,
            "Backfilled finalization times"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chainscan_common::{
        models::blockchain::{Block, FinalizationProof},
        storage::{MockImportTransaction, MockImporterGateway},
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{block_hash, import_state, ts};

    fn block_at(height: u64, slot_secs: i64) -> Block {
        Block {
            height,
            hash: block_hash(height),
            slot_time: ts(slot_secs),
            baker_id: None,
            finalized: true,
            finalization_time_secs: None,
        }
    }

    fn info_with_proof(height: u64, slot_secs: i64, finalized: u64) -> BlockInfo {
        BlockInfo {
            height,
            hash: block_hash(height),
            parent_hash: block_hash(height - 1),
            slot_time: ts(slot_secs),
            baker_id: None,
            finalized: true,
            finalization_proof: Some(FinalizationProof { finalized_block: block_hash(finalized) }),
        }
    }

    #[tokio::test]
    async fn a_proof_backfills_up_to_the_proven_height() {
        // Finalized blocks at heights 10 (T+0), 11 (T+9), 12 (T+21); a later
        // block at T+31 proves height 12.
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_get_block_by_hash()
            .returning(|hash| {
                assert_eq!(*hash, block_hash(12));
                Ok(Some(block_at(12, 21)))
            });
        let backfiller = FinalizationBackfiller::new(Arc::new(gateway));

        let mut tx = MockImportTransaction::new();
        tx.expect_apply_finalization_times()
            .times(1)
            .withf(|from, to, finalized_at| {
                *from == Some(9) && *to == 12 && *finalized_at == ts(31)
            })
            .returning(|_, _, _| Ok(()));
        let mut state = import_state(12, 21);
        state.max_height_with_finalization_time = Some(9);

        backfiller
            .backfill(&mut tx, &info_with_proof(13, 31, 12), &mut state)
            .await
            .unwrap();
        assert_eq!(state.max_height_with_finalization_time, Some(12));
    }

    #[tokio::test]
    async fn a_proof_at_or_below_the_watermark_is_a_no_op() {
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_get_block_by_hash()
            .returning(|_| Ok(Some(block_at(12, 21))));
        let backfiller = FinalizationBackfiller::new(Arc::new(gateway));

        let mut tx = MockImportTransaction::new();
        tx.expect_apply_finalization_times().times(0);
        let mut state = import_state(14, 40);
        state.max_height_with_finalization_time = Some(12);

        backfiller
            .backfill(&mut tx, &info_with_proof(15, 45, 12), &mut state)
            .await
            .unwrap();
        assert_eq!(state.max_height_with_finalization_time, Some(12));
    }

    #[tokio::test]
    async fn a_block_without_a_proof_is_a_no_op() {
        let gateway = MockImporterGateway::new();
        let backfiller = FinalizationBackfiller::new(Arc::new(gateway));

        let mut tx = MockImportTransaction::new();
        tx.expect_apply_finalization_times().times(0);
        let mut info = info_with_proof(13, 31, 12);
        info.finalization_proof = None;
        let mut state = import_state(12, 21);

        backfiller
            .backfill(&mut tx, &info, &mut state)
            .await
            .unwrap();
        assert_eq!(state.max_height_with_finalization_time, None);
    }

    #[tokio::test]
    async fn the_first_proof_covers_everything_from_genesis() {
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_get_block_by_hash()
            .returning(|_| Ok(Some(block_at(5, 50))));
        let backfiller = FinalizationBackfiller::new(Arc::new(gateway));

        let mut tx = MockImportTransaction::new();
        tx.expect_apply_finalization_times()
            .times(1)
            .withf(|from, to, _| from.is_none() && *to == 5)
            .returning(|_, _, _| Ok(()));
        let mut state = import_state(5, 50);

        backfiller
            .backfill(&mut tx, &info_with_proof(6, 60, 5), &mut state)
            .await
            .unwrap();
        assert_eq!(state.max_height_with_finalization_time, Some(5));
    }

    #[tokio::test]
    async fn a_proof_for_an_unimported_block_is_a_data_inconsistency() {
        let mut gateway = MockImporterGateway::new();
        gateway
            .expect_get_block_by_hash()
            .returning(|_| Ok(None));
        let backfiller = FinalizationBackfiller::new(Arc::new(gateway));

        let mut tx = MockImportTransaction::new();
        let res = backfiller
            .backfill(&mut tx, &info_with_proof(13, 31, 12), &mut import_state(12, 21))
            .await;
        assert!(matches!(res, Err(ImportError::DataInconsistency(_))));
    }
}
