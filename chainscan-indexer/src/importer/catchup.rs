use std::{sync::Arc, time::Duration};

use chainscan_common::{
    models::BlockHeight,
    node::NodeGateway,
    storage::ContractCatchupGateway,
};
use futures03::{stream, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::importer::{with_retries, ImportError, RetryPolicy};

#[derive(Clone, Debug)]
pub struct CatchupJobConfig {
    /// Number of blocks per batch transaction.
    pub batch_size: u64,
    /// Upper bound on concurrently in-flight batches.
    pub max_parallel_tasks: usize,
    /// Pause between polls once the job has caught up with the chain head.
    pub job_delay: Duration,
    pub retry_count: usize,
    pub delay_between_retries: Duration,
}

impl Default for CatchupJobConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_parallel_tasks: 4,
            job_delay: Duration::from_secs(10),
            retry_count: 3,
            delay_between_retries: Duration::from_secs(5),
        }
    }
}

/// Checkpointed, parallel processor for the auxiliary contract/token event
/// stream, scheduled independently of the sequential block pipeline.
///
/// The range behind the chain head is split into contiguous batches that run
/// with bounded concurrency; each batch commits its writes in its own
/// transaction. Completions are consumed in range order, so the checkpoint
/// only ever advances over a gapless prefix of committed batches, no matter
/// which batch finishes first. A batch that exhausts its retries halts this
/// job only.
pub struct ContractCatchupJob<G, N> {
    name: String,
    gateway: Arc<G>,
    node: Arc<N>,
    config: CatchupJobConfig,
}

impl<G, N> ContractCatchupJob<G, N>
where
    G: ContractCatchupGateway,
    N: NodeGateway,
{
    pub fn new(name: impl Into<String>, gateway: Arc<G>, node: Arc<N>, config: CatchupJobConfig) -> Self {
        Self { name: name.into(), gateway, node, config }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Polls the node and processes everything behind the last finalized
    /// block until `shutdown` flips. Errors halt this job; the caller
    /// decides how loudly to surface them.
    #[instrument(skip_all, fields(job = %self.name))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ImportError> {
        info!("Catch-up job starting");
        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested, catch-up job stopping");
                return Ok(());
            }
            let head = with_retries(&self.retry_policy(), "consensus_status", || async {
                Ok(self
                    .node
                    .consensus_status()
                    .await?
                    .last_finalized_height)
            })
            .await?;
            let from = with_retries(&self.retry_policy(), "read_height", || async {
                Ok(self
                    .gateway
                    .read_height(&self.name)
                    .await?)
            })
            .await?
            .map(|height| height + 1)
            .unwrap_or(0);
            if from <= head {
                self.process_range(from, head, &mut shutdown)
                    .await?;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.job_delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Processes `[from, to]` in batches of `batch_size`, at most
    /// `max_parallel_tasks` in flight, advancing the checkpoint strictly in
    /// batch order.
    pub(crate) async fn process_range(
        &self,
        from: BlockHeight,
        to: BlockHeight,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ImportError> {
        debug!(from, to, "Processing range");
        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<(BlockHeight, BlockHeight)> = (from..=to)
            .step_by(batch_size as usize)
            .map(|start| (start, (start + batch_size - 1).min(to)))
            .collect();

        let mut completions = stream::iter(
            batches
                .into_iter()
                .map(|(start, end)| self.process_batch(start, end)),
        )
        .buffered(self.config.max_parallel_tasks.max(1));

        while let Some(completed) = completions.next().await {
            let (_, end) = completed?;
            // The serialization point: batches complete here in range
            // order, so the watermark stays gapless.
            with_retries(&self.retry_policy(), "advance_read_height", || async {
                Ok(self
                    .gateway
                    .advance_read_height(&self.name, end)
                    .await?)
            })
            .await?;
            gauge!("catchup_read_height", "job" => self.name.clone()).set(end as f64);
            if *shutdown.borrow() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn process_batch(
        &self,
        start: BlockHeight,
        end: BlockHeight,
    ) -> Result<(BlockHeight, BlockHeight), ImportError> {
        with_retries(&self.retry_policy(), "catchup_batch", || async {
            let activity = self
                .node
                .contract_activity(start, end)
                .await?;
            // One transaction per batch; the checkpoint is advanced
            // separately, once every earlier batch has also committed.
            self.gateway
                .persist_activity(&self.name, &activity)
                .await?;
            counter!("catchup_events_total", "job" => self.name.clone())
                .increment(activity.len() as u64);
            Ok(())
        })
        .await
        .map_err(|err| {
            warn!(job = %self.name, start, end, %err, "Catch-up batch failed permanently");
            err
        })?;
        debug!(start, end, "Batch committed");
        Ok((start, end))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.config.retry_count,
            delay_between_retries: self.config.delay_between_retries,
        }
    }
}
