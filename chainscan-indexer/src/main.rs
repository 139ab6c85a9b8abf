use std::sync::Arc;

use anyhow::Context;
use chainscan_indexer::{
    cli::{CatchupArgs, Cli, Command, GlobalArgs, ImportArgs},
    importer::{catchup::ContractCatchupJob, pipeline::BlockImportPipeline},
    node_client::JsonNodeClient,
};
use chainscan_storage::postgres::{connect, PgImporterGateway};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let global_args = cli.args();
    create_tracing_subscriber();
    if let Some(port) = global_args.metrics_port {
        install_metrics_exporter(port)?;
    }
    match cli.command() {
        Command::Import(import_args) => run_import(global_args, import_args).await,
        Command::Catchup(catchup_args) => run_catchup(global_args, catchup_args).await,
    }
}

fn create_tracing_subscriber() {
    let format = tracing_subscriber::fmt::format()
        .with_level(true)
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .event_format(format)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

fn install_metrics_exporter(port: u16) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(port, "Prometheus exporter listening");
    Ok(())
}

async fn run_import(global_args: GlobalArgs, import_args: ImportArgs) -> anyhow::Result<()> {
    let pool = connect(&global_args.database_url)
        .await
        .context("Failed to connect to the database")?;
    let gateway = Arc::new(PgImporterGateway::new(pool));
    let node = Arc::new(JsonNodeClient::new(&global_args.node_url)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let catchup_handles = spawn_catchup_jobs(
        &import_args.catchup,
        gateway.clone(),
        node.clone(),
        &shutdown_rx,
    );

    let pipeline =
        BlockImportPipeline::new(gateway, node, import_args.importer_config());
    let pipeline_rx = shutdown_rx.clone();
    let mut pipeline_handle = tokio::spawn(async move { pipeline.run(pipeline_rx).await });

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            Ok(())
        }
        joined = &mut pipeline_handle => {
            // The pipeline only returns early on an unrecoverable error;
            // sequencing cannot skip a block, so the whole process halts and
            // the supervisor restarts it from the committed checkpoint.
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!(%err, "Block import halted");
                    Err(anyhow::Error::new(err))
                }
                Err(join_err) => Err(anyhow::anyhow!("Block import panicked: {join_err}")),
            }
        }
    };

    shutdown_tx
        .send(true)
        .unwrap_or_else(|_| warn!("All shutdown receivers already dropped"));
    if !pipeline_handle.is_finished() {
        let _ = pipeline_handle.await;
    }
    for handle in catchup_handles {
        let _ = handle.await;
    }
    result
}

async fn run_catchup(global_args: GlobalArgs, catchup_args: CatchupArgs) -> anyhow::Result<()> {
    let pool = connect(&global_args.database_url)
        .await
        .context("Failed to connect to the database")?;
    let gateway = Arc::new(PgImporterGateway::new(pool));
    let node = Arc::new(JsonNodeClient::new(&global_args.node_url)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_catchup_jobs(&catchup_args, gateway, node, &shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupts")?;
    info!("Interrupt received, shutting down");
    shutdown_tx
        .send(true)
        .unwrap_or_else(|_| warn!("All shutdown receivers already dropped"));
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// One independent task per job: a halted job is logged for the operator but
/// never takes down its siblings or the block pipeline.
fn spawn_catchup_jobs(
    args: &CatchupArgs,
    gateway: Arc<PgImporterGateway>,
    node: Arc<JsonNodeClient>,
    shutdown_rx: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    args.jobs
        .iter()
        .map(|name| {
            let job = ContractCatchupJob::new(
                name.clone(),
                gateway.clone(),
                node.clone(),
                args.job_config(),
            );
            let rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(err) = job.run(rx).await {
                    error!(job = %job.name(), %err, "Catch-up job halted");
                }
            })
        })
        .collect()
}
