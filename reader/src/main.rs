use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use reader_lib::bootstrap::{BootstrapManifest, Bootstrapper, NodeFiles};
use reader_lib::one_block::OneBlockStore;
use reader_lib::supervisor::{OsProcessLauncher, Supervisor, SupervisorConfig};
use reader_lib::{BlockStreamServer, MetricsAndReadinessManager, Operator, SyncStateStore};
use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::ManagerApi;
use crate::config::get_reader_config;

mod api;
mod config;

const MAX_LOG_FILES: usize = 7;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ignore faillures as .env might not be present at runtime, and this use-case is tolerated
    dotenv()
        .inspect_err(|err| println!("[WARN] reading .env files is failed with err {err}"))
        .ok();

    let config = get_reader_config()?;

    // logs
    let log_dir = config.app_logs_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let file_appender = BasicRollingFileAppender::new(
        log_dir.join("reader.log"),
        RollingConditionBasic::new().daily(),
        MAX_LOG_FILES,
    )
    .with_context(|| format!("opening log file in {}", log_dir.display()))?;
    let (non_blocking_appender, _guard_stdout) = tracing_appender::non_blocking(std::io::stdout());
    let (non_blocking_file_appender, _guard_file) = tracing_appender::non_blocking(file_appender);
    let stdout_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_appender)
        .with_filter(config.rust_log);
    let file_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file_appender)
        .with_ansi(false)
        .with_filter(config.rust_log);
    tracing_subscriber::registry()
        .with(stdout_subscriber)
        .with(file_subscriber)
        .init();

    // node layout
    let working_dir = config.resolve(&config.working_dir)?;
    let node_data_dir = config.resolve(&config.node_data_dir)?;
    std::fs::create_dir_all(&working_dir)
        .with_context(|| format!("creating working directory {}", working_dir.display()))?;
    let manifest = BootstrapManifest::for_node(
        &node_data_dir,
        NodeFiles {
            config_file: Some(config.resolve(&config.node_config_file)?),
            genesis_file: config.resolve_optional(config.node_genesis_file.as_deref())?,
            waypoint_file: config.resolve_optional(config.node_waypoint_file.as_deref())?,
            validator_identity_file: config
                .resolve_optional(config.node_validator_identity_file.as_deref())?,
            vfn_identity_file: config.resolve_optional(config.node_vfn_identity_file.as_deref())?,
        },
    );
    info!(
        working_dir = %working_dir.display(),
        node_data_dir = %node_data_dir.display(),
        node_path = %config.node_path.display(),
        "Reader node layout resolved"
    );

    let supervisor_config = SupervisorConfig::builder()
        .program(config.node_path.clone())
        .working_dir(working_dir.clone())
        .node_data_dir(node_data_dir)
        .config_file(manifest.resolved_config_file())
        .role(config.node_role.clone())
        .arguments(config.node_arguments.clone())
        .log_to_tracing(config.node_log_to_tracing)
        .debug_block_logs(config.debug_firehose_logs)
        .build();
    let (records_tx, records_rx) = flume::bounded(config.blocks_chan_capacity);
    let supervisor = Supervisor::new(
        Arc::new(OsProcessLauncher::default()),
        supervisor_config,
        records_tx,
    );

    let one_block_store = match config.resolve_optional(config.one_block_store.as_deref())? {
        Some(dir) => Some(OneBlockStore::new(dir, config.one_block_suffix.clone())?),
        None => None,
    };
    let readiness = Arc::new(MetricsAndReadinessManager::new(
        config.readiness_max_latency,
    ));
    let server = BlockStreamServer::new(
        config.stream_retention,
        config.subscriber_capacity,
        config.backpressure_policy(),
    );

    let operator = Operator::builder()
        .bootstrapper(Bootstrapper::new(manifest))
        .supervisor(supervisor)
        .records_rx(records_rx)
        .sync_state(Arc::new(SyncStateStore::in_dir(&working_dir)))
        .readiness(readiness.clone())
        .server(server.clone())
        .restart_policy(config.restart_policy())
        .first_streamable_block(config.first_streamable_block)
        .maybe_start_block(config.start_block)
        .maybe_stop_block(config.stop_block)
        .checkpoint_interval(config.checkpoint_interval)
        .publish_capacity(config.blocks_chan_capacity)
        .maybe_one_block_store(one_block_store)
        .shutdown_delay(config.shutdown_delay)
        .stop_grace(config.stop_grace)
        .build();

    let api = ManagerApi::new(readiness, server, operator.phase());
    let (shutdown_api_tx, shutdown_api_rx) = tokio::sync::oneshot::channel();
    let api_addr = config.manager_api_addr.clone();
    let api_handle = tokio::spawn(async move {
        api.serve(&api_addr, shutdown_api_rx)
            .await
            .inspect_err(|err| error!("manager api stopped with error: {err}"))
    });

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let (shutdown_operator_tx, shutdown_operator_rx) = tokio::sync::oneshot::channel();
    let mut operator_handle = tokio::spawn(operator.run(shutdown_operator_rx));

    let outcome = tokio::select! {
        result = &mut operator_handle => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            _ = shutdown_operator_tx
                .send(())
                .inspect_err(|_err| error!("failed to send shutdown to operator"));
            operator_handle.await
        }
        _ = terminate.recv() => {
            info!("Received SIGTERM, shutting down");
            _ = shutdown_operator_tx
                .send(())
                .inspect_err(|_err| error!("failed to send shutdown to operator"));
            operator_handle.await
        }
    };

    _ = shutdown_api_tx
        .send(())
        .inspect_err(|_err| error!("failed to send shutdown to manager api"));
    _ = api_handle
        .await
        .inspect_err(|err| error!("manager api task failed: {err}"));

    let summary = outcome.context("operator task did not complete")??;
    info!(
        reason = ?summary.reason,
        final_block = ?summary.final_block,
        restarts = summary.restarts,
        "Reader stopped"
    );
    Ok(())
}
