use std::path::PathBuf;
use std::time::Duration;

use reader_lib::template::{self, TemplateError};
use reader_lib::{BackpressurePolicy, RestartPolicy};
use serde::Deserialize;
use serde_with::{DisplayFromStr, DurationSeconds, serde_as};
use tracing::level_filters::LevelFilter;

/// Reader settings, read from the environment (and `.env`).
///
/// Path settings may use the `{data-dir}` and `{node-role}` placeholders.
#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct ReaderConfig {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_rust_log")]
    pub rust_log: LevelFilter,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_node_role")]
    pub node_role: String,

    #[serde(default = "default_node_path")]
    pub node_path: PathBuf,
    #[serde(default = "default_node_data_dir")]
    pub node_data_dir: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    pub node_config_file: String,
    pub node_genesis_file: Option<String>,
    pub node_waypoint_file: Option<String>,
    pub node_validator_identity_file: Option<String>,
    pub node_vfn_identity_file: Option<String>,
    #[serde(default)]
    pub node_arguments: String,
    #[serde(default = "default_true")]
    pub node_log_to_tracing: bool,
    #[serde(default)]
    pub debug_firehose_logs: bool,

    #[serde(default)]
    pub first_streamable_block: u64,
    /// Blocks below this are not forwarded, unset means the first streamable block
    pub start_block: Option<u64>,
    pub stop_block: Option<u64>,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_blocks_chan_capacity")]
    pub blocks_chan_capacity: usize,
    #[serde(default = "default_stream_retention")]
    pub stream_retention: usize,
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    /// Disconnect subscribers that stay full this long, unset waits forever
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(default)]
    pub subscriber_timeout: Option<Duration>,
    pub one_block_store: Option<String>,
    #[serde(default = "default_one_block_suffix")]
    pub one_block_suffix: String,

    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_readiness_max_latency")]
    pub readiness_max_latency: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub shutdown_delay: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_stop_grace")]
    pub stop_grace: Duration,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_restart_backoff_max")]
    pub restart_backoff_max: Duration,

    #[serde(default = "default_manager_api_addr")]
    pub manager_api_addr: String,
}

fn default_rust_log() -> LevelFilter {
    LevelFilter::INFO
}

fn default_data_dir() -> String {
    "./sf-data".to_string()
}

fn default_node_role() -> String {
    "reader".to_string()
}

fn default_node_path() -> PathBuf {
    PathBuf::from("sui-node")
}

fn default_node_data_dir() -> String {
    "{data-dir}/{node-role}/data".to_string()
}

fn default_working_dir() -> String {
    "{data-dir}/{node-role}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_interval() -> u64 {
    1
}

fn default_blocks_chan_capacity() -> usize {
    100
}

fn default_stream_retention() -> usize {
    1000
}

fn default_subscriber_capacity() -> usize {
    256
}

fn default_one_block_suffix() -> String {
    "default".to_string()
}

fn default_readiness_max_latency() -> Duration {
    Duration::from_secs(30)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_max_restarts() -> u32 {
    RestartPolicy::default().max_restarts
}

fn default_restart_backoff() -> Duration {
    RestartPolicy::default().initial_backoff
}

fn default_restart_backoff_max() -> Duration {
    RestartPolicy::default().max_backoff
}

fn default_manager_api_addr() -> String {
    "127.0.0.1:10011".to_string()
}

impl ReaderConfig {
    /// Substitutes `{data-dir}` and `{node-role}` in a path setting.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, TemplateError> {
        template::resolve_path(path, &self.data_dir, &self.node_role)
    }

    pub fn resolve_optional(&self, path: Option<&str>) -> Result<Option<PathBuf>, TemplateError> {
        path.map(|path| self.resolve(path)).transpose()
    }

    pub fn app_logs_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("app_logs")
    }

    pub fn backpressure_policy(&self) -> BackpressurePolicy {
        match self.subscriber_timeout {
            Some(timeout) => BackpressurePolicy::DisconnectSlow { timeout },
            None => BackpressurePolicy::Block,
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.max_restarts,
            initial_backoff: self.restart_backoff,
            max_backoff: self.restart_backoff_max,
            ..Default::default()
        }
    }
}

pub fn get_reader_config() -> anyhow::Result<ReaderConfig> {
    Ok(envy::from_env::<ReaderConfig>()?)
}
