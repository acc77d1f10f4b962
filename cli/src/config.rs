use std::path::PathBuf;

use reader_lib::sync_state::SYNC_STATE_FILE_NAME;
use reader_lib::template;
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use tracing::level_filters::LevelFilter;

/// Subset of the reader settings needed to locate its files.
#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct CliConfig {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_rust_log")]
    pub rust_log: LevelFilter,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_node_role")]
    pub node_role: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

fn default_rust_log() -> LevelFilter {
    LevelFilter::WARN
}

fn default_data_dir() -> String {
    "./sf-data".to_string()
}

fn default_node_role() -> String {
    "reader".to_string()
}

fn default_working_dir() -> String {
    "{data-dir}/{node-role}".to_string()
}

impl CliConfig {
    pub fn sync_state_path(&self) -> anyhow::Result<PathBuf> {
        let working_dir = template::resolve_path(&self.working_dir, &self.data_dir, &self.node_role)?;
        Ok(working_dir.join(SYNC_STATE_FILE_NAME))
    }
}

pub fn get_cli_config() -> anyhow::Result<CliConfig> {
    Ok(envy::from_env::<CliConfig>()?)
}
