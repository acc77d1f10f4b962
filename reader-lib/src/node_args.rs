use crate::template::{self, TemplateError, Vars};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeArgsError {
    #[error("invalid node role: {0}")]
    InvalidRole(String),
    #[error("invalid node arguments: {0}")]
    Template(#[from] TemplateError),
}

fn default_arguments(role: &str) -> Option<&'static str> {
    match role {
        "reader" => Some("--config-path {config-file} --start-checkpoint {start-block} {extra-arg}"),
        _ => None,
    }
}

/// Builds the node command line.
///
/// An empty `overrides` keeps the role defaults, a leading `+` appends to
/// them and anything else replaces them entirely. `{config-file}`,
/// `{node-data-dir}` and `{start-block}` are available as placeholders in
/// every form.
pub fn build_node_arguments(
    role: &str,
    node_data_dir: &Path,
    config_file: &Path,
    overrides: &str,
    start_block: u64,
) -> Result<Vec<String>, NodeArgsError> {
    let defaults =
        default_arguments(role).ok_or_else(|| NodeArgsError::InvalidRole(role.to_string()))?;
    let arguments = match overrides.strip_prefix('+') {
        Some(extra) => defaults.replace("{extra-arg}", extra),
        None if overrides.is_empty() => defaults.replace("{extra-arg}", ""),
        None => overrides.to_string(),
    };

    let config_file = std::path::absolute(config_file).unwrap_or_else(|_| config_file.to_path_buf());
    let vars = Vars::from([
        ("config-file", config_file.display().to_string()),
        ("node-data-dir", node_data_dir.display().to_string()),
        ("start-block", start_block.to_string()),
    ]);
    let arguments = template::render(&arguments, &vars)?;
    Ok(arguments.split_whitespace().map(str::to_string).collect())
}
