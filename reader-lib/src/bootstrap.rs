use crate::template::{self, TemplateError, Vars};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const RESOLVED_CONFIG_FILE_NAME: &str = "node.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Placeholder name other staged files use to refer to this one
    pub name: &'static str,
    pub source: Option<PathBuf>,
    pub dest: PathBuf,
    pub required: bool,
    /// Substitute placeholders in the file body while staging it
    pub render: bool,
}

/// Files to stage into the node data directory before its first start.
#[derive(Debug, Clone, Default)]
pub struct BootstrapManifest {
    pub data_dir: PathBuf,
    pub entries: Vec<ManifestEntry>,
}

/// Source paths of the files the reader node needs, empty means not provided.
#[derive(Debug, Clone, Default)]
pub struct NodeFiles {
    pub config_file: Option<PathBuf>,
    pub genesis_file: Option<PathBuf>,
    pub waypoint_file: Option<PathBuf>,
    pub validator_identity_file: Option<PathBuf>,
    pub vfn_identity_file: Option<PathBuf>,
}

impl BootstrapManifest {
    /// Standard layout: the config file is rendered into `node.yaml`, the
    /// optional network files keep their own file name.
    pub fn for_node(data_dir: &Path, files: NodeFiles) -> Self {
        let optional = |name: &'static str, file_name: &str, source: Option<PathBuf>| {
            ManifestEntry {
                name,
                source,
                dest: data_dir.join(file_name),
                required: false,
                render: false,
            }
        };
        Self {
            data_dir: data_dir.to_path_buf(),
            entries: vec![
                optional("genesis-file", "genesis.blob", files.genesis_file),
                optional("waypoint-file", "waypoint.txt", files.waypoint_file),
                optional(
                    "validator-identity-file",
                    "validator-identity.yaml",
                    files.validator_identity_file,
                ),
                optional("vfn-identity-file", "vfn-identity.yaml", files.vfn_identity_file),
                ManifestEntry {
                    name: "config-file",
                    source: files.config_file,
                    dest: data_dir.join(RESOLVED_CONFIG_FILE_NAME),
                    required: true,
                    render: true,
                },
            ],
        }
    }

    pub fn resolved_config_file(&self) -> PathBuf {
        self.data_dir.join(RESOLVED_CONFIG_FILE_NAME)
    }

    /// Values for rendered files: every entry's staged path plus the data dir.
    fn vars(&self) -> Vars {
        let mut vars = Vars::new();
        vars.insert("node-data-dir", self.data_dir.display().to_string());
        for entry in &self.entries {
            vars.insert(entry.name, entry.dest.display().to_string());
        }
        vars
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("required bootstrap file `{name}` is not configured")]
    MissingRequiredFile { name: &'static str },
    #[error("required bootstrap file `{name}` at {path} is unreadable: {source}")]
    UnreadableRequiredFile {
        name: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot render `{name}`: {source}")]
    Template {
        name: &'static str,
        #[source]
        source: TemplateError,
    },
    #[error("bootstrap io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

enum Plan<'a> {
    Skip,
    Stage(&'a ManifestEntry, &'a Path),
}

pub struct Bootstrapper {
    manifest: BootstrapManifest,
}

impl Bootstrapper {
    pub fn new(manifest: BootstrapManifest) -> Self {
        Self { manifest }
    }

    pub fn manifest(&self) -> &BootstrapManifest {
        &self.manifest
    }

    /// A missing data directory means the node state was wiped and the
    /// support files must be staged again.
    pub fn needs_prepare(&self) -> bool {
        !self.manifest.data_dir.exists()
    }

    pub fn prepare(&self) -> Result<(), BootstrapError> {
        let plan = self.plan()?;

        std::fs::create_dir_all(&self.manifest.data_dir).map_err(|source| BootstrapError::Io {
            path: self.manifest.data_dir.clone(),
            source,
        })?;

        let vars = self.manifest.vars();
        let mut staged = 0;
        for step in plan {
            if let Plan::Stage(entry, source) = step {
                self.stage(entry, source, &vars)?;
                staged += 1;
            }
        }
        info!(
            data_dir = %self.manifest.data_dir.display(),
            staged,
            "Node data directory bootstrapped"
        );
        Ok(())
    }

    /// Validates every entry before anything is written.
    fn plan(&self) -> Result<Vec<Plan<'_>>, BootstrapError> {
        self.manifest
            .entries
            .iter()
            .map(|entry| {
                if entry.dest.exists() {
                    debug!(name = entry.name, dest = %entry.dest.display(), "Already staged, skipping");
                    return Ok(Plan::Skip);
                }
                match (&entry.source, entry.required) {
                    (None, true) => Err(BootstrapError::MissingRequiredFile { name: entry.name }),
                    (None, false) => {
                        debug!(name = entry.name, "Not configured, skipping");
                        Ok(Plan::Skip)
                    }
                    (Some(source), required) => match std::fs::metadata(source) {
                        Ok(meta) if meta.is_file() => Ok(Plan::Stage(entry, source.as_path())),
                        Ok(_) if required => Err(BootstrapError::UnreadableRequiredFile {
                            name: entry.name,
                            path: source.clone(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::InvalidInput,
                                "not a regular file",
                            ),
                        }),
                        Err(err) if required => Err(BootstrapError::UnreadableRequiredFile {
                            name: entry.name,
                            path: source.clone(),
                            source: err,
                        }),
                        _ => {
                            debug!(name = entry.name, source = %source.display(), "Optional file absent, skipping");
                            Ok(Plan::Skip)
                        }
                    },
                }
            })
            .collect()
    }

    fn stage(&self, entry: &ManifestEntry, source: &Path, vars: &Vars) -> Result<(), BootstrapError> {
        let read_err = |source_err| {
            if entry.required {
                BootstrapError::UnreadableRequiredFile {
                    name: entry.name,
                    path: source.to_path_buf(),
                    source: source_err,
                }
            } else {
                BootstrapError::Io {
                    path: source.to_path_buf(),
                    source: source_err,
                }
            }
        };
        let content = std::fs::read(source).map_err(read_err)?;
        let content = if entry.render {
            let text = String::from_utf8_lossy(&content);
            template::render(&text, vars)
                .map_err(|source| BootstrapError::Template {
                    name: entry.name,
                    source,
                })?
                .into_bytes()
        } else {
            content
        };

        let io_err = |err| BootstrapError::Io {
            path: entry.dest.clone(),
            source: err,
        };
        if let Some(parent) = entry.dest.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let temp_path = entry.dest.with_extension("staging");
        let mut file = std::fs::File::create(&temp_path).map_err(io_err)?;
        file.write_all(&content).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        std::fs::rename(&temp_path, &entry.dest).map_err(io_err)?;
        info!(
            name = entry.name,
            from = %source.display(),
            to = %entry.dest.display(),
            "Staged bootstrap file"
        );
        Ok(())
    }
}
