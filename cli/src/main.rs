use std::time::UNIX_EPOCH;

use anyhow::Context;
use clap::{Command, arg, command, value_parser};
use dotenv::dotenv;
use protocol::{NativeRecord, parse_record};
use reader_lib::{SyncState, SyncStateError, SyncStateStore, canonicalize};
use serde::Serialize;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::get_cli_config;

mod config;

/// Canonical envelope of a decoded block record, without the payload bytes.
#[derive(Debug, Serialize)]
struct Envelope {
    id: String,
    number: u64,
    previous_id: String,
    timestamp_ms: u64,
    lib_num: u64,
    payload_version: i32,
    payload_len: usize,
}

fn main() -> anyhow::Result<()> {
    // ignore faillures as .env might not be present at runtime, and this use-case is tolerated
    dotenv()
        .inspect_err(|err| println!("[WARN] reading .env files is failed with err {err}"))
        .ok();

    let config = get_cli_config()?;

    // logs
    let (non_blocking_appender, _guard_stdout) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_appender)
        .with_filter(config.rust_log);
    tracing_subscriber::registry()
        .with(stderr_subscriber)
        .init();

    let matches = cli().get_matches();
    let output = match matches.subcommand() {
        Some(("sync-state", sub_matches)) => {
            let store = SyncStateStore::new(config.sync_state_path()?);
            match sub_matches.subcommand() {
                Some(("show", _)) => show_sync_state(&store)?,
                Some(("reset", reset_matches)) => {
                    let block_num = reset_matches
                        .get_one::<u64>("BLOCK_NUM")
                        .copied()
                        .context("missing block number")?;
                    reset_sync_state(&store, block_num)?
                }
                _ => anyhow::bail!("unknown sync-state subcommand"),
            }
        }
        Some(("decode", sub_matches)) => {
            let line = sub_matches
                .get_one::<String>("LINE")
                .context("missing record line")?;
            decode_line(line)?
        }
        _ => anyhow::bail!("unknown subcommand"),
    };
    println!("{output}");

    Ok(())
}

fn cli() -> Command {
    command!() // requires `cargo` feature
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("sync-state")
                .alias("s")
                .about("inspect or reset the reader sync state")
                .subcommand_required(true)
                .subcommand(Command::new("show").about("print the persisted sync state"))
                .subcommand(
                    Command::new("reset")
                        .about("overwrite the sync state, may move it backwards")
                        .arg(
                            arg!([BLOCK_NUM])
                                .required(true)
                                .value_parser(value_parser!(u64)),
                        ),
                ),
        )
        .subcommand(
            Command::new("decode")
                .alias("d")
                .about("decode a raw `FIRE ...` record line")
                .arg(arg!([LINE]).required(true)),
        )
}

fn show_sync_state(store: &SyncStateStore) -> anyhow::Result<String> {
    match store.load() {
        Ok(state) => Ok(serde_json::to_string_pretty(&state)?),
        Err(SyncStateError::NotFound(path)) => Ok(format!("no sync state at {}", path.display())),
        Err(err) => Err(err.into()),
    }
}

fn reset_sync_state(store: &SyncStateStore, block_num: u64) -> anyhow::Result<String> {
    let previous = match store.load() {
        Ok(state) => Some(state.block_num),
        Err(SyncStateError::NotFound(_)) => None,
        // a corrupt file is exactly what a reset is for
        Err(SyncStateError::Corrupt { .. }) => None,
        Err(err) => return Err(err.into()),
    };
    store.reset(SyncState { block_num })?;
    Ok(match previous {
        Some(previous) => format!("sync state moved from {previous} to {block_num}"),
        None => format!("sync state set to {block_num}"),
    })
}

fn decode_line(line: &str) -> anyhow::Result<String> {
    match parse_record(line)? {
        NativeRecord::Init {
            protocol_version,
            node_version,
        } => Ok(format!(
            "init record: protocol {protocol_version}, node {node_version}"
        )),
        NativeRecord::Block(block) => {
            let canonical = canonicalize(&block)?;
            let envelope = Envelope {
                timestamp_ms: canonical
                    .timestamp
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default(),
                payload_len: canonical.payload.len(),
                payload_version: canonical.payload_version,
                lib_num: canonical.lib_num,
                number: canonical.number,
                id: canonical.id,
                previous_id: canonical.previous_id,
            };
            Ok(serde_json::to_string_pretty(&envelope)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{SuiBlock, format_block_record};
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_subcommands() {
        cli().debug_assert();
        let matches = cli()
            .try_get_matches_from(["cli", "sync-state", "reset", "42"])
            .unwrap();
        let (_, sync_state) = matches.subcommand().unwrap();
        let (name, reset) = sync_state.subcommand().unwrap();
        assert_eq!(name, "reset");
        assert_eq!(reset.get_one::<u64>("BLOCK_NUM"), Some(&42));

        assert!(cli()
            .try_get_matches_from(["cli", "sync-state", "reset", "abc"])
            .is_err());
        assert!(cli().try_get_matches_from(["cli", "sync-state"]).is_err());
    }

    #[test]
    fn test_show_and_reset_sync_state() {
        let dir = TempDir::new().unwrap();
        let store = SyncStateStore::in_dir(dir.path());
        assert!(show_sync_state(&store).unwrap().starts_with("no sync state"));

        assert_eq!(
            reset_sync_state(&store, 150).unwrap(),
            "sync state set to 150"
        );
        assert_eq!(
            reset_sync_state(&store, 90).unwrap(),
            "sync state moved from 150 to 90"
        );
        assert!(show_sync_state(&store).unwrap().contains("\"block_num\": 90"));
        assert_eq!(
            SyncStateStore::in_dir(dir.path()).load().unwrap(),
            SyncState { block_num: 90 }
        );
    }

    #[test]
    fn test_reset_replaces_corrupt_state() {
        let dir = TempDir::new().unwrap();
        let store = SyncStateStore::in_dir(dir.path());
        std::fs::write(store.path(), b"{\"block_num\":").unwrap();
        assert!(show_sync_state(&store).is_err());

        assert_eq!(reset_sync_state(&store, 7).unwrap(), "sync state set to 7");
        assert_eq!(store.load().unwrap(), SyncState { block_num: 7 });
    }

    #[test]
    fn test_decode_block_line() {
        let block = SuiBlock {
            sequence_number: 12,
            digest: "D12".to_string(),
            previous_digest: Some("D11".to_string()),
            epoch: 1,
            timestamp_ms: 1_700_000_012_000,
            network_total_transactions: 120,
            transactions: vec![],
        };
        let line = format_block_record(&block).unwrap();

        let output: serde_json::Value = serde_json::from_str(&decode_line(&line).unwrap()).unwrap();
        assert_eq!(output["number"], 12);
        assert_eq!(output["id"], "D12");
        assert_eq!(output["previous_id"], "D11");
        assert_eq!(output["lib_num"], 11);
        assert_eq!(output["timestamp_ms"], 1_700_000_012_000u64);
        assert!(output["payload_len"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_decode_init_and_garbage() {
        assert_eq!(
            decode_line("FIRE INIT 1.0 sui-node-1.14.0").unwrap(),
            "init record: protocol 1.0, node sui-node-1.14.0"
        );
        assert!(decode_line("INFO started").is_err());
        assert!(decode_line("FIRE BLOCK zz").is_err());
    }
}
