use crate::block::SuiBlock;
use thiserror::Error;
use tracing::warn;

pub const RECORD_PREFIX: &str = "FIRE ";
pub const BLOCK_PART: &str = "BLOCK ";
pub const INIT_PART: &str = "INIT ";

/// A block record emitted on the node's standard output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeRecord {
    Init {
        protocol_version: String,
        node_version: String,
    },
    Block(Box<SuiBlock>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line is not a block record")]
    NotARecord,
    #[error("unknown record kind: {0}")]
    UnknownKind(String),
    #[error("malformed {kind} record: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("invalid hex payload: {0}")]
    Hex(#[from] faster_hex::Error),
    #[error("undecodable block payload: {0}")]
    Payload(#[from] bincode::Error),
}

pub fn is_record_line(line: &str) -> bool {
    line.starts_with(RECORD_PREFIX)
}

pub fn parse_record(line: &str) -> Result<NativeRecord, DecodeError> {
    let record = line
        .trim_end()
        .strip_prefix(RECORD_PREFIX)
        .ok_or(DecodeError::NotARecord)?;

    if let Some(hex) = record.strip_prefix(BLOCK_PART) {
        let hex = hex.trim();
        if hex.is_empty() || hex.len() % 2 != 0 {
            return Err(DecodeError::Malformed {
                kind: "BLOCK",
                reason: format!("payload has odd or zero length {}", hex.len()),
            });
        }
        let mut bytes = vec![0u8; hex.len() / 2];
        faster_hex::hex_decode(hex.as_bytes(), &mut bytes)?;
        let block: SuiBlock = bincode::deserialize(&bytes)?;
        return Ok(NativeRecord::Block(Box::new(block)));
    }

    if let Some(rest) = record.strip_prefix(INIT_PART) {
        let mut parts = rest.split_whitespace();
        return match (parts.next(), parts.next(), parts.next()) {
            (Some(protocol_version), Some(node_version), None) => Ok(NativeRecord::Init {
                protocol_version: protocol_version.to_string(),
                node_version: node_version.to_string(),
            }),
            _ => Err(DecodeError::Malformed {
                kind: "INIT",
                reason: format!("expected `<protocol> <node>` got {rest:?}"),
            }),
        };
    }

    let kind = record.split_whitespace().next().unwrap_or_default();
    warn!(kind, "Unknown record kind");
    Err(DecodeError::UnknownKind(kind.to_string()))
}

/// Renders a block the way the instrumented node prints it.
pub fn format_block_record(block: &SuiBlock) -> Result<String, bincode::Error> {
    let bytes = bincode::serialize(block)?;
    Ok(format!(
        "{RECORD_PREFIX}{BLOCK_PART}{}",
        faster_hex::hex_string(&bytes)
    ))
}
