pub mod block;
pub mod record;

pub use block::{CheckpointTransaction, SuiBlock};
pub use record::{format_block_record, is_record_line, parse_record, DecodeError, NativeRecord};
