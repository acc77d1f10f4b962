pub mod block_stream;
pub mod bootstrap;
pub mod canonical;
pub mod node_args;
pub mod one_block;
pub mod operator;
pub mod readiness;
pub mod reader;
pub mod supervisor;
pub mod sync_state;
pub mod template;

pub use block_stream::{BackpressurePolicy, BlockStreamServer, HeadInfo};
pub use canonical::{canonicalize, CanonicalBlock};
pub use operator::{Operator, OperatorError, OperatorPhase, OperatorSummary, RestartPolicy};
pub use readiness::{HeadObserver, MetricsAndReadinessManager, ReaderMetricsSnapshot};
pub use sync_state::{SyncState, SyncStateError, SyncStateStore};
