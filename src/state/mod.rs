//! Persisted pipeline state.
//!
//! One JSON document per pipeline instance is the sole source of truth
//! between invocations. `StateStore` validates on every load and save and
//! never repairs a document on its own.

mod document;
mod lock;
mod store;

pub use document::{
    ExecutionState, HistoryEntry, Phase, PipelineState, ReviewDecision, ReviewFix, ReviewStatus,
    SCHEMA_VERSION,
};
pub use lock::StateLock;
pub use store::StateStore;
