//! The persisted, resumable delivery state machine.
//!
//! ```text
//! INIT → EXECUTE → AWAITING_REVIEW → REVIEW_PROCESSING → READY_TO_MERGE
//!          ↑  │                              │                 │
//!          │  └──→ FAILED                    │                 ├──→ COMPLETED
//!          └─────────────────────────────────┴─────────────────┘
//! ```
//!
//! `transitions` is the pure table; `runner` does the work of each phase.

mod runner;
mod transitions;

pub use runner::{DeliveryMachine, MachineSettings, ResetReport, StatusReport, StepOutcome};
pub use transitions::{RECOVERABLE_PHASES, Trigger, next_phase};
