//! Bounded polling of the external review system.
//!
//! Each poll is one short call whose result is persisted by the caller, so a
//! wait can be interrupted at any point between polls. Running out of budget
//! never fails the pipeline; it only asks for a manual check.

mod poller;

pub use poller::{
    DEFAULT_MAX_POLL_DURATION_MS, DEFAULT_POLL_INTERVAL_MS, PollConfig, PollReport, ReviewPoller,
};
