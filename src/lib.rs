pub mod atomic;
pub mod branch;
pub mod config;
pub mod dag;
pub mod errors;
pub mod ledger;
pub mod logging;
pub mod machine;
pub mod review;
pub mod services;
pub mod state;
pub mod task;
pub mod waveforge_config;
