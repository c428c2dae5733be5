//! Device synchronization engine
//!
//! Pulls punches from attendance terminals, pairs them into attendance
//! intervals and writes them to the central ledger. Records are cleared from
//! a terminal only after the ledger has accepted everything built from them.

pub mod audit;
pub mod config;
pub mod dedup;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod types;
