//! Shared account records for the registration tools
//!
//! The account lifecycle and batch statistics used by the CLI and by
//! anything else that drives registrations through the flow engine.

pub mod account;

pub use account::{Account, AccountStatus, BatchStatistics};
