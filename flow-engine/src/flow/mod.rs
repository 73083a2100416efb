//! Flow module - document model, loading, resolution and execution

pub mod model;
pub mod loader;
pub mod resolver;
pub mod actions;
pub mod control;
pub mod otp;
pub mod imap;
pub mod runner;
pub mod batch;
pub mod browser;
pub mod page;
