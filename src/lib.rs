pub mod backend;
pub mod billing;
pub mod cli;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod engine;
pub mod entitlement;
pub mod exit;
pub mod identity;
pub mod logs;
pub mod page;
pub mod pending;
pub mod recovery;
pub mod signal;
pub mod store;
pub mod ui;

#[cfg(test)]
mod testing;
