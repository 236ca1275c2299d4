//! Wallet state synchronization for eCash against the Chronik indexer.

pub mod config;
pub mod indexer;
pub mod utils;
pub mod wallet;
