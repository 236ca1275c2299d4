//! Indexer integration module for the eCash Chronik indexer
//!
//! This module provides the clients and types for querying UTXO sets, transactions and
//! token metadata, and for receiving push notifications about wallet scripts.

/// GraphQL client for indexer queries
mod client;
/// Service traits the sync engine depends on
mod service;
/// WebSocket push subscription client
mod subscription;
/// Type definitions for indexer data structures
mod types;

pub use client::ChronikIndexerClient;
pub use service::*;
pub use subscription::{ChronikWsConnector, ChronikWsSubscription};
pub use types::*;
