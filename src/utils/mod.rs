//!
//! Utility module for the wallet sync engine.
//!
//! Re-exports the exact amount scaling helper used throughout the codebase.
/// Amount scaling
pub mod index;

pub use index::scale_amount;
