pub mod sync;
pub mod types;

pub use sync::SyncScheduler;
pub use types::*;

/// Decimal places of the native currency (1 XEC = 100 satoshis).
pub const XEC_DECIMALS: u32 = 2;
