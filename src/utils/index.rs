use crate::wallet::WalletSyncError;

use rust_decimal::Decimal;

/// Convert a base-unit amount into display units, exactly.
///
/// `scale_amount(4046, 2)` is `40.46`. Fails when the amount does not fit the 96-bit mantissa
/// or `decimals` exceeds the maximum scale of 28.
pub fn scale_amount(amount: u128, decimals: u32) -> Result<Decimal, WalletSyncError> {
    let mantissa = i128::try_from(amount).map_err(|_| {
        WalletSyncError::MalformedData(format!("Amount {} is out of range", amount))
    })?;

    Decimal::try_from_i128_with_scale(mantissa, decimals).map_err(|e| {
        WalletSyncError::MalformedData(format!(
            "Cannot scale {} by {} decimals: {}",
            amount, decimals, e
        ))
    })
}
