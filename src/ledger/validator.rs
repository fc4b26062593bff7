//! Balance Validator

use super::types::Amount;

/// `true` when debiting `amount` leaves `current_balance` non-negative.
///
/// Must be fed the balance read under the account's row lock; a value read
/// before the lock is only good for a fast pre-check.
#[inline]
pub fn can_debit(current_balance: Amount, amount: Amount) -> bool {
    match current_balance.checked_sub(amount) {
        Some(remaining) => remaining >= 0,
        None => false,
    }
}
