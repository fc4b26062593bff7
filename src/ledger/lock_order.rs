//! Lock ordering
//!
//! Every path that locks two accounts takes them in ascending id order.
//! Two transfers over the same pair, in either direction, therefore request
//! the locks in the same sequence and can never wait on each other in a cycle.

use super::types::AccountId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOrder {
    first: AccountId,
    second: AccountId,
}

impl LockOrder {
    /// Canonical order for a pair of distinct accounts
    pub fn of(a: AccountId, b: AccountId) -> Self {
        debug_assert_ne!(a, b, "lock order requires two distinct accounts");
        if a < b {
            Self {
                first: a,
                second: b,
            }
        } else {
            Self {
                first: b,
                second: a,
            }
        }
    }

    pub fn first(&self) -> AccountId {
        self.first
    }

    pub fn second(&self) -> AccountId {
        self.second
    }

    pub fn sequence(&self) -> [AccountId; 2] {
        [self.first, self.second]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_direction_independent() {
        assert_eq!(LockOrder::of(7, 3), LockOrder::of(3, 7));
        assert_eq!(LockOrder::of(7, 3).sequence(), [3, 7]);
    }

    #[test]
    fn test_lower_id_first() {
        let order = LockOrder::of(42, 1001);
        assert_eq!(order.first(), 42);
        assert_eq!(order.second(), 1001);
    }

    #[test]
    fn test_negative_ids_ordered_numerically() {
        assert_eq!(LockOrder::of(1, -5).sequence(), [-5, 1]);
    }
}
