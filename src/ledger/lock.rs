//! Keys for transaction-scoped advisory locks.
//!
//! Funding takes the shift lock first and the pool lock second. Keeping that
//! order everywhere is what keeps two units of work from deadlocking.

use sha2::{Digest, Sha256};

use super::models::ShiftKey;

/// Serialises every funding decision for one (user, event) pair
pub fn shift_lock_key(shift: ShiftKey) -> i64 {
    hash_key(&format!("earn_shift:{}:{}", shift.user_id, shift.event_id))
}

/// Serialises draws against one pool's donations
pub fn pool_lock_key(pool_id: i64) -> i64 {
    hash_key(&format!("pool_draw:{}", pool_id))
}

fn hash_key(material: &str) -> i64 {
    let digest = Sha256::digest(material.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shift_key_is_stable_and_pair_specific() {
        let a = shift_lock_key(ShiftKey::new(10, 20));
        assert_eq!(a, shift_lock_key(ShiftKey::new(10, 20)));
        assert_ne!(a, shift_lock_key(ShiftKey::new(20, 10)));
        assert_ne!(a, shift_lock_key(ShiftKey::new(10, 21)));
    }

    #[test]
    fn test_pool_and_shift_namespaces_differ() {
        assert_ne!(pool_lock_key(1), shift_lock_key(ShiftKey::new(1, 1)));
    }
}
