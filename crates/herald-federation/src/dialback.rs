//! Dialback protocol support.
//!
//! Dialback establishes that a claimed source domain actually controls the
//! connection claiming to originate from it, without any pre-shared
//! credential. One process plays up to three roles concurrently, per domain
//! pair:
//!
//! * **Originator** — presents a freshly generated key on a new outbound link.
//! * **Receiver** — relays a received key to the claimed origin's
//!   authoritative server before trusting an inbound connection.
//! * **Authoritative** — confirms keys it generated itself.
//!
//! Role orchestration lives in [`crate::router`] and [`crate::context`]; this
//! module produces the key material.

use rand::Rng;

/// Length of a generated dialback key.
pub const KEY_LEN: usize = 16;

/// Generate a dialback key: [`KEY_LEN`] random ASCII digits.
///
/// Deliberately plain. The key only has to defeat casual spoofing — the
/// authoritative round trip is what establishes trust.
pub fn generate_key() -> String {
    let mut rng = rand::rng();
    (0..KEY_LEN).map(|_| char::from(b'0' + rng.random_range(0..10))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_fixed_length_digits() {
        for _ in 0..32 {
            let key = generate_key();
            assert_eq!(key.len(), KEY_LEN);
            assert!(key.bytes().all(|b| b.is_ascii_digit()));
        }
    }
}
