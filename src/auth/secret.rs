//! Constant-time secret comparison.
//!
//! The content comparison XOR-folds every byte pair so timing does not
//! depend on where the inputs first differ. Length is not considered
//! sensitive, so a length mismatch may short-circuit.

/// Compare two byte strings in time independent of the position of the
/// first differing byte.
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (lhs, rhs) in left.iter().zip(right.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Fail-closed check of a presented credential against the configured
/// secret: an absent or empty configured secret never matches anything.
pub fn secrets_match(configured: Option<&str>, presented: &str) -> bool {
    match configured {
        Some(secret) if !secret.is_empty() => {
            constant_time_eq(secret.as_bytes(), presented.as_bytes())
        }
        _ => false,
    }
}
