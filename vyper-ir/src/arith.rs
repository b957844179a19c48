//! Two's-complement helpers over `U256`.

use ethereum_types::U256;

/// Split into sign and magnitude.
pub(crate) fn to_signed(x: U256) -> (bool, U256) {
    if x.bit(255) {
        (true, (!x).overflowing_add(U256::one()).0)
    } else {
        (false, x)
    }
}

/// Rebuild from sign and magnitude.
pub(crate) fn from_signed(negative: bool, magnitude: U256) -> U256 {
    if negative {
        (!magnitude).overflowing_add(U256::one()).0
    } else {
        magnitude
    }
}

/// Signed comparison.
pub(crate) fn signed_lt(a: U256, b: U256) -> bool {
    match (a.bit(255), b.bit(255)) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    }
}

/// 0 or 1 as a word.
pub(crate) fn bool_word(b: bool) -> U256 {
    if b {
        U256::one()
    } else {
        U256::zero()
    }
}
