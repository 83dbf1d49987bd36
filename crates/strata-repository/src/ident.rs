//! Opaque identifier generation.

use rand::distr::Alphanumeric;
use rand::Rng;

/// Generate a random identifier of `len` URL-safe characters.
///
/// Alphanumeric characters carry just under six bits of entropy each, so
/// the sixteen-character repository id comfortably clears eighty bits.
pub fn generate_id(len: usize) -> String {
    let rng = rand::rng();
    rng.sample_iter(Alphanumeric).take(len).map(char::from).collect()
}
