//! Short random identifiers for namespacing cloud resources.
//!
//! Parallel test runs that share an account need resource names that do
//! not clash. The identifiers produced here are short enough to embed in
//! provider names with tight length limits, and random enough that
//! collisions within one account over a test's lifetime are rare. They are
//! not guaranteed unique; provisioning retries absorb the occasional clash.

use rand::Rng;

/// Alphabet used for identifiers (base 62).
const BASE62_ALPHABET: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of identifiers returned by [`unique_id`].
pub const UNIQUE_ID_LEN: usize = 6;

/// Returns a random base-62 identifier of [`UNIQUE_ID_LEN`] characters.
#[must_use]
pub fn unique_id() -> String {
    unique_id_with_len(UNIQUE_ID_LEN)
}

/// Returns a random base-62 identifier of `len` characters.
#[must_use]
pub fn unique_id_with_len(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let position = rng.random_range(0..BASE62_ALPHABET.len());
            BASE62_ALPHABET
                .get(position)
                .map_or('0', |byte| char::from(*byte))
        })
        .collect()
}

/// Builds `<prefix>-<id>` with a lowercased identifier.
///
/// Several providers reject uppercase characters in resource names, so the
/// identifier is lowercased; this slightly raises the collision rate.
#[must_use]
pub fn resource_name(prefix: &str) -> String {
    format!("{prefix}-{}", unique_id().to_ascii_lowercase())
}
