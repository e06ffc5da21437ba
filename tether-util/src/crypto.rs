use rand::Rng;
use sha2::{Digest as _, Sha256};

pub const ALPHA_NUM: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Build a random string of `len` characters picked from `charset`.
///
/// Not suitable for secrets that need a CSPRNG guarantee beyond what
/// the thread rng provides.
pub fn pseudorandom_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..charset.len());
            charset[idx] as char
        })
        .collect()
}

pub fn sha256_hex_digest<D: AsRef<[u8]>>(data: D) -> String {
    let mut hasher = Sha256::default();
    hasher.update(data.as_ref());
    let digest = hasher.finalize();
    format!("{digest:x}")
}
