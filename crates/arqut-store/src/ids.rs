//! Short alphanumeric identifiers.

use rand::Rng;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const SERVICE_ID_LEN: usize = 8;
const EDGE_ID_LEN: usize = 16;

/// Random alphanumeric string of the given length.
pub fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// 8-character service / message id.
pub fn short_id() -> String {
    random_string(SERVICE_ID_LEN)
}

/// 16-character edge id, used when `EDGE_ID` is not configured.
pub fn edge_id() -> String {
    random_string(EDGE_ID_LEN)
}
