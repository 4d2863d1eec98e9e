//! Access secrets for published artifacts: issuance and verification.

use rand::Rng;

/// Characters that survive being read aloud or copied by hand; visually
/// confusable ones (0/O, 1/l/I) are excluded.
const SECRET_ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyzABCDEFGHJKMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy)]
pub struct SecretIssuer {
    length: usize,
}

impl SecretIssuer {
    pub fn new(length: usize) -> Self {
        // Anything shorter is trivially guessable.
        Self {
            length: length.max(8),
        }
    }

    /// Generates a fresh secret. Shown to the owner exactly once per
    /// issuance or rotation.
    pub fn issue(&self) -> String {
        let mut rng = rand::rng();
        (0..self.length)
            .map(|_| {
                let index = rng.random_range(0..SECRET_ALPHABET.len());
                SECRET_ALPHABET[index] as char
            })
            .collect()
    }
}

/// Constant-time comparison: iterates over the longer of the two inputs so
/// timing does not reveal the length of the common prefix.
pub fn verify(expected: &str, candidate: &str) -> bool {
    let expected = expected.as_bytes();
    let candidate = candidate.as_bytes();
    let mut diff = expected.len() ^ candidate.len();
    for index in 0..expected.len().max(candidate.len()) {
        let a = expected.get(index).copied().unwrap_or(0);
        let b = candidate.get(index).copied().unwrap_or(0);
        diff |= usize::from(a ^ b);
    }
    diff == 0
}
