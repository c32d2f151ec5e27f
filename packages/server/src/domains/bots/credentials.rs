use sha2::{Digest, Sha256};

pub fn hash_credential(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// Compare a presented credential to a stored hash without short-circuiting
/// on the first differing byte.
pub fn credential_matches(stored_hash: &str, presented: &str) -> bool {
    let Ok(stored) = hex::decode(stored_hash) else {
        return false;
    };
    let presented = Sha256::digest(presented.as_bytes());
    if stored.len() != presented.len() {
        return false;
    }

    stored
        .iter()
        .zip(presented.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
