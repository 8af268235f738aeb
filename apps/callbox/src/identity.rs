//! Local identities and validation of remote ones.

use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

const ADJECTIVES: [&str; 8] = [
    "calm", "bright", "kind", "brave", "sunny", "clever", "lively", "gentle",
];
const NOUNS: [&str; 8] = [
    "window", "star", "mountain", "ocean", "cloud", "sun", "moon", "flower",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("remote identity is empty")]
    Empty,
    #[error("cannot connect to your own identity ({0})")]
    SelfReference(String),
}

/// Generates an `adjective-noun-N` identity with `N` in `0..100`.
pub fn generate_identity() -> String {
    generate_identity_with(&mut rand::thread_rng())
}

pub fn generate_identity_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("calm");
    let noun = NOUNS.choose(rng).copied().unwrap_or("star");
    let number: u8 = rng.gen_range(0..100);
    format!("{adjective}-{noun}-{number}")
}

/// Trims `remote` and rejects it when empty or equal to `local`.
pub fn validate_remote(local: &str, remote: &str) -> Result<String, IdentityError> {
    let remote = remote.trim();
    if remote.is_empty() {
        return Err(IdentityError::Empty);
    }
    if remote == local {
        return Err(IdentityError::SelfReference(remote.to_string()));
    }
    Ok(remote.to_string())
}
