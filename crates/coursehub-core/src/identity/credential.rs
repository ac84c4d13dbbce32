//! Random credential generation for new directory records.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Minimum length of a generated credential.
pub const MIN_CREDENTIAL_LENGTH: usize = 12;

const MIN_DIGITS: usize = 3;

const ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789=+-[]!$():./*";

/// Returns true if `candidate` satisfies the credential policy: at least
/// [`MIN_CREDENTIAL_LENGTH`] characters, one upper-case letter, one lower-case
/// letter and three digits.
pub fn satisfies_policy(candidate: &str) -> bool {
    candidate.chars().count() >= MIN_CREDENTIAL_LENGTH
        && candidate.chars().any(|c| c.is_ascii_uppercase())
        && candidate.chars().any(|c| c.is_ascii_lowercase())
        && candidate.chars().filter(|c| c.is_ascii_digit()).count() >= MIN_DIGITS
}

/// Generates a credential of `length` characters (at least the policy
/// minimum), drawing again until the policy is met.
pub fn generate_credential<R: Rng>(rng: &mut R, length: usize) -> String {
    let length = length.max(MIN_CREDENTIAL_LENGTH);
    loop {
        let candidate: String = (0..length)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        if satisfies_policy(&candidate) {
            return candidate;
        }
    }
}

/// Hashes a credential for storage as a `userPassword` value using the
/// salted SHA-256 scheme: `{SSHA256}` + base64(sha256(secret || salt) || salt).
pub fn hash_credential<R: Rng>(rng: &mut R, secret: &str) -> String {
    let mut salt = [0u8; 8];
    rng.fill(&mut salt);

    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(salt);
    let mut payload = hasher.finalize().to_vec();
    payload.extend_from_slice(&salt);

    format!("{{SSHA256}}{}", BASE64_STANDARD.encode(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_policy() {
        assert!(satisfies_policy("Abcdefgh123x"));
        assert!(!satisfies_policy("Abcdefgh12xy")); // two digits
        assert!(!satisfies_policy("abcdefgh123x")); // no upper
        assert!(!satisfies_policy("ABCDEFGH123X")); // no lower
        assert!(!satisfies_policy("Ab123")); // too short
    }

    #[test]
    fn test_generated_credentials_always_satisfy_policy() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let credential = generate_credential(&mut rng, 12);
            assert_eq!(credential.len(), 12);
            assert!(satisfies_policy(&credential), "{}", credential);
        }
    }

    #[test]
    fn test_short_length_is_raised_to_minimum() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(generate_credential(&mut rng, 4).len(), MIN_CREDENTIAL_LENGTH);
    }

    #[test]
    fn test_hash_hides_secret_and_is_salted() {
        let mut rng = StdRng::seed_from_u64(3);
        let first = hash_credential(&mut rng, "Abcdefgh123x");
        let second = hash_credential(&mut rng, "Abcdefgh123x");

        assert!(first.starts_with("{SSHA256}"));
        assert!(!first.contains("Abcdefgh123x"));
        assert_ne!(first, second);

        let decoded = BASE64_STANDARD
            .decode(first.trim_start_matches("{SSHA256}"))
            .unwrap();
        assert_eq!(decoded.len(), 32 + 8);
    }
}
