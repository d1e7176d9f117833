//! Argon2id password hashes, stored as PHC strings
//! (`$argon2id$v=19$m=...,t=...,p=...$<salt>$<hash>`).

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{self, SaltString},
};
use rand::RngCore;

pub fn hash(password: &str) -> Result<String, password_hash::Error> {
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt)?;
    Ok(Argon2::default().hash_password(password.as_bytes(), &salt)?.to_string())
}

/// Parameters are read from the stored string, so older hashes keep working
/// if the defaults change.
pub fn verify(password: &str, encoded: &str) -> bool {
    PasswordHash::new(encoded)
        .is_ok_and(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_own_hash_only() {
        let stored = hash("password123").unwrap();
        assert!(stored.starts_with("$argon2id$"));
        assert!(verify("password123", &stored));
        assert!(!verify("password124", &stored));
    }

    #[test]
    fn salts_differ() {
        assert_ne!(hash("same").unwrap(), hash("same").unwrap());
    }

    #[test]
    fn garbage_never_verifies() {
        assert!(!verify("x", ""));
        assert!(!verify("x", "$argon2id$v=19$m=8,t=1,p=1$!!$AAAA"));
        assert!(!verify("x", "sha256$10000$AAAA$AAAA"));
    }
}
