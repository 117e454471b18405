#![forbid(unsafe_code)]

// Room password digests. The shared per-room password is stored only as an
// argon2 PHC string, never in clear.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed = PasswordHash::new(hash)?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("speakeasy").unwrap();
        assert!(verify_password("speakeasy", &hash).unwrap());
        assert!(!verify_password("sp3akeasy", &hash).unwrap());
    }

    #[test]
    fn same_password_salts_differently() {
        let h1 = hash_password("twin").unwrap();
        let h2 = hash_password("twin").unwrap();
        assert_ne!(h1, h2);
        assert!(verify_password("twin", &h1).unwrap());
        assert!(verify_password("twin", &h2).unwrap());
    }
}
