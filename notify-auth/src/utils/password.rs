use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Verified against when there is no real hash, so a missing account costs
/// the same argon2 work as a wrong password.
const DUMMY_SECRET: &str = "notify-auth-timing-equalizer";

/// Newtype for password to prevent accidental logging
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: String) -> Self {
        Self(password)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(***)")
    }
}

/// One-way hashing for passwords and opaque access-token secrets (Argon2id).
///
/// The salt is generated per call and embedded in the PHC string, so the same
/// secret never hashes to the same value twice.
#[derive(Clone)]
pub struct SecretHasher {
    params: Params,
    dummy_hash: Arc<OnceLock<Option<String>>>,
    verifications: Arc<AtomicU64>,
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self::new(Params::default())
    }
}

impl SecretHasher {
    pub fn new(params: Params) -> Self {
        Self {
            params,
            dummy_hash: Arc::new(OnceLock::new()),
            verifications: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Minimal-cost parameters for tests.
    pub fn fast() -> Result<Self, anyhow::Error> {
        let params = Params::new(Params::MIN_M_COST, Params::MIN_T_COST, 1, None)
            .map_err(|e| anyhow::anyhow!("Invalid argon2 parameters: {}", e))?;
        Ok(Self::new(params))
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, secret: &str) -> Result<String, anyhow::Error> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("Failed to hash secret: {}", e))?
            .to_string();
        Ok(hash)
    }

    /// Constant-time inside argon2. A malformed stored hash never matches.
    pub fn verify(&self, secret: &str, hash: &str) -> bool {
        self.verifications.fetch_add(1, Ordering::Relaxed);
        match PasswordHash::new(hash) {
            // Parameters come from the PHC string, not from `self.params`.
            Ok(parsed) => self
                .argon2()
                .verify_password(secret.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Stored secret hash is malformed");
                false
            }
        }
    }

    pub fn hash_password(&self, password: &Password) -> Result<String, anyhow::Error> {
        self.hash(password.as_str())
    }

    pub fn verify_password(&self, password: &Password, hash: &str) -> bool {
        self.verify(password.as_str(), hash)
    }

    /// Verify against `hash`, or burn an equivalent verification against a
    /// dummy hash when there is none. Only a real hash can match.
    pub fn verify_password_or_dummy(&self, password: &Password, hash: Option<&str>) -> bool {
        match hash {
            Some(hash) => self.verify_password(password, hash),
            None => {
                let dummy = self.dummy_hash.get_or_init(|| match self.hash(DUMMY_SECRET) {
                    Ok(hash) => Some(hash),
                    Err(e) => {
                        tracing::error!(error = %e, "Could not prepare dummy hash");
                        None
                    }
                });
                if let Some(dummy) = dummy {
                    self.verify_password(password, dummy);
                }
                false
            }
        }
    }

    /// Argon2 verifications run so far by this hasher and its clones.
    pub fn verifications(&self) -> u64 {
        self.verifications.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() -> Result<(), anyhow::Error> {
        let hasher = SecretHasher::fast()?;
        let password = Password::new("mySecurePassword123".to_string());
        let hash = hasher.hash_password(&password)?;

        assert!(hash.starts_with("$argon2id"));
        assert!(hasher.verify_password(&password, &hash));
        assert!(!hasher.verify_password(&Password::new("wrongPassword".to_string()), &hash));
        Ok(())
    }

    #[test]
    fn missing_hash_still_costs_a_verification() -> Result<(), anyhow::Error> {
        let hasher = SecretHasher::fast()?;
        let password = Password::new(DUMMY_SECRET.to_string());

        assert!(!hasher.verify_password_or_dummy(&password, None));
        assert!(!hasher.verify_password_or_dummy(&password, None));
        assert_eq!(hasher.verifications(), 2);

        let hash = hasher.hash_password(&password)?;
        assert!(hasher.verify_password_or_dummy(&password, Some(&hash)));
        assert_eq!(hasher.verifications(), 3);
        Ok(())
    }

    #[test]
    fn test_different_hashes_for_same_secret() -> Result<(), anyhow::Error> {
        let hasher = SecretHasher::fast()?;
        let hash1 = hasher.hash("ntk_abc")?;
        let hash2 = hasher.hash("ntk_abc")?;

        assert_ne!(hash1, hash2);
        assert!(hasher.verify("ntk_abc", &hash1));
        assert!(hasher.verify("ntk_abc", &hash2));
        Ok(())
    }

    #[test]
    fn test_malformed_hash_never_matches() -> Result<(), anyhow::Error> {
        let hasher = SecretHasher::fast()?;
        assert!(!hasher.verify("anything", "not-a-phc-string"));
        Ok(())
    }

    #[test]
    fn test_password_debug_is_redacted() {
        let password = Password::new("hunter2".to_string());
        assert_eq!(format!("{:?}", password), "Password(***)");
    }
}
