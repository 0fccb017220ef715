use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};

fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    let argon2 = argon2::Argon2::default();
    Ok(argon2.hash_password(password.as_bytes(), &salt)?.to_string())
}

// Output comparison inside `verify_password` is constant-time.
fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    argon2::Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Reference credential for mutating requests.
///
/// Only the salted hash is kept; the salt is regenerated on every start of
/// the panel.
#[derive(Clone)]
pub struct AdminCredentials {
    reference_hash: Arc<str>,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials").finish_non_exhaustive()
    }
}

impl AdminCredentials {
    pub fn new(password: &str) -> anyhow::Result<Self> {
        let hash = hash_password(password)
            .map_err(|e| anyhow::anyhow!("hash admin password: {e}"))?;
        Ok(Self {
            reference_hash: Arc::from(hash),
        })
    }

    /// Runs the hash on the blocking pool.
    pub async fn verify(&self, candidate: String) -> bool {
        let hash = self.reference_hash.clone();
        match tokio::task::spawn_blocking(move || verify_password(&hash, &candidate)).await {
            Ok(ok) => ok,
            Err(err) => {
                tracing::warn!(%err, "password verification task failed");
                false
            }
        }
    }
}
