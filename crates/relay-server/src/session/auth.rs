use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::SessionError;

/// Shared secret checked without leaking where a mismatch starts.
///
/// Both sides are hashed first so the comparison always runs over 32 bytes,
/// whatever length the presented token has.
#[derive(Clone)]
pub(crate) struct AuthToken {
    digest: [u8; 32],
}

impl AuthToken {
    pub(crate) fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }

    pub(crate) fn verify(&self, presented: Option<&str>) -> Result<(), SessionError> {
        let presented = presented.unwrap_or_default();
        let digest: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        if bool::from(self.digest[..].ct_eq(&digest[..])) && !presented.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Unauthorized)
        }
    }

    /// Checks an `Authorization: Bearer <token>` header value.
    pub(crate) fn verify_bearer(&self, header: Option<&str>) -> Result<(), SessionError> {
        let token = header.and_then(|value| value.strip_prefix("Bearer "));
        self.verify(token.map(str::trim))
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(..)")
    }
}
