use hmac::{digest::InvalidLength, Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Keyed password digests. The stored form is the hex HMAC-SHA256 of the
/// password under the service secret.
#[derive(Clone)]
pub struct PasswordHasher {
    secret: Vec<u8>,
}

impl PasswordHasher {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn hash(&self, password: &str) -> Result<String, InvalidLength> {
        Ok(hex::encode(self.digest(password)?))
    }

    /// Compares `password` against a stored digest in constant time.
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        let Ok(stored_bytes) = hex::decode(stored) else {
            return false;
        };
        let Ok(expected) = self.digest(password) else {
            return false;
        };
        expected.as_slice().ct_eq(stored_bytes.as_slice()).into()
    }

    fn digest(&self, password: &str) -> Result<Vec<u8>, InvalidLength> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)?;
        mac.update(password.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
