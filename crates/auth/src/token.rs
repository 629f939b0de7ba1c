use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub email: String,
    pub session_id: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
}

/// Issues and validates HS256 access tokens. Expiry is checked against the
/// caller-supplied instant so an injected clock stays authoritative.
#[derive(Clone)]
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn sign(&self, claims: &AccessClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|err| TokenError::Invalid(format!("{err}")))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, TokenError> {
        let claims = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| TokenError::Invalid(format!("{err}")))?
            .claims;
        if now.timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(now: DateTime<Utc>) -> AccessClaims {
        AccessClaims {
            sub: "user-1".into(),
            email: "ada@example.com".into(),
            session_id: "session-1".into(),
            role: "authenticated".into(),
            iat: now.timestamp(),
            exp: now.timestamp() + 60,
        }
    }

    #[test]
    fn signs_and_verifies() {
        let signer = TokenSigner::new(b"secret");
        let now = Utc::now();
        let token = signer.sign(&claims(now)).expect("sign");
        let decoded = signer.verify(&token, now).expect("verify");
        assert_eq!(decoded, claims(now));
    }

    #[test]
    fn rejects_expired_token() {
        let signer = TokenSigner::new(b"secret");
        let now = Utc::now();
        let token = signer.sign(&claims(now)).expect("sign");
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(signer.verify(&token, later), Err(TokenError::Expired));
    }

    #[test]
    fn rejects_foreign_signature() {
        let now = Utc::now();
        let token = TokenSigner::new(b"other").sign(&claims(now)).expect("sign");
        let err = TokenSigner::new(b"secret")
            .verify(&token, now)
            .expect_err("signature mismatch");
        assert!(matches!(err, TokenError::Invalid(_)));
    }
}
