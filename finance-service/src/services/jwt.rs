use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

/// Caller's role within their company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
    /// Operator role spanning all companies.
    SuperAdmin,
}

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Tenant the caller acts for
    pub company_id: Uuid,
    pub role: Role,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
}

/// HS256 token signing and validation with the shared secret.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    pub fn new(secret: &Secret<String>) -> Self {
        let secret = secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Validate signature and expiry.
    pub fn validate(&self, token: &str) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }

    /// Issue a token. Tokens normally come from the identity provider; this
    /// is used by tests and operator tooling.
    pub fn issue(
        &self,
        user_id: Uuid,
        company_id: Uuid,
        role: Role,
        ttl: Duration,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            company_id,
            role,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(secret: &str) -> TokenService {
        TokenService::new(&Secret::new(secret.to_string()))
    }

    #[test]
    fn issued_token_validates() {
        let tokens = service("test-secret");
        let (user, company) = (Uuid::new_v4(), Uuid::new_v4());
        let token = tokens
            .issue(user, company, Role::Admin, Duration::minutes(5))
            .unwrap();

        let claims = tokens.validate(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.company_id, company);
        assert_eq!(claims.role, Role::Admin);
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = service("test-secret");
        let token = tokens
            .issue(Uuid::new_v4(), Uuid::new_v4(), Role::Member, Duration::minutes(-5))
            .unwrap();
        assert!(matches!(tokens.validate(&token), Err(AppError::InvalidToken(_))));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let token = service("one")
            .issue(Uuid::new_v4(), Uuid::new_v4(), Role::Member, Duration::minutes(5))
            .unwrap();
        assert!(service("two").validate(&token).is_err());
    }
}
