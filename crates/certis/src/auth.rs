use std::num::NonZeroU32;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use ring::digest::SHA256_OUTPUT_LEN;
use ring::pbkdf2::{self, PBKDF2_HMAC_SHA256};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::CertisError;
use crate::types::{Role, User};

const HASH_SCHEME: &str = "pbkdf2-sha256";
pub const HASH_ITERATIONS: NonZeroU32 = NonZeroU32::new(50_000).unwrap();
pub const MIN_PASSWORD_LEN: usize = 8;

/// PBKDF2-HMAC-SHA256 with a random 16-byte salt, encoded as
/// `pbkdf2-sha256$<iterations>$<hex salt>$<hex key>`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().into_bytes();
    encode_hash(password, &salt, HASH_ITERATIONS)
}

fn encode_hash(password: &str, salt: &[u8], iterations: NonZeroU32) -> String {
    let mut key = [0u8; SHA256_OUTPUT_LEN];
    pbkdf2::derive(PBKDF2_HMAC_SHA256, iterations, salt, password.as_bytes(), &mut key);
    format!(
        "{HASH_SCHEME}${iterations}${}${}",
        hex::encode(salt),
        hex::encode(key)
    )
}

pub fn check_password_strength(password: &str) -> Result<(), CertisError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(CertisError::InvalidInput(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    let [scheme, iterations, salt, expected] = parts.as_slice() else {
        return false;
    };
    if *scheme != HASH_SCHEME {
        return false;
    }
    let Some(iterations) = iterations.parse::<u32>().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(expected)) else {
        return false;
    };
    pbkdf2::verify(PBKDF2_HMAC_SHA256, iterations, &salt, password.as_bytes(), &expected).is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub role: Role,
    pub staff_id: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub fn issue_token(
    user: &User,
    secret: &str,
    ttl_hours: i64,
) -> Result<(String, DateTime<Utc>), CertisError> {
    let now = Utc::now();
    let expires_at = now + Duration::hours(ttl_hours);
    let claims = Claims {
        sub: user.id,
        role: user.role,
        staff_id: user.staff_id.clone(),
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| CertisError::Internal(format!("failed to sign token: {e}")))?;
    Ok((token, expires_at))
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, CertisError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| {
        debug!("rejected token: {e}");
        CertisError::Unauthorized("invalid or expired token".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role) -> User {
        User {
            id: 7,
            first_name: "Ada".into(),
            last_name: "Obi".into(),
            email: "ada@example.org".into(),
            phone_number: None,
            responsibility: None,
            year_of_employment: Some("2023".into()),
            role,
            staff_id: "SHSL/23/AD/0001".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn password_roundtrip() {
        let stored = hash_password("correct horse");
        assert!(stored.starts_with("pbkdf2-sha256$50000$"));
        assert!(verify_password("correct horse", &stored));
        assert!(!verify_password("wrong horse", &stored));
    }

    #[test]
    fn short_passwords_rejected() {
        assert!(check_password_strength("1234567").is_err());
        assert!(check_password_strength("12345678").is_ok());
    }

    #[test]
    fn salts_differ_per_hash() {
        assert_ne!(hash_password("same"), hash_password("same"));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        assert!(!verify_password("x", ""));
        assert!(!verify_password("x", "md5$1$salt$abcd"));
        assert!(!verify_password("x", "pbkdf2-sha256$zero$00$abcd"));
        assert!(!verify_password("x", "pbkdf2-sha256$0$00$abcd"));
        assert!(!verify_password("x", "pbkdf2-sha256$1$not-hex$abcd"));
    }

    #[test]
    fn stored_format_matches_pbkdf2() {
        let one = NonZeroU32::new(1).unwrap();
        let stored = encode_hash("pw", b"salt", one);
        let mut key = [0u8; SHA256_OUTPUT_LEN];
        pbkdf2::derive(PBKDF2_HMAC_SHA256, one, b"salt", b"pw", &mut key);
        assert_eq!(
            stored,
            format!("pbkdf2-sha256$1${}${}", hex::encode(b"salt"), hex::encode(key))
        );
        assert!(verify_password("pw", &stored));
    }

    #[test]
    fn tampered_digest_never_verifies() {
        let stored = hash_password("correct horse");
        let mut parts: Vec<String> = stored.split('$').map(str::to_string).collect();
        let replacement = if parts[3].starts_with("00") { "11" } else { "00" };
        parts[3].replace_range(0..2, replacement);
        assert!(!verify_password("correct horse", &parts.join("$")));
    }

    #[test]
    fn token_roundtrip() {
        let (token, expires_at) = issue_token(&user(Role::Admin), "secret", 2).unwrap();
        assert!(expires_at > Utc::now());
        let claims = verify_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, 7);
        assert!(claims.is_admin());
        assert_eq!(claims.staff_id, "SHSL/23/AD/0001");
    }

    #[test]
    fn token_with_wrong_secret_is_rejected() {
        let (token, _) = issue_token(&user(Role::Staff), "secret", 2).unwrap();
        assert!(matches!(
            verify_token(&token, "other"),
            Err(CertisError::Unauthorized(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let (token, _) = issue_token(&user(Role::Admin), "secret", -1).unwrap();
        assert!(verify_token(&token, "secret").is_err());
    }
}
