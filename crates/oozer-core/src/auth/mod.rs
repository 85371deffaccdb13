//! Access token issuance/validation and password digests.
//!
//! Tokens are HMAC-SHA256 signed, carrying `{sub, role, exp}` claims.
//! Format: `ozr_<claims_hex>_<hmac_hex>` where the HMAC is computed over
//! the raw claims JSON bytes.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use oozer_db::models::Role;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify oozer access tokens.
const TOKEN_PREFIX: &str = "ozr_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("token expired")]
    Expired,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
    /// Token lifetime in minutes.
    pub expire_minutes: u64,
}

impl AuthConfig {
    pub fn new(secret: impl Into<Vec<u8>>, expire_minutes: u64) -> Self {
        Self {
            secret: secret.into(),
            expire_minutes,
        }
    }
}

/// Claims carried by a validated token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Username the token was issued to.
    pub sub: String,
    /// Role at issuance time.
    pub role: Role,
    /// Expiry as a unix timestamp (seconds).
    pub exp: i64,
}

/// Issue an access token for a user.
pub fn issue_token(config: &AuthConfig, username: &str, role: Role) -> String {
    let exp = Utc::now().timestamp() + (config.expire_minutes as i64) * 60;
    let claims = Claims {
        sub: username.to_owned(),
        role,
        exp,
    };
    // Claims are a plain struct; serialization cannot fail.
    let payload = serde_json::to_vec(&claims).unwrap_or_default();
    let mac = compute_hmac(&config.secret, &payload);
    format!("{TOKEN_PREFIX}{}_{}", hex::encode(&payload), hex::encode(mac))
}

/// Validate an access token and extract its claims.
///
/// Verifies the HMAC with a constant-time comparison before looking at the
/// payload, then checks the expiry.
pub fn verify_token(config: &AuthConfig, token: &str) -> Result<Claims, TokenError> {
    let rest = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| TokenError::InvalidFormat("missing token prefix".to_owned()))?;

    let (payload_hex, mac_hex) = rest
        .split_once('_')
        .ok_or_else(|| TokenError::InvalidFormat("missing signature separator".to_owned()))?;

    let payload = hex::decode(payload_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in payload: {e}")))?;
    let provided_mac = hex::decode(mac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

    verify_hmac_constant_time(&config.secret, &payload, &provided_mac)?;

    let claims: Claims = serde_json::from_slice(&payload)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid claims payload: {e}")))?;

    if claims.exp <= Utc::now().timestamp() {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}

/// Compute HMAC-SHA256 over the given message with the given key.
fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Verify HMAC using the `hmac` crate's constant-time `verify_slice`.
fn verify_hmac_constant_time(
    key: &[u8],
    message: &[u8],
    expected_mac: &[u8],
) -> Result<(), TokenError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.verify_slice(expected_mac)
        .map_err(|_| TokenError::HmacMismatch)
}

// -----------------------------------------------------------------------
// Password digests
// -----------------------------------------------------------------------

/// Hash a password with a random 16-byte salt.
///
/// Format: `<salt_hex>$<sha256(salt || password)_hex>`.
pub fn hash_password(password: &str) -> String {
    use rand::Rng;
    let mut salt = [0u8; 16];
    rand::rng().fill(&mut salt);
    let digest = password_digest(&salt, password);
    format!("{}${}", hex::encode(salt), hex::encode(digest))
}

/// Verify a password against a stored `<salt_hex>$<digest_hex>` hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };
    password_digest(&salt, password) == expected
}

fn password_digest(salt: &[u8], password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        AuthConfig::new(b"test-secret-key-for-oozer".to_vec(), 60)
    }

    #[test]
    fn issue_token_has_expected_format() {
        let config = test_config();
        let token = issue_token(&config, "alice", Role::Admin);

        assert!(token.starts_with("ozr_"), "token must carry the prefix");
        let rest = token.strip_prefix("ozr_").unwrap();
        let (payload_hex, mac_hex) = rest.split_once('_').unwrap();
        assert!(payload_hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(mac_hex.len(), 64, "HMAC-SHA256 hex should be 64 chars");
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let config = test_config();
        let token = issue_token(&config, "alice", Role::Admin);
        let claims = verify_token(&config, &token).unwrap();

        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.role, Role::Admin);
        assert!(claims.exp > Utc::now().timestamp());
    }

    #[test]
    fn viewer_role_survives_roundtrip() {
        let config = test_config();
        let token = issue_token(&config, "bob", Role::Viewer);
        let claims = verify_token(&config, &token).unwrap();
        assert_eq!(claims.role, Role::Viewer);
    }

    #[test]
    fn reject_tampered_payload() {
        let config = test_config();
        let token = issue_token(&config, "alice", Role::Viewer);

        // Flip a nibble inside the hex payload.
        let rest = token.strip_prefix("ozr_").unwrap();
        let (payload_hex, mac_hex) = rest.split_once('_').unwrap();
        let mut bytes = hex::decode(payload_hex).unwrap();
        bytes[0] ^= 0x01;
        let tampered = format!("ozr_{}_{}", hex::encode(bytes), mac_hex);

        let result = verify_token(&config, &tampered);
        assert!(matches!(result.unwrap_err(), TokenError::HmacMismatch));
    }

    #[test]
    fn reject_wrong_secret() {
        let config = test_config();
        let token = issue_token(&config, "alice", Role::Admin);

        let wrong = AuthConfig::new(b"wrong-secret-key".to_vec(), 60);
        let result = verify_token(&wrong, &token);
        assert!(matches!(result.unwrap_err(), TokenError::HmacMismatch));
    }

    #[test]
    fn reject_expired_token() {
        // Zero-minute lifetime expires immediately.
        let config = AuthConfig::new(b"test-secret-key-for-oozer".to_vec(), 0);
        let token = issue_token(&config, "alice", Role::Admin);
        let result = verify_token(&config, &token);
        assert!(matches!(result.unwrap_err(), TokenError::Expired));
    }

    #[test]
    fn reject_garbage_tokens() {
        let config = test_config();
        for bad in ["", "ozr_", "nope", "ozr_zzzz_yyyy", "ozr_abcd"] {
            assert!(
                verify_token(&config, bad).is_err(),
                "token {bad:?} must be rejected"
            );
        }
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("s3cret");
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn password_hashes_are_salted() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a, b, "two hashes of the same password should differ");
    }

    #[test]
    fn verify_password_rejects_malformed_hash() {
        assert!(!verify_password("x", "not-a-hash"));
        assert!(!verify_password("x", "zz$zz"));
    }
}
