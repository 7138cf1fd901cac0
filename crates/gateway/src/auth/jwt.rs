use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::{AuthError, TokenVerifier};

pub const MIN_SECRET_LEN: usize = 32;
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum AudienceClaim {
    One(String),
    Many(Vec<String>),
}

impl AudienceClaim {
    fn contains(&self, audience: &str) -> bool {
        match self {
            Self::One(value) => value == audience,
            Self::Many(values) => values.iter().any(|value| value == audience),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    iss: String,
    aud: AudienceClaim,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    exp: i64,
}

/// Verified identity bound to one connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaim {
    pub subject_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub issuer: String,
    pub audience: String,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// HS256 verifier for gateway handshake credentials.
#[derive(Clone)]
pub struct JwtTokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
}

impl JwtTokenVerifier {
    pub fn new(secret: &str, issuer: &str, audience: &str) -> anyhow::Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            bail!("jwt secret must be at least {MIN_SECRET_LEN} characters long");
        }
        if issuer.is_empty() || audience.is_empty() {
            bail!("jwt issuer and audience must not be empty");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked in `verify_at` against the caller's clock.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        })
    }

    /// Issue a token with the same claim layout the identity service uses.
    pub fn issue_token(
        &self,
        subject_id: &str,
        username: Option<&str>,
        email: Option<&str>,
    ) -> anyhow::Result<String> {
        self.issue_token_at(
            subject_id,
            username,
            email,
            current_unix_timestamp()?,
            DEFAULT_TOKEN_TTL_SECONDS,
        )
    }

    pub fn issue_token_at(
        &self,
        subject_id: &str,
        username: Option<&str>,
        email: Option<&str>,
        issued_at: i64,
        ttl_seconds: i64,
    ) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: subject_id.to_string(),
            username: username.map(ToOwned::to_owned),
            email: email.map(ToOwned::to_owned),
            iss: self.issuer.clone(),
            aud: AudienceClaim::One(self.audience.clone()),
            iat: Some(issued_at),
            exp: issued_at + ttl_seconds,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    /// Verify `credential` against an explicit clock.
    pub fn verify_at(&self, credential: &str, now: i64) -> Result<IdentityClaim, AuthError> {
        if credential.split('.').count() != 3 {
            return Err(AuthError::MalformedToken);
        }

        let claims = decode::<AccessTokenClaims>(credential, &self.decoding_key, &self.validation)
            .map_err(|error| classify_decode_error(error.kind()))?
            .claims;

        // A token is already dead at `exp`.
        if now >= claims.exp {
            return Err(AuthError::Expired);
        }
        if claims.iss != self.issuer {
            return Err(AuthError::IssuerMismatch);
        }
        if !claims.aud.contains(&self.audience) {
            return Err(AuthError::AudienceMismatch);
        }
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MalformedToken);
        }

        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(AuthError::MalformedToken)?;
        let issued_at = match claims.iat {
            Some(iat) => Some(DateTime::from_timestamp(iat, 0).ok_or(AuthError::MalformedToken)?),
            None => None,
        };

        Ok(IdentityClaim {
            subject_id: claims.sub,
            username: claims.username,
            email: claims.email,
            issuer: claims.iss,
            audience: self.audience.clone(),
            issued_at,
            expires_at,
        })
    }
}

impl TokenVerifier for JwtTokenVerifier {
    fn verify(&self, credential: &str) -> Result<IdentityClaim, AuthError> {
        let now = current_unix_timestamp().map_err(|_| AuthError::Expired)?;
        self.verify_at(credential, now)
    }
}

fn classify_decode_error(kind: &ErrorKind) -> AuthError {
    match kind {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => AuthError::SignatureInvalid,
        ErrorKind::InvalidIssuer => AuthError::IssuerMismatch,
        ErrorKind::InvalidAudience => AuthError::AudienceMismatch,
        _ => AuthError::MalformedToken,
    }
}

pub(crate) fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, JwtTokenVerifier, DEFAULT_TOKEN_TTL_SECONDS};
    use crate::auth::{AuthError, TokenVerifier};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    const TEST_SECRET: &str = "your_super_secure_jwt_secret_32_characters_minimum";
    const ISSUER: &str = "collabornest";
    const AUDIENCE: &str = "collabornest-users";

    fn verifier() -> JwtTokenVerifier {
        JwtTokenVerifier::new(TEST_SECRET, ISSUER, AUDIENCE).expect("verifier should initialize")
    }

    fn sign(claims: serde_json::Value, secret: &str) -> String {
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
            .expect("token should encode")
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(JwtTokenVerifier::new("too-short", ISSUER, AUDIENCE).is_err());
    }

    #[test]
    fn issues_and_verifies_identity_claims() {
        let verifier = verifier();
        let token = verifier
            .issue_token("test-user-001", Some("user_test-user-001"), Some("test-user-001@example.com"))
            .expect("token should be issued");

        let identity = verifier.verify(&token).expect("token should verify");

        assert_eq!(identity.subject_id, "test-user-001");
        assert_eq!(identity.username.as_deref(), Some("user_test-user-001"));
        assert_eq!(identity.email.as_deref(), Some("test-user-001@example.com"));
        assert_eq!(identity.issuer, ISSUER);
        assert_eq!(identity.audience, AUDIENCE);
        assert!(identity.issued_at.is_some());
    }

    #[test]
    fn rejects_garbage_as_malformed() {
        assert_eq!(verifier().verify("not-a-jwt"), Err(AuthError::MalformedToken));
        assert_eq!(verifier().verify("a.b.c"), Err(AuthError::MalformedToken));
        assert_eq!(verifier().verify(""), Err(AuthError::MalformedToken));
    }

    #[test]
    fn rejects_tampered_tokens() {
        let verifier = verifier();
        let token = verifier.issue_token("tamper-user", None, None).expect("token should be issued");
        let tampered = format!("{token}x");

        assert_eq!(verifier.verify(&tampered), Err(AuthError::SignatureInvalid));
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token = sign(
            json!({ "sub": "u", "iss": ISSUER, "aud": AUDIENCE, "iat": now, "exp": now + 60 }),
            "a_completely_different_secret_of_enough_length",
        );

        assert_eq!(verifier().verify(&token), Err(AuthError::SignatureInvalid));
    }

    #[test]
    fn rejects_expired_tokens() {
        let verifier = verifier();
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - DEFAULT_TOKEN_TTL_SECONDS
            - 3600;
        let token = verifier
            .issue_token_at("expired-user", None, None, issued_at, DEFAULT_TOKEN_TTL_SECONDS)
            .expect("token should be issued");

        let error = verifier.verify(&token).expect_err("expired token should be rejected");
        assert_eq!(error, AuthError::Expired);
        assert!(error.to_string().contains("expired"));
    }

    #[test]
    fn token_is_expired_exactly_at_exp() {
        let verifier = verifier();
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token = verifier
            .issue_token_at("edge-user", None, None, now, 60)
            .expect("token should be issued");

        assert!(verifier.verify_at(&token, now + 59).is_ok());
        assert_eq!(verifier.verify_at(&token, now + 60), Err(AuthError::Expired));
    }

    #[test]
    fn verify_at_follows_the_supplied_clock() {
        let verifier = verifier();
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token = verifier
            .issue_token_at("clock-user", None, None, now - 7200, 3600)
            .expect("token should be issued");

        assert!(verifier.verify_at(&token, now - 5000).is_ok());
        assert_eq!(verifier.verify_at(&token, now - 3600), Err(AuthError::Expired));
        assert_eq!(verifier.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn rejects_issuer_mismatch() {
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token = sign(
            json!({ "sub": "u", "iss": "someone-else", "aud": AUDIENCE, "exp": now + 60 }),
            TEST_SECRET,
        );

        assert_eq!(verifier().verify(&token), Err(AuthError::IssuerMismatch));
    }

    #[test]
    fn rejects_audience_mismatch() {
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token = sign(
            json!({ "sub": "u", "iss": ISSUER, "aud": "other-users", "exp": now + 60 }),
            TEST_SECRET,
        );

        assert_eq!(verifier().verify(&token), Err(AuthError::AudienceMismatch));
    }

    #[test]
    fn accepts_audience_lists_containing_expected_audience() {
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token = sign(
            json!({ "sub": "u", "iss": ISSUER, "aud": ["admin", AUDIENCE], "exp": now + 60 }),
            TEST_SECRET,
        );

        let identity = verifier().verify(&token).expect("token should verify");
        assert_eq!(identity.audience, AUDIENCE);
        assert!(identity.username.is_none());
    }

    #[test]
    fn rejects_tokens_missing_subject() {
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let token =
            sign(json!({ "iss": ISSUER, "aud": AUDIENCE, "exp": now + 60 }), TEST_SECRET);

        assert_eq!(verifier().verify(&token), Err(AuthError::MalformedToken));
    }

    #[test]
    fn verification_is_stateless() {
        let verifier = verifier();
        let token = verifier.issue_token("repeat-user", None, None).expect("token should be issued");

        let first = verifier.verify(&token).expect("first verification should succeed");
        let second = verifier.verify(&token).expect("second verification should succeed");
        assert_eq!(first, second);
    }
}
