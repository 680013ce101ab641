use std::collections::HashSet;

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub signing_key: String,
    pub issuer: String,
    pub audience: String,
    pub max_token_age_seconds: u64,
    pub clock_skew_leeway_seconds: u64,
    pub revoked_jtis: HashSet<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountTokenClaims {
    pub iss: String,
    pub aud: String,
    /// Account id of the caller.
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub nbf: usize,
    #[serde(default)]
    pub iat: usize,
    #[serde(default)]
    pub jti: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountPrincipal {
    pub account_id: String,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthorization,
    #[error("invalid authorization scheme")]
    InvalidAuthorizationScheme,
    #[error("invalid access token")]
    InvalidToken,
    #[error("access token expired")]
    TokenExpired,
    #[error("access token is not valid yet")]
    TokenNotYetValid,
    #[error("access token missing iat")]
    MissingIssuedAt,
    #[error("access token missing subject")]
    MissingSubject,
    #[error("access token too old")]
    TokenTooOld,
    #[error("access token revoked")]
    TokenRevoked,
    #[error("internal token not configured")]
    InternalTokenNotConfigured,
    #[error("invalid internal token")]
    InvalidInternalToken,
}

impl AuthError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingAuthorization => "missing_authorization",
            Self::InvalidAuthorizationScheme => "invalid_authorization_scheme",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::TokenNotYetValid => "token_not_yet_valid",
            Self::MissingIssuedAt => "missing_iat",
            Self::MissingSubject => "missing_subject",
            Self::TokenTooOld => "token_too_old",
            Self::TokenRevoked => "token_revoked",
            Self::InternalTokenNotConfigured => "internal_token_not_configured",
            Self::InvalidInternalToken => "invalid_internal_token",
        }
    }

    /// False only for server-side misconfiguration.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        !matches!(self, Self::InternalTokenNotConfigured)
    }
}

#[derive(Clone)]
pub struct AccountAuthorizer {
    decoding_key: DecodingKey,
    validation: Validation,
    max_token_age_seconds: u64,
    revoked_jtis: HashSet<String>,
    internal_token_sha256: Option<[u8; 32]>,
}

impl AccountAuthorizer {
    #[must_use]
    pub fn from_config(config: AuthConfig, internal_token: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.validate_nbf = true;
        validation.leeway = config.clock_skew_leeway_seconds;
        Self {
            decoding_key: DecodingKey::from_secret(config.signing_key.as_bytes()),
            validation,
            max_token_age_seconds: config.max_token_age_seconds.max(1),
            revoked_jtis: config.revoked_jtis,
            internal_token_sha256: internal_token
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| Sha256::digest(value.as_bytes()).into()),
        }
    }

    pub fn extract_bearer_token(header_value: Option<&str>) -> Result<&str, AuthError> {
        let raw = header_value.ok_or(AuthError::MissingAuthorization)?;
        let trimmed = raw.trim();
        let Some(token) = trimmed.strip_prefix("Bearer ") else {
            return Err(AuthError::InvalidAuthorizationScheme);
        };
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidAuthorizationScheme);
        }
        Ok(token)
    }

    pub fn authenticate(&self, token: &str) -> Result<AccountPrincipal, AuthError> {
        let now = chrono::Utc::now().timestamp().max(0) as usize;
        let claims = decode::<AccountTokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(map_decode_error)?
            .claims;

        if claims.iat == 0 {
            return Err(AuthError::MissingIssuedAt);
        }
        if now.saturating_sub(claims.iat) > self.max_token_age_seconds as usize {
            return Err(AuthError::TokenTooOld);
        }
        if !claims.jti.is_empty() && self.revoked_jtis.contains(&claims.jti) {
            return Err(AuthError::TokenRevoked);
        }
        let account_id = claims.sub.trim();
        if account_id.is_empty() {
            return Err(AuthError::MissingSubject);
        }

        Ok(AccountPrincipal {
            account_id: account_id.to_string(),
        })
    }

    /// Checks the shared token presented by the chat subsystem. Digests are
    /// compared so the check does not depend on where the inputs differ.
    pub fn verify_internal_token(&self, header_value: Option<&str>) -> Result<(), AuthError> {
        let Some(expected) = self.internal_token_sha256 else {
            return Err(AuthError::InternalTokenNotConfigured);
        };
        let presented = Self::extract_bearer_token(header_value)?;
        let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        let diff = expected
            .iter()
            .zip(presented.iter())
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(AuthError::InvalidInternalToken);
        }
        Ok(())
    }
}

fn map_decode_error(error: jsonwebtoken::errors::Error) -> AuthError {
    match error.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        ErrorKind::ImmatureSignature => AuthError::TokenNotYetValid,
        _ => AuthError::InvalidToken,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::{AccountAuthorizer, AccountTokenClaims, AuthConfig, AuthError};

    const KEY: &str = "escrow-test-key";

    fn authorizer(revoked: HashSet<String>) -> AccountAuthorizer {
        AccountAuthorizer::from_config(
            AuthConfig {
                signing_key: KEY.to_string(),
                issuer: "https://marketplace.test".to_string(),
                audience: "marketplace-escrow".to_string(),
                max_token_age_seconds: 300,
                clock_skew_leeway_seconds: 0,
                revoked_jtis: revoked,
            },
            Some("internal-secret"),
        )
    }

    fn claims(sub: &str, jti: &str) -> AccountTokenClaims {
        let now = Utc::now().timestamp();
        AccountTokenClaims {
            iss: "https://marketplace.test".to_string(),
            aud: "marketplace-escrow".to_string(),
            sub: sub.to_string(),
            exp: (now + 60) as usize,
            nbf: now as usize,
            iat: now as usize,
            jti: jti.to_string(),
        }
    }

    fn make_token(claims: &AccountTokenClaims, key: &str) -> String {
        encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(key.as_bytes()),
        )
        .expect("token should encode")
    }

    #[test]
    fn bearer_extraction_requires_scheme() {
        assert_eq!(
            AccountAuthorizer::extract_bearer_token(None),
            Err(AuthError::MissingAuthorization)
        );
        assert_eq!(
            AccountAuthorizer::extract_bearer_token(Some("token")),
            Err(AuthError::InvalidAuthorizationScheme)
        );
        assert_eq!(
            AccountAuthorizer::extract_bearer_token(Some("Bearer abc ")),
            Ok("abc")
        );
    }

    #[test]
    fn valid_token_yields_account_principal() {
        let token = make_token(&claims("acct_client", "jti-1"), KEY);
        let principal = authorizer(HashSet::new())
            .authenticate(&token)
            .expect("principal");
        assert_eq!(principal.account_id, "acct_client");
    }

    #[test]
    fn wrong_key_and_garbage_are_invalid() {
        let authorizer = authorizer(HashSet::new());
        let token = make_token(&claims("acct_client", "jti-1"), "other-key");
        assert_eq!(authorizer.authenticate(&token), Err(AuthError::InvalidToken));
        assert_eq!(
            authorizer.authenticate("this-is-not-a-jwt"),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn expired_revoked_and_blank_subject_are_rejected() {
        let authorizer = authorizer(HashSet::from([String::from("revoked-jti")]));

        let mut expired = claims("acct_client", "jti-2");
        expired.exp = (Utc::now().timestamp() - 120) as usize;
        assert_eq!(
            authorizer.authenticate(&make_token(&expired, KEY)),
            Err(AuthError::TokenExpired)
        );

        let revoked = claims("acct_client", "revoked-jti");
        assert_eq!(
            authorizer.authenticate(&make_token(&revoked, KEY)),
            Err(AuthError::TokenRevoked)
        );

        let blank = claims("  ", "jti-3");
        assert_eq!(
            authorizer.authenticate(&make_token(&blank, KEY)),
            Err(AuthError::MissingSubject)
        );
    }

    #[test]
    fn internal_token_must_match() {
        let authorizer = authorizer(HashSet::new());
        assert_eq!(
            authorizer.verify_internal_token(Some("Bearer internal-secret")),
            Ok(())
        );
        assert_eq!(
            authorizer.verify_internal_token(Some("Bearer nope")),
            Err(AuthError::InvalidInternalToken)
        );
        assert_eq!(
            authorizer.verify_internal_token(None),
            Err(AuthError::MissingAuthorization)
        );

        let unconfigured = AccountAuthorizer::from_config(
            AuthConfig {
                signing_key: KEY.to_string(),
                issuer: "i".to_string(),
                audience: "a".to_string(),
                max_token_age_seconds: 60,
                clock_skew_leeway_seconds: 0,
                revoked_jtis: HashSet::new(),
            },
            None,
        );
        assert_eq!(
            unconfigured.verify_internal_token(Some("Bearer internal-secret")),
            Err(AuthError::InternalTokenNotConfigured)
        );
    }
}
