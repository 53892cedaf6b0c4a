//! Signed identity-assertion verification.
//!
//! The identity proxy in front of the gateway issues a JWT for every
//! authenticated caller. We validate it against trusted key material
//! supplied out-of-band in [`AccessConfig`] and extract the caller's
//! claims. Every verification failure is collapsed into the single opaque
//! [`AuthError::InvalidToken`]; the concrete reason (malformed, expired,
//! bad signature) is logged at debug level and never surfaced, so
//! rejections cannot be used as a verification oracle.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use crate::config::{AccessConfig, VerificationMaterial};
use crate::error::{AuthError, ConfigError};

/// Identity of an admitted caller.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IdentityClaims {
    /// Email-like identifier of the caller.
    pub email: String,
    /// Set when the assertion was issued for a service token rather than a
    /// human session.
    pub service_token_id: Option<String>,
}

impl IdentityClaims {
    /// Synthetic identity used when the development bypass admits a request.
    pub fn synthetic_dev() -> Self {
        Self {
            email: "dev@localhost".to_string(),
            service_token_id: None,
        }
    }

    /// Synthetic identity used when the end-to-end-test bypass admits a
    /// request.
    pub fn synthetic_e2e() -> Self {
        Self {
            email: "e2e-tests@localhost".to_string(),
            service_token_id: None,
        }
    }
}

/// Raw claim set as carried in the assertion.
#[derive(Debug, Deserialize)]
struct RawClaims {
    email: Option<String>,
    /// Service-token identifier, when the proxy issued the assertion for a
    /// non-human caller.
    common_name: Option<String>,
    sub: Option<String>,
}

/// Validates identity assertions against the configured key material.
pub struct TokenVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl TokenVerifier {
    /// Build a verifier from the access configuration. With no material
    /// configured the verifier fails closed: every token is invalid.
    pub fn new(access: &AccessConfig) -> Result<Self, ConfigError> {
        let (key, algorithm) = match &access.material {
            VerificationMaterial::Hs256Secret(secret) => (
                Some(DecodingKey::from_secret(secret.as_bytes())),
                Algorithm::HS256,
            ),
            VerificationMaterial::Rs256Pem(pem) => (
                Some(
                    DecodingKey::from_rsa_pem(pem.as_bytes())
                        .map_err(|e| ConfigError::BadVerificationMaterial(e.to_string()))?,
                ),
                Algorithm::RS256,
            ),
            VerificationMaterial::None => (None, Algorithm::HS256),
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        match &access.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        Ok(Self { key, validation })
    }

    /// Verify an assertion and extract the caller's identity.
    pub fn verify(&self, token: &str) -> Result<IdentityClaims, AuthError> {
        let Some(key) = &self.key else {
            tracing::debug!("identity assertion rejected: no verification material configured");
            return Err(AuthError::InvalidToken);
        };

        let data = decode::<RawClaims>(token, key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "identity assertion failed verification");
            AuthError::InvalidToken
        })?;

        let claims = data.claims;
        let email = claims
            .email
            .or_else(|| claims.common_name.clone())
            .or(claims.sub)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                tracing::debug!("identity assertion carried no usable identity claim");
                AuthError::InvalidToken
            })?;

        Ok(IdentityClaims {
            email,
            service_token_id: claims.common_name,
        })
    }
}
