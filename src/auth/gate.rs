//! Layered authorization gate.
//!
//! Every inbound request is classified by path into a trust tier and the
//! tier's check runs before any handler logic:
//!
//! - **Public**: health/status. Always admitted, no check.
//! - **Identity**: admin routes. Dev bypass, then e2e bypass, then a signed
//!   identity assertion.
//! - **Diagnostic**: `/debug` routes. Identity tier plus an explicit
//!   enable flag; disabled means 404 so the routes' existence is not
//!   revealed.
//! - **DebugBridge**: the remote-debugging (CDP) routes. Shared-secret
//!   check only — bypass flags are never consulted here, and identity
//!   verification never admits into this tier.
//!
//! [`evaluate`] is a pure function over explicit inputs; the axum
//! middlewares below are thin adapters that extract credentials from the
//! request and translate the decision into a response.

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::config::BypassConfig;
use crate::error::{AuthError, GatewayError};
use crate::server::AppState;

use super::secret::secrets_match;
use super::token::{IdentityClaims, TokenVerifier};

/// Header carrying the identity proxy's signed assertion.
pub const ASSERTION_HEADER: &str = "x-identity-assertion";
/// Cookie fallback for browser sessions behind the identity proxy.
pub const ASSERTION_COOKIE: &str = "IDENTITY_ASSERTION";
/// Query parameter carrying the shared secret on bridge routes.
pub const DEBUG_SECRET_PARAM: &str = "secret";

/// Trust tier of a route, decided statically by path — never by user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTier {
    Public,
    Identity,
    Diagnostic,
    DebugBridge,
}

impl RouteTier {
    pub fn classify(path: &str) -> Self {
        if path == "/health" || path == "/status" {
            Self::Public
        } else if path == "/debug" || path.starts_with("/debug/") {
            Self::Diagnostic
        } else if path == "/cdp" || path.starts_with("/cdp/") {
            Self::DebugBridge
        } else {
            Self::Identity
        }
    }
}

/// Outcome of classifying one request. Ephemeral, computed per request.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Admit,
    Unauthenticated,
    /// Required server-side secret material is missing (503, distinct from
    /// 401 so operators can tell "not set up" from probing).
    Misconfigured,
    /// Feature gated off by policy; indistinguishable from an absent route.
    NotFound,
}

/// The gate's decision for one request.
#[derive(Debug)]
pub struct AuthDecision {
    pub tier: RouteTier,
    pub outcome: AuthOutcome,
    /// Present only for identity-tier admits.
    pub claims: Option<IdentityClaims>,
}

impl AuthDecision {
    fn admit(tier: RouteTier, claims: Option<IdentityClaims>) -> Self {
        Self {
            tier,
            outcome: AuthOutcome::Admit,
            claims,
        }
    }

    fn reject(tier: RouteTier, outcome: AuthOutcome) -> Self {
        Self {
            tier,
            outcome,
            claims: None,
        }
    }
}

/// Credentials extracted from the request, if any.
#[derive(Debug, Default)]
pub struct Presented<'a> {
    /// Signed identity assertion (header or cookie).
    pub assertion: Option<&'a str>,
    /// Shared secret presented on bridge routes.
    pub debug_secret: Option<&'a str>,
}

/// Decide admit/reject for one request. Pure: all inputs are explicit, no
/// ambient state is read, nothing is mutated.
pub fn evaluate(
    tier: RouteTier,
    bypass: BypassConfig,
    verifier: &TokenVerifier,
    configured_debug_secret: Option<&str>,
    presented: &Presented<'_>,
) -> AuthDecision {
    match tier {
        RouteTier::Public => AuthDecision::admit(tier, None),

        RouteTier::Diagnostic if !bypass.debug_routes_enabled => {
            AuthDecision::reject(tier, AuthOutcome::NotFound)
        }
        RouteTier::Identity | RouteTier::Diagnostic => {
            if bypass.dev_bypass {
                return AuthDecision::admit(tier, Some(IdentityClaims::synthetic_dev()));
            }
            if bypass.e2e_bypass {
                return AuthDecision::admit(tier, Some(IdentityClaims::synthetic_e2e()));
            }
            let Some(assertion) = presented.assertion else {
                return AuthDecision::reject(tier, AuthOutcome::Unauthenticated);
            };
            match verifier.verify(assertion) {
                Ok(claims) => AuthDecision::admit(tier, Some(claims)),
                Err(_) => AuthDecision::reject(tier, AuthOutcome::Unauthenticated),
            }
        }

        // Evaluated independently of every bypass flag, by design.
        RouteTier::DebugBridge => match configured_debug_secret {
            None => AuthDecision::reject(tier, AuthOutcome::Misconfigured),
            Some(secret) if secret.is_empty() => {
                AuthDecision::reject(tier, AuthOutcome::Misconfigured)
            }
            Some(secret) => {
                if secrets_match(Some(secret), presented.debug_secret.unwrap_or("")) {
                    AuthDecision::admit(tier, None)
                } else {
                    AuthDecision::reject(tier, AuthOutcome::Unauthenticated)
                }
            }
        },
    }
}

/// Pull the identity assertion out of the request headers: dedicated
/// header first, then bearer token, then session cookie.
pub fn extract_assertion(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(ASSERTION_HEADER).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value);
        }
    }
    if let Some(token) = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
    {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }
    cookie_value(headers, ASSERTION_COOKIE)
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let cookies = headers.get(COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name && !value.is_empty()).then_some(value)
    })
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then_some(value)
    })
}

fn decision_into_error(outcome: AuthOutcome) -> GatewayError {
    match outcome {
        AuthOutcome::Unauthenticated => GatewayError::Auth(AuthError::MissingCredential),
        AuthOutcome::Misconfigured => GatewayError::Auth(AuthError::Misconfigured),
        AuthOutcome::NotFound | AuthOutcome::Admit => GatewayError::NotFound,
    }
}

/// Route layer for identity-tier (and diagnostic) routes. Admitted claims
/// are attached as a request extension for handlers like `/api/whoami`.
pub async fn identity_layer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let tier = RouteTier::classify(request.uri().path());
    let presented = Presented {
        assertion: extract_assertion(request.headers()),
        debug_secret: None,
    };
    let decision = evaluate(tier, state.bypass(), &state.verifier, None, &presented);

    match decision.outcome {
        AuthOutcome::Admit => {
            if let Some(claims) = decision.claims {
                tracing::debug!(email = %claims.email, path = %request.uri().path(), "request admitted");
                request.extensions_mut().insert(claims);
            }
            next.run(request).await
        }
        outcome => decision_into_error(outcome).into_response(),
    }
}

/// Route layer for the shared-secret remote-debugging bridge.
pub async fn debug_bridge_layer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = Presented {
        assertion: None,
        debug_secret: query_param(request.uri().query(), DEBUG_SECRET_PARAM),
    };
    let decision = evaluate(
        RouteTier::DebugBridge,
        state.bypass(),
        &state.verifier,
        state.config.debug_secret.as_deref(),
        &presented,
    );

    match decision.outcome {
        AuthOutcome::Admit => next.run(request).await,
        outcome => decision_into_error(outcome).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::AccessConfig;

    use super::*;

    fn verifier() -> TokenVerifier {
        // Fail-closed verifier: no material configured, every token invalid.
        TokenVerifier::new(&AccessConfig::disabled()).unwrap()
    }

    fn bypass(dev: bool, e2e: bool, debug_routes: bool) -> BypassConfig {
        BypassConfig {
            dev_bypass: dev,
            e2e_bypass: e2e,
            debug_routes_enabled: debug_routes,
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(RouteTier::classify("/health"), RouteTier::Public);
        assert_eq!(RouteTier::classify("/status"), RouteTier::Public);
        assert_eq!(RouteTier::classify("/debug/processes"), RouteTier::Diagnostic);
        assert_eq!(RouteTier::classify("/cdp"), RouteTier::DebugBridge);
        assert_eq!(RouteTier::classify("/cdp/json/version"), RouteTier::DebugBridge);
        assert_eq!(RouteTier::classify("/api/restart"), RouteTier::Identity);
        // Not a /debug or /cdp prefix, just a lookalike.
        assert_eq!(RouteTier::classify("/debugging"), RouteTier::Identity);
        assert_eq!(RouteTier::classify("/cdpx"), RouteTier::Identity);
    }

    #[test]
    fn test_public_always_admits() {
        let d = evaluate(
            RouteTier::Public,
            bypass(false, false, false),
            &verifier(),
            None,
            &Presented::default(),
        );
        assert_eq!(d.outcome, AuthOutcome::Admit);
        assert!(d.claims.is_none());
    }

    #[test]
    fn test_dev_bypass_admits_with_synthetic_identity() {
        let d = evaluate(
            RouteTier::Identity,
            bypass(true, false, false),
            &verifier(),
            None,
            &Presented::default(),
        );
        assert_eq!(d.outcome, AuthOutcome::Admit);
        assert_eq!(d.claims.unwrap(), IdentityClaims::synthetic_dev());
    }

    #[test]
    fn test_dev_bypass_takes_priority_over_e2e() {
        let d = evaluate(
            RouteTier::Identity,
            bypass(true, true, false),
            &verifier(),
            None,
            &Presented::default(),
        );
        assert_eq!(d.claims.unwrap(), IdentityClaims::synthetic_dev());
    }

    #[test]
    fn test_identity_rejects_without_token_or_bypass() {
        let d = evaluate(
            RouteTier::Identity,
            bypass(false, false, false),
            &verifier(),
            None,
            &Presented::default(),
        );
        assert_eq!(d.outcome, AuthOutcome::Unauthenticated);
    }

    #[test]
    fn test_diagnostic_disabled_is_not_found_even_with_bypass() {
        // The enable flag wins over every credential, including bypasses:
        // a disabled diagnostic surface must look absent.
        let d = evaluate(
            RouteTier::Diagnostic,
            bypass(true, true, false),
            &verifier(),
            None,
            &Presented::default(),
        );
        assert_eq!(d.outcome, AuthOutcome::NotFound);
    }

    #[test]
    fn test_diagnostic_enabled_follows_identity_rules() {
        let admitted = evaluate(
            RouteTier::Diagnostic,
            bypass(true, false, true),
            &verifier(),
            None,
            &Presented::default(),
        );
        assert_eq!(admitted.outcome, AuthOutcome::Admit);

        let rejected = evaluate(
            RouteTier::Diagnostic,
            bypass(false, false, true),
            &verifier(),
            None,
            &Presented::default(),
        );
        assert_eq!(rejected.outcome, AuthOutcome::Unauthenticated);
    }

    #[test]
    fn test_bridge_unconfigured_is_misconfigured_for_any_input() {
        for presented in [None, Some(""), Some("anything")] {
            let d = evaluate(
                RouteTier::DebugBridge,
                bypass(false, false, false),
                &verifier(),
                None,
                &Presented {
                    assertion: None,
                    debug_secret: presented,
                },
            );
            assert_eq!(d.outcome, AuthOutcome::Misconfigured, "presented {presented:?}");
        }
        let empty = evaluate(
            RouteTier::DebugBridge,
            bypass(false, false, false),
            &verifier(),
            Some(""),
            &Presented::default(),
        );
        assert_eq!(empty.outcome, AuthOutcome::Misconfigured);
    }

    #[test]
    fn test_bridge_ignores_bypass_flags() {
        // All bypasses on, wrong secret: still unauthenticated.
        let d = evaluate(
            RouteTier::DebugBridge,
            bypass(true, true, true),
            &verifier(),
            Some("abc123"),
            &Presented {
                assertion: None,
                debug_secret: Some("abc124"),
            },
        );
        assert_eq!(d.outcome, AuthOutcome::Unauthenticated);
    }

    #[test]
    fn test_bridge_secret_match() {
        let ok = evaluate(
            RouteTier::DebugBridge,
            bypass(false, false, false),
            &verifier(),
            Some("abc123"),
            &Presented {
                assertion: None,
                debug_secret: Some("abc123"),
            },
        );
        assert_eq!(ok.outcome, AuthOutcome::Admit);

        let missing = evaluate(
            RouteTier::DebugBridge,
            bypass(false, false, false),
            &verifier(),
            Some("abc123"),
            &Presented::default(),
        );
        assert_eq!(missing.outcome, AuthOutcome::Unauthenticated);
    }

    #[test]
    fn test_extract_assertion_sources() {
        let mut headers = HeaderMap::new();
        headers.insert(ASSERTION_HEADER, "from-header".parse().unwrap());
        assert_eq!(extract_assertion(&headers), Some("from-header"));

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer from-bearer".parse().unwrap());
        assert_eq!(extract_assertion(&headers), Some("from-bearer"));

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            format!("other=1; {ASSERTION_COOKIE}=from-cookie").parse().unwrap(),
        );
        assert_eq!(extract_assertion(&headers), Some("from-cookie"));

        assert_eq!(extract_assertion(&HeaderMap::new()), None);
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("secret=abc123"), "secret"), Some("abc123"));
        assert_eq!(query_param(Some("a=1&secret=x&b=2"), "secret"), Some("x"));
        assert_eq!(query_param(Some("secret"), "secret"), Some(""));
        assert_eq!(query_param(Some("a=1"), "secret"), None);
        assert_eq!(query_param(None, "secret"), None);
    }
}
