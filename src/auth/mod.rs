//! Request authorization: trust-tier classification, signed identity
//! assertions, and constant-time shared-secret checks.

mod gate;
mod secret;
mod token;

pub use gate::{
    ASSERTION_COOKIE, ASSERTION_HEADER, AuthDecision, AuthOutcome, DEBUG_SECRET_PARAM, Presented,
    RouteTier, debug_bridge_layer, evaluate, extract_assertion, identity_layer,
};
pub use secret::{constant_time_eq, secrets_match};
pub use token::{IdentityClaims, TokenVerifier};
