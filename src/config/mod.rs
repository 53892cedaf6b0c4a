//! Configuration for the gateway.
//!
//! Two kinds of configuration with different lifetimes:
//!
//! - [`GatewayConfig`] is resolved once at startup from `SANDGATE_*` env
//!   vars (after dotenvy) and is immutable for the life of the process.
//! - [`BypassConfig`] is re-read from the environment on every request,
//!   because the hosting runtime may inject fresh values per invocation.
//!   It is always passed into the authorization gate explicitly as a plain
//!   struct so tests can inject arbitrary flag combinations.

pub(crate) mod helpers;

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;

use self::helpers::{optional_env, parse_bool_env, parse_num_env, parse_string_env};

/// The agent process the gateway supervises and proxies to.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Command line used to start the agent inside the sandbox. Also serves
    /// as the process-table signature for discovering a running instance.
    pub command: String,
    /// Port the agent process serves traffic on once ready.
    pub port: u16,
    /// Port of the agent's remote-debugging (CDP) endpoint.
    pub devtools_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "agent serve --port 4100".to_string(),
            port: 4100,
            devtools_port: 9222,
        }
    }
}

/// Trusted verification material for the identity tier, supplied
/// out-of-band. When neither variant is configured the identity tier fails
/// closed: only bypass modes can admit.
#[derive(Debug, Clone)]
pub enum VerificationMaterial {
    /// HS256 shared key.
    Hs256Secret(String),
    /// RS256 public key in PEM form.
    Rs256Pem(String),
    /// Nothing configured.
    None,
}

/// Identity-proxy verification settings.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub material: VerificationMaterial,
    /// Expected `aud` claim, if the identity proxy scopes its assertions.
    pub audience: Option<String>,
}

impl AccessConfig {
    pub fn disabled() -> Self {
        Self {
            material: VerificationMaterial::None,
            audience: None,
        }
    }
}

/// Supervisor timing knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound on waiting for the agent port to become reachable.
    pub ready_timeout: Duration,
    /// Interval between process-table polls while waiting for a kill to
    /// take effect during restart.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Startup configuration, immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Base URL of the sandbox control API.
    pub sandbox_url: String,
    pub agent: AgentConfig,
    pub access: AccessConfig,
    /// Shared secret protecting the remote-debugging bridge routes. Unset
    /// means the bridge reports service-unavailable, never admit.
    pub debug_secret: Option<String>,
    pub supervisor: SupervisorConfig,
}

impl GatewayConfig {
    /// Resolve from environment variables. Loads `.env` first via dotenvy
    /// (never overwrites already-set vars).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let bind_addr: SocketAddr = parse_string_env("SANDGATE_BIND", "0.0.0.0:8080")
            .parse()
            .map_err(|e| ConfigError::Invalid {
                key: "SANDGATE_BIND".to_string(),
                message: format!("{e}"),
            })?;

        let material = match (
            optional_env("SANDGATE_ACCESS_JWT_SECRET"),
            optional_env("SANDGATE_ACCESS_JWT_PUBLIC_KEY_PEM"),
        ) {
            (Some(secret), _) => VerificationMaterial::Hs256Secret(secret),
            (None, Some(pem)) => VerificationMaterial::Rs256Pem(pem),
            (None, None) => VerificationMaterial::None,
        };

        Ok(Self {
            bind_addr,
            sandbox_url: parse_string_env("SANDGATE_SANDBOX_URL", "http://127.0.0.1:7070"),
            agent: AgentConfig {
                command: parse_string_env("SANDGATE_AGENT_COMMAND", "agent serve --port 4100"),
                port: parse_num_env("SANDGATE_AGENT_PORT", 4100)?,
                devtools_port: parse_num_env("SANDGATE_AGENT_DEVTOOLS_PORT", 9222)?,
            },
            access: AccessConfig {
                material,
                audience: optional_env("SANDGATE_ACCESS_AUD"),
            },
            debug_secret: optional_env("SANDGATE_DEBUG_SECRET"),
            supervisor: SupervisorConfig {
                ready_timeout: Duration::from_millis(parse_num_env(
                    "SANDGATE_READY_TIMEOUT_MS",
                    30_000,
                )?),
                poll_interval: Duration::from_millis(parse_num_env(
                    "SANDGATE_POLL_INTERVAL_MS",
                    250,
                )?),
            },
        })
    }
}

/// Per-request snapshot of the bypass flags.
///
/// These affect only the identity tier. The shared-secret bridge tier never
/// consults them, and the public tier needs no check they could widen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BypassConfig {
    /// Local development: admit identity-tier requests with a synthetic
    /// dev identity, no token required.
    pub dev_bypass: bool,
    /// Automated end-to-end tests: same, with a synthetic test identity.
    pub e2e_bypass: bool,
    /// Whether the `/debug` diagnostic routes exist at all. Off means 404,
    /// not 401.
    pub debug_routes_enabled: bool,
}

impl BypassConfig {
    /// Read the current flag values. Called per request on purpose: no
    /// caching assumptions may be made about their stability.
    pub fn from_env() -> Self {
        Self {
            dev_bypass: parse_bool_env("SANDGATE_DEV_MODE", false).unwrap_or(false),
            e2e_bypass: parse_bool_env("SANDGATE_E2E_TESTS", false).unwrap_or(false),
            debug_routes_enabled: parse_bool_env("SANDGATE_DEBUG_ROUTES", false).unwrap_or(false),
        }
    }
}
