//! sandgate - main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sandgate::{
    config::GatewayConfig,
    auth::TokenVerifier,
    sandbox::HttpSandbox,
    server::{self, AppState},
    supervisor::Supervisor,
};

#[derive(Parser, Debug)]
#[command(name = "sandgate")]
#[command(about = "Gateway for a sandboxed long-lived agent process")]
#[command(version)]
struct Args {
    /// Bind address (overrides SANDGATE_BIND)
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Resolve and print the effective configuration, then exit
    #[arg(long)]
    config_check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sandgate=info,tower_http=warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = GatewayConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    if args.config_check {
        // Secrets redacted: presence only.
        println!(
            "bind={} sandbox={} agent_port={} devtools_port={} debug_secret={} access_audience={:?}",
            config.bind_addr,
            config.sandbox_url,
            config.agent.port,
            config.agent.devtools_port,
            if config.debug_secret.is_some() { "set" } else { "unset" },
            config.access.audience,
        );
        return Ok(());
    }

    tracing::info!(
        sandbox = %config.sandbox_url,
        agent_port = config.agent.port,
        "starting sandgate"
    );

    let verifier = Arc::new(TokenVerifier::new(&config.access)?);
    let sandbox = Arc::new(HttpSandbox::new(config.sandbox_url.clone()));
    let supervisor = Arc::new(Supervisor::new(
        sandbox,
        config.agent.clone(),
        config.supervisor.clone(),
    ));

    let bind_addr = config.bind_addr;
    let state = AppState::new(supervisor, verifier, Arc::new(config));

    server::serve(bind_addr, state).await?;
    Ok(())
}
