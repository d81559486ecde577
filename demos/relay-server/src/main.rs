//! Example relay server.
//!
//! Run with: cargo run -p relay-server-example
//!
//! Environment:
//! - `TOOLWIRE_ADDR` - listen address (default `127.0.0.1:3000`)
//! - `TOOLWIRE_CONFIG` - optional JSON config file
//! - `RUST_LOG` - log filter (default `info`)
//!
//! Methods: `echo`, `whoami`, and `progress` (`{"steps": n}`), which streams
//! `{type: "progress", pct}` messages before answering.

use std::{collections::HashMap, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use toolwire_core::{AuthVerifier, Identity, RpcError};
use toolwire_session::{
    AllowAll, IDENTITY_KEY, MemoryBus, SessionConfig, SessionManager, StaticTokenVerifier,
    StreamConfig, StreamManager, storage::MemorySessionStore,
};
use toolwire_transport::server::{
    RelayState, RequestContext, RequestHandler, ServerConfig, router,
};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Relay configuration file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RelayConfig {
    server: ServerConfig,
    session: SessionConfig,
    stream: StreamConfig,
    /// Bearer token to subject. Empty means every caller is accepted.
    tokens: HashMap<String, String>,
}

impl RelayConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn verifier(&self) -> Arc<dyn AuthVerifier> {
        if self.tokens.is_empty() {
            tracing::warn!("no tokens configured, accepting every caller");
            return Arc::new(AllowAll);
        }
        let verifier = self
            .tokens
            .iter()
            .fold(StaticTokenVerifier::new(), |verifier, (token, subject)| {
                verifier.with_token(token.clone(), Identity::new(subject.clone()))
            });
        Arc::new(verifier)
    }
}

/// Demo methods.
struct DemoHandler;

impl DemoHandler {
    async fn progress(ctx: &RequestContext, params: Option<Value>) -> Result<Value, RpcError> {
        let steps = params
            .as_ref()
            .and_then(|p| p.get("steps"))
            .and_then(Value::as_u64)
            .unwrap_or(4)
            .clamp(1, 100);

        for step in 1..=steps {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let pct = step * 100 / steps;
            if let Err(e) = ctx.publish(json!({ "type": "progress", "pct": pct })).await {
                // At-most-once: nobody is listening, the work goes on.
                tracing::debug!(session_id = %ctx.session_id, error = %e, "progress not delivered");
            }
        }
        Ok(json!({ "steps": steps }))
    }

    async fn whoami(ctx: &RequestContext) -> Result<Value, RpcError> {
        let record = ctx
            .sessions
            .get(&ctx.session_id)
            .await
            .map_err(|e| RpcError::internal(e.to_string()))?;
        Ok(record
            .metadata
            .get(IDENTITY_KEY)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RequestHandler for DemoHandler {
    async fn handle_request(
        &self,
        ctx: &RequestContext,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        match method {
            "echo" => Ok(params.unwrap_or(Value::Null)),
            "progress" => Self::progress(ctx, params).await,
            "whoami" => Self::whoami(ctx).await,
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match std::env::var_os("TOOLWIRE_CONFIG") {
        Some(path) => RelayConfig::load(Path::new(&path))?,
        None => RelayConfig::default(),
    };
    let addr: SocketAddr = std::env::var("TOOLWIRE_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
        .parse()
        .context("parsing TOOLWIRE_ADDR")?;

    // Single instance: in-process store and bus.
    let store = MemorySessionStore::new();
    let streams = StreamManager::new(Arc::new(MemoryBus::new()), config.stream.clone());
    let sessions = Arc::new(SessionManager::new(
        Arc::new(store),
        Arc::new(streams),
        config.verifier(),
        config.session.clone(),
    ));
    let sweeper = Arc::clone(&sessions).spawn_sweeper();

    let state = RelayState::new(sessions, Arc::new(DemoHandler), &config.server);
    let app = router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Relay listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    sweeper.abort();
    Ok(())
}
