//! HTTP surface of the engine process.
//!
//! Only two routes live here: the dashboard WebSocket (mounted from
//! the push hub) and a trivial health probe. The CRUD/API surface is
//! a separate service and out of scope; it drives the engine through
//! the methods on [`OutdialEngine`](crate::engine::OutdialEngine).

use std::sync::Arc;

use axum::routing::get;
use axum::Json;
use outdial_push::{AuthUser, TokenVerifier};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::OutdialEngine;
use crate::error::{EngineError, Result};

/// Bearer-token verifier backed by the shared internal secret.
///
/// Tokens have the shape `<user_id>.<role>.<secret>`; the JWT layer
/// proper lives in the out-of-scope API service, which mints these
/// for dashboard sockets.
pub struct SecretTokenVerifier {
    secret: String,
}

impl SecretTokenVerifier {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Read `INTERNAL_API_SECRET` from the environment
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var("INTERNAL_API_SECRET").map_err(|_| {
            EngineError::config("missing required environment variable INTERNAL_API_SECRET")
        })?;
        Ok(Self::new(secret))
    }
}

impl TokenVerifier for SecretTokenVerifier {
    fn verify(&self, token: &str) -> Option<AuthUser> {
        let mut parts = token.splitn(3, '.');
        let user_id: i64 = parts.next()?.parse().ok()?;
        let role = parts.next()?;
        let secret = parts.next()?;
        if secret != self.secret {
            return None;
        }
        Some(AuthUser {
            user_id,
            admin: matches!(role, "admin" | "supervisor"),
        })
    }
}

/// Serve `/ws` and `/health` until `shutdown` fires
pub async fn serve(
    engine: Arc<OutdialEngine>,
    verifier: Arc<dyn TokenVerifier>,
    shutdown: CancellationToken,
) -> Result<()> {
    let port = engine.config().http_port;

    let app = outdial_push::router(engine.hub().clone(), verifier).route(
        "/health",
        get(|| async {
            Json(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
            }))
        }),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("🌐 HTTP listener on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_accepts_well_formed_tokens() {
        let verifier = SecretTokenVerifier::new("s3cret".to_string());

        let user = verifier.verify("42.agent.s3cret").unwrap();
        assert_eq!(user.user_id, 42);
        assert!(!user.admin);

        let admin = verifier.verify("7.admin.s3cret").unwrap();
        assert!(admin.admin);
        let supervisor = verifier.verify("8.supervisor.s3cret").unwrap();
        assert!(supervisor.admin);
    }

    #[test]
    fn verifier_rejects_bad_tokens() {
        let verifier = SecretTokenVerifier::new("s3cret".to_string());
        assert!(verifier.verify("").is_none());
        assert!(verifier.verify("42.agent.wrong").is_none());
        assert!(verifier.verify("notanumber.agent.s3cret").is_none());
        assert!(verifier.verify("42.agent").is_none());
    }
}
