//! HTTP-01 challenge responder
//!
//! Pending challenges are kept as token → key authorization pairs and served at
//! `/.well-known/acme-challenge/{token}`. Envoy forwards that path to this
//! responder through the ACME cluster.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace};

use crate::errors::{Error, Result};

pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Pending HTTP-01 challenges. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges.insert(token.to_string(), key_authorization.to_string());
    }

    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// Token of a challenge request path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX).filter(|token| !token.is_empty())
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }

    pub fn clear(&self) {
        let count = self.challenges.len();
        self.challenges.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }
}

/// Router answering challenge requests from the manager
pub fn challenge_router(manager: ChallengeManager) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

async fn serve_challenge(
    State(manager): State<ChallengeManager>,
    Path(token): Path<String>,
) -> Response {
    match manager.get_response(&token) {
        Some(key_authorization) => (StatusCode::OK, key_authorization).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve challenges on `address` until `shutdown` is cancelled
pub async fn serve_challenges(
    address: SocketAddr,
    manager: ChallengeManager,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(address).await.map_err(|e| {
        Error::transport(format!("Failed to bind ACME challenge responder on {}: {}", address, e))
    })?;

    info!(address = %address, "ACME challenge responder listening");

    axum::serve(listener, challenge_router(manager))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::transport(format!("ACME challenge responder error: {}", e)))
}
