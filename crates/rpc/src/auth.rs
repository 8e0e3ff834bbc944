//! Connection-level authentication.
//!
//! The [`Authenticator`] sits in front of a transport handler. It resolves
//! the caller's bearer token to a [`PrivilegeSet`] through a [`Verifier`],
//! attaches the set to the call context and only then delegates. A duplex
//! connection is authenticated once, during its handshake; every call over
//! it afterwards runs with the privileges resolved then.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use perm::{BoxFuture, CallContext, PrivilegeSet};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Error, Result};
use crate::handler::{ConnectionHandler, Handler, Request, Response};
use crate::link::{Connection, Link};
use crate::protocol::{Handshake, HandshakeReply, Headers};

/// Authorization scheme prefix, including the separating space.
pub const BEARER: &str = "Bearer ";

/// Query parameter consulted when no authorization header is present.
pub const TOKEN_QUERY: &str = "token";

/// How long a new connection may take to send its handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves a credential to a privilege set.
pub trait Verifier: Send + Sync {
    fn verify<'a>(
        &'a self,
        ctx: &'a CallContext,
        token: &'a str,
    ) -> BoxFuture<'a, std::result::Result<PrivilegeSet, AuthError>>;
}

impl<F, Fut> Verifier for F
where
    F: Fn(CallContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<PrivilegeSet, AuthError>> + Send + 'static,
{
    fn verify<'a>(
        &'a self,
        ctx: &'a CallContext,
        token: &'a str,
    ) -> BoxFuture<'a, std::result::Result<PrivilegeSet, AuthError>> {
        Box::pin(self(ctx.clone(), token.to_string()))
    }
}

/// A fixed token table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticTokens {
    tokens: BTreeMap<String, PrivilegeSet>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, privileges: PrivilegeSet) -> Self {
        self.tokens.insert(token.into(), privileges);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PrivilegeSet)> {
        self.tokens.iter().map(|(token, set)| (token.as_str(), set))
    }
}

impl Verifier for StaticTokens {
    fn verify<'a>(
        &'a self,
        _ctx: &'a CallContext,
        token: &'a str,
    ) -> BoxFuture<'a, std::result::Result<PrivilegeSet, AuthError>> {
        let result = self
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::Rejected("unknown token".to_string()));
        Box::pin(async move { result })
    }
}

/// Extract the bearer token from the authorization header, falling back to
/// the `token` query parameter.
///
/// Returns `Ok(None)` when no credential was supplied at all.
pub fn bearer_token(
    headers: &Headers,
    query: &BTreeMap<String, String>,
) -> std::result::Result<Option<String>, AuthError> {
    if let Some(value) = headers.get("authorization") {
        let token = value
            .strip_prefix(BEARER)
            .ok_or(AuthError::MalformedCredential)?;
        if token.is_empty() {
            return Err(AuthError::MalformedCredential);
        }
        return Ok(Some(token.to_string()));
    }

    match query.get(TOKEN_QUERY) {
        Some(token) if !token.is_empty() => Ok(Some(token.clone())),
        _ => Ok(None),
    }
}

/// Authenticates inbound requests and connections, then delegates to `next`.
pub struct Authenticator<V, N> {
    verifier: V,
    next: N,
    allow_anonymous: bool,
}

impl<V: Verifier, N> Authenticator<V, N> {
    pub fn new(verifier: V, next: N) -> Self {
        Self {
            verifier,
            next,
            allow_anonymous: false,
        }
    }

    /// Let requests without any credential through without a privilege
    /// override, so the bound operations' default set applies. Malformed or
    /// rejected credentials are still refused.
    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    /// Resolve the caller's privileges and derive the context to delegate
    /// with.
    pub async fn authenticate(
        &self,
        ctx: &CallContext,
        headers: &Headers,
        query: &BTreeMap<String, String>,
    ) -> std::result::Result<CallContext, AuthError> {
        let token = match bearer_token(headers, query)? {
            Some(token) => token,
            None if self.allow_anonymous => return Ok(ctx.clone()),
            None => return Err(AuthError::MissingCredential),
        };

        let privileges = self.verifier.verify(ctx, &token).await?;
        tracing::debug!(privileges = privileges.len(), "credential verified");
        Ok(ctx.with_privileges(privileges))
    }

    /// Authenticate a duplex connection's handshake and, on success, serve
    /// it with the resolved privileges for its whole lifetime.
    pub async fn accept(&self, ctx: CallContext, io: impl Connection) -> Result<()>
    where
        N: ConnectionHandler,
    {
        let mut link = Link::new(io);
        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, link.read::<Handshake>())
            .await
            .map_err(|_| Error::Timeout)??
            .ok_or(Error::ConnectionClosed)?;

        let ctx = match self
            .authenticate(&ctx, &handshake.headers, &BTreeMap::new())
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, "rejected connection");
                let reply = HandshakeReply {
                    accepted: false,
                    reason: Some(e.to_string()),
                };
                // the peer may already be gone; the rejection stands either way
                let _ = link.write(&reply).await;
                return Err(e.into());
            }
        };

        link.write(&HandshakeReply {
            accepted: true,
            reason: None,
        })
        .await?;
        self.next.serve(ctx, link).await
    }
}

impl<V: Verifier, N: Handler> Handler for Authenticator<V, N> {
    fn handle(&self, ctx: CallContext, request: Request) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            match self.authenticate(&ctx, &request.headers, &request.query).await {
                Ok(ctx) => self.next.handle(ctx, request).await,
                Err(e) => {
                    tracing::warn!(error = %e, "rejected request");
                    Response::unauthorized(e.to_string())
                }
            }
        })
    }
}
