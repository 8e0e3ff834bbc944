//! Request/response and duplex handler seams.

use crate::Headers;
use crate::error::Result;
use crate::link::Link;
use perm::{BoxFuture, CallContext};
use std::collections::BTreeMap;

/// A single inbound request/response exchange.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub headers: Headers,
    pub query: BTreeMap<String, String>,
    pub body: String,
}

impl Request {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self {
            status: 401,
            body: reason.into(),
        }
    }
}

/// Handles one request/response exchange.
pub trait Handler: Send + Sync {
    fn handle(&self, ctx: CallContext, request: Request) -> BoxFuture<'_, Response>;
}

/// Serves a long-lived duplex connection.
///
/// The context is resolved once, before `serve` is called, and governs every
/// call made over the connection.
pub trait ConnectionHandler: Send + Sync {
    fn serve(&self, ctx: CallContext, link: Link) -> BoxFuture<'_, Result<()>>;
}

impl<H: Handler + ?Sized> Handler for std::sync::Arc<H> {
    fn handle(&self, ctx: CallContext, request: Request) -> BoxFuture<'_, Response> {
        (**self).handle(ctx, request)
    }
}

impl<H: ConnectionHandler + ?Sized> ConnectionHandler for std::sync::Arc<H> {
    fn serve(&self, ctx: CallContext, link: Link) -> BoxFuture<'_, Result<()>> {
        (**self).serve(ctx, link)
    }
}
