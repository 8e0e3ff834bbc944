//! Permission-gated RPC transport.
//!
//! Serves [`perm::BoundProxy`] method tables as JSON-RPC 2.0 over either
//! single request/response exchanges ([`Handler`]) or long-lived duplex
//! connections ([`ConnectionHandler`]). An [`Authenticator`] in front of the
//! server turns the caller's bearer token into a privilege set once per
//! request or connection; the bound proxies enforce it on every call.
//!
//! # Example
//!
//! ```no_run
//! use perm::{CallContext, Operation, OperationTable, PrivilegeSet, Shape, Template, bind};
//! use rpc::{Authenticator, Client, ClientConfig, Headers, Server, StaticTokens};
//! use std::sync::Arc;
//!
//! # async fn example() -> rpc::Result<()> {
//! let template = Template::new("Calc").slot("Add", Shape::Value, "admin");
//! let implementation = OperationTable::new().with(
//!     "Add",
//!     Operation::value("Add", |_ctx, (a, b): (i64, i64)| async move { Ok::<_, String>(a + b) }),
//! );
//! let valid: PrivilegeSet = ["admin", "read"].into_iter().collect();
//! let default: PrivilegeSet = ["read"].into_iter().collect();
//! let proxy = bind(&valid, &default, &implementation, &template).expect("template binds");
//!
//! let mut server = Server::new();
//! server.register("Calc", proxy);
//! let tokens = StaticTokens::new().with("secret", valid.clone());
//! let auth = Arc::new(Authenticator::new(tokens, server));
//!
//! let connector = move || {
//!     let auth = Arc::clone(&auth);
//!     async move {
//!         let (client, server) = tokio::io::duplex(64 * 1024);
//!         tokio::spawn(async move { auth.accept(CallContext::new(), server).await });
//!         Ok::<_, std::io::Error>(client)
//!     }
//! };
//! let headers = Headers::new().with("Authorization", "Bearer secret");
//! let client = Client::connect(connector, "Calc", headers, ClientConfig::default()).await?;
//! let sum: i64 = client.call("Add", (1, 2)).await?;
//! assert_eq!(sum, 3);
//! # Ok(())
//! # }
//! ```

mod auth;
mod backoff;
mod client;
mod config;
mod error;
mod handler;
mod link;
mod protocol;
mod server;

pub use auth::{Authenticator, BEARER, HANDSHAKE_TIMEOUT, StaticTokens, TOKEN_QUERY, Verifier, bearer_token};
pub use backoff::Backoff;
pub use client::{Client, Connector, Subscription};
pub use config::ClientConfig;
pub use error::{AuthError, Error, Result};
pub use handler::{ConnectionHandler, Handler, Request, Response};
pub use link::{BoxConnection, Connection, FrameReader, FrameWriter, Link, MAX_FRAME_SIZE};
pub use protocol::{
    APPLICATION_ERROR, CHANNEL_CLOSE, CHANNEL_VALUE, Handshake, HandshakeReply, Headers,
    INVALID_PARAMS, INVALID_REQUEST, JsonRpcError, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_FOUND, Message, PARSE_ERROR, PING, RequestId,
};
pub use server::Server;
