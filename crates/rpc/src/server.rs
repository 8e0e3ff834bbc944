//! RPC server: named method tables over request/response and duplex links.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use perm::{BoundProxy, BoxFuture, CallContext, CallError, Reply};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::Result;
use crate::handler::{ConnectionHandler, Handler, Request, Response};
use crate::link::{FrameWriter, Link};
use crate::protocol::{
    APPLICATION_ERROR, CHANNEL_CLOSE, CHANNEL_VALUE, INVALID_REQUEST, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, Message, PARSE_ERROR, PING, RequestId,
};

/// Capacity of the per-connection outbound frame queue.
const OUTBOUND_BUFFER: usize = 64;

/// Dispatches `Namespace.Method` calls to registered bound proxies.
///
/// Registration happens at wiring time; after that the server is shared
/// read-only (typically behind an `Arc`).
#[derive(Debug, Clone, Default)]
pub struct Server {
    namespaces: Arc<HashMap<String, BoundProxy>>,
    next_channel: Arc<AtomicU64>,
}

/// Result of dispatching one request.
enum Dispatch {
    Respond(JsonRpcResponse),
    Stream(RequestId, mpsc::Receiver<Value>),
    Nothing,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose `proxy` under `namespace`. Re-registering a namespace replaces
    /// the previous table.
    pub fn register(&mut self, namespace: impl Into<String>, proxy: BoundProxy) -> &mut Self {
        let namespace = namespace.into();
        tracing::debug!(
            namespace = %namespace,
            methods = proxy.methods().count(),
            "registered method table"
        );
        Arc::make_mut(&mut self.namespaces).insert(namespace, proxy);
        self
    }

    /// All callable `Namespace.Method` names.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .namespaces
            .iter()
            .flat_map(|(ns, proxy)| proxy.methods().map(move |m| format!("{ns}.{m}")))
            .collect();
        names.sort();
        names
    }

    /// Handle one JSON-RPC request. Notifications produce no response.
    ///
    /// Stream results cannot be carried on a single exchange; the stream is
    /// dropped and the caller gets an error.
    pub async fn call(&self, ctx: CallContext, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        match self.dispatch(ctx, request).await {
            Dispatch::Respond(response) => Some(response),
            Dispatch::Stream(id, _) => Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(
                    APPLICATION_ERROR,
                    "stream results require a duplex connection",
                ),
            )),
            Dispatch::Nothing => None,
        }
    }

    async fn dispatch(&self, ctx: CallContext, request: JsonRpcRequest) -> Dispatch {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        if method == PING {
            return match id {
                Some(id) => Dispatch::Respond(JsonRpcResponse::success(id, Value::Null)),
                None => Dispatch::Nothing,
            };
        }

        let result = match method.split_once('.') {
            Some((namespace, name)) => match self.namespaces.get(namespace) {
                Some(proxy) => {
                    proxy
                        .invoke(ctx, name, params.unwrap_or(Value::Null))
                        .await
                }
                None => Err(CallError::MethodNotFound(method.clone())),
            },
            None => Err(CallError::MethodNotFound(method.clone())),
        };

        let Some(id) = id else {
            if let Err(e) = result {
                tracing::debug!(method = %method, error = %e, "notification failed");
            }
            return Dispatch::Nothing;
        };

        match result {
            Ok(Reply::Unit) => Dispatch::Respond(JsonRpcResponse::success(id, Value::Null)),
            Ok(Reply::Value(value)) => Dispatch::Respond(JsonRpcResponse::success(id, value)),
            Ok(Reply::Stream(rx)) => Dispatch::Stream(id, rx),
            Err(e) => Dispatch::Respond(JsonRpcResponse::failure(id, e.into())),
        }
    }

    async fn serve_link(&self, ctx: CallContext, link: Link) -> Result<()> {
        let (mut reader, writer) = link.into_split();
        let (tx, rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let writer_task = tokio::spawn(write_frames(writer, rx));
        let mut calls = JoinSet::new();

        loop {
            let line = tokio::select! {
                line = reader.read_line() => line,
                Some(_) = calls.join_next(), if !calls.is_empty() => continue,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "connection read failed");
                    break;
                }
            };

            let request = match serde_json::from_str::<Message>(&line) {
                Ok(Message::Request(request)) => request,
                Ok(Message::Response(_)) => continue,
                Err(e) => {
                    let error = JsonRpcError::new(PARSE_ERROR, e.to_string());
                    send(&tx, &JsonRpcResponse::failure(None, error)).await;
                    continue;
                }
            };

            let server = self.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            calls.spawn(async move {
                match server.dispatch(ctx, request).await {
                    Dispatch::Respond(response) => {
                        send(&tx, &response).await;
                    }
                    Dispatch::Stream(id, items) => {
                        forward_stream(&tx, id, items, &server.next_channel).await;
                    }
                    Dispatch::Nothing => {}
                }
            });
        }

        // the peer is gone: stop in-flight calls and their streams
        calls.shutdown().await;
        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }
}

/// Answer with a channel id, then relay every item untouched until the
/// producer finishes or the connection goes away.
async fn forward_stream(
    tx: &mpsc::Sender<String>,
    id: RequestId,
    mut items: mpsc::Receiver<Value>,
    next_channel: &AtomicU64,
) {
    let channel = next_channel.fetch_add(1, Ordering::Relaxed) + 1;
    if !send(tx, &JsonRpcResponse::success(id, Value::from(channel))).await {
        return;
    }

    loop {
        let item = tokio::select! {
            item = items.recv() => item,
            () = tx.closed() => return,
        };
        let Some(item) = item else { break };
        let mut note = JsonRpcRequest::notification(CHANNEL_VALUE);
        note.params = Some(json!([channel, item]));
        if !send(tx, &note).await {
            return;
        }
    }

    let mut close = JsonRpcRequest::notification(CHANNEL_CLOSE);
    close.params = Some(json!([channel]));
    send(tx, &close).await;
}

/// Queue a frame for the writer task. Returns false once the connection is
/// gone.
async fn send<T: serde::Serialize>(tx: &mpsc::Sender<String>, frame: &T) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => tx.send(json).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode frame");
            true
        }
    }
}

async fn write_frames(mut writer: FrameWriter, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_line(&line).await {
            tracing::debug!(error = %e, "connection write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

impl Handler for Server {
    fn handle(&self, ctx: CallContext, request: Request) -> BoxFuture<'_, Response> {
        Box::pin(async move {
            let rpc = match serde_json::from_str::<JsonRpcRequest>(&request.body) {
                Ok(rpc) => rpc,
                Err(e) => {
                    let code = if serde_json::from_str::<Value>(&request.body).is_ok() {
                        INVALID_REQUEST
                    } else {
                        PARSE_ERROR
                    };
                    let response =
                        JsonRpcResponse::failure(None, JsonRpcError::new(code, e.to_string()));
                    return Response::ok(serde_json::to_string(&response).unwrap_or_default());
                }
            };

            match self.call(ctx, rpc).await {
                Some(response) => {
                    Response::ok(serde_json::to_string(&response).unwrap_or_default())
                }
                None => Response::ok(String::new()),
            }
        })
    }
}

impl ConnectionHandler for Server {
    fn serve(&self, ctx: CallContext, link: Link) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.serve_link(ctx, link))
    }
}
