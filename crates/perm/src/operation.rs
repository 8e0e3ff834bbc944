//! Type-erased operations and implementation tables.
//!
//! An [`Operation`] wraps a typed async function behind a uniform
//! context-first calling convention: it takes a [`CallContext`] and JSON
//! params and resolves to a [`Reply`] or a [`CallError`]. Typed
//! constructors decode params with serde before calling the function and
//! encode its result afterwards.

use crate::{CallContext, CallError, Shape};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of invoking an operation.
pub type CallResult = std::result::Result<Reply, CallError>;

pub(crate) type Handler = dyn Fn(CallContext, Value) -> BoxFuture<'static, CallResult> + Send + Sync;

/// Buffer size of the channel adapting typed streams to JSON values.
pub const STREAM_BUFFER: usize = 16;

/// Successful result of an operation, matching its [`Shape`].
pub enum Reply {
    Unit,
    Value(Value),
    Stream(mpsc::Receiver<Value>),
}

impl Reply {
    pub fn shape(&self) -> Shape {
        match self {
            Reply::Unit => Shape::Unit,
            Reply::Value(_) => Shape::Value,
            Reply::Stream(_) => Shape::Stream,
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Unit => f.write_str("Unit"),
            Reply::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A named operation's callable body.
#[derive(Clone)]
pub struct Operation {
    shape: Shape,
    handler: Arc<Handler>,
}

impl Operation {
    /// An operation returning only an error position.
    pub fn unit<P, F, Fut, E>(name: &str, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        let name = name.to_string();
        Self::raw(Shape::Unit, move |ctx, params| -> BoxFuture<'static, CallResult> {
            let call = decode(&name, params).map(|p| f(ctx, p));
            Box::pin(async move {
                call?
                    .await
                    .map(|()| Reply::Unit)
                    .map_err(|e| CallError::Application(e.to_string()))
            })
        })
    }

    /// An operation returning a value and an error position.
    pub fn value<P, T, F, Fut, E>(name: &str, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        T: Serialize + Send,
        F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display,
    {
        let name = name.to_string();
        Self::raw(Shape::Value, move |ctx, params| -> BoxFuture<'static, CallResult> {
            let op = name.clone();
            let call = decode(&name, params).map(|p| f(ctx, p));
            Box::pin(async move {
                let value = call?
                    .await
                    .map_err(|e| CallError::Application(e.to_string()))?;
                serde_json::to_value(value)
                    .map(Reply::Value)
                    .map_err(|e| {
                        CallError::Application(format!("failed to encode '{op}' result: {e}"))
                    })
            })
        })
    }

    /// An operation returning an open stream of values.
    ///
    /// Items are encoded as they arrive; an item that fails to encode ends
    /// the stream.
    pub fn stream<P, T, F, Fut, E>(name: &str, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
        F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<mpsc::Receiver<T>, E>> + Send + 'static,
        E: fmt::Display,
    {
        let name = name.to_string();
        Self::raw(Shape::Stream, move |ctx, params| -> BoxFuture<'static, CallResult> {
            let op = name.clone();
            let call = decode(&name, params).map(|p| f(ctx, p));
            Box::pin(async move {
                let mut items = call?
                    .await
                    .map_err(|e| CallError::Application(e.to_string()))?;
                let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                tokio::spawn(async move {
                    loop {
                        // a consumer that hangs up releases the producer too
                        let item = tokio::select! {
                            item = items.recv() => item,
                            () = tx.closed() => break,
                        };
                        let Some(item) = item else { break };
                        match serde_json::to_value(item) {
                            Ok(value) => {
                                if tx.send(value).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    operation = %op,
                                    error = %e,
                                    "dropping stream after encode failure"
                                );
                                break;
                            }
                        }
                    }
                });
                Ok(Reply::Stream(rx))
            })
        })
    }

    /// An operation over raw JSON params.
    pub fn raw<F>(shape: Shape, f: F) -> Self
    where
        F: Fn(CallContext, Value) -> BoxFuture<'static, CallResult> + Send + Sync + 'static,
    {
        Self {
            shape,
            handler: Arc::new(f),
        }
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn call(&self, ctx: CallContext, params: Value) -> BoxFuture<'static, CallResult> {
        (self.handler)(ctx, params)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").field("shape", &self.shape).finish()
    }
}

/// Decode positional params. An absent or empty param list decodes as `()`.
fn decode<P: DeserializeOwned>(operation: &str, params: Value) -> Result<P, CallError> {
    let params = match params {
        Value::Array(items) if items.is_empty() => Value::Null,
        other => other,
    };
    serde_json::from_value(params).map_err(|e| CallError::InvalidParams {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

/// An object exposing named operations.
pub trait Implementation {
    /// Look up the operation called `name`.
    fn operation(&self, name: &str) -> Option<Operation>;
}

/// A hand-built table of named operations.
#[derive(Debug, Clone, Default)]
pub struct OperationTable {
    operations: HashMap<String, Operation>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, operation: Operation) -> Self {
        self.operations.insert(name.into(), operation);
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Implementation for OperationTable {
    fn operation(&self, name: &str) -> Option<Operation> {
        self.operations.get(name).cloned()
    }
}

impl<T: Implementation + ?Sized> Implementation for Arc<T> {
    fn operation(&self, name: &str) -> Option<Operation> {
        (**self).operation(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn add(_ctx: CallContext, (a, b): (i64, i64)) -> Result<i64, String> {
        Ok(a + b)
    }

    #[tokio::test]
    async fn value_operation_decodes_positional_params() {
        let op = Operation::value("Add", add);
        assert_eq!(op.shape(), Shape::Value);

        let reply = op.call(CallContext::new(), json!([1, 2])).await.unwrap();
        assert!(matches!(reply, Reply::Value(v) if v == json!(3)));
    }

    #[tokio::test]
    async fn bad_params_are_invalid_params() {
        let op = Operation::value("Add", add);
        let err = op.call(CallContext::new(), json!(["x"])).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidParams { ref operation, .. } if operation == "Add"));
    }

    #[tokio::test]
    async fn unit_operation_accepts_empty_params() {
        let op = Operation::unit("Todo", |_ctx, (): ()| async { Err::<(), _>("TODO") });
        for params in [Value::Null, json!([])] {
            let err = op.call(CallContext::new(), params).await.unwrap_err();
            assert_eq!(err, CallError::Application("TODO".into()));
        }
    }

    #[tokio::test]
    async fn stream_operation_forwards_items() {
        let op = Operation::stream("Count", |_ctx, (n,): (u32,)| async move {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                for i in 0..n {
                    if tx.send(i).await.is_err() {
                        break;
                    }
                }
            });
            Ok::<_, String>(rx)
        });

        let Reply::Stream(mut rx) = op.call(CallContext::new(), json!([3])).await.unwrap() else {
            panic!("expected stream");
        };
        let mut seen = Vec::new();
        while let Some(v) = rx.recv().await {
            seen.push(v);
        }
        assert_eq!(seen, [json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn table_lookup() {
        let table = OperationTable::new().with("Add", Operation::value("Add", add));
        assert!(table.operation("Add").is_some());
        assert!(table.operation("Sub").is_none());
        assert_eq!(table.len(), 1);
    }
}
