//! Binding templates to implementations.

use crate::operation::Handler;
use crate::{
    BindError, BoxFuture, CallContext, CallError, CallResult, Implementation, Privilege,
    PrivilegeSet, Reply, Requirement, Result, Shape, Template,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A permission-checked operation.
#[derive(Clone)]
pub struct BoundOperation {
    required: Privilege,
    shape: Shape,
    handler: Arc<Handler>,
}

impl BoundOperation {
    pub fn required(&self) -> &Privilege {
        &self.required
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn call(&self, ctx: CallContext, params: Value) -> BoxFuture<'static, CallResult> {
        (self.handler)(ctx, params)
    }
}

impl fmt::Debug for BoundOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundOperation")
            .field("required", &self.required)
            .field("shape", &self.shape)
            .finish()
    }
}

/// The permission-checked surface produced by [`bind`].
///
/// Immutable once built; clones share the same operation table.
#[derive(Debug, Clone)]
pub struct BoundProxy {
    name: String,
    methods: Arc<BTreeMap<String, BoundOperation>>,
}

impl BoundProxy {
    /// Name of the template this proxy was bound from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of all remotely callable operations. Excluded slots never
    /// appear here.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn get(&self, method: &str) -> Option<&BoundOperation> {
        self.methods.get(method)
    }

    /// Invoke `method` with JSON params.
    pub fn invoke(
        &self,
        ctx: CallContext,
        method: &str,
        params: Value,
    ) -> BoxFuture<'static, CallResult> {
        match self.methods.get(method) {
            Some(op) => op.call(ctx, params),
            None => {
                let err = CallError::MethodNotFound(method.to_string());
                Box::pin(async move { Err(err) })
            }
        }
    }

    /// Invoke a unit or value operation and decode its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        ctx: CallContext,
        method: &str,
        params: impl Serialize,
    ) -> std::result::Result<T, CallError> {
        let value = match self.invoke(ctx, method, encode(method, params)?).await? {
            Reply::Unit => Value::Null,
            Reply::Value(value) => value,
            Reply::Stream(_) => {
                return Err(CallError::Shape {
                    operation: method.to_string(),
                    expected: Shape::Value,
                    actual: Shape::Stream,
                });
            }
        };
        serde_json::from_value(value).map_err(|e| CallError::Application(e.to_string()))
    }

    /// Invoke a stream operation.
    pub async fn subscribe(
        &self,
        ctx: CallContext,
        method: &str,
        params: impl Serialize,
    ) -> std::result::Result<mpsc::Receiver<Value>, CallError> {
        match self.invoke(ctx, method, encode(method, params)?).await? {
            Reply::Stream(rx) => Ok(rx),
            other => Err(CallError::Shape {
                operation: method.to_string(),
                expected: Shape::Stream,
                actual: other.shape(),
            }),
        }
    }
}

fn encode(method: &str, params: impl Serialize) -> std::result::Result<Value, CallError> {
    serde_json::to_value(params).map_err(|e| CallError::InvalidParams {
        operation: method.to_string(),
        reason: e.to_string(),
    })
}

/// Bind `template` to `implementation`.
///
/// Every checked slot reachable from the template, embedded templates
/// included, must declare a privilege from `valid` and have an operation of
/// the same name and shape on the implementation. Excluded slots are skipped
/// and never appear on the proxy.
///
/// A bound operation admits a call when the caller's effective privilege set
/// (the context override, else `default`) contains the slot's privilege, and
/// forwards it unchanged. Otherwise it fails with
/// [`CallError::Unauthorized`] without touching the implementation.
pub fn bind(
    valid: &PrivilegeSet,
    default: &PrivilegeSet,
    implementation: &dyn Implementation,
    template: &Template,
) -> Result<BoundProxy> {
    let default = Arc::new(default.clone());
    let mut methods = BTreeMap::new();
    let mut excluded = 0usize;

    for (name, slot) in template.resolve() {
        let required = match slot.requirement() {
            Requirement::Missing => {
                return Err(BindError::MissingPrivilege {
                    slot: name.to_string(),
                });
            }
            Requirement::Excluded => {
                tracing::trace!(template = %template.name, slot = name, "slot excluded");
                excluded += 1;
                continue;
            }
            Requirement::Privilege(p) => p,
        };

        if !valid.contains(&required) {
            return Err(BindError::UnknownPrivilege {
                slot: name.to_string(),
                privilege: required.to_string(),
            });
        }

        let op = implementation
            .operation(name)
            .ok_or_else(|| BindError::NotImplemented {
                slot: name.to_string(),
            })?;
        if op.shape() != slot.shape {
            return Err(BindError::ShapeMismatch {
                slot: name.to_string(),
                expected: slot.shape,
                found: op.shape(),
            });
        }

        let handler = guard(name, required.clone(), Arc::clone(&default), op);
        methods.insert(
            name.to_string(),
            BoundOperation {
                required,
                shape: slot.shape,
                handler,
            },
        );
    }

    tracing::debug!(
        template = %template.name,
        bound = methods.len(),
        excluded,
        "template bound"
    );

    Ok(BoundProxy {
        name: template.name.clone(),
        methods: Arc::new(methods),
    })
}

/// Like [`bind`], but a configuration error aborts the process.
///
/// Meant for service wiring, where running half-configured is worse than not
/// starting.
///
/// # Panics
///
/// Panics if binding fails.
#[track_caller]
pub fn permissioned_proxy(
    valid: &PrivilegeSet,
    default: &PrivilegeSet,
    implementation: &dyn Implementation,
    template: &Template,
) -> BoundProxy {
    match bind(valid, default, implementation, template) {
        Ok(proxy) => proxy,
        Err(e) => panic!("failed to bind '{}': {e}", template.name),
    }
}

fn guard(
    name: &str,
    required: Privilege,
    default: Arc<PrivilegeSet>,
    op: crate::Operation,
) -> Arc<Handler> {
    let name = name.to_string();
    Arc::new(move |ctx: CallContext, params: Value| -> BoxFuture<'static, CallResult> {
        if ctx.has_perm(&default, &required) {
            return op.call(ctx, params);
        }

        tracing::debug!(operation = %name, required = %required, "call denied");
        let err = CallError::Unauthorized {
            operation: name.clone(),
            required: required.to_string(),
        };
        Box::pin(async move { Err(err) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BindErrorKind, Operation, OperationTable};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn set(items: &[&str]) -> PrivilegeSet {
        items.iter().copied().collect()
    }

    fn template() -> Template {
        Template::new("Testing")
            .excluded("Ignore", Shape::Unit)
            .slot("Add", Shape::Value, "admin")
            .slot("Todo", Shape::Unit, "admin")
            .slot("ChanSub", Shape::Stream, "admin")
    }

    /// Implementation whose calls are counted.
    fn implementation(calls: Arc<AtomicUsize>) -> OperationTable {
        let add_calls = Arc::clone(&calls);
        let todo_calls = Arc::clone(&calls);
        let sub_calls = calls;
        OperationTable::new()
            .with(
                "Add",
                Operation::value("Add", move |_ctx, (a, b): (i64, i64)| {
                    add_calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok::<_, String>(a + b) }
                }),
            )
            .with(
                "Todo",
                Operation::unit("Todo", move |_ctx, (): ()| {
                    todo_calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("TODO") }
                }),
            )
            .with(
                "ChanSub",
                Operation::stream("ChanSub", move |_ctx, (): ()| {
                    sub_calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        let (tx, rx) = mpsc::channel(1);
                        let _ = tx.send(true).await;
                        Ok::<_, String>(rx)
                    }
                }),
            )
    }

    fn bound(calls: &Arc<AtomicUsize>) -> BoundProxy {
        bind(
            &set(&["admin", "read"]),
            &set(&["read"]),
            &implementation(Arc::clone(calls)),
            &template(),
        )
        .unwrap()
    }

    #[test]
    fn binds_checked_slots_only() {
        let proxy = bound(&Arc::new(AtomicUsize::new(0)));
        assert_eq!(proxy.name(), "Testing");
        assert_eq!(proxy.methods().collect::<Vec<_>>(), ["Add", "ChanSub", "Todo"]);
        assert_eq!(proxy.get("Add").unwrap().required().as_str(), "admin");
        assert!(proxy.get("Ignore").is_none());
    }

    #[test]
    fn unimplemented_slot_fails() {
        let err = bind(
            &set(&["admin", "read"]),
            &set(&["read"]),
            &OperationTable::new(),
            &template(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), BindErrorKind::NotImplemented);
        assert!(err.to_string().contains("operation not implemented"));
    }

    #[test]
    fn missing_declaration_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let template = template().undeclared("Add", Shape::Value);
        let err = bind(
            &set(&["admin"]),
            &set(&[]),
            &implementation(calls),
            &template,
        )
        .unwrap_err();
        assert_eq!(err, BindError::MissingPrivilege { slot: "Add".into() });
    }

    #[test]
    fn unknown_privilege_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = bind(
            &set(&["read"]),
            &set(&["read"]),
            &implementation(calls),
            &template(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), BindErrorKind::UnknownPrivilege);
    }

    #[test]
    fn shape_mismatch_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let template = Template::new("t").slot("Add", Shape::Stream, "admin");
        let err = bind(
            &set(&["admin"]),
            &set(&[]),
            &implementation(calls),
            &template,
        )
        .unwrap_err();
        assert_eq!(err.kind(), BindErrorKind::NotImplemented);
    }

    #[test]
    fn excluded_slot_needs_nothing() {
        let template = Template::new("t")
            .excluded("Ignore", Shape::Unit)
            .excluded("Other", Shape::Value);
        let proxy = bind(&set(&[]), &set(&[]), &OperationTable::new(), &template).unwrap();
        assert_eq!(proxy.methods().count(), 0);
    }

    #[tokio::test]
    async fn admitted_call_passes_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let proxy = bound(&calls);
        let ctx = CallContext::new().with_privileges(set(&["admin"]));

        let sum: i64 = proxy.call(ctx.clone(), "Add", (1, 2)).await.unwrap();
        assert_eq!(sum, 3);

        let err = proxy.call::<()>(ctx, "Todo", ()).await.unwrap_err();
        assert_eq!(err, CallError::Application("TODO".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn denied_call_never_reaches_implementation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let proxy = bound(&calls);

        let err = proxy
            .call::<i64>(CallContext::new(), "Add", (1, 2))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CallError::Unauthorized {
                operation: "Add".into(),
                required: "admin".into(),
            }
        );
        assert!(err.to_string().contains("admin"));

        let err = proxy
            .subscribe(CallContext::new(), "ChanSub", ())
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn override_set_without_privilege_is_denied() {
        let calls = Arc::new(AtomicUsize::new(0));
        let proxy = bound(&calls);
        let ctx = CallContext::new().with_privileges(set(&["read"]));

        let err = proxy.call::<i64>(ctx, "Add", (1, 2)).await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn default_set_governs_calls_without_override() {
        let calls = Arc::new(AtomicUsize::new(0));
        let proxy = bind(
            &set(&["admin", "read"]),
            &set(&["admin"]),
            &implementation(Arc::clone(&calls)),
            &template(),
        )
        .unwrap();

        let sum: i64 = proxy.call(CallContext::new(), "Add", (2, 2)).await.unwrap();
        assert_eq!(sum, 4);
    }

    #[tokio::test]
    async fn stream_is_checked_once_at_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let proxy = bound(&calls);
        let ctx = CallContext::new().with_privileges(set(&["admin"]));

        let mut rx = proxy.subscribe(ctx, "ChanSub", ()).await.unwrap();
        assert_eq!(rx.recv().await, Some(Value::Bool(true)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn excluded_slot_is_not_callable() {
        let proxy = bound(&Arc::new(AtomicUsize::new(0)));
        let ctx = CallContext::new().with_privileges(set(&["admin", "read"]));
        let err = proxy.call::<()>(ctx, "Ignore", ()).await.unwrap_err();
        assert_eq!(err, CallError::MethodNotFound("Ignore".into()));
    }

    #[tokio::test]
    async fn outer_declaration_governs_shadowed_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = Template::new("inner").slot("Add", Shape::Value, "admin");
        let outer = Template::new("outer")
            .slot("Add", Shape::Value, "read")
            .embed(inner);
        let proxy = bind(
            &set(&["admin", "read"]),
            &set(&["read"]),
            &implementation(Arc::clone(&calls)),
            &outer,
        )
        .unwrap();

        assert_eq!(proxy.get("Add").unwrap().required().as_str(), "read");
        let sum: i64 = proxy.call(CallContext::new(), "Add", (1, 2)).await.unwrap();
        assert_eq!(sum, 3);

        // an invalid inner declaration is irrelevant once shadowed
        let inner = Template::new("inner").slot("Add", Shape::Value, "root");
        let outer = Template::new("outer")
            .slot("Add", Shape::Value, "read")
            .embed(inner);
        assert!(
            bind(
                &set(&["admin", "read"]),
                &set(&["read"]),
                &implementation(calls),
                &outer,
            )
            .is_ok()
        );
    }

    #[test]
    fn embedded_slots_are_bound() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = Template::new("inner").slot("Todo", Shape::Unit, "admin");
        let outer = Template::new("outer")
            .slot("Add", Shape::Value, "admin")
            .embed(inner);
        let proxy = bind(
            &set(&["admin"]),
            &set(&[]),
            &implementation(calls),
            &outer,
        )
        .unwrap();
        assert_eq!(proxy.methods().collect::<Vec<_>>(), ["Add", "Todo"]);
    }

    #[test]
    #[should_panic(expected = "unknown privilege")]
    fn permissioned_proxy_panics_on_bad_wiring() {
        let calls = Arc::new(AtomicUsize::new(0));
        permissioned_proxy(
            &set(&[]),
            &set(&[]),
            &implementation(calls),
            &template(),
        );
    }
}
