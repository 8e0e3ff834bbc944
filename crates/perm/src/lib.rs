//! Capability-based permission gate for RPC surfaces.
//!
//! A [`Template`] declares which privilege each operation requires. [`bind`]
//! pairs a template with an [`Implementation`] and produces a
//! [`BoundProxy`] whose every operation checks the caller's privileges,
//! carried on a [`CallContext`], before forwarding.
//!
//! # Example
//!
//! ```
//! use perm::{CallContext, Operation, OperationTable, PrivilegeSet, Shape, Template, bind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let template = Template::new("Calc")
//!     .slot("Add", Shape::Value, "admin")
//!     .excluded("Debug", Shape::Unit);
//!
//! let implementation = OperationTable::new().with(
//!     "Add",
//!     Operation::value("Add", |_ctx, (a, b): (i64, i64)| async move {
//!         Ok::<_, String>(a + b)
//!     }),
//! );
//!
//! let valid: PrivilegeSet = ["admin", "read"].into_iter().collect();
//! let default: PrivilegeSet = ["read"].into_iter().collect();
//! let proxy = bind(&valid, &default, &implementation, &template)?;
//!
//! // No override: the default set applies and the call is denied.
//! assert!(proxy.call::<i64>(CallContext::new(), "Add", (1, 2)).await.is_err());
//!
//! let admin = CallContext::new().with_privileges(["admin"].into_iter().collect());
//! assert_eq!(proxy.call::<i64>(admin, "Add", (1, 2)).await?, 3);
//! # Ok(())
//! # }
//! ```

mod bind;
mod context;
mod error;
mod operation;
mod privilege;
mod template;

pub use bind::{BoundOperation, BoundProxy, bind, permissioned_proxy};
pub use context::{CallContext, has_perm};
pub use error::{BindError, BindErrorKind, CallError, Result, TemplateError};
pub use operation::{
    BoxFuture, CallResult, Implementation, Operation, OperationTable, Reply, STREAM_BUFFER,
};
pub use privilege::{Privilege, PrivilegeSet};
pub use template::{EXCLUDED, Requirement, Shape, Slot, Template};
