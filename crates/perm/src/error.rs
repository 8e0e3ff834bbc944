//! Permission layer error types.

use crate::Shape;
use thiserror::Error;

/// Bind-time configuration errors.
///
/// Any of these means the service wiring is wrong; they are never expected at
/// runtime. Use [`BindError::kind`] for coarse classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BindError {
    /// A checked slot has no privilege declaration, or an empty one.
    #[error("missing privilege declaration on '{slot}'")]
    MissingPrivilege { slot: String },

    /// A slot declares a privilege outside the supplied universe.
    #[error("unknown privilege '{privilege}' on '{slot}'")]
    UnknownPrivilege { slot: String, privilege: String },

    /// The implementation has no operation with the slot's name.
    #[error("operation not implemented: '{slot}'")]
    NotImplemented { slot: String },

    /// The implementation has an operation with the slot's name but a
    /// different shape.
    #[error("operation not implemented: '{slot}' is a {found} operation, template declares {expected}")]
    ShapeMismatch {
        slot: String,
        expected: Shape,
        found: Shape,
    },
}

/// Coarse classification of a [`BindError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindErrorKind {
    MissingPrivilege,
    UnknownPrivilege,
    NotImplemented,
}

impl BindError {
    #[must_use]
    pub fn kind(&self) -> BindErrorKind {
        match self {
            Self::MissingPrivilege { .. } => BindErrorKind::MissingPrivilege,
            Self::UnknownPrivilege { .. } => BindErrorKind::UnknownPrivilege,
            Self::NotImplemented { .. } | Self::ShapeMismatch { .. } => {
                BindErrorKind::NotImplemented
            }
        }
    }

    /// Name of the slot that failed to bind.
    #[must_use]
    pub fn slot(&self) -> &str {
        match self {
            Self::MissingPrivilege { slot }
            | Self::UnknownPrivilege { slot, .. }
            | Self::NotImplemented { slot }
            | Self::ShapeMismatch { slot, .. } => slot,
        }
    }
}

/// Errors produced when invoking a bound operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CallError {
    /// The caller's privilege set lacks the operation's required privilege.
    #[error("missing permission to invoke '{operation}' (need '{required}')")]
    Unauthorized { operation: String, required: String },

    /// No bound operation with this name exists.
    #[error("method not found: '{0}'")]
    MethodNotFound(String),

    /// The call parameters could not be decoded for the operation.
    #[error("invalid params for '{operation}': {reason}")]
    InvalidParams { operation: String, reason: String },

    /// The operation produced a result of a different shape than the caller
    /// asked for.
    #[error("'{operation}' returns a {actual} result, not {expected}")]
    Shape {
        operation: String,
        expected: Shape,
        actual: Shape,
    },

    /// Error returned by the implementation, message unchanged.
    #[error("{0}")]
    Application(String),
}

impl CallError {
    /// Returns true for authorization denials.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// Template loading errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TemplateError {
    /// Failed to parse a template file.
    #[error("failed to parse template: {0}")]
    Parse(String),

    /// An I/O error occurred while reading a template.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BindError>;
