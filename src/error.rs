//! The error type returned by every fallible operation on [`crate::Module`] and
//! [`crate::Sink`].
//!
//! Mutations either succeed and take effect, or fail and leave the module/sink
//! untouched; there is no partial application. See the module-level docs for
//! the discussion of deferred errors raised from implicit cleanup (`Drop`).

use crate::ty::ValType;
use std::fmt;

/// A human-readable reference to an entity: either its `$`-prefixed textual
/// id, or its bare numeric index when it has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Id(String),
    Index(u32),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Id(id) => write!(f, "${id}"),
            EntityRef::Index(idx) => write!(f, "{idx}"),
        }
    }
}

impl From<u32> for EntityRef {
    fn from(index: u32) -> Self {
        EntityRef::Index(index)
    }
}

impl From<&str> for EntityRef {
    fn from(id: &str) -> Self {
        EntityRef::Id(id.to_string())
    }
}

impl From<String> for EntityRef {
    fn from(id: String) -> Self {
        EntityRef::Id(id)
    }
}

/// A rendered list of operand types, used in type-mismatch messages.
pub fn type_list(types: &[ValType]) -> String {
    let mut out = String::from("[");
    for (i, t) in types.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(t.name());
    }
    out.push(']');
    out
}

/// The single error type surfaced by a failing mutation of a [`crate::Module`]
/// or [`crate::Sink`].
///
/// Every variant names the offending entity (by id or index) and the
/// operation that failed; [`Error::TypeMismatch`] additionally carries the
/// expected and found operand-type sequences, in the order the validator
/// compared them.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A structural precondition was violated: a duplicate id, an import
    /// appearing after a non-import, an entity referenced that did not
    /// originate from the same module, an invalid handle, and so on.
    #[error("{operation}: {detail}")]
    Precondition { operation: String, detail: String },

    /// A close-time (or otherwise lifecycle-scoped) invariant was violated:
    /// a memory/table without a limit at close, an unassigned global, a
    /// second startup function, mutating a closed module or sink.
    #[error("{operation}: {detail}")]
    Structural { operation: String, detail: String },

    /// The operand-stack type checker rejected an instruction.
    #[error("{operation}: expected {} but found {}", type_list(.expected), type_list(.found))]
    TypeMismatch {
        operation: String,
        expected: Vec<ValType>,
        found: Vec<ValType>,
    },

    /// An instruction descriptor carried a tag the active backend does not
    /// know how to encode. This indicates an internal inconsistency between
    /// the validator and the encoder rather than anything a caller did
    /// wrong, but it is still surfaced as an ordinary error instead of
    /// panicking the host process.
    #[error("encoding failure: {0}")]
    Encoding(String),
}

impl Error {
    pub(crate) fn precondition(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Precondition {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn structural(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Structural {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub(crate) fn type_mismatch(
        operation: impl Into<String>,
        expected: Vec<ValType>,
        found: Vec<ValType>,
    ) -> Self {
        Error::TypeMismatch {
            operation: operation.into(),
            expected,
            found,
        }
    }
}

/// The crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, Error>;
