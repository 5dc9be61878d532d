//! A builder for well-formed WebAssembly modules.
//!
//! A [`Module`] accumulates prototypes, memories, tables, globals and
//! functions; a [`Sink`], opened against one of the module's declared
//! functions, accumulates that function's locals and instruction stream
//! behind an operand-stack type checker that enforces the same rules a
//! conforming WebAssembly validator would. Neither type ever produces bytes
//! itself — both write every observable effect through a
//! [`backend::ModuleBackend`]/[`backend::SinkBackend`] pair, so the same
//! validated build can target the binary encoder (`backend::binary`), a
//! fan-out to several backends at once (`backend::split`), or a caller's own
//! implementation of the same two traits.
//!
//! # Mutation semantics
//!
//! Every fallible method on [`Module`] and [`Sink`] either succeeds and takes
//! effect, or fails and leaves the object exactly as it was; there is no
//! partial application of a single call. The one exception is a cascading
//! [`Sink::close_scope`]/[`Sink::toggle_else`] call that closes several
//! nested scopes at once: a type error partway through the cascade leaves
//! the scopes already closed, closed, and the rest still open.
//!
//! # Deferred errors
//!
//! [`Sink`] and [`Module`] are closed explicitly with
//! [`Sink::close`]/[`Module::close`], which return a [`error::Result`]. Both
//! also implement `Drop`, closing themselves implicitly if dropped first —
//! but a destructor cannot return a `Result`, so an error raised during an
//! implicit close is instead stored on the owning object (a dropped `Sink`
//! defers to its `Module`) and surfaced the next time that object is used or
//! explicitly closed. A caller that wants close-time errors should call
//! `close()` explicitly rather than relying on `Drop`.
//!
//! # Logging
//!
//! Structural decisions (declarations, close-time checks, discarded deferred
//! errors) are logged through the [`log`] crate at `trace`/`debug`/`warn`
//! levels; this crate never installs a logger itself, so a binary embedding
//! it picks the subscriber.

pub mod backend;
pub mod entity;
pub mod error;
pub mod inst;
pub mod leb;
pub mod module;
pub mod sink;
pub mod ty;
pub mod value;

pub use entity::{EntityRef, FunctionId, GlobalId, MemoryId, ModuleId, PrototypeId, TableId};
pub use error::{Error, Result};
pub use inst::{
    ConstLiteral, GlobalOp, Instruction, LocalOp, MemoryOp, OperandOp, SimpleOp, TableOp, VariableId,
    WidthOp,
};
pub use module::{Exchange, Module};
pub use sink::{ScopeKind, Sink, Target};
pub use ty::{Limit, Param, RefType, ValType};
pub use value::Value;
