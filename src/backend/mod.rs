//! The pluggable output side: every observable effect of building a
//! [`crate::Module`] and its [`crate::Sink`]s is funneled through these two
//! traits. The binary encoder (`binary`) and the multi-backend fan-out
//! (`split`) are the two implementations this crate ships; a caller wanting
//! a textual dump, a validator-only backend, or anything else implements
//! the same traits.
//!
//! A backend is never asked to validate anything — by the time any of these
//! methods run, [`crate::Module`]/[`crate::Sink`] have already accepted the
//! call. A backend method is expected to succeed; the instruction descriptor
//! enum in [`crate::inst`] is matched exhaustively by every implementation
//! (adding a variant without updating every backend is a compile error, not
//! a runtime one), so [`crate::Error::Encoding`] exists for forward
//! compatibility with backends that cannot be exhaustive (the text backend's
//! `other_examples`-style pretty-printer, for instance) rather than for
//! anything the shipped binary/split backends can actually hit.

pub mod binary;
pub mod split;

use crate::entity::{FunctionId, GlobalId, MemoryId, PrototypeId, TableId};
use crate::inst::Instruction;
use crate::sink::ScopeKind;
use crate::ty::{Limit, Param, ValType};
use crate::value::Value;

/// A snapshot of a prototype's signature, passed to `ModuleBackend::add_prototype`.
pub struct PrototypeView<'a> {
    pub id: Option<&'a str>,
    pub params: &'a [Param],
    pub results: &'a [ValType],
}

/// A snapshot of a memory's declared shape, passed to `ModuleBackend::add_memory`.
pub struct MemoryView<'a> {
    pub id: Option<&'a str>,
    pub import_module: Option<&'a str>,
    pub exported: bool,
    pub limit: Limit,
}

/// A snapshot of a table's declared shape, passed to `ModuleBackend::add_table`.
pub struct TableView<'a> {
    pub id: Option<&'a str>,
    pub import_module: Option<&'a str>,
    pub exported: bool,
    pub ref_kind: crate::ty::RefType,
    pub limit: Limit,
}

/// A snapshot of a global's declared shape, passed to `ModuleBackend::add_global`.
pub struct GlobalView<'a> {
    pub id: Option<&'a str>,
    pub import_module: Option<&'a str>,
    pub exported: bool,
    pub val_type: ValType,
    pub mutating: bool,
}

/// A snapshot of a function's declared shape, passed to `ModuleBackend::add_function`.
pub struct FunctionView<'a> {
    pub id: Option<&'a str>,
    pub import_module: Option<&'a str>,
    pub exported: bool,
    pub prototype: PrototypeId,
}

/// What a newly opened scope looks like, passed to `SinkBackend::push_scope`.
pub struct TargetInfo<'a> {
    pub kind: ScopeKind,
    pub prototype: PrototypeId,
    pub params: &'a [ValType],
    pub results: &'a [ValType],
    pub label: Option<&'a str>,
}

/// The module-level half of a backend: receives every entity declaration and
/// assembles whatever the backend produces (a binary blob, a text dump, ...)
/// at `close`.
pub trait ModuleBackend {
    /// Begins the function body for `function`; the returned [`SinkBackend`]
    /// receives every instruction and scope change until it is closed.
    fn sink(&mut self, function: FunctionId) -> Box<dyn SinkBackend>;

    fn add_prototype(&mut self, id: PrototypeId, view: &PrototypeView<'_>);
    fn add_memory(&mut self, id: MemoryId, view: &MemoryView<'_>);
    fn add_table(&mut self, id: TableId, view: &TableView<'_>);
    fn add_global(&mut self, id: GlobalId, view: &GlobalView<'_>);
    fn add_function(&mut self, id: FunctionId, view: &FunctionView<'_>);

    fn set_memory_limit(&mut self, id: MemoryId, limit: Limit);
    fn set_table_limit(&mut self, id: TableId, limit: Limit);
    fn set_global_value(&mut self, id: GlobalId, value: &Value);
    fn set_startup(&mut self, id: FunctionId);

    fn write_data(&mut self, memory: MemoryId, offset: &Value, bytes: &[u8]);
    fn write_elements(&mut self, table: TableId, offset: &Value, values: &[Value]);

    /// Called once, after every entity has been declared and every function
    /// body has closed. Assembles and finalizes whatever output this backend
    /// produces.
    fn close(&mut self);
}

/// The per-function half of a backend.
pub trait SinkBackend {
    fn add_local(&mut self, ty: ValType);
    fn push_scope(&mut self, target: &TargetInfo<'_>);
    fn pop_scope(&mut self, kind: ScopeKind);
    fn toggle_conditional(&mut self);
    /// A free-text annotation attached at the current position; backends
    /// that have no notion of comments (most binary formats) ignore it.
    fn add_comment(&mut self, _text: &str) {}
    fn add_inst(&mut self, inst: &Instruction);
    /// Consumes the backend, finalizing this function's body into the
    /// owning [`ModuleBackend`].
    fn close(self: Box<Self>);
}
