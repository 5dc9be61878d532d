//! The instruction-stream builder for a single function body: local
//! declarations, the operand-stack type checker, and the scope/target stack
//! that backs structured control flow.

use std::collections::HashSet;

use smallvec::SmallVec;

use crate::backend::{SinkBackend, TargetInfo};
use crate::entity::{FunctionId, PrototypeId};
use crate::error::{Error, Result};
use crate::inst::{
    ConstLiteral, GlobalOp, Instruction, LocalOp, MemoryOp, OperandOp, SimpleOp, TableOp, VariableId,
    WidthOp,
};
use crate::module::Module;
use crate::ty::ValType;

/// The kind of structured control-flow scope a [`Target`] was opened with.
///
/// A `loop`'s label targets its *entry* (branching to it re-enters the loop
/// body), so its label arity is its parameter types; every other kind's
/// label targets its *exit*, so its label arity is its result types. This
/// single distinction is threaded through every branch-family type check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Block,
    Loop,
    Conditional,
}

/// A handle to a still-open structured-control-flow scope, returned by
/// `Sink::open_block`/`open_loop`/`open_if` and consumed by
/// `Sink::close_scope`/`toggle_else`/the branch instructions.
///
/// Like every other handle in this crate, a `Target` is only valid against
/// the `Sink` that issued it and only for as long as that scope is still
/// open; `stamp` catches reuse of a `Target` whose depth slot has since been
/// recycled by closing and reopening scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    index: u32,
    stamp: u64,
}

impl Target {
    /// The branch depth this target currently sits at, counting outward from
    /// the innermost open scope (`0` is the innermost). This is recomputed on
    /// every call since closing intervening scopes changes it.
    pub fn depth_from(self, sink: &Sink<'_, '_>) -> Option<u32> {
        if (self.index as usize) >= sink.targets.len() || sink.targets[self.index as usize].stamp != self.stamp {
            return None;
        }
        Some(sink.targets.len() as u32 - self.index - 1)
    }
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    /// Operand-stack depth this scope's region begins at.
    stack: usize,
    /// Once `true`, pops are never rejected until the scope closes.
    unreachable: bool,
}

struct TargetEntry {
    prototype: PrototypeId,
    label: Option<String>,
    kind: ScopeKind,
    stamp: u64,
    /// Set once `toggle_else` has fired for a `Conditional` target.
    otherwise: bool,
    scope: Scope,
}

struct VariableData {
    ty: ValType,
    id: Option<String>,
}

/// A function body under construction.
///
/// Obtained from [`Module::open_sink`], which borrows the module for the
/// sink's entire lifetime: a module cannot be mutated elsewhere while one of
/// its functions is being written to, matching the single-writer model
/// described in the crate docs. Drop this value (or call
/// [`Sink::close`] explicitly) to finish the function; an error raised by an
/// implicit close is deferred to the owning module, see
/// `Module::check`.
pub struct Sink<'m, 'b> {
    module: &'m mut Module<'b>,
    function: FunctionId,
    variables: Vec<VariableData>,
    variable_ids: HashSet<String>,
    parameter_count: u32,
    targets: Vec<TargetEntry>,
    operand_stack: SmallVec<[ValType; 8]>,
    next_stamp: u64,
    root: Scope,
    closed: bool,
    backend: Option<Box<dyn SinkBackend>>,
}

impl<'m, 'b> Sink<'m, 'b> {
    pub(crate) fn open(module: &'m mut Module<'b>, function: FunctionId) -> Result<Self> {
        module.check()?;
        Self::open_unchecked(module, function)
    }

    /// Opens a sink without re-running `Module::check`'s closed/deferred-error
    /// gate. Used only by `Module::close_impl` to synthesize an empty body for
    /// an unbound function after the module has already drained its deferred
    /// error and marked itself closed; every other caller goes through `open`.
    pub(crate) fn open_unchecked(module: &'m mut Module<'b>, function: FunctionId) -> Result<Self> {
        if !function.originates_from(module.id()) {
            return Err(Error::precondition(
                "open_sink",
                "function does not originate from this module",
            ));
        }
        let data = module.function_data(function)?;
        if data.import_module.is_some() {
            return Err(Error::precondition(
                "open_sink",
                format!("function {} is an import and has no body", module.function_ref(function)),
            ));
        }
        if data.bound {
            return Err(Error::precondition(
                "open_sink",
                format!("function {} already has a sink open or closed against it", module.function_ref(function)),
            ));
        }
        let prototype = data.prototype;
        let params = module.prototype_data(prototype)?.params.clone();

        let mut variables = Vec::with_capacity(params.len());
        let mut variable_ids = HashSet::new();
        for param in &params {
            if let Some(id) = &param.id {
                if !variable_ids.insert(id.clone()) {
                    return Err(Error::precondition(
                        "open_sink",
                        format!("parameter id ${id} declared more than once"),
                    ));
                }
            }
            variables.push(VariableData { ty: param.ty, id: param.id.clone() });
        }
        let parameter_count = variables.len() as u32;

        module.mark_function_bound(function)?;
        let backend = module.backend_mut().sink(function);

        Ok(Sink {
            module,
            function,
            variables,
            variable_ids,
            parameter_count,
            targets: Vec::new(),
            operand_stack: SmallVec::new(),
            next_stamp: 0,
            root: Scope { stack: 0, unreachable: false },
            closed: false,
            backend: Some(backend),
        })
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// The handle for parameter `index`, as declared on the function's
    /// prototype.
    pub fn param(&self, index: u32) -> Result<VariableId> {
        if index >= self.parameter_count {
            return Err(Error::precondition("param", format!("index {index} is not a parameter")));
        }
        Ok(VariableId { function: self.function, index })
    }

    /// Declares a new local variable, returning a handle usable with
    /// `local_access`.
    pub fn local(&mut self, ty: ValType, id: Option<&str>) -> Result<VariableId> {
        self.check()?;
        if let Some(id) = id {
            if !self.variable_ids.insert(id.to_string()) {
                return Err(Error::precondition("local", format!("id ${id} already declared")));
            }
        }
        let index = self.variables.len() as u32;
        self.variables.push(VariableData { ty, id: id.map(str::to_string) });
        self.backend_mut().add_local(ty);
        Ok(VariableId { function: self.function, index })
    }

    fn check(&self) -> Result<()> {
        if self.closed {
            return Err(Error::structural("sink", "already closed"));
        }
        Ok(())
    }

    fn backend_mut(&mut self) -> &mut dyn SinkBackend {
        self.backend.as_deref_mut().expect("sink backend missing before close")
    }

    fn current_scope(&self) -> Scope {
        self.targets.last().map(|t| t.scope).unwrap_or(self.root)
    }

    fn current_scope_mut(&mut self) -> &mut Scope {
        match self.targets.last_mut() {
            Some(t) => &mut t.scope,
            None => &mut self.root,
        }
    }

    // -- operand-stack helpers, grounded in wasm-sink.cpp's fPopTypes/
    // fPushTypes/fSwapTypes/fCheckEmpty --

    fn push_types(&mut self, types: &[ValType]) {
        self.operand_stack.extend_from_slice(types);
    }

    fn pop_types(&mut self, operation: &str, types: &[ValType]) -> Result<()> {
        if self.current_scope().unreachable {
            return Ok(());
        }
        let depth = self.current_scope().stack;
        let avail = self.operand_stack.len() - depth;
        if avail >= types.len() && &self.operand_stack[self.operand_stack.len() - types.len()..] == types {
            let new_len = self.operand_stack.len() - types.len();
            self.operand_stack.truncate(new_len);
            return Ok(());
        }
        Err(self.pop_failed(operation, types, avail))
    }

    fn pop_failed(&self, operation: &str, expected: &[ValType], avail: usize) -> Error {
        let take = expected.len().min(avail);
        let start = self.operand_stack.len() - take;
        let found = self.operand_stack[start..].to_vec();
        Error::type_mismatch(operation.to_string(), expected.to_vec(), found)
    }

    fn swap_types(&mut self, operation: &str, pop: &[ValType], push: &[ValType]) -> Result<()> {
        self.pop_types(operation, pop)?;
        self.push_types(push);
        Ok(())
    }

    fn check_empty(&self, operation: &str) -> Result<()> {
        if self.current_scope().unreachable {
            return Ok(());
        }
        let depth = self.current_scope().stack;
        if self.operand_stack.len() != depth {
            let found = self.operand_stack[depth..].to_vec();
            return Err(Error::type_mismatch(operation.to_string(), Vec::new(), found));
        }
        Ok(())
    }

    /// Pops exactly one value of any type, returning it. Used by `drop` and
    /// `ref.is_null`, whose type rule depends on what is actually on top of
    /// the stack rather than a fixed type list.
    fn pop_any(&mut self, operation: &str) -> Result<Option<ValType>> {
        if self.current_scope().unreachable {
            let depth = self.current_scope().stack;
            if self.operand_stack.len() > depth {
                return Ok(self.operand_stack.pop());
            }
            return Ok(None);
        }
        let depth = self.current_scope().stack;
        if self.operand_stack.len() <= depth {
            return Err(self.pop_failed(operation, &[ValType::I32], 0));
        }
        Ok(self.operand_stack.pop())
    }

    // -- structured control flow --

    fn target_info<'a>(
        &self,
        kind: ScopeKind,
        prototype: PrototypeId,
        label: &'a Option<String>,
        params: &'a [ValType],
        results: &'a [ValType],
    ) -> TargetInfo<'a> {
        TargetInfo { kind, prototype, params, results, label: label.as_deref() }
    }

    fn open_target(&mut self, kind: ScopeKind, prototype: PrototypeId, label: Option<String>) -> Result<Target> {
        self.check()?;
        if !prototype.originates_from(self.module.id()) {
            return Err(Error::precondition("open_scope", "prototype does not originate from this module"));
        }
        if kind == ScopeKind::Conditional {
            self.pop_types("if", &[ValType::I32])?;
        }
        let data = self.module.prototype_data(prototype)?;
        let params: Vec<ValType> = data.params.iter().map(|p| p.ty).collect();
        let results: Vec<ValType> = data.results.clone();

        self.pop_types("open_scope", &params)?;
        let inherited_unreachable = self.current_scope().unreachable;
        self.push_types(&params);
        let entry_depth = self.operand_stack.len() - params.len();

        self.next_stamp += 1;
        let stamp = self.next_stamp;
        let info = self.target_info(kind, prototype, &label, &params, &results);
        self.backend_mut().push_scope(&info);

        self.targets.push(TargetEntry {
            prototype,
            label,
            kind,
            stamp,
            otherwise: false,
            scope: Scope { stack: entry_depth, unreachable: inherited_unreachable },
        });
        Ok(Target { index: (self.targets.len() - 1) as u32, stamp })
    }

    /// Opens a `block` scope with the given anonymous signature.
    pub fn open_block(&mut self, params: &[ValType], results: &[ValType], label: Option<&str>) -> Result<Target> {
        let prototype = self.module.intern_prototype(params, results);
        self.open_target(ScopeKind::Block, prototype, label.map(str::to_string))
    }

    /// Opens a `loop` scope with the given anonymous signature.
    pub fn open_loop(&mut self, params: &[ValType], results: &[ValType], label: Option<&str>) -> Result<Target> {
        let prototype = self.module.intern_prototype(params, results);
        self.open_target(ScopeKind::Loop, prototype, label.map(str::to_string))
    }

    /// Opens an `if` scope, consuming the `i32` condition already on the
    /// stack. Call [`Sink::toggle_else`] with the returned target before
    /// adding any `else`-branch instructions.
    pub fn open_if(&mut self, params: &[ValType], results: &[ValType], label: Option<&str>) -> Result<Target> {
        let prototype = self.module.intern_prototype(params, results);
        self.open_target(ScopeKind::Conditional, prototype, label.map(str::to_string))
    }

    /// Switches a still-open `if` scope from its `then` arm to its `else`
    /// arm. Legal exactly once, before the scope is closed, and only for a
    /// target opened with [`Sink::open_if`].
    pub fn toggle_else(&mut self, target: Target) -> Result<()> {
        self.check()?;
        let idx = target.index as usize;
        if idx >= self.targets.len() || self.targets[idx].stamp != target.stamp {
            return Err(Error::precondition("toggle_else", "target is not open on this sink"));
        }
        if self.targets[idx].kind != ScopeKind::Conditional {
            return Err(Error::precondition("toggle_else", "target is not an `if` scope"));
        }
        if self.targets[idx].otherwise {
            return Err(Error::precondition("toggle_else", "target already has an `else` arm"));
        }

        // Closing anything nested above this target mirrors how
        // `close_scope` cascades; a dangling nested scope cannot survive an
        // `else` toggle on its enclosing `if`.
        self.pop_until(idx + 1)?;

        let (prototype, scope) = {
            let entry = &self.targets[idx];
            (entry.prototype, entry.scope)
        };
        let results = self.module.prototype_data(prototype)?.results.clone();
        let params: Vec<ValType> = self.module.prototype_data(prototype)?.params.iter().map(|p| p.ty).collect();

        if !scope.unreachable {
            self.pop_types("else", &results)?;
            self.check_empty("else")?;
        }

        self.operand_stack.truncate(scope.stack);
        self.push_types(&params);

        let entry = &mut self.targets[idx];
        entry.otherwise = true;
        entry.scope.unreachable = false;

        self.backend_mut().toggle_conditional();
        Ok(())
    }

    /// Closes every scope from the top of the target stack down to and
    /// including `target`. Closing a scope that still has nested scopes open
    /// above it closes those too, in order, innermost first; per the crate's
    /// partial-mutation note, a type error raised partway through this
    /// cascade leaves the scopes already closed, closed.
    pub fn close_scope(&mut self, target: Target) -> Result<()> {
        self.check()?;
        let idx = target.index as usize;
        if idx >= self.targets.len() || self.targets[idx].stamp != target.stamp {
            return Err(Error::precondition("close_scope", "target is not open on this sink"));
        }
        self.pop_until(idx)
    }

    fn pop_until(&mut self, size: usize) -> Result<()> {
        while self.targets.len() > size {
            let (prototype, scope, kind) = {
                let entry = self.targets.last().unwrap();
                (entry.prototype, entry.scope, entry.kind)
            };
            let results = self.module.prototype_data(prototype)?.results.clone();
            if !scope.unreachable {
                self.pop_types("close_scope", &results)?;
                self.check_empty("close_scope")?;
            } else {
                self.operand_stack.truncate(scope.stack);
            }
            self.push_types(&results);
            self.backend_mut().pop_scope(kind);
            self.targets.pop();
        }
        Ok(())
    }

    /// The label arity a branch to `target` must match: a `loop`'s
    /// parameter types (branching re-enters the loop), every other scope's
    /// result types (branching exits it).
    fn branch_arity(&self, target: Target) -> Result<(Vec<ValType>, bool)> {
        let idx = target.index as usize;
        if idx >= self.targets.len() || self.targets[idx].stamp != target.stamp {
            return Err(Error::precondition("branch", "target is not open on this sink"));
        }
        let entry = &self.targets[idx];
        let data = self.module.prototype_data(entry.prototype)?;
        let types = if entry.kind == ScopeKind::Loop {
            data.params.iter().map(|p| p.ty).collect()
        } else {
            data.results.clone()
        };
        Ok((types, entry.kind == ScopeKind::Loop))
    }

    // -- instruction emission --

    fn emit(&mut self, instruction: Instruction) -> Result<()> {
        self.backend_mut().add_inst(&instruction);
        Ok(())
    }

    pub fn simple(&mut self, op: SimpleOp) -> Result<()> {
        self.check()?;
        use ValType::*;
        match op {
            SimpleOp::Unreachable => {
                self.current_scope_mut().unreachable = true;
            }
            SimpleOp::Nop => {}
            SimpleOp::Return => {
                let results = self.module.prototype_data(self.module.function_data(self.function)?.prototype)?.results.clone();
                self.pop_types("return", &results)?;
                self.current_scope_mut().unreachable = true;
            }
            SimpleOp::Drop => {
                self.pop_any("drop")?;
            }
            SimpleOp::Select => {
                self.pop_types("select", &[I32])?;
                let depth = self.current_scope().stack;
                let ty = if self.operand_stack.len() >= depth + 2 {
                    self.operand_stack[self.operand_stack.len() - 2]
                } else if self.current_scope().unreachable {
                    I32
                } else {
                    return Err(self.pop_failed("select", &[I32, I32], self.operand_stack.len() - depth));
                };
                self.swap_types("select", &[ty, ty], &[ty])?;
            }
            SimpleOp::SelectTyped(ty) => {
                self.pop_types("select", &[I32])?;
                self.swap_types("select", &[ty, ty], &[ty])?;
            }
            SimpleOp::RefIsNull => {
                let popped = self.pop_any("ref.is_null")?;
                if let Some(ty) = popped {
                    if !ty.is_reference() {
                        return Err(Error::type_mismatch("ref.is_null", vec![RefFunc], vec![ty]));
                    }
                }
                self.push_types(&[I32]);
            }
            SimpleOp::RefNullFunc => self.push_types(&[RefFunc]),
            SimpleOp::RefNullExtern => self.push_types(&[RefExtern]),
            SimpleOp::ExtendI32Signed | SimpleOp::ExtendI32Unsigned => {
                self.swap_types("extend", &[I32], &[I64])?;
            }
            SimpleOp::WrapI64 => {
                self.swap_types("wrap", &[I64], &[I32])?;
            }
            SimpleOp::PromoteF32 => {
                self.swap_types("promote", &[F32], &[F64])?;
            }
            SimpleOp::DemoteF64 => {
                self.swap_types("demote", &[F64], &[F32])?;
            }
        }
        self.emit(Instruction::Simple(op))
    }

    pub fn konst(&mut self, lit: ConstLiteral) -> Result<()> {
        self.check()?;
        self.push_types(&[lit.ty()]);
        self.emit(Instruction::Const(lit))
    }

    pub fn operand(&mut self, op: OperandOp, ty: ValType) -> Result<()> {
        self.check()?;
        self.swap_types("operand", &[ty, ty], &[ty])?;
        self.emit(Instruction::Operand { op, ty })
    }

    pub fn width(&mut self, op: WidthOp, ty: ValType) -> Result<()> {
        self.check()?;
        use ValType::*;
        use WidthOp::*;
        match op {
            EqualZero => self.swap_types("width", &[ty], &[I32])?,
            GreaterSigned | GreaterUnsigned | LessSigned | LessUnsigned | GreaterEqualSigned
            | GreaterEqualUnsigned | LessEqualSigned | LessEqualUnsigned | Greater | Less | GreaterEqual
            | LessEqual => self.swap_types("width", &[ty, ty], &[I32])?,
            DivSigned | DivUnsigned | ModSigned | ModUnsigned | BitAnd | BitOr | BitXor | ShiftLeft
            | ShiftRightSigned | ShiftRightUnsigned | RotateLeft | RotateRight | Div | Min | Max | CopySign => {
                self.swap_types("width", &[ty, ty], &[ty])?
            }
            LeadingZeros | TrailingZeros | PopCount | Floor | Round | Ceil | Truncate | Absolute | Negate
            | SquareRoot => self.swap_types("width", &[ty], &[ty])?,
            ConvertToF32Signed | ConvertToF32Unsigned => self.swap_types("width", &[ty], &[F32])?,
            ConvertToF64Signed | ConvertToF64Unsigned => self.swap_types("width", &[ty], &[F64])?,
            ConvertFromF32Signed | ConvertFromF32Unsigned | ConvertFromF32SignedSaturating
            | ConvertFromF32UnsignedSaturating => self.swap_types("width", &[F32], &[ty])?,
            ConvertFromF64Signed | ConvertFromF64Unsigned | ConvertFromF64SignedSaturating
            | ConvertFromF64UnsignedSaturating => self.swap_types("width", &[F64], &[ty])?,
            ReinterpretAsFloat => {
                let target = if ty == I32 { F32 } else { F64 };
                self.swap_types("width", &[ty], &[target])?
            }
            ReinterpretAsInt => {
                let target = if ty == F32 { I32 } else { I64 };
                self.swap_types("width", &[ty], &[target])?
            }
        }
        self.emit(Instruction::Width { op, ty })
    }

    pub fn memory(&mut self, op: MemoryOp, ty: ValType, memory: crate::entity::MemoryId, offset: u32) -> Result<()> {
        self.check()?;
        if !memory.originates_from(self.module.id()) {
            return Err(Error::precondition("memory", "memory does not originate from this module"));
        }
        use MemoryOp::*;
        use ValType::*;
        if matches!(op, Load32Signed | Load32Unsigned | Store32) && ty != I64 {
            return Err(Error::precondition("memory", "load32/store32 only exist for i64"));
        }
        match op {
            Load | Load8Signed | Load8Unsigned | Load16Signed | Load16Unsigned | Load32Signed | Load32Unsigned => {
                self.swap_types("memory.load", &[I32], &[ty])?
            }
            Store | Store8 | Store16 | Store32 => self.pop_types("memory.store", &[I32, ty])?,
            Size => self.push_types(&[I32]),
            Grow => self.swap_types("memory.grow", &[I32], &[I32])?,
            Fill => self.pop_types("memory.fill", &[I32, I32, I32])?,
        }
        self.emit(Instruction::Memory { op, ty, memory, offset })
    }

    /// `memory.copy $destination $source`. The operand stack (destination
    /// address, source address, length) matches the order the two memory
    /// arguments are named here.
    pub fn memory_copy(&mut self, destination: crate::entity::MemoryId, source: crate::entity::MemoryId) -> Result<()> {
        self.check()?;
        if !destination.originates_from(self.module.id()) || !source.originates_from(self.module.id()) {
            return Err(Error::precondition("memory.copy", "memory does not originate from this module"));
        }
        self.pop_types("memory.copy", &[ValType::I32, ValType::I32, ValType::I32])?;
        self.emit(Instruction::MemoryCopy { destination, source })
    }

    pub fn table(&mut self, op: TableOp, table: crate::entity::TableId) -> Result<()> {
        self.check()?;
        if !table.originates_from(self.module.id()) {
            return Err(Error::precondition("table", "table does not originate from this module"));
        }
        let ref_ty = self.module.table_data(table)?.ref_kind.val_type();
        use TableOp::*;
        use ValType::*;
        match op {
            Get => self.swap_types("table.get", &[I32], &[ref_ty])?,
            Set => self.pop_types("table.set", &[I32, ref_ty])?,
            Size => self.push_types(&[I32]),
            Grow => self.swap_types("table.grow", &[ref_ty, I32], &[I32])?,
            Fill => self.pop_types("table.fill", &[I32, ref_ty, I32])?,
        }
        self.emit(Instruction::Table { op, table })
    }

    /// `table.copy $destination $source`, analogous to [`Sink::memory_copy`].
    pub fn table_copy(&mut self, destination: crate::entity::TableId, source: crate::entity::TableId) -> Result<()> {
        self.check()?;
        if !destination.originates_from(self.module.id()) || !source.originates_from(self.module.id()) {
            return Err(Error::precondition("table.copy", "table does not originate from this module"));
        }
        self.pop_types("table.copy", &[ValType::I32, ValType::I32, ValType::I32])?;
        self.emit(Instruction::TableCopy { destination, source })
    }

    pub fn local_access(&mut self, op: LocalOp, var: VariableId) -> Result<()> {
        self.check()?;
        if !var.originates_from(self.function) {
            return Err(Error::precondition("local", "variable does not originate from this sink"));
        }
        let ty = self
            .variables
            .get(var.index() as usize)
            .ok_or_else(|| Error::precondition("local", "variable index out of range"))?
            .ty;
        match op {
            LocalOp::Get => self.push_types(&[ty]),
            LocalOp::Set => self.pop_types("local.set", &[ty])?,
            LocalOp::Tee => self.swap_types("local.tee", &[ty], &[ty])?,
        }
        self.emit(Instruction::Local { op, var })
    }

    pub fn global_access(&mut self, op: GlobalOp, global: crate::entity::GlobalId) -> Result<()> {
        self.check()?;
        if !global.originates_from(self.module.id()) {
            return Err(Error::precondition("global", "global does not originate from this module"));
        }
        let data = self.module.global_data(global)?;
        let ty = data.val_type;
        match op {
            GlobalOp::Get => self.push_types(&[ty]),
            GlobalOp::Set => {
                if !data.mutating {
                    return Err(Error::precondition("global.set", format!("global {} is not mutable", self.module.global_ref(global))));
                }
                self.pop_types("global.set", &[ty])?
            }
        }
        self.emit(Instruction::Global { op, global })
    }

    pub fn ref_func(&mut self, function: crate::entity::FunctionId) -> Result<()> {
        self.check()?;
        if !function.originates_from(self.module.id()) {
            return Err(Error::precondition("ref.func", "function does not originate from this module"));
        }
        self.push_types(&[ValType::RefFunc]);
        self.emit(Instruction::RefFunc(function))
    }

    fn call_like(&mut self, function: crate::entity::FunctionId, operation: &str, tail: bool) -> Result<()> {
        if !function.originates_from(self.module.id()) {
            return Err(Error::precondition(operation, "function does not originate from this module"));
        }
        let prototype = self.module.function_data(function)?.prototype;
        let data = self.module.prototype_data(prototype)?;
        let params: Vec<ValType> = data.params.iter().map(|p| p.ty).collect();
        let results = data.results.clone();
        self.pop_types(operation, &params)?;
        if tail {
            let own_results = self.module.prototype_data(self.module.function_data(self.function)?.prototype)?.results.clone();
            if results != own_results {
                return Err(Error::type_mismatch(operation.to_string(), own_results, results));
            }
            self.current_scope_mut().unreachable = true;
        } else {
            self.push_types(&results);
        }
        Ok(())
    }

    pub fn call(&mut self, function: crate::entity::FunctionId) -> Result<()> {
        self.check()?;
        self.call_like(function, "call", false)?;
        self.emit(Instruction::Call(function))
    }

    pub fn return_call(&mut self, function: crate::entity::FunctionId) -> Result<()> {
        self.check()?;
        self.call_like(function, "return_call", true)?;
        self.emit(Instruction::ReturnCall(function))
    }

    fn call_indirect_like(&mut self, table: crate::entity::TableId, prototype: PrototypeId, operation: &str, tail: bool) -> Result<()> {
        if !table.originates_from(self.module.id()) {
            return Err(Error::precondition(operation, "table does not originate from this module"));
        }
        if !prototype.originates_from(self.module.id()) {
            return Err(Error::precondition(operation, "prototype does not originate from this module"));
        }
        if self.module.table_data(table)?.ref_kind != crate::ty::RefType::Func {
            return Err(Error::precondition(operation, "table does not hold funcref"));
        }
        self.pop_types(operation, &[ValType::I32])?;
        let data = self.module.prototype_data(prototype)?;
        let params: Vec<ValType> = data.params.iter().map(|p| p.ty).collect();
        let results = data.results.clone();
        self.pop_types(operation, &params)?;
        if tail {
            let own_results = self.module.prototype_data(self.module.function_data(self.function)?.prototype)?.results.clone();
            if results != own_results {
                return Err(Error::type_mismatch(operation.to_string(), own_results, results));
            }
            self.current_scope_mut().unreachable = true;
        } else {
            self.push_types(&results);
        }
        Ok(())
    }

    pub fn call_indirect(&mut self, table: crate::entity::TableId, prototype: PrototypeId) -> Result<()> {
        self.check()?;
        self.call_indirect_like(table, prototype, "call_indirect", false)?;
        self.emit(Instruction::CallIndirect { table, prototype })
    }

    pub fn return_call_indirect(&mut self, table: crate::entity::TableId, prototype: PrototypeId) -> Result<()> {
        self.check()?;
        self.call_indirect_like(table, prototype, "return_call_indirect", true)?;
        self.emit(Instruction::ReturnCallIndirect { table, prototype })
    }

    pub fn branch(&mut self, target: Target) -> Result<()> {
        self.check()?;
        let (types, _) = self.branch_arity(target)?;
        let depth = target.depth_from(self).expect("validated by branch_arity");
        self.pop_types("br", &types)?;
        self.current_scope_mut().unreachable = true;
        self.emit(Instruction::Branch(depth))
    }

    pub fn branch_if(&mut self, target: Target) -> Result<()> {
        self.check()?;
        let (types, _) = self.branch_arity(target)?;
        let depth = target.depth_from(self).expect("validated by branch_arity");
        self.pop_types("br_if", &[ValType::I32])?;
        self.swap_types("br_if", &types, &types)?;
        self.emit(Instruction::BranchIf(depth))
    }

    pub fn branch_table(&mut self, targets: &[Target], default: Target) -> Result<()> {
        self.check()?;
        self.pop_types("br_table", &[ValType::I32])?;
        let (default_types, _) = self.branch_arity(default)?;
        let mut depths = Vec::with_capacity(targets.len());
        for &t in targets {
            let (types, _) = self.branch_arity(t)?;
            if types != default_types {
                return Err(Error::type_mismatch("br_table", default_types.clone(), types));
            }
            depths.push(t.depth_from(self).expect("validated by branch_arity"));
        }
        let default_depth = default.depth_from(self).expect("validated by branch_arity");
        self.pop_types("br_table", &default_types)?;
        self.current_scope_mut().unreachable = true;
        self.emit(Instruction::BranchTable { targets: depths, default: default_depth })
    }

    /// Opens a `block`, runs `body`, then closes it — the scope's handle
    /// never escapes, so misuse across scopes is caught at compile time
    /// rather than at runtime.
    pub fn with_block<F>(&mut self, params: &[ValType], results: &[ValType], label: Option<&str>, body: F) -> Result<()>
    where
        F: FnOnce(&mut Sink<'m, 'b>) -> Result<()>,
    {
        let target = self.open_block(params, results, label)?;
        body(self)?;
        self.close_scope(target)
    }

    /// Opens a `loop`, runs `body`, then closes it.
    pub fn with_loop<F>(&mut self, params: &[ValType], results: &[ValType], label: Option<&str>, body: F) -> Result<()>
    where
        F: FnOnce(&mut Sink<'m, 'b>) -> Result<()>,
    {
        let target = self.open_loop(params, results, label)?;
        body(self)?;
        self.close_scope(target)
    }

    /// Opens an `if`, runs `then_body`, optionally toggles to an `else` arm
    /// and runs `else_body`, then closes the scope.
    pub fn with_if_then<F, G>(
        &mut self,
        params: &[ValType],
        results: &[ValType],
        label: Option<&str>,
        then_body: F,
        else_body: Option<G>,
    ) -> Result<()>
    where
        F: FnOnce(&mut Sink<'m, 'b>) -> Result<()>,
        G: FnOnce(&mut Sink<'m, 'b>) -> Result<()>,
    {
        let target = self.open_if(params, results, label)?;
        then_body(self)?;
        if let Some(else_body) = else_body {
            self.toggle_else(target)?;
            else_body(self)?;
        }
        self.close_scope(target)
    }

    fn close_impl(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pop_until(0)?;
        if !self.root.unreachable {
            let results = self.module.prototype_data(self.module.function_data(self.function)?.prototype)?.results.clone();
            self.pop_types("close", &results)?;
            self.check_empty("close")?;
        }
        if let Some(backend) = self.backend.take() {
            backend.close();
        }
        Ok(())
    }

    /// Finishes this function body. Automatically invoked on drop if not
    /// called explicitly; a failure from the implicit path is deferred to
    /// the owning module (see the crate-level docs on deferred errors).
    pub fn close(mut self) -> Result<()> {
        self.close_impl()
    }
}

impl<'m, 'b> Drop for Sink<'m, 'b> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.close_impl() {
            self.module.defer_error(e);
        }
    }
}
