//! The module builder: declares prototypes, memories, tables, globals and
//! functions, wires up imports/exports, and closes the module once every
//! invariant is satisfied.
//!
//! Grounded throughout in `objects/wasm-module.cpp`'s `Module` class, with
//! the back-pointer-heavy entity bookkeeping replaced by the
//! generation-stamped handles in [`crate::entity`].

use std::cell::RefCell;
use std::collections::HashSet;

use hashbrown::HashMap;

use crate::backend::{
    FunctionView, GlobalView, MemoryView, ModuleBackend, PrototypeView, TableView,
};
use crate::entity::{FunctionId, GlobalId, MemoryId, ModuleId, PrototypeId, TableId};
use crate::error::{Error, EntityRef as Ref, Result};
use crate::sink::Sink;
use crate::ty::{Limit, Param, RefType, ValType};
use crate::value::Value;

/// Where an entity's storage comes from and whether it is re-exported: the
/// shared shape of every `declare_*` call's "is this an import/export"
/// argument.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub import_module: Option<String>,
    pub exported: bool,
}

impl Exchange {
    pub fn none() -> Self {
        Exchange::default()
    }

    pub fn import(module: impl Into<String>) -> Self {
        Exchange { import_module: Some(module.into()), exported: false }
    }

    pub fn export() -> Self {
        Exchange { import_module: None, exported: true }
    }
}

pub(crate) struct PrototypeData {
    pub id: Option<String>,
    pub params: Vec<Param>,
    pub results: Vec<ValType>,
}

pub(crate) struct MemoryData {
    pub id: Option<String>,
    pub import_module: Option<String>,
    pub exported: bool,
    pub limit: Limit,
}

pub(crate) struct TableData {
    pub id: Option<String>,
    pub import_module: Option<String>,
    pub exported: bool,
    pub ref_kind: RefType,
    pub limit: Limit,
}

pub(crate) struct GlobalData {
    pub id: Option<String>,
    pub import_module: Option<String>,
    pub exported: bool,
    pub val_type: ValType,
    pub mutating: bool,
    pub assigned: bool,
}

pub(crate) struct FunctionData {
    pub id: Option<String>,
    pub import_module: Option<String>,
    pub exported: bool,
    pub prototype: PrototypeId,
    pub bound: bool,
}

/// A module under construction.
///
/// Holds a borrowed reference to its [`crate::backend::ModuleBackend`]
/// rather than owning it: the backend (a `binary::BinaryModule`, a
/// `split::SplitModule`, ...) is the caller's, and outlives the module so
/// its output can be read back after `close`.
pub struct Module<'b> {
    id: ModuleId,
    prototypes: Vec<PrototypeData>,
    memories: Vec<MemoryData>,
    tables: Vec<TableData>,
    globals: Vec<GlobalData>,
    functions: Vec<FunctionData>,
    prototype_ids: HashSet<String>,
    memory_ids: HashSet<String>,
    table_ids: HashSet<String>,
    global_ids: HashSet<String>,
    function_ids: HashSet<String>,
    anon_prototypes: HashMap<(Vec<ValType>, usize), PrototypeId>,
    imports_closed: bool,
    startup: Option<FunctionId>,
    closed: bool,
    deferred_error: RefCell<Option<Error>>,
    backend: &'b mut dyn ModuleBackend,
}

impl<'b> Module<'b> {
    pub fn new(backend: &'b mut dyn ModuleBackend) -> Self {
        Module {
            id: ModuleId::fresh(),
            prototypes: Vec::new(),
            memories: Vec::new(),
            tables: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            prototype_ids: HashSet::new(),
            memory_ids: HashSet::new(),
            table_ids: HashSet::new(),
            global_ids: HashSet::new(),
            function_ids: HashSet::new(),
            anon_prototypes: HashMap::new(),
            imports_closed: false,
            startup: None,
            closed: false,
            deferred_error: RefCell::new(None),
            backend,
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub(crate) fn check(&self) -> Result<()> {
        if let Some(err) = self.deferred_error.borrow_mut().take() {
            return Err(err);
        }
        if self.closed {
            return Err(Error::structural("module", "already closed"));
        }
        Ok(())
    }

    pub(crate) fn defer_error(&self, err: Error) {
        let mut slot = self.deferred_error.borrow_mut();
        if slot.is_none() {
            *slot = Some(err);
        } else {
            log::warn!("discarding additional deferred error: {err}");
        }
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn ModuleBackend {
        self.backend
    }

    pub(crate) fn prototype_data(&self, id: PrototypeId) -> Result<&PrototypeData> {
        self.prototypes
            .get(id.index() as usize)
            .filter(|_| id.originates_from(self.id))
            .ok_or_else(|| Error::precondition("lookup", "invalid prototype handle"))
    }

    pub(crate) fn table_data(&self, id: TableId) -> Result<&TableData> {
        self.tables
            .get(id.index() as usize)
            .filter(|_| id.originates_from(self.id))
            .ok_or_else(|| Error::precondition("lookup", "invalid table handle"))
    }

    pub(crate) fn global_data(&self, id: GlobalId) -> Result<&GlobalData> {
        self.globals
            .get(id.index() as usize)
            .filter(|_| id.originates_from(self.id))
            .ok_or_else(|| Error::precondition("lookup", "invalid global handle"))
    }

    pub(crate) fn function_data(&self, id: FunctionId) -> Result<&FunctionData> {
        self.functions
            .get(id.index() as usize)
            .filter(|_| id.originates_from(self.id))
            .ok_or_else(|| Error::precondition("lookup", "invalid function handle"))
    }

    pub(crate) fn global_ref(&self, id: GlobalId) -> Ref {
        match self.global_data(id).ok().and_then(|d| d.id.clone()) {
            Some(s) => Ref::Id(s),
            None => Ref::Index(id.index()),
        }
    }

    pub(crate) fn function_ref(&self, id: FunctionId) -> Ref {
        match self.function_data(id).ok().and_then(|d| d.id.clone()) {
            Some(s) => Ref::Id(s),
            None => Ref::Index(id.index()),
        }
    }

    pub(crate) fn mark_function_bound(&mut self, id: FunctionId) -> Result<()> {
        let data = self
            .functions
            .get_mut(id.index() as usize)
            .filter(|_| id.originates_from(self.id))
            .ok_or_else(|| Error::precondition("lookup", "invalid function handle"))?;
        data.bound = true;
        Ok(())
    }

    /// Interns an anonymous prototype, deduplicating by `(params, results)`.
    pub(crate) fn intern_prototype(&mut self, params: &[ValType], results: &[ValType]) -> PrototypeId {
        let mut key: Vec<ValType> = params.to_vec();
        key.extend_from_slice(results);
        let key = (key, params.len());
        if let Some(&id) = self.anon_prototypes.get(&key) {
            return id;
        }
        let index = self.prototypes.len() as u32;
        let data = PrototypeData {
            id: None,
            params: params.iter().map(|&ty| Param::new(ty)).collect(),
            results: results.to_vec(),
        };
        let view = PrototypeView { id: None, params: &data.params, results: &data.results };
        self.backend.add_prototype(PrototypeId::new(self.id, index), &view);
        self.prototypes.push(data);
        let id = PrototypeId::new(self.id, index);
        self.anon_prototypes.insert(key, id);
        id
    }

    /// Declares a named prototype. Unlike anonymous prototypes, named ones
    /// are never deduplicated: the id is the identity.
    pub fn declare_prototype(&mut self, id: impl Into<String>, params: Vec<Param>, results: Vec<ValType>) -> Result<PrototypeId> {
        self.check()?;
        let id = id.into();
        if !self.prototype_ids.insert(id.clone()) {
            return Err(Error::precondition("declare_prototype", format!("id ${id} already defined")));
        }
        let mut seen = HashSet::new();
        for p in &params {
            if let Some(pid) = &p.id {
                if !seen.insert(pid.clone()) {
                    return Err(Error::precondition("declare_prototype", format!("parameter id ${pid} declared more than once")));
                }
            }
        }
        let index = self.prototypes.len() as u32;
        let data = PrototypeData { id: Some(id.clone()), params, results };
        let view = PrototypeView { id: Some(id.as_str()), params: &data.params, results: &data.results };
        self.backend.add_prototype(PrototypeId::new(self.id, index), &view);
        self.prototypes.push(data);
        Ok(PrototypeId::new(self.id, index))
    }

    /// Declares an anonymous prototype, public for callers that only need a
    /// block/loop/if signature rather than a function's.
    pub fn declare_anonymous_prototype(&mut self, params: &[ValType], results: &[ValType]) -> Result<PrototypeId> {
        self.check()?;
        Ok(self.intern_prototype(params, results))
    }

    fn check_exchange(&self, operation: &str, id: &Option<String>, exchange: &Exchange) -> Result<()> {
        if (exchange.import_module.is_some() || exchange.exported) && id.is_none() {
            return Err(Error::precondition(operation, "importing or exporting requires an explicit id"));
        }
        if exchange.import_module.is_some() && self.imports_closed {
            return Err(Error::precondition(
                operation,
                "cannot import after the first non-import object has been added",
            ));
        }
        Ok(())
    }

    fn note_non_import(&mut self, exchange: &Exchange) {
        if exchange.import_module.is_none() {
            self.imports_closed = true;
        }
    }

    /// Declares a memory. `limit` must already be valid when `exchange`
    /// carries an import — an import's bounds are a fact about the external
    /// dependency, not something assigned later — and may otherwise be left
    /// `Limit::unset()` to defer it to a subsequent `set_memory_limit` call.
    pub fn declare_memory(&mut self, id: Option<&str>, limit: Limit, exchange: Exchange) -> Result<MemoryId> {
        self.check()?;
        let id = id.map(str::to_string);
        self.check_exchange("declare_memory", &id, &exchange)?;
        if exchange.import_module.is_some() && !limit.is_valid() {
            return Err(Error::precondition("declare_memory", "an imported memory immediately requires a valid limit"));
        }
        if let Some(s) = &id {
            if !self.memory_ids.insert(s.clone()) {
                return Err(Error::precondition("declare_memory", format!("id ${s} already defined")));
            }
        }
        log::trace!("declare_memory id={id:?} limit={limit:?} import={:?}", exchange.import_module);
        let index = self.memories.len() as u32;
        let data = MemoryData {
            id: id.clone(),
            import_module: exchange.import_module.clone(),
            exported: exchange.exported,
            limit,
        };
        let view = MemoryView {
            id: id.as_deref(),
            import_module: exchange.import_module.as_deref(),
            exported: exchange.exported,
            limit,
        };
        self.backend.add_memory(MemoryId::new(self.id, index), &view);
        self.memories.push(data);
        self.note_non_import(&exchange);
        Ok(MemoryId::new(self.id, index))
    }

    pub fn set_memory_limit(&mut self, memory: MemoryId, limit: Limit) -> Result<()> {
        self.check()?;
        let data = self
            .memories
            .get_mut(memory.index() as usize)
            .filter(|_| memory.originates_from(self.id))
            .ok_or_else(|| Error::precondition("set_memory_limit", "invalid memory handle"))?;
        if data.limit.is_valid() {
            return Err(Error::precondition("set_memory_limit", "memory already has a limit"));
        }
        if !limit.is_valid() {
            return Err(Error::precondition("set_memory_limit", "a memory can only be assigned a valid limit"));
        }
        data.limit = limit;
        self.backend.set_memory_limit(memory, limit);
        Ok(())
    }

    /// Declares a table. `limit` must already be valid when `exchange`
    /// carries an import; see [`Module::declare_memory`].
    pub fn declare_table(&mut self, id: Option<&str>, ref_kind: RefType, limit: Limit, exchange: Exchange) -> Result<TableId> {
        self.check()?;
        let id = id.map(str::to_string);
        self.check_exchange("declare_table", &id, &exchange)?;
        if exchange.import_module.is_some() && !limit.is_valid() {
            return Err(Error::precondition("declare_table", "an imported table immediately requires a valid limit"));
        }
        if let Some(s) = &id {
            if !self.table_ids.insert(s.clone()) {
                return Err(Error::precondition("declare_table", format!("id ${s} already defined")));
            }
        }
        log::trace!("declare_table id={id:?} limit={limit:?} import={:?}", exchange.import_module);
        let index = self.tables.len() as u32;
        let data = TableData {
            id: id.clone(),
            import_module: exchange.import_module.clone(),
            exported: exchange.exported,
            ref_kind,
            limit,
        };
        let view = TableView {
            id: id.as_deref(),
            import_module: exchange.import_module.as_deref(),
            exported: exchange.exported,
            ref_kind,
            limit,
        };
        self.backend.add_table(TableId::new(self.id, index), &view);
        self.tables.push(data);
        self.note_non_import(&exchange);
        Ok(TableId::new(self.id, index))
    }

    pub fn set_table_limit(&mut self, table: TableId, limit: Limit) -> Result<()> {
        self.check()?;
        let data = self
            .tables
            .get_mut(table.index() as usize)
            .filter(|_| table.originates_from(self.id))
            .ok_or_else(|| Error::precondition("set_table_limit", "invalid table handle"))?;
        if data.limit.is_valid() {
            return Err(Error::precondition("set_table_limit", "table already has a limit"));
        }
        if !limit.is_valid() {
            return Err(Error::precondition("set_table_limit", "a table can only be assigned a valid limit"));
        }
        data.limit = limit;
        self.backend.set_table_limit(table, limit);
        Ok(())
    }

    pub fn declare_global(&mut self, id: Option<&str>, val_type: ValType, mutating: bool, exchange: Exchange) -> Result<GlobalId> {
        self.check()?;
        let id = id.map(str::to_string);
        self.check_exchange("declare_global", &id, &exchange)?;
        if let Some(s) = &id {
            if !self.global_ids.insert(s.clone()) {
                return Err(Error::precondition("declare_global", format!("id ${s} already defined")));
            }
        }
        let assigned = exchange.import_module.is_some();
        log::trace!("declare_global id={id:?} ty={val_type:?} mutating={mutating} import={:?}", exchange.import_module);
        let index = self.globals.len() as u32;
        let data = GlobalData {
            id: id.clone(),
            import_module: exchange.import_module.clone(),
            exported: exchange.exported,
            val_type,
            mutating,
            assigned,
        };
        let view = GlobalView {
            id: id.as_deref(),
            import_module: exchange.import_module.as_deref(),
            exported: exchange.exported,
            val_type,
            mutating,
        };
        self.backend.add_global(GlobalId::new(self.id, index), &view);
        self.globals.push(data);
        self.note_non_import(&exchange);
        Ok(GlobalId::new(self.id, index))
    }

    pub fn set_global_value(&mut self, global: GlobalId, value: Value) -> Result<()> {
        self.check()?;
        let data = self
            .globals
            .get_mut(global.index() as usize)
            .filter(|_| global.originates_from(self.id))
            .ok_or_else(|| Error::precondition("set_global_value", "invalid global handle"))?;
        if data.import_module.is_some() {
            return Err(Error::precondition("set_global_value", "cannot assign a value to an imported global"));
        }
        if data.assigned {
            return Err(Error::precondition("set_global_value", "global already has a value assigned"));
        }
        let resolved_ty = self.resolve_value_type(value)?;
        if resolved_ty != data.val_type {
            return Err(Error::type_mismatch("set_global_value", vec![data.val_type], vec![resolved_ty]));
        }
        data.assigned = true;
        self.backend.set_global_value(global, &value);
        Ok(())
    }

    fn resolve_value_type(&self, value: Value) -> Result<ValType> {
        if let Value::Global(g) = value {
            let data = self.global_data(g)?;
            if data.import_module.is_none() || data.mutating {
                return Err(Error::precondition(
                    "value",
                    "a global reference in a constant expression must be an imported immutable global",
                ));
            }
            return Ok(data.val_type);
        }
        Ok(value.ty())
    }

    pub fn declare_function(&mut self, id: Option<&str>, prototype: PrototypeId, exchange: Exchange) -> Result<FunctionId> {
        self.check()?;
        if !prototype.originates_from(self.id) {
            return Err(Error::precondition("declare_function", "prototype does not originate from this module"));
        }
        let id = id.map(str::to_string);
        self.check_exchange("declare_function", &id, &exchange)?;
        if let Some(s) = &id {
            if !self.function_ids.insert(s.clone()) {
                return Err(Error::precondition("declare_function", format!("id ${s} already defined")));
            }
        }
        log::trace!("declare_function id={id:?} prototype={} import={:?}", prototype.index(), exchange.import_module);
        let index = self.functions.len() as u32;
        let data = FunctionData {
            id: id.clone(),
            import_module: exchange.import_module.clone(),
            exported: exchange.exported,
            prototype,
            bound: exchange.import_module.is_some(),
        };
        let view = FunctionView {
            id: id.as_deref(),
            import_module: exchange.import_module.as_deref(),
            exported: exchange.exported,
            prototype,
        };
        self.backend.add_function(FunctionId::new(self.id, index), &view);
        self.functions.push(data);
        self.note_non_import(&exchange);
        Ok(FunctionId::new(self.id, index))
    }

    pub fn open_sink(&mut self, function: FunctionId) -> Result<Sink<'_, 'b>> {
        Sink::open(self, function)
    }

    /// Used only by `close_impl` to synthesize an empty body for an unbound
    /// function once the module is already marked closed.
    fn open_sink_for_close(&mut self, function: FunctionId) -> Result<Sink<'_, 'b>> {
        Sink::open_unchecked(self, function)
    }

    pub fn write_data(&mut self, memory: MemoryId, offset: Value, bytes: Vec<u8>) -> Result<()> {
        self.check()?;
        if !memory.originates_from(self.id) {
            return Err(Error::precondition("write_data", "memory does not originate from this module"));
        }
        let offset_ty = self.resolve_value_type(offset)?;
        if offset_ty != ValType::I32 {
            return Err(Error::type_mismatch("write_data", vec![ValType::I32], vec![offset_ty]));
        }
        self.backend.write_data(memory, &offset, &bytes);
        Ok(())
    }

    pub fn write_elements(&mut self, table: TableId, offset: Value, values: Vec<Value>) -> Result<()> {
        self.check()?;
        if !table.originates_from(self.id) {
            return Err(Error::precondition("write_elements", "table does not originate from this module"));
        }
        let offset_ty = self.resolve_value_type(offset)?;
        if offset_ty != ValType::I32 {
            return Err(Error::type_mismatch("write_elements", vec![ValType::I32], vec![offset_ty]));
        }
        let ref_kind = self.table_data(table)?.ref_kind;
        for &v in &values {
            let item_ty = self.resolve_value_type(v)?;
            if item_ty != ref_kind.val_type() {
                return Err(Error::type_mismatch("write_elements", vec![ref_kind.val_type()], vec![item_ty]));
            }
            if let Value::RefFunc(Some(f)) = v {
                if !f.originates_from(self.id) {
                    return Err(Error::precondition("write_elements", "function does not originate from this module"));
                }
            }
        }
        log::trace!("write_elements table={} count={}", table.index(), values.len());
        self.backend.write_elements(table, &offset, &values);
        Ok(())
    }

    pub fn set_startup(&mut self, function: FunctionId) -> Result<()> {
        self.check()?;
        if !function.originates_from(self.id) {
            return Err(Error::precondition("set_startup", "function does not originate from this module"));
        }
        self.function_data(function)?;
        if self.startup.is_some() {
            return Err(Error::precondition("set_startup", "module already has a startup function"));
        }
        self.startup = Some(function);
        self.backend.set_startup(function);
        Ok(())
    }

    /// Looks up a previously declared prototype by id.
    pub fn find_prototype(&self, id: &str) -> Option<PrototypeId> {
        self.prototypes
            .iter()
            .position(|p| p.id.as_deref() == Some(id))
            .map(|i| PrototypeId::new(self.id, i as u32))
    }

    pub fn find_memory(&self, id: &str) -> Option<MemoryId> {
        self.memories
            .iter()
            .position(|m| m.id.as_deref() == Some(id))
            .map(|i| MemoryId::new(self.id, i as u32))
    }

    pub fn find_table(&self, id: &str) -> Option<TableId> {
        self.tables
            .iter()
            .position(|t| t.id.as_deref() == Some(id))
            .map(|i| TableId::new(self.id, i as u32))
    }

    pub fn find_global(&self, id: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.id.as_deref() == Some(id))
            .map(|i| GlobalId::new(self.id, i as u32))
    }

    pub fn find_function(&self, id: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| f.id.as_deref() == Some(id))
            .map(|i| FunctionId::new(self.id, i as u32))
    }

    fn close_impl(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Some(err) = self.deferred_error.borrow_mut().take() {
            return Err(err);
        }
        self.closed = true;

        for i in 0..self.memories.len() {
            let id = MemoryId::new(self.id, i as u32);
            let data = &self.memories[i];
            if !data.limit.is_valid() {
                return Err(Error::structural("close", format!("memory {} requires a limit to be set", self.ref_for(&data.id, id.index()))));
            }
        }
        for i in 0..self.tables.len() {
            let id = TableId::new(self.id, i as u32);
            let data = &self.tables[i];
            if !data.limit.is_valid() {
                return Err(Error::structural("close", format!("table {} requires a limit to be set", self.ref_for(&data.id, id.index()))));
            }
        }
        for i in 0..self.globals.len() {
            let id = GlobalId::new(self.id, i as u32);
            let data = &self.globals[i];
            if !data.assigned {
                return Err(Error::structural(
                    "close",
                    format!("global {} requires to either be imported or a value assigned to it", self.ref_for(&data.id, id.index())),
                ));
            }
        }

        let unbound: Vec<FunctionId> = self
            .functions
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.bound)
            .map(|(i, _)| FunctionId::new(self.id, i as u32))
            .collect();
        for function in unbound {
            let sink = self.open_sink_for_close(function)?;
            sink.close()?;
        }

        self.backend.close();
        Ok(())
    }

    fn ref_for(&self, id: &Option<String>, index: u32) -> Ref {
        match id {
            Some(s) => Ref::Id(s.clone()),
            None => Ref::Index(index),
        }
    }

    /// Finishes the module: validates every close-time invariant, silently
    /// synthesizes an empty body for any declared-but-never-written
    /// function, and notifies the backend to assemble its output.
    pub fn close(mut self) -> Result<()> {
        self.close_impl()
    }
}

impl<'b> Drop for Module<'b> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.close_impl() {
            log::error!("module dropped without a successful close: {e}");
        }
    }
}
