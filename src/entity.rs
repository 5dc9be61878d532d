//! Densely-numbered entity handles and the primary map that allocates them.
//!
//! The original implementation stores a raw pointer back to the owning
//! module inside every handle and compares pointers to check "did this
//! handle originate from this module". A systems language without that
//! pointer ergonomics instead stamps each handle with the generation of the
//! module that issued it (see Design Notes in `SPEC_FULL.md`): two `Module`s
//! never share a generation, even if one is dropped and its storage reused,
//! so `PrototypeId::module() == this.id()` is a cheap, sound substitute for
//! the pointer comparison.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicU32, Ordering};

/// A trait for types that behave like a dense, zero-based index.
pub trait EntityRef: Copy + Eq {
    fn new(index: usize) -> Self;
    fn index(self) -> usize;
}

/// The generation stamp of a single `Module` instance. Two `Module`s created
/// during the process's lifetime never compare equal, even across drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u32);

impl ModuleId {
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        ModuleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Defines a handle type for one of a module's entity kinds: a `ModuleId`
/// stamp plus a dense index, with the boilerplate to compare/hash/display it
/// and to check whether it originates from a given module.
macro_rules! entity_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            module: $crate::entity::ModuleId,
            index: u32,
        }

        impl $name {
            pub(crate) fn new(module: $crate::entity::ModuleId, index: u32) -> Self {
                $name { module, index }
            }

            /// The dense, zero-based index of this entity within its kind.
            pub fn index(self) -> u32 {
                self.index
            }

            /// Does this handle originate from the module identified by `module`?
            pub fn originates_from(self, module: $crate::entity::ModuleId) -> bool {
                self.module == module
            }
        }

        impl $crate::entity::EntityRef for $name {
            fn new(index: usize) -> Self {
                // Only used by `PrimaryMap`, which never crosses module
                // boundaries internally; the module stamp is attached by
                // the owning `Module` immediately after allocation.
                $name {
                    module: $crate::entity::ModuleId(0),
                    index: index as u32,
                }
            }
            fn index(self) -> usize {
                self.index as usize
            }
        }
    };
}

entity_handle!(
    /// A handle to a function signature (parameters + results).
    PrototypeId
);
entity_handle!(
    /// A handle to a linear memory.
    MemoryId
);
entity_handle!(
    /// A handle to a table.
    TableId
);
entity_handle!(
    /// A handle to a global variable.
    GlobalId
);
entity_handle!(
    /// A handle to a function.
    FunctionId
);

/// A `Vec<V>` indexed by a dense `EntityRef` key, mirroring the producing
/// side of an arena: `push` is the only way to create a new key.
#[derive(Debug, Clone)]
pub struct PrimaryMap<K, V> {
    elems: Vec<V>,
    unused: PhantomData<K>,
}

impl<K, V> PrimaryMap<K, V>
where
    K: EntityRef,
{
    pub fn new() -> Self {
        PrimaryMap {
            elems: Vec::new(),
            unused: PhantomData,
        }
    }

    pub fn push(&mut self, value: V) -> K {
        let key = K::new(self.elems.len());
        self.elems.push(value);
        key
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.elems.get(key.index())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.elems.get_mut(key.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.elems
            .iter()
            .enumerate()
            .map(|(i, v)| (K::new(i), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.elems.iter()
    }
}

impl<K, V> Default for PrimaryMap<K, V>
where
    K: EntityRef,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Index<K> for PrimaryMap<K, V>
where
    K: EntityRef,
{
    type Output = V;
    fn index(&self, key: K) -> &V {
        &self.elems[key.index()]
    }
}

impl<K, V> IndexMut<K> for PrimaryMap<K, V>
where
    K: EntityRef,
{
    fn index_mut(&mut self, key: K) -> &mut V {
        &mut self.elems[key.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_ids_are_never_reused() {
        let a = ModuleId::fresh();
        let b = ModuleId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn primary_map_roundtrips() {
        let mut map: PrimaryMap<FunctionId, &str> = PrimaryMap::new();
        let k0 = map.push("a");
        let k1 = map.push("b");
        assert_eq!(map[k0], "a");
        assert_eq!(map[k1], "b");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn handle_tracks_owning_module() {
        let m1 = ModuleId::fresh();
        let m2 = ModuleId::fresh();
        let handle = FunctionId::new(m1, 0);
        assert!(handle.originates_from(m1));
        assert!(!handle.originates_from(m2));
    }
}
