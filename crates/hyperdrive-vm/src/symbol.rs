// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Symbol interning shared between the runtime and compiler threads.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// An interned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

impl SymbolId {
    /// Creates a symbol id from its table index.
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// Returns the table index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Default)]
struct Interner {
    names: Vec<Arc<str>>,
    ids: FxHashMap<Arc<str>, SymbolId>,
}

/// A thread-safe symbol table.
///
/// Compilations running on worker threads intern method and variable
/// names through a shared reference.
#[derive(Default)]
pub struct SymbolTable {
    inner: RwLock<Interner>,
}

impl SymbolTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `name`, returning its id.
    pub fn intern(&self, name: &str) -> SymbolId {
        if let Some(id) = self.inner.read().ids.get(name) {
            return *id;
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.ids.get(name) {
            return *id;
        }
        let id = SymbolId::new(inner.names.len());
        let name: Arc<str> = Arc::from(name);
        inner.names.push(name.clone());
        inner.ids.insert(name, id);
        id
    }

    /// Looks up a name without interning it.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.inner.read().ids.get(name).copied()
    }

    /// Returns the name of an interned symbol.
    pub fn name(&self, id: SymbolId) -> Arc<str> {
        self.inner
            .read()
            .names
            .get(id.index())
            .cloned()
            .unwrap_or_else(|| Arc::from("<unknown>"))
    }

    /// Number of interned symbols.
    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTable").field("len", &self.len()).finish()
    }
}
