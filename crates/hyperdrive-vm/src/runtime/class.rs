// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Classes and method dispatch tables.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::Runtime;
use crate::backend::{FuncId, NativeFunction};
use crate::error::RunResult;
use crate::iseq::Iseq;
use crate::symbol::{SymbolId, SymbolTable};
use crate::value::Value;

/// Index of a class in the [`ClassTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

impl ClassId {
    /// Creates a class id from its table index.
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// The table index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A method implemented in Rust.
pub type BuiltinFn = fn(&mut Runtime, Value, &[Value]) -> RunResult<Value>;

/// How an iseq method is currently executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodState {
    /// Run by the interpreter
    Interpreted,
    /// Compile on the next call
    Stub,
    /// Run as native code
    Compiled(FuncId),
}

/// A method defined from an instruction sequence.
#[derive(Debug)]
pub struct IseqMethod {
    /// Defining class
    pub owner: ClassId,
    /// Body
    pub iseq: Arc<Iseq>,
    state: RwLock<MethodState>,
}

impl IseqMethod {
    /// Creates a method in the given state.
    pub fn new(owner: ClassId, iseq: Arc<Iseq>, state: MethodState) -> Self {
        Self {
            owner,
            iseq,
            state: RwLock::new(state),
        }
    }

    /// Current state.
    pub fn state(&self) -> MethodState {
        *self.state.read()
    }

    /// Swaps the state.
    pub fn set_state(&self, state: MethodState) {
        *self.state.write() = state;
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.iseq.name
    }
}

/// A dispatch table entry.
#[derive(Clone)]
pub enum MethodEntry {
    /// Rust implementation
    Builtin(BuiltinFn),
    /// Bytecode implementation, possibly compiled
    Iseq(Arc<IseqMethod>),
}

impl fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodEntry::Builtin(_) => write!(f, "Builtin"),
            MethodEntry::Iseq(method) => write!(f, "Iseq({}, {:?})", method.name(), method.state()),
        }
    }
}

/// What the compile hook wants done with a newly defined method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave it to the interpreter
    Interpret,
    /// Compile on first call
    Stub,
    /// Compile now
    Compile,
}

/// Receives method definitions and compiles methods on request.
pub trait CompileHook: Send + Sync {
    /// Called whenever a method is (re)defined.
    fn method_added(&self, owner: &str, iseq: &Iseq) -> Disposition;

    /// Compiles a method body; `None` leaves it interpreted.
    fn compile(&self, iseq: &Iseq, symbols: &SymbolTable) -> Option<NativeFunction>;
}

/// A class.
#[derive(Debug)]
pub struct Class {
    /// Name
    pub name: Arc<str>,
    /// Superclass
    pub superclass: Option<ClassId>,
    /// Method table
    pub methods: FxHashMap<SymbolId, MethodEntry>,
    /// The class object
    pub object: Value,
}

/// All classes.
#[derive(Debug, Default)]
pub struct ClassTable {
    classes: Vec<Class>,
    by_name: FxHashMap<Arc<str>, ClassId>,
}

impl ClassTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a class. Its object is filled in by the runtime.
    pub fn define(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        let id = ClassId::new(self.classes.len());
        let name: Arc<str> = Arc::from(name);
        self.by_name.insert(Arc::clone(&name), id);
        self.classes.push(Class {
            name,
            superclass,
            methods: FxHashMap::default(),
            object: Value::NIL,
        });
        id
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class is defined.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Looks up a class by name.
    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    /// Class by id.
    pub fn get(&self, id: ClassId) -> &Class {
        &self.classes[id.index()]
    }

    /// Class by id, mutably.
    pub fn get_mut(&mut self, id: ClassId) -> &mut Class {
        &mut self.classes[id.index()]
    }

    /// Finds a method along the superclass chain.
    pub fn find_method(&self, mut class: ClassId, mid: SymbolId) -> Option<MethodEntry> {
        loop {
            let c = self.get(class);
            if let Some(entry) = c.methods.get(&mid) {
                return Some(entry.clone());
            }
            class = c.superclass?;
        }
    }

    /// Whether `class` is `ancestor` or inherits from it.
    pub fn is_subclass(&self, mut class: ClassId, ancestor: ClassId) -> bool {
        loop {
            if class == ancestor {
                return true;
            }
            match self.get(class).superclass {
                Some(superclass) => class = superclass,
                None => return false,
            }
        }
    }

    /// Every iseq method in the table.
    pub fn iseq_methods(&self) -> Vec<Arc<IseqMethod>> {
        self.classes
            .iter()
            .flat_map(|class| class.methods.values())
            .filter_map(|entry| match entry {
                MethodEntry::Iseq(method) => Some(Arc::clone(method)),
                MethodEntry::Builtin(_) => None,
            })
            .collect()
    }

    /// Every class object.
    pub fn objects(&self) -> impl Iterator<Item = Value> + '_ {
        self.classes.iter().map(|class| class.object)
    }
}

/// Ids of the classes the runtime itself refers to.
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    /// `Object`
    pub object: ClassId,
    /// `Class`
    pub class: ClassId,
    /// `Integer`
    pub integer: ClassId,
    /// `String`
    pub string: ClassId,
    /// `Symbol`
    pub symbol: ClassId,
    /// `Array`
    pub array: ClassId,
    /// `Hash`
    pub hash: ClassId,
    /// `NilClass`
    pub nil: ClassId,
    /// `TrueClass`
    pub true_class: ClassId,
    /// `FalseClass`
    pub false_class: ClassId,
    /// `Proc`
    pub proc_class: ClassId,
    /// `Data`, the class of wrapped native data
    pub data: ClassId,
    /// `Exception`
    pub exception: ClassId,
    /// `StandardError`
    pub standard_error: ClassId,
    /// `RuntimeError`
    pub runtime_error: ClassId,
    /// `ArgumentError`
    pub argument_error: ClassId,
    /// `TypeError`
    pub type_error: ClassId,
    /// `NameError`
    pub name_error: ClassId,
    /// `NoMethodError`
    pub no_method_error: ClassId,
    /// `ZeroDivisionError`
    pub zero_division_error: ClassId,
    /// `IndexError`
    pub index_error: ClassId,
    /// `LocalJumpError`
    pub local_jump_error: ClassId,
    /// `SystemStackError`
    pub stack_error: ClassId,
    /// `fatal`
    pub fatal: ClassId,
}

impl CoreClasses {
    /// Defines the core hierarchy.
    pub fn define(table: &mut ClassTable) -> Self {
        let object = table.define("Object", None);
        let exception = table.define("Exception", Some(object));
        let standard_error = table.define("StandardError", Some(exception));
        let argument_error = table.define("ArgumentError", Some(standard_error));
        let name_error = table.define("NameError", Some(standard_error));
        Self {
            object,
            class: table.define("Class", Some(object)),
            integer: table.define("Integer", Some(object)),
            string: table.define("String", Some(object)),
            symbol: table.define("Symbol", Some(object)),
            array: table.define("Array", Some(object)),
            hash: table.define("Hash", Some(object)),
            nil: table.define("NilClass", Some(object)),
            true_class: table.define("TrueClass", Some(object)),
            false_class: table.define("FalseClass", Some(object)),
            proc_class: table.define("Proc", Some(object)),
            data: table.define("Data", Some(object)),
            exception,
            standard_error,
            runtime_error: table.define("RuntimeError", Some(standard_error)),
            argument_error,
            type_error: table.define("TypeError", Some(standard_error)),
            name_error,
            no_method_error: table.define("NoMethodError", Some(name_error)),
            zero_division_error: table.define("ZeroDivisionError", Some(standard_error)),
            index_error: table.define("IndexError", Some(standard_error)),
            local_jump_error: table.define("LocalJumpError", Some(standard_error)),
            stack_error: table.define("SystemStackError", Some(exception)),
            fatal: table.define("fatal", Some(exception)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_lookup_walks_superclasses() {
        let mut table = ClassTable::new();
        let core = CoreClasses::define(&mut table);
        let symbols = SymbolTable::new();
        let mid = symbols.intern("m");
        fn m(_: &mut Runtime, recv: Value, _: &[Value]) -> RunResult<Value> {
            Ok(recv)
        }
        table
            .get_mut(core.object)
            .methods
            .insert(mid, MethodEntry::Builtin(m));

        assert!(table.find_method(core.runtime_error, mid).is_some());
        assert!(table.find_method(core.runtime_error, symbols.intern("n")).is_none());
        assert!(table.is_subclass(core.no_method_error, core.standard_error));
        assert!(!table.is_subclass(core.stack_error, core.standard_error));
    }

    #[test]
    fn test_state_swap_is_visible_through_shared_entry() {
        let iseq = Arc::new(Iseq {
            name: "f".into(),
            kind: crate::iseq::IseqKind::Method,
            params: Default::default(),
            locals: vec![],
            code: vec![],
            catch_table: vec![],
            blocks: vec![],
        });
        let method = Arc::new(IseqMethod::new(ClassId::new(0), iseq, MethodState::Stub));
        let shared = Arc::clone(&method);
        method.set_state(MethodState::Interpreted);
        assert_eq!(shared.state(), MethodState::Interpreted);
    }
}
