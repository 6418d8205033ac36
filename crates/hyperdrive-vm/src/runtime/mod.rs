// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The host runtime.
//!
//! [`Runtime`] owns every piece of mutable VM state: the heap, memory
//! blocks, installed native code, classes and the thread state. Methods
//! are dispatched by name through [`Runtime::invoke`]; each iseq method is
//! interpreted, compiled on its first call, or already compiled, as
//! recorded in its dispatch entry.

mod builtins;
mod class;
mod heap;
mod interp;
mod memory;
mod natives;
mod object;
mod thread;

pub use class::{
    BuiltinFn, Class, ClassId, ClassTable, CompileHook, CoreClasses, Disposition, IseqMethod,
    MethodEntry, MethodState,
};
pub use heap::{
    DataHandle, FreeFn, GcStats, HashKey, HashTable, Heap, MarkFn, ObjectKind, free_block,
    mark_conservative,
};
pub use memory::Memory;
pub use thread::{Block, ControlFrame, IseqBlock, TagRecord, ThreadState};

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{CodeArena, FuncId, NativeFunction, Ptr, Signature, machine};
use crate::error::{Jump, Result, RunResult, RuntimeError, State};
use crate::iseq::{Iseq, Program};
use crate::symbol::{SymbolId, SymbolTable};
use crate::value::Value;
use interp::IseqInfo;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum nesting of native and interpreted frames
    pub max_depth: usize,
    /// Allocations between collections
    pub gc_threshold: usize,
    /// Collect at every safepoint
    pub gc_stress: bool,
    /// Value stack size limit, in words
    pub stack_words: usize,
    /// Also print program output to stdout
    pub echo_output: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_depth: 200,
            gc_threshold: 10_000,
            gc_stress: false,
            stack_words: 1 << 20,
            echo_output: false,
        }
    }
}

/// The VM.
pub struct Runtime {
    /// Interned names, shared with compiler threads
    pub symbols: Arc<SymbolTable>,
    /// Objects
    pub heap: Heap,
    /// Memory blocks, including the value stack
    pub memory: Memory,
    /// Installed native code
    pub code: CodeArena,
    /// Classes and method tables
    pub classes: ClassTable,
    /// Core class ids
    pub core: CoreClasses,
    /// Thread state
    pub thread: ThreadState,
    /// Configuration
    pub config: RuntimeConfig,
    constants: FxHashMap<SymbolId, Value>,
    hook: Option<Arc<dyn CompileHook>>,
    iseq_cache: FxHashMap<usize, Arc<IseqInfo>>,
    output: String,
    main: Value,
}

impl Runtime {
    /// Creates a runtime with the core classes and methods defined.
    pub fn new(config: RuntimeConfig) -> Self {
        let mut classes = ClassTable::new();
        let core = CoreClasses::define(&mut classes);
        let mut rt = Self {
            symbols: Arc::new(SymbolTable::new()),
            heap: Heap::new(),
            memory: Memory::new(config.stack_words),
            code: CodeArena::new(),
            classes,
            core,
            thread: ThreadState::new(),
            config,
            constants: FxHashMap::default(),
            hook: None,
            iseq_cache: FxHashMap::default(),
            output: String::new(),
            main: Value::NIL,
        };
        for index in 0..rt.classes.len() {
            rt.alloc_class_object(ClassId::new(index));
        }
        rt.main = rt.heap.alloc(core.object, ObjectKind::Instance);
        builtins::define(&mut rt);
        rt
    }

    fn alloc_class_object(&mut self, id: ClassId) {
        let object = self.heap.alloc(self.core.class, ObjectKind::Class(id));
        self.classes.get_mut(id).object = object;
    }

    /// Installs the hook consulted on every method definition.
    pub fn set_compile_hook(&mut self, hook: Arc<dyn CompileHook>) {
        self.hook = Some(hook);
    }

    /// The top-level `self`.
    pub fn main_object(&self) -> Value {
        self.main
    }

    /// Interns a name.
    pub fn intern(&self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    /// Everything the program has printed.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Takes the printed output.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn write_output(&mut self, text: &str) {
        if self.config.echo_output {
            print!("{}", text);
        }
        self.output.push_str(text);
    }

    // ========================================================================
    // Classes and methods
    // ========================================================================

    /// Defines (or reopens) a class under `Object`.
    pub fn define_class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        if let Some(id) = self.classes.lookup(name) {
            return id;
        }
        let id = self
            .classes
            .define(name, Some(superclass.unwrap_or(self.core.object)));
        self.alloc_class_object(id);
        id
    }

    /// Defines a builtin method.
    pub fn define_builtin(&mut self, class: ClassId, name: &str, func: BuiltinFn) {
        let mid = self.intern(name);
        self.classes
            .get_mut(class)
            .methods
            .insert(mid, MethodEntry::Builtin(func));
    }

    /// Defines a method from an instruction sequence, consulting the compile
    /// hook for its initial state.
    pub fn define_method(&mut self, owner: &str, iseq: Iseq) -> Result<Arc<IseqMethod>> {
        iseq.validate()?;
        let class = self.define_class(owner, None);
        let disposition = match &self.hook {
            Some(hook) => hook.method_added(owner, &iseq),
            None => Disposition::Interpret,
        };
        let state = match disposition {
            Disposition::Interpret => MethodState::Interpreted,
            Disposition::Stub | Disposition::Compile => MethodState::Stub,
        };
        let mid = self.intern(&iseq.name);
        let method = Arc::new(IseqMethod::new(class, Arc::new(iseq), state));
        self.classes
            .get_mut(class)
            .methods
            .insert(mid, MethodEntry::Iseq(Arc::clone(&method)));
        debug!(method = %method.name(), owner, ?disposition, "method defined");
        if disposition == Disposition::Compile {
            self.compile_method(&method);
        }
        Ok(method)
    }

    /// Compiles a method through the hook and swaps its dispatch entry.
    pub fn compile_method(&mut self, method: &Arc<IseqMethod>) -> MethodState {
        let unit = match &self.hook {
            Some(hook) => hook.compile(&method.iseq, &self.symbols),
            None => None,
        };
        match unit {
            Some(unit) => self.install_compiled(method, unit),
            None => {
                method.set_state(MethodState::Interpreted);
                MethodState::Interpreted
            }
        }
    }

    /// Installs native code for `method` and points its entry at it.
    pub fn install_compiled(&mut self, method: &IseqMethod, unit: NativeFunction) -> MethodState {
        let state = match self.code.install(unit) {
            Ok(id) => {
                info!(method = %method.name(), ?id, "installed native code");
                MethodState::Compiled(id)
            }
            Err(err) => {
                warn!(method = %method.name(), %err, "rejected native code");
                MethodState::Interpreted
            }
        };
        method.set_state(state);
        state
    }

    /// Iseq methods still waiting for their first call.
    pub fn pending_methods(&self) -> Vec<Arc<IseqMethod>> {
        self.classes
            .iseq_methods()
            .into_iter()
            .filter(|method| method.state() == MethodState::Stub)
            .collect()
    }

    /// Looks up an iseq method by owner and name.
    pub fn find_iseq_method(&self, owner: &str, name: &str) -> Option<Arc<IseqMethod>> {
        let class = self.classes.lookup(owner)?;
        let mid = self.symbols.lookup(name)?;
        match self.classes.get(class).methods.get(&mid)? {
            MethodEntry::Iseq(method) => Some(Arc::clone(method)),
            MethodEntry::Builtin(_) => None,
        }
    }

    /// Layout, interned call names and child blocks of `iseq`, shared
    /// across activations.
    pub(crate) fn iseq_info(&mut self, iseq: &Arc<Iseq>) -> Arc<IseqInfo> {
        let key = Arc::as_ptr(iseq) as usize;
        if let Some(info) = self.iseq_cache.get(&key) {
            return Arc::clone(info);
        }
        let info = Arc::new(IseqInfo::new(iseq, &self.symbols));
        self.iseq_cache.insert(key, Arc::clone(&info));
        info
    }

    /// Looks up a constant.
    pub fn constant(&mut self, name: SymbolId) -> RunResult<Value> {
        if let Some(value) = self.constants.get(&name) {
            return Ok(*value);
        }
        let text = self.symbols.name(name);
        match self.classes.lookup(&text) {
            Some(class) => Ok(self.classes.get(class).object),
            None => Err(self.raise(
                self.core.name_error,
                format!("uninitialized constant {}", text),
            )),
        }
    }

    /// Defines a constant.
    pub fn set_constant(&mut self, name: &str, value: Value) {
        let id = self.intern(name);
        self.constants.insert(id, value);
    }

    // ========================================================================
    // Programs
    // ========================================================================

    /// Defines a program's methods.
    pub fn load(&mut self, program: &Program) -> Result<()> {
        for def in &program.methods {
            self.define_method(&def.owner, def.iseq.clone())?;
        }
        Ok(())
    }

    /// Loads a program and runs its top-level sequence.
    pub fn run(&mut self, program: &Program) -> Result<Value> {
        self.load(program)?;
        self.run_main(&program.main)
    }

    /// Runs a top-level sequence with `main` as self.
    pub fn run_main(&mut self, iseq: &Iseq) -> Result<Value> {
        iseq.validate()?;
        let iseq = Arc::new(iseq.clone());
        let main = self.main;
        let result = interp::run_top(self, &iseq, main);
        self.finish(result)
    }

    /// Invokes a method from the host.
    pub fn call_method(&mut self, recv: Value, name: &str, args: &[Value]) -> Result<Value> {
        let mid = self.intern(name);
        let result = self.invoke(recv, mid, args, None);
        self.finish(result)
    }

    fn finish(&mut self, result: RunResult<Value>) -> Result<Value> {
        match result {
            Ok(value) => Ok(value),
            Err(jump) => Err(self.jump_error(jump)),
        }
    }

    /// Converts an escaped jump into a boundary error.
    pub fn jump_error(&mut self, jump: Jump) -> RuntimeError {
        match jump.state {
            State::Raise | State::Fatal => {
                let exc = self.thread.errinfo;
                let class = self
                    .heap
                    .get(exc)
                    .map(|object| self.classes.get(object.class).name.to_string())
                    .unwrap_or_else(|| "Exception".to_string());
                RuntimeError::Uncaught {
                    class,
                    message: self.exception_message(exc),
                }
            }
            state => RuntimeError::LocalJump(state.name()),
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Invokes `mid` on `recv`.
    pub fn invoke(
        &mut self,
        recv: Value,
        mid: SymbolId,
        args: &[Value],
        block: Option<Block>,
    ) -> RunResult<Value> {
        let class = self.class_of(recv);
        let Some(entry) = self.classes.find_method(class, mid) else {
            return Err(self.no_method_error(recv, mid));
        };
        self.thread.frames.push(ControlFrame { recv, mid, block });
        let result = match entry {
            MethodEntry::Builtin(func) => func(self, recv, args),
            MethodEntry::Iseq(method) => self.call_iseq(&method, recv, args),
        };
        self.thread.frames.pop();
        result
    }

    fn call_iseq(&mut self, method: &Arc<IseqMethod>, recv: Value, args: &[Value]) -> RunResult<Value> {
        let mut state = method.state();
        if state == MethodState::Stub {
            debug!(method = %method.name(), "compiling stub on first call");
            state = self.compile_method(method);
        }
        let result = match state {
            MethodState::Compiled(id) => self.call_native(id, recv, args),
            MethodState::Interpreted | MethodState::Stub => {
                interp::run_method(self, &method.iseq, recv, args)
            }
        };
        match result {
            Err(jump) if jump.state == State::Return => Ok(self.take_jump_value()),
            other => other,
        }
    }

    /// Calls installed native code with the method calling convention.
    pub fn call_native(&mut self, id: FuncId, recv: Value, args: &[Value]) -> RunResult<Value> {
        let Some(signature) = self.code.get(id).map(|entry| entry.body.signature) else {
            return Err(self.fatal(format!("no native function {:?}", id)));
        };
        match signature {
            Signature::Fixed(n) => {
                if args.len() != n {
                    return Err(self.argument_error(args.len(), n, Some(n)));
                }
                let mut words = Vec::with_capacity(n + 1);
                words.push(recv.raw());
                words.extend(args.iter().map(|arg| arg.raw()));
                machine::execute(self, id, &words).map(Value::from_raw)
            }
            Signature::Variadic => {
                let base = self.thread.sp;
                if !self.memory.reserve_stack(base + args.len()) {
                    return Err(self.stack_overflow());
                }
                for (slot, arg) in self.memory.stack_mut()[base..].iter_mut().zip(args) {
                    *slot = arg.raw();
                }
                self.thread.sp = base + args.len();
                let argv = Ptr::new(0, base as u32);
                let result =
                    machine::execute(self, id, &[args.len() as u64, argv.raw(), recv.raw()]);
                self.thread.sp = base;
                result.map(Value::from_raw)
            }
            Signature::Internal(_) => Err(self.fatal("internal function called as a method")),
        }
    }

    /// Runs a block with the given arguments, handling `next` and `redo`.
    pub fn yield_values(&mut self, block: &Block, args: &[Value]) -> RunResult<Value> {
        let packed = match args {
            [] => Value::UNDEF,
            [single] => *single,
            many => self.ary_new(many.to_vec()),
        };
        self.pinned(packed, |rt| {
            loop {
                let result = match block {
                    Block::Native { body, scope } => {
                        machine::execute(rt, *body, &[packed.raw(), scope.raw()]).map(Value::from_raw)
                    }
                    Block::Iseq(block) => interp::run_block(rt, block, packed),
                    Block::Proc(proc) => {
                        let inner = rt.proc_block(*proc)?;
                        return rt.yield_values(&inner, args);
                    }
                };
                match result {
                    Err(jump) if jump.state == State::Next => return Ok(rt.take_jump_value()),
                    Err(jump) if jump.state == State::Redo => continue,
                    other => return other,
                }
            }
        })
    }

    /// Yields to the block of the innermost method activation.
    pub fn yield_current(&mut self, args: &[Value]) -> RunResult<Value> {
        match self.thread.current_block().cloned() {
            Some(block) => self.yield_values(&block, args),
            None => Err(self.raise(self.core.local_jump_error, "no block given (yield)")),
        }
    }

    /// The current method's block, or `LocalJumpError`.
    pub fn block_given(&mut self) -> RunResult<Block> {
        match self.thread.current_block().cloned() {
            Some(block) => Ok(block),
            None => Err(self.raise(self.core.local_jump_error, "no block given (yield)")),
        }
    }

    /// Runs an iterate trampoline with `block` pending for the call it makes.
    pub fn iterate(&mut self, trampoline: FuncId, iter_arg: Ptr, block: Block) -> RunResult<Value> {
        self.thread.iter_blocks.push(block);
        let result = machine::execute(self, trampoline, &[iter_arg.raw()]);
        self.thread.iter_blocks.pop();
        result.map(Value::from_raw)
    }

    /// Destructures a yielded value into `count` positional parameters,
    /// followed by a rest array when `rest`.
    pub fn splat_params(&mut self, value: Value, count: usize, rest: bool) -> Vec<Value> {
        let items: Vec<Value> = if value.is_undef() {
            Vec::new()
        } else if count > 1 || rest {
            match self.heap.array(value) {
                Some(items) => items.to_vec(),
                None => vec![value],
            }
        } else {
            vec![value]
        };
        let mut params: Vec<Value> = (0..count)
            .map(|i| items.get(i).copied().unwrap_or(Value::NIL))
            .collect();
        if rest {
            let tail = items.get(count..).map(<[Value]>::to_vec).unwrap_or_default();
            params.push(self.ary_new(tail));
        }
        params
    }

    // ========================================================================
    // Non-local exits
    // ========================================================================

    /// Raises a new exception of `class`.
    pub fn raise(&mut self, class: ClassId, message: impl Into<String>) -> Jump {
        let exc = self.exception_new(class, message.into());
        self.raise_value(exc)
    }

    /// Raises an exception object.
    pub fn raise_value(&mut self, exc: Value) -> Jump {
        self.thread.errinfo = exc;
        Jump::new(State::Raise)
    }

    /// Raises whatever `raise value` means: exceptions as-is, classes
    /// instantiated, anything else as a `RuntimeError` message.
    pub fn raise_object(&mut self, value: Value) -> Jump {
        match self.heap.get(value).map(|object| &object.kind) {
            Some(ObjectKind::Exception { .. }) => self.raise_value(value),
            Some(ObjectKind::Class(class)) => {
                let class = *class;
                let name = self.classes.get(class).name.to_string();
                self.raise(class, name)
            }
            _ => {
                let message = self.to_s(value);
                self.raise(self.core.runtime_error, message)
            }
        }
    }

    /// Starts a non-local exit carrying `value`.
    pub fn throw_state(&mut self, state: State, value: Value) -> Jump {
        match state {
            State::Raise => self.raise_object(value),
            _ => {
                self.thread.jump_value = value;
                Jump::new(state)
            }
        }
    }

    /// Payload of the exit in flight for `state`.
    pub fn payload(&self, state: State) -> Value {
        match state {
            State::Raise | State::Fatal => self.thread.errinfo,
            _ => self.thread.jump_value,
        }
    }

    /// Restores a payload saved by an ensure handler and continues the exit.
    pub fn rethrow(&mut self, state: Value, payload: Value) -> Jump {
        let code = state.as_fixnum().unwrap_or(0);
        match State::from_code(code as u32) {
            Some(state @ (State::Raise | State::Fatal)) => {
                self.thread.errinfo = payload;
                Jump::new(state)
            }
            Some(state) => {
                self.thread.jump_value = payload;
                Jump::new(state)
            }
            None => self.fatal(format!("rethrow with state {}", code)),
        }
    }

    /// Takes the payload of a break, next or return.
    pub fn take_jump_value(&mut self) -> Value {
        std::mem::replace(&mut self.thread.jump_value, Value::NIL)
    }

    /// Raises an unrecoverable error.
    pub fn fatal(&mut self, message: impl Into<String>) -> Jump {
        let exc = self.exception_new(self.core.fatal, message.into());
        self.thread.errinfo = exc;
        Jump::new(State::Fatal)
    }

    /// Raises `SystemStackError`.
    pub fn stack_overflow(&mut self) -> Jump {
        self.raise(self.core.stack_error, "stack level too deep")
    }

    /// Raises `ArgumentError` for a call with `given` arguments.
    pub fn argument_error(&mut self, given: usize, min: usize, max: Option<usize>) -> Jump {
        let expected = match max {
            Some(max) if max == min => min.to_string(),
            Some(max) => format!("{}..{}", min, max),
            None => format!("{}+", min),
        };
        self.raise(
            self.core.argument_error,
            format!("wrong number of arguments (given {}, expected {})", given, expected),
        )
    }

    fn no_method_error(&mut self, recv: Value, mid: SymbolId) -> Jump {
        let name = self.symbols.name(mid);
        let class = self.class_of(recv);
        let class_name = self.classes.get(class).name.clone();
        self.raise(
            self.core.no_method_error,
            format!("undefined method '{}' for an instance of {}", name, class_name),
        )
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Collects when the allocation threshold is reached or in stress mode.
    pub fn safepoint(&mut self) {
        if self.config.gc_stress || self.heap.allocated_since_gc() >= self.config.gc_threshold {
            self.collect_garbage();
        }
    }

    /// Runs a full collection and returns the number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<Value> = self.classes.objects().collect();
        roots.extend(self.constants.values().copied());
        roots.push(self.main);
        self.thread.trace(&mut roots);
        let sp = self.thread.sp.min(self.memory.stack().len());
        roots.extend(self.memory.stack()[..sp].iter().map(|&word| Value::from_raw(word)));
        let freed = self.heap.collect(roots, &mut self.memory);
        debug!(freed, live = self.heap.live(), "collected garbage");
        freed
    }

    /// Runs `f` with `value` pinned against collection.
    pub fn pinned<T>(&mut self, value: Value, f: impl FnOnce(&mut Self) -> T) -> T {
        let mark = self.thread.pins.len();
        self.thread.pins.push(value);
        let result = f(self);
        self.thread.pins.truncate(mark);
        result
    }
}
