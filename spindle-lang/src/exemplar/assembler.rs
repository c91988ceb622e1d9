//! A label-based assembler for [`Exemplar`]s.
//!
//! ```rust
//! use spindle_lang::exemplar::assembler::ExemplarBuilder;
//!
//! let mut timer = ExemplarBuilder::new("timer");
//! let body = timer.new_label();
//! timer.state("start");
//! timer.call_with("time.after", |b| b.push_real(2.0));
//! timer.on(body);
//! timer.end_state();
//! timer.label(body);
//! timer.call_with("io.print", |b| b.push_string("fired"));
//! timer.end_sub();
//! let exemplar = timer.finish();
//! assert!(exemplar.validate().is_ok());
//! ```

use crate::exemplar::opcode::Opcode;
use crate::exemplar::{Exemplar, StateEntry, StringTable, VariableDescriptor};
use crate::runtime::symbol::Symbol;

/// A jump target whose address may not be known yet.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Label(usize);

/// Builds an [`Exemplar`] one instruction at a time.
#[derive(Debug)]
pub struct ExemplarBuilder {
    name: Symbol,
    words: Vec<u64>,
    strings: StringTable,
    states: Vec<StateEntry>,
    locals: Vec<VariableDescriptor>,
    shared: Vec<VariableDescriptor>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl ExemplarBuilder {
    /// Returns a builder for a machine type named `name`.
    #[must_use]
    pub fn new(name: impl Into<Symbol>) -> Self {
        Self {
            name: name.into(),
            words: Vec::new(),
            strings: StringTable::new(),
            states: Vec::new(),
            locals: Vec::new(),
            shared: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Returns a new, unbound label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len());
        self.labels.push(None);
        label
    }

    /// Binds `label` to the address of the next instruction.
    ///
    /// # Panics
    ///
    /// Panics if `label` was already bound.
    pub fn label(&mut self, label: Label) {
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label bound twice");
        *slot = Some(self.words.len());
    }

    /// Returns the address of the next instruction.
    #[must_use]
    pub fn address(&self) -> usize {
        self.words.len()
    }

    /// Starts a state named `name` at the next instruction and returns its
    /// index. The first state is the machine's entry state.
    pub fn state(&mut self, name: &str) -> usize {
        let name = self.strings.intern(name);
        self.states.push(StateEntry {
            name,
            address: self.words.len(),
        });
        self.states.len() - 1
    }

    /// Declares an instance variable and returns its index.
    pub fn declare_local(&mut self, name: &str, ty: &str) -> usize {
        let descriptor = self.descriptor(name, ty);
        self.locals.push(descriptor);
        self.locals.len() - 1
    }

    /// Declares a shared variable and returns its index.
    pub fn declare_shared(&mut self, name: &str, ty: &str) -> usize {
        let descriptor = self.descriptor(name, ty);
        self.shared.push(descriptor);
        self.shared.len() - 1
    }

    fn descriptor(&mut self, name: &str, ty: &str) -> VariableDescriptor {
        VariableDescriptor {
            name: self.strings.intern(name),
            ty: self.strings.intern(ty),
        }
    }

    /// Returns the string table index of `value`, interning it if needed.
    pub fn string(&mut self, value: &str) -> u32 {
        self.strings.intern(value)
    }

    /// Emits `opcode` without an operand.
    pub fn op(&mut self, opcode: Opcode) {
        self.op_inline(opcode, 0);
    }

    /// Emits `opcode` with an inline operand.
    pub fn op_inline(&mut self, opcode: Opcode, inline: u64) {
        self.words.push(opcode.encode(inline));
    }

    /// Emits a raw word. Used for operands, and for deliberately malformed
    /// images.
    pub fn word(&mut self, word: u64) {
        self.words.push(word);
    }

    fn op_string(&mut self, opcode: Opcode, value: &str) {
        let index = self.strings.intern(value);
        self.op_inline(opcode, u64::from(index));
    }

    fn op_label(&mut self, opcode: Opcode, target: Label) {
        self.op(opcode);
        self.fixups.push((self.words.len(), target));
        self.words.push(0);
    }

    /// Pushes nil.
    pub fn push_nil(&mut self) {
        self.op(Opcode::PushNil);
    }

    /// Pushes an integer.
    pub fn push_int(&mut self, value: i64) {
        self.op(Opcode::PushConstant);
        self.words.push(u64::from_ne_bytes(value.to_ne_bytes()));
    }

    /// Pushes a real.
    pub fn push_real(&mut self, value: f64) {
        self.op(Opcode::PushFloatConstant);
        self.words.push(value.to_bits());
    }

    /// Pushes a string.
    pub fn push_string(&mut self, value: &str) {
        self.op_string(Opcode::PushString, value);
    }

    /// Pushes the instance variable `name`.
    pub fn get_self(&mut self, name: &str) {
        self.push_string(name);
        self.op(Opcode::GetSelfVar);
    }

    /// Pops the top of the stack into the instance variable `name`.
    pub fn set_self(&mut self, name: &str) {
        self.push_string(name);
        self.op(Opcode::SetSelfVar);
    }

    /// Pushes the shared variable `name`.
    pub fn get_shared(&mut self, name: &str) {
        self.push_string(name);
        self.op(Opcode::GetSharedVar);
    }

    /// Pops the top of the stack into the shared variable `name`.
    pub fn set_shared(&mut self, name: &str) {
        self.push_string(name);
        self.op(Opcode::SetSharedVar);
    }

    /// Pushes the global variable `name`.
    pub fn get_global(&mut self, name: &str) {
        self.push_string(name);
        self.op(Opcode::GetGlobalVar);
    }

    /// Pops the top of the stack into the global variable `name`.
    pub fn set_global(&mut self, name: &str) {
        self.push_string(name);
        self.op(Opcode::SetGlobalVar);
    }

    /// Pushes entry `index` of the current local frame.
    pub fn get_frame(&mut self, index: u32) {
        self.op_inline(Opcode::GetFrameVar, u64::from(index));
    }

    /// Emits an argument list built by `args`.
    pub fn params(&mut self, args: impl FnOnce(&mut Self)) {
        self.op(Opcode::ParamsStart);
        args(self);
        self.op(Opcode::ParamsEnd);
    }

    /// Calls `name` with the argument array on top of the stack.
    pub fn call(&mut self, name: &str) {
        self.op_string(Opcode::CallFunction, name);
    }

    /// Calls `name` with the arguments emitted by `args`.
    pub fn call_with(&mut self, name: &str, args: impl FnOnce(&mut Self)) {
        self.params(args);
        self.call(name);
    }

    /// Moves the top of the stack onto the receiver stack.
    pub fn dot(&mut self) {
        self.op(Opcode::DotChain);
    }

    /// Calls `name` on the most recent receiver with the argument array on
    /// top of the stack.
    pub fn call_dynamic(&mut self, name: &str) {
        self.op_string(Opcode::DynamicCallLibFunction, name);
    }

    /// Emits a conditional test whose false branch jumps to `otherwise`.
    ///
    /// # Panics
    ///
    /// Panics if `test` is not a conditional opcode.
    pub fn branch(&mut self, test: Opcode, otherwise: Label) {
        assert!(test.is_conditional(), "{test} is not a conditional");
        self.op(test);
        self.jump(otherwise);
    }

    /// Jumps to `target`.
    pub fn jump(&mut self, target: Label) {
        self.op_label(Opcode::GotoAddr, target);
    }

    /// Begins a loop over the generator on top of the stack. The body follows
    /// and must end with [`end_sub`](Self::end_sub); `end` must be bound
    /// immediately after it.
    pub fn for_each(&mut self, end: Label) {
        self.op_label(Opcode::ForEach, end);
    }

    /// Registers the condition on top of the stack to run `body`.
    pub fn on(&mut self, body: Label) {
        self.op_label(Opcode::On, body);
    }

    /// Suspends until the condition on top of the stack is met.
    pub fn wait(&mut self) {
        self.op(Opcode::Wait);
    }

    /// Transitions to the state `name`.
    pub fn goto_state(&mut self, name: &str) {
        self.push_string(name);
        self.op(Opcode::GotoState);
    }

    /// Launches the machine `name` with the arguments emitted by `args`.
    pub fn launch(&mut self, name: &str, args: impl FnOnce(&mut Self)) {
        self.params(args);
        self.push_string(name);
        self.op(Opcode::LaunchMachine);
    }

    /// Ends the current state.
    pub fn end_state(&mut self) {
        self.op(Opcode::StateEnd);
    }

    /// Ends the current body.
    pub fn end_sub(&mut self) {
        self.op(Opcode::SubStateEnd);
    }

    /// Suspends until the host resumes the fiber.
    pub fn suspend(&mut self) {
        self.op(Opcode::StateSuspend);
    }

    /// Returns the finished exemplar.
    ///
    /// # Panics
    ///
    /// Panics if a referenced label was never bound.
    #[must_use]
    pub fn finish(mut self) -> Exemplar {
        for (at, label) in std::mem::take(&mut self.fixups) {
            let address = self.labels[label.0].expect("label never bound");
            self.words[at] = address as u64;
        }
        Exemplar::from_parts(
            self.name,
            self.words,
            self.states,
            self.locals,
            self.shared,
            self.strings,
        )
    }
}
