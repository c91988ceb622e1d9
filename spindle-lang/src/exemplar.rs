//! The compiled program image of one machine type.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::exemplar::opcode::{instruction_width, split, Opcode};
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;

pub mod assembler;
pub mod opcode;

/// An immutable compiled description of one machine type.
///
/// Exemplars are produced by a compiler backend, or by
/// [`ExemplarBuilder`](assembler::ExemplarBuilder), and are never modified
/// once built. The first state is the machine's entry state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exemplar {
    name: Symbol,
    bytecode: Vec<u64>,
    states: Vec<StateEntry>,
    locals: Vec<VariableDescriptor>,
    shared: Vec<VariableDescriptor>,
    strings: StringTable,
}

impl Exemplar {
    /// Returns an exemplar assembled from its parts.
    ///
    /// The result is not validated; call [`validate`](Self::validate) before
    /// executing an exemplar from an untrusted source.
    #[must_use]
    pub fn from_parts(
        name: impl Into<Symbol>,
        bytecode: Vec<u64>,
        states: Vec<StateEntry>,
        locals: Vec<VariableDescriptor>,
        shared: Vec<VariableDescriptor>,
        strings: StringTable,
    ) -> Self {
        Self {
            name: name.into(),
            bytecode,
            states,
            locals,
            shared,
            strings,
        }
    }

    /// Returns the machine type's name.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns the instruction words.
    #[must_use]
    pub fn bytecode(&self) -> &[u64] {
        &self.bytecode
    }

    /// Returns the state table.
    #[must_use]
    pub fn states(&self) -> &[StateEntry] {
        &self.states
    }

    /// Returns the instance variable descriptors.
    #[must_use]
    pub fn locals(&self) -> &[VariableDescriptor] {
        &self.locals
    }

    /// Returns the shared variable descriptors.
    #[must_use]
    pub fn shared(&self) -> &[VariableDescriptor] {
        &self.shared
    }

    /// Returns the string table.
    #[must_use]
    pub const fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// Returns the string at `index` in the string table.
    #[must_use]
    pub fn string(&self, index: u32) -> Option<&str> {
        self.strings.get(index)
    }

    /// Returns the index of the instance variable named `name`.
    #[must_use]
    pub fn var_index(&self, name: &str) -> Option<usize> {
        self.find_variable(&self.locals, name)
    }

    /// Returns the index of the shared variable named `name`.
    #[must_use]
    pub fn shared_var_index(&self, name: &str) -> Option<usize> {
        self.find_variable(&self.shared, name)
    }

    fn find_variable(&self, variables: &[VariableDescriptor], name: &str) -> Option<usize> {
        variables
            .iter()
            .position(|variable| self.strings.get(variable.name) == Some(name))
    }

    /// Returns the index of the state named `name`.
    #[must_use]
    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.states
            .iter()
            .position(|state| self.strings.get(state.name) == Some(name))
    }

    /// Returns the entry address of the state at `index`.
    #[must_use]
    pub fn state_address(&self, index: usize) -> Option<usize> {
        self.states.get(index).map(|state| state.address)
    }

    /// Returns the entry address of the machine's first state.
    #[must_use]
    pub fn entry_address(&self) -> Option<usize> {
        self.state_address(0)
    }

    /// Returns the name and declared type of the variable `descriptor`.
    pub fn describe(
        &self,
        descriptor: &VariableDescriptor,
    ) -> Result<(&str, VariableType), ExemplarError> {
        let name = self
            .strings
            .get(descriptor.name)
            .ok_or(ExemplarError::InvalidString(descriptor.name))?;
        let ty = self
            .strings
            .get(descriptor.ty)
            .ok_or(ExemplarError::InvalidString(descriptor.ty))?;
        let ty = VariableType::from_name(ty).ok_or_else(|| ExemplarError::UnknownType {
            variable: Symbol::from(name),
            ty: Symbol::from(ty),
        })?;
        Ok((name, ty))
    }

    /// Checks the structural soundness of this image.
    ///
    /// Every instruction is decoded in order, checking that its opcode is
    /// known, that its operand words are present, and that every string
    /// index and jump target is in range. The state and variable tables are
    /// checked as well.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ExemplarError> {
        let len = self.bytecode.len();
        let mut pc = 0;
        while pc < len {
            let word = self.bytecode[pc];
            let (opcode, width) =
                instruction_width(word).map_err(|opcode| ExemplarError::InvalidOpcode { pc, opcode })?;
            if pc + width > len {
                return Err(ExemplarError::TruncatedInstruction { pc, opcode });
            }
            let (_, inline) = split(word);
            if opcode.has_string_operand() {
                let index = u32::try_from(inline).map_err(|_| ExemplarError::InvalidString(u32::MAX))?;
                if self.strings.get(index).is_none() {
                    return Err(ExemplarError::InvalidString(index));
                }
            }
            if opcode.has_address_operand() {
                let target = usize::try_from(self.bytecode[pc + 1]).unwrap_or(usize::MAX);
                if target >= len {
                    return Err(ExemplarError::AddressOutOfRange { pc, target });
                }
            }
            if opcode.is_conditional() {
                let follows_goto = self
                    .bytecode
                    .get(pc + 1)
                    .and_then(|word| Opcode::try_from(split(*word).0).ok())
                    == Some(Opcode::GotoAddr);
                if !follows_goto {
                    return Err(ExemplarError::TruncatedInstruction { pc, opcode });
                }
            }
            pc += width;
        }

        for (index, state) in self.states.iter().enumerate() {
            let name = self
                .strings
                .get(state.name)
                .ok_or(ExemplarError::InvalidString(state.name))?;
            if state.address >= len {
                return Err(ExemplarError::StateOutOfRange {
                    state: Symbol::from(name),
                    address: state.address,
                });
            }
            if self.state_index(name) != Some(index) {
                return Err(ExemplarError::DuplicateState(Symbol::from(name)));
            }
        }

        for descriptor in self.locals.iter().chain(&self.shared) {
            self.describe(descriptor)?;
        }

        Ok(())
    }
}

/// An entry in an [`Exemplar`]'s state table.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// The string table index of the state's name.
    pub name: u32,
    /// The absolute bytecode address of the state's entry point.
    pub address: usize,
}

/// A variable declared by an [`Exemplar`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    /// The string table index of the variable's name.
    pub name: u32,
    /// The string table index of the variable's declared type.
    pub ty: u32,
}

/// The declared type of a variable.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VariableType {
    /// `int`, initialized to `0`.
    Int,
    /// `real`, initialized to `0.0`.
    Real,
    /// `string`, initialized to `""`.
    String,
    /// `array`, initialized to `[]`.
    Array,
    /// `fiber`, initialized to nil.
    Fiber,
    /// `any`, initialized to nil.
    Any,
}

impl VariableType {
    /// Returns the type named `name`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int" => Some(Self::Int),
            "real" => Some(Self::Real),
            "string" => Some(Self::String),
            "array" => Some(Self::Array),
            "fiber" => Some(Self::Fiber),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    /// Returns the value a newly declared variable of this type holds.
    #[must_use]
    pub fn initial_value(self) -> Value {
        match self {
            VariableType::Int => Value::Int(0),
            VariableType::Real => Value::Real(0.),
            VariableType::String => Value::String(Symbol::empty().clone()),
            VariableType::Array => Value::Array(Vec::new()),
            VariableType::Fiber | VariableType::Any => Value::Nil,
        }
    }
}

/// A table of strings stored in one contiguous blob of NUL-terminated
/// strings.
///
/// Strings are referenced by index; the index maps to the byte offset of the
/// string within the blob.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StringTable {
    blob: Vec<u8>,
    offsets: Vec<u32>,
}

impl StringTable {
    /// Returns an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            blob: Vec::new(),
            offsets: Vec::new(),
        }
    }

    /// Returns the index of `value`, adding it to the table if needed.
    ///
    /// # Panics
    ///
    /// Panics if `value` contains a NUL byte, or if the table grows past
    /// `u32::MAX` bytes.
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(index) = self.find(value) {
            return index;
        }
        assert!(!value.contains('\0'), "strings may not contain NUL");
        let offset = u32::try_from(self.blob.len()).expect("string table too large");
        let index = u32::try_from(self.offsets.len()).expect("string table too large");
        self.blob.extend_from_slice(value.as_bytes());
        self.blob.push(0);
        self.offsets.push(offset);
        index
    }

    /// Returns the index of `value`, if present.
    #[must_use]
    pub fn find(&self, value: &str) -> Option<u32> {
        (0..self.offsets.len())
            .find(|index| self.get_usize(*index) == Some(value))
            .and_then(|index| u32::try_from(index).ok())
    }

    /// Returns the string at `index`.
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&str> {
        self.get_usize(usize::try_from(index).ok()?)
    }

    fn get_usize(&self, index: usize) -> Option<&str> {
        let start = usize::try_from(*self.offsets.get(index)?).ok()?;
        let bytes = self.blob.get(start..)?;
        let end = bytes.iter().position(|b| *b == 0)?;
        std::str::from_utf8(&bytes[..end]).ok()
    }

    /// Returns the number of strings in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns true if the table contains no strings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// A structural problem in an [`Exemplar`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExemplarError {
    /// A jump or body address points outside of the bytecode.
    AddressOutOfRange {
        /// The address of the instruction.
        pc: usize,
        /// The out-of-range target.
        target: usize,
    },
    /// A state's entry address points outside of the bytecode.
    StateOutOfRange {
        /// The state's name.
        state: Symbol,
        /// The out-of-range address.
        address: usize,
    },
    /// An instruction is missing operand words, or a conditional is not
    /// followed by a goto.
    TruncatedInstruction {
        /// The address of the instruction.
        pc: usize,
        /// The instruction's opcode.
        opcode: Opcode,
    },
    /// An instruction word does not contain a known opcode.
    InvalidOpcode {
        /// The address of the instruction.
        pc: usize,
        /// The raw opcode.
        opcode: u16,
    },
    /// A string table index is out of range or not valid UTF-8.
    InvalidString(u32),
    /// A variable was declared with an unknown type name.
    UnknownType {
        /// The variable's name.
        variable: Symbol,
        /// The unknown type name.
        ty: Symbol,
    },
    /// Two states share a name.
    DuplicateState(Symbol),
}

impl Display for ExemplarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExemplarError::AddressOutOfRange { pc, target } => {
                write!(f, "instruction at {pc} targets out-of-range address {target}")
            }
            ExemplarError::StateOutOfRange { state, address } => {
                write!(f, "state {state} starts at out-of-range address {address}")
            }
            ExemplarError::TruncatedInstruction { pc, opcode } => {
                write!(f, "instruction {opcode} at {pc} is incomplete")
            }
            ExemplarError::InvalidOpcode { pc, opcode } => {
                write!(f, "invalid opcode {opcode} at {pc}")
            }
            ExemplarError::InvalidString(index) => write!(f, "invalid string index {index}"),
            ExemplarError::UnknownType { variable, ty } => {
                write!(f, "variable {variable} has unknown type {ty}")
            }
            ExemplarError::DuplicateState(state) => write!(f, "state {state} is declared twice"),
        }
    }
}

impl std::error::Error for ExemplarError {}

impl crate::ErrorKind for ExemplarError {
    fn kind(&self) -> &'static str {
        match self {
            ExemplarError::AddressOutOfRange { .. } => "address_out_of_range",
            ExemplarError::StateOutOfRange { .. } => "state_out_of_range",
            ExemplarError::TruncatedInstruction { .. } => "truncated_instruction",
            ExemplarError::InvalidOpcode { .. } => "invalid_opcode",
            ExemplarError::InvalidString(_) => "invalid_string",
            ExemplarError::UnknownType { .. } => "unknown_type",
            ExemplarError::DuplicateState(_) => "duplicate_state",
        }
    }
}
