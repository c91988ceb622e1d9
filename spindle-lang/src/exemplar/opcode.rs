//! The instruction set.
//!
//! An instruction is one 64-bit word. The low 16 bits select the [`Opcode`]
//! and the high 48 bits carry an optional inline operand, such as a string
//! table index. Opcodes that need a full word operand are followed by that
//! many operand words.

use std::fmt::{self, Display};

/// The number of bits used by the opcode of an instruction word.
pub const OPCODE_BITS: u32 = 16;
/// The largest value that fits in an instruction's inline operand.
pub const MAX_INLINE: u64 = (1 << (64 - OPCODE_BITS)) - 1;

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $code:literal, $operands:literal, $mnemonic:literal;)+) => {
        /// A bytecode operation.
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[repr(u16)]
        pub enum Opcode {
            $($(#[$doc])* $name = $code,)+
        }

        impl Opcode {
            /// Every opcode, in numeric order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)+];

            /// Returns the number of operand words following this opcode's
            /// instruction word.
            #[must_use]
            pub const fn operand_words(self) -> usize {
                match self {
                    $(Opcode::$name => $operands,)+
                }
            }

            /// Returns the mnemonic used when printing this opcode.
            #[must_use]
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)+
                }
            }
        }

        impl TryFrom<u16> for Opcode {
            type Error = u16;

            fn try_from(value: u16) -> Result<Self, Self::Error> {
                match value {
                    $($code => Ok(Opcode::$name),)+
                    other => Err(other),
                }
            }
        }
    };
}

opcodes! {
    /// Does nothing.
    Nop = 0, 0, "nop";
    /// Pushes nil.
    PushNil = 1, 0, "push.nil";
    /// Pushes the integer in the following word.
    PushConstant = 2, 1, "push.int";
    /// Pushes the real whose bits are in the following word.
    PushFloatConstant = 3, 1, "push.real";
    /// Pushes the string at the inline string index.
    PushString = 4, 0, "push.str";
    /// Discards the top of the stack.
    Pop = 5, 0, "pop";
    /// Duplicates the top of the stack.
    Dup = 6, 0, "dup";
    /// Pops a variable key and pushes the fiber's instance variable.
    GetSelfVar = 7, 0, "get.self";
    /// Pops a variable key and pushes the machine's shared variable.
    GetSharedVar = 8, 0, "get.shared";
    /// Pops a variable key and pushes the global variable.
    GetGlobalVar = 9, 0, "get.global";
    /// Pops a key and a value, storing a copy of the value into the fiber's
    /// instance variable.
    SetSelfVar = 10, 0, "set.self";
    /// Pops a key and a value, storing a copy of the value into the
    /// machine's shared variable.
    SetSharedVar = 11, 0, "set.shared";
    /// Pops a key and a value, storing a copy of the value into a global
    /// variable, declaring it if needed.
    SetGlobalVar = 12, 0, "set.global";
    /// Pushes the local frame entry at the inline index.
    GetFrameVar = 13, 0, "get.frame";
    /// Begins an argument list.
    ParamsStart = 14, 0, "params.start";
    /// Collects an argument list into one array.
    ParamsEnd = 15, 0, "params.end";
    /// Pops an argument array and calls the function named by the inline
    /// string index.
    CallFunction = 16, 0, "call";
    /// Moves the top of the stack onto the receiver stack.
    DotChain = 17, 0, "dot";
    /// Pops an argument array and calls the function named by the inline
    /// string index on the most recent receiver.
    DynamicCallLibFunction = 18, 0, "call.dyn";
    /// Pops two numbers and skips the following goto if they are equal.
    IfEq = 19, 0, "if.eq";
    /// Pops a number and skips the following goto if it is zero.
    IfEq0 = 20, 0, "if.eq0";
    /// Pops a number and skips the following goto if it is not zero.
    IfNotEq0 = 21, 0, "if.ne0";
    /// Pops a number and skips the following goto if it is negative.
    IfLt0 = 22, 0, "if.lt0";
    /// Pops a number and skips the following goto if it is positive.
    IfGt0 = 23, 0, "if.gt0";
    /// Pops a number and skips the following goto if it is not positive.
    IfLte0 = 24, 0, "if.lte0";
    /// Pops a number and skips the following goto if it is not negative.
    IfGte0 = 25, 0, "if.gte0";
    /// Adds two values.
    OpAdd = 26, 0, "add";
    /// Subtracts two numbers.
    OpSub = 27, 0, "sub";
    /// Multiplies two numbers.
    OpMul = 28, 0, "mul";
    /// Divides two numbers.
    OpDiv = 29, 0, "div";
    /// Computes the remainder of dividing two numbers.
    OpModulus = 30, 0, "mod";
    /// Negates a number.
    OpNegate = 31, 0, "neg";
    /// Pops a state key, cancels every continuation of the fiber, and jumps
    /// to the state's entry address.
    GotoState = 32, 0, "goto.state";
    /// Jumps to the address in the following word.
    GotoAddr = 33, 1, "goto";
    /// Pops a generator and runs the following body once per element. The
    /// following word is the address after the body.
    ForEach = 34, 1, "foreach";
    /// Pops a condition and registers a continuation resuming at the body
    /// address in the following word.
    On = 35, 1, "on";
    /// Pops a condition, registers a continuation resuming after this
    /// instruction, and suspends.
    Wait = 36, 0, "wait";
    /// Ends the current state.
    StateEnd = 37, 0, "end";
    /// Ends the current body.
    SubStateEnd = 38, 0, "end.sub";
    /// Suspends the fiber until the host resumes it.
    StateSuspend = 39, 0, "suspend";
    /// Pops a machine name and an argument array, and launches a new fiber.
    LaunchMachine = 40, 0, "launch";
}

impl Opcode {
    /// Returns this opcode encoded as an instruction word with `inline` as
    /// its inline operand.
    ///
    /// # Panics
    ///
    /// Panics if `inline` exceeds [`MAX_INLINE`].
    #[must_use]
    pub const fn encode(self, inline: u64) -> u64 {
        assert!(inline <= MAX_INLINE, "inline operand too large");
        (inline << OPCODE_BITS) | self as u64
    }

    /// Returns true if this opcode carries an inline string table index.
    #[must_use]
    pub const fn has_string_operand(self) -> bool {
        matches!(
            self,
            Opcode::PushString | Opcode::CallFunction | Opcode::DynamicCallLibFunction
        )
    }

    /// Returns true if this opcode's operand word is a bytecode address.
    #[must_use]
    pub const fn has_address_operand(self) -> bool {
        matches!(self, Opcode::GotoAddr | Opcode::ForEach | Opcode::On)
    }

    /// Returns true if this opcode is one of the conditional tests that are
    /// always followed by a [`Opcode::GotoAddr`].
    #[must_use]
    pub const fn is_conditional(self) -> bool {
        matches!(
            self,
            Opcode::IfEq
                | Opcode::IfEq0
                | Opcode::IfNotEq0
                | Opcode::IfLt0
                | Opcode::IfGt0
                | Opcode::IfLte0
                | Opcode::IfGte0
        )
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Splits an instruction word into its raw opcode and inline operand.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn split(word: u64) -> (u16, u64) {
    (word as u16, word >> OPCODE_BITS)
}

/// Returns the opcode of `word` and the width in words of the instruction it
/// begins.
///
/// # Errors
///
/// Returns the raw opcode if it is not a valid [`Opcode`].
pub fn instruction_width(word: u64) -> Result<(Opcode, usize), u16> {
    let (code, _) = split(word);
    let opcode = Opcode::try_from(code)?;
    Ok((opcode, 1 + opcode.operand_words()))
}
