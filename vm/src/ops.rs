//! The opcode table shared by the builder, the disassembler and the machine.
//!
//! Opcode values and argument widths are a wire contract with the on-chain
//! interpreter that replays requests against proofs. They must never be
//! renumbered.

use std::fmt;

use bitflags::bitflags;

/// Widest literal push: `PUSH_32` reads a full word.
pub const MAX_PUSH_WIDTH: u8 = 32;

macro_rules! define_ops {
    ($($(#[$doc:meta])* $variant:ident = $value:literal => $name:literal,)*) => {
        /// A single opcode, without its inline arguments.
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub enum Op {
            /// `PUSH_0..PUSH_32`: push the next `N` bytes as a big-endian
            /// unsigned integer, where `N` is the opcode value itself.
            Push(u8),
            $($(#[$doc])* $variant,)*
        }

        impl Op {
            /// Every named opcode, in table order. Literal pushes are not
            /// listed.
            pub const NAMED: &'static [Op] = &[$(Op::$variant,)*];

            pub const fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    0..=MAX_PUSH_WIDTH => Some(Op::Push(byte)),
                    $($value => Some(Op::$variant),)*
                    _ => None,
                }
            }

            pub const fn byte(self) -> u8 {
                match self {
                    Op::Push(width) => width,
                    $(Op::$variant => $value,)*
                }
            }

            fn symbol(self) -> &'static str {
                match self {
                    Op::Push(_) => "PUSH",
                    $(Op::$variant => $name,)*
                }
            }
        }
    };
}

define_ops! {
    /// Push a single literal byte as a word.
    PushByte = 33 => "PUSH_BYTE",
    /// Push up to `u16::MAX` literal bytes.
    PushBytes = 34 => "PUSH_BYTES",
    PushInput = 35 => "PUSH_INPUT",
    PushOutput = 36 => "PUSH_OUTPUT",
    PushSlot = 37 => "PUSH_SLOT",
    PushTarget = 38 => "PUSH_TARGET",
    /// Pop an absolute stack index and push a copy of that value.
    PushStack = 39 => "PUSH_STACK",
    StackSize = 40 => "STACK_SIZE",

    SetTarget = 50 => "SET_TARGET",
    SetOutput = 51 => "SET_OUTPUT",
    EvalLoop = 52 => "EVAL_LOOP",
    EvalInline = 53 => "EVAL_INLINE",
    RequireNonzero = 54 => "REQ_NONZERO",
    RequireContract = 55 => "REQ_CONTRACT",
    IsContract = 56 => "IS_CONTRACT",

    ReadSlots = 60 => "READ_SLOTS",
    ReadBytes = 61 => "READ_BYTES",
    ReadArray = 62 => "READ_ARRAY",
    ReadHashedBytes = 63 => "READ_HASHED_BYTES",

    /// Deprecated: equivalent to `PUSH_0 SET_SLOT`.
    SlotZero = 70 => "SLOT_ZERO",
    SlotAdd = 71 => "SLOT_ADD",
    SlotFollow = 72 => "SLOT_FOLLOW",
    SetSlot = 73 => "SET_SLOT",

    Dup = 80 => "DUP",
    Pop = 81 => "POP",
    Swap = 82 => "SWAP",

    Keccak = 90 => "KECCAK",
    Concat = 91 => "CONCAT",
    Slice = 92 => "SLICE",
    Length = 93 => "LENGTH",

    Plus = 100 => "PLUS",
    Times = 101 => "TIMES",
    Divide = 102 => "DIVIDE",
    Mod = 103 => "MOD",
    Subtract = 104 => "SUBTRACT",

    And = 110 => "AND",
    Or = 111 => "OR",
    Xor = 112 => "XOR",
    Not = 113 => "NOT",
    ShiftLeft = 114 => "SHIFT_LEFT",
    ShiftRight = 115 => "SHIFT_RIGHT",

    IsZero = 120 => "IS_ZERO",
    Eq = 121 => "EQ",
    Lt = 122 => "LT",
    Gt = 123 => "GT",
}

impl Op {
    /// Number of inline argument bytes that follow the opcode, if fixed.
    ///
    /// `PUSH_BYTES` carries a variable payload after its two-byte length and
    /// reports only the length prefix here.
    pub const fn arg_width(self) -> usize {
        match self {
            Op::Push(width) => width as usize,
            Op::PushByte
            | Op::PushInput
            | Op::PushOutput
            | Op::SetOutput
            | Op::RequireNonzero
            | Op::ReadSlots
            | Op::ReadArray
            | Op::Concat
            | Op::ShiftLeft
            | Op::ShiftRight => 1,
            Op::PushBytes | Op::EvalLoop => 2,
            Op::Slice => 4,
            _ => 0,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Push(width) => write!(f, "PUSH_{width}"),
            op => f.write_str(op.symbol()),
        }
    }
}

bitflags! {
    /// Loop-continuation policy for `EVAL_LOOP`.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct LoopFlags: u8 {
        /// Stop after the first iteration that exits with code 0.
        const STOP_ON_SUCCESS = 1;
        /// Stop after the first iteration that exits with a non-zero code.
        const STOP_ON_FAILURE = 2;
        /// When stopping, adopt the iteration's target, slot and stack.
        const ACQUIRE_STATE = 4;
    }
}
