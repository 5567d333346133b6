use serde::{Deserialize, Serialize};

// =============================================================================
// OPCODES - one byte each; opcodes >= HAVE_ARGUMENT carry a u16 operand
// =============================================================================

pub const HAVE_ARGUMENT: u8 = 90;

/// How an instruction's operand is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// Plain count or flag word.
    Int,
    /// Index into the constant table.
    Const,
    /// Index into the names table (globals, attributes, dynamic names).
    Name,
    /// Index into the fast-locals table.
    Local,
    /// Index into cellvars followed by freevars.
    Free,
    /// Byte distance from the end of the instruction, forward only.
    RelJump,
    /// Absolute byte offset.
    AbsJump,
    /// Index into the comparison operator table.
    Compare,
}

impl OperandKind {
    pub fn describe(self) -> &'static str {
        match self {
            OperandKind::None => "no",
            OperandKind::Int => "integer",
            OperandKind::Const => "constant",
            OperandKind::Name => "name",
            OperandKind::Local => "local",
            OperandKind::Free => "cell or free variable",
            OperandKind::RelJump | OperandKind::AbsJump => "label",
            OperandKind::Compare => "comparison",
        }
    }

    pub fn is_jump(self) -> bool {
        matches!(self, OperandKind::RelJump | OperandKind::AbsJump)
    }
}

macro_rules! opcodes {
    ($($variant:ident = $value:literal, $text:literal, $kind:ident;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant = $value,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub fn from_u8(byte: u8) -> Option<Opcode> {
                match byte {
                    $($value => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $text,)*
                }
            }

            pub fn operand_kind(self) -> OperandKind {
                match self {
                    $(Opcode::$variant => OperandKind::$kind,)*
                }
            }
        }
    };
}

opcodes! {
    PopTop = 1, "POP_TOP", None;
    RotTwo = 2, "ROT_TWO", None;
    RotThree = 3, "ROT_THREE", None;
    DupTop = 4, "DUP_TOP", None;
    DupTopTwo = 5, "DUP_TOP_TWO", None;
    Nop = 9, "NOP", None;
    UnaryPositive = 10, "UNARY_POSITIVE", None;
    UnaryNegative = 11, "UNARY_NEGATIVE", None;
    UnaryNot = 12, "UNARY_NOT", None;
    UnaryInvert = 15, "UNARY_INVERT", None;
    BinaryMatrixMultiply = 16, "BINARY_MATRIX_MULTIPLY", None;
    InplaceMatrixMultiply = 17, "INPLACE_MATRIX_MULTIPLY", None;
    BinaryPower = 19, "BINARY_POWER", None;
    BinaryMultiply = 20, "BINARY_MULTIPLY", None;
    BinaryModulo = 22, "BINARY_MODULO", None;
    BinaryAdd = 23, "BINARY_ADD", None;
    BinarySubtract = 24, "BINARY_SUBTRACT", None;
    BinarySubscr = 25, "BINARY_SUBSCR", None;
    BinaryFloorDivide = 26, "BINARY_FLOOR_DIVIDE", None;
    BinaryTrueDivide = 27, "BINARY_TRUE_DIVIDE", None;
    InplaceFloorDivide = 28, "INPLACE_FLOOR_DIVIDE", None;
    InplaceTrueDivide = 29, "INPLACE_TRUE_DIVIDE", None;
    InplaceAdd = 55, "INPLACE_ADD", None;
    InplaceSubtract = 56, "INPLACE_SUBTRACT", None;
    InplaceMultiply = 57, "INPLACE_MULTIPLY", None;
    InplaceModulo = 59, "INPLACE_MODULO", None;
    StoreSubscr = 60, "STORE_SUBSCR", None;
    DeleteSubscr = 61, "DELETE_SUBSCR", None;
    BinaryLshift = 62, "BINARY_LSHIFT", None;
    BinaryRshift = 63, "BINARY_RSHIFT", None;
    BinaryAnd = 64, "BINARY_AND", None;
    BinaryXor = 65, "BINARY_XOR", None;
    BinaryOr = 66, "BINARY_OR", None;
    InplacePower = 67, "INPLACE_POWER", None;
    GetIter = 68, "GET_ITER", None;
    InplaceLshift = 75, "INPLACE_LSHIFT", None;
    InplaceRshift = 76, "INPLACE_RSHIFT", None;
    InplaceAnd = 77, "INPLACE_AND", None;
    InplaceXor = 78, "INPLACE_XOR", None;
    InplaceOr = 79, "INPLACE_OR", None;
    BreakLoop = 80, "BREAK_LOOP", None;
    WithCleanupStart = 81, "WITH_CLEANUP_START", None;
    WithCleanupFinish = 82, "WITH_CLEANUP_FINISH", None;
    ReturnValue = 83, "RETURN_VALUE", None;
    YieldValue = 86, "YIELD_VALUE", None;
    PopBlock = 87, "POP_BLOCK", None;
    EndFinally = 88, "END_FINALLY", None;
    PopExcept = 89, "POP_EXCEPT", None;
    StoreName = 90, "STORE_NAME", Name;
    DeleteName = 91, "DELETE_NAME", Name;
    UnpackSequence = 92, "UNPACK_SEQUENCE", Int;
    ForIter = 93, "FOR_ITER", RelJump;
    UnpackEx = 94, "UNPACK_EX", Int;
    StoreAttr = 95, "STORE_ATTR", Name;
    DeleteAttr = 96, "DELETE_ATTR", Name;
    StoreGlobal = 97, "STORE_GLOBAL", Name;
    DeleteGlobal = 98, "DELETE_GLOBAL", Name;
    LoadConst = 100, "LOAD_CONST", Const;
    LoadName = 101, "LOAD_NAME", Name;
    BuildTuple = 102, "BUILD_TUPLE", Int;
    BuildList = 103, "BUILD_LIST", Int;
    BuildSet = 104, "BUILD_SET", Int;
    BuildMap = 105, "BUILD_MAP", Int;
    LoadAttr = 106, "LOAD_ATTR", Name;
    CompareOp = 107, "COMPARE_OP", Compare;
    JumpForward = 110, "JUMP_FORWARD", RelJump;
    JumpIfFalseOrPop = 111, "JUMP_IF_FALSE_OR_POP", AbsJump;
    JumpIfTrueOrPop = 112, "JUMP_IF_TRUE_OR_POP", AbsJump;
    JumpAbsolute = 113, "JUMP_ABSOLUTE", AbsJump;
    PopJumpIfFalse = 114, "POP_JUMP_IF_FALSE", AbsJump;
    PopJumpIfTrue = 115, "POP_JUMP_IF_TRUE", AbsJump;
    LoadGlobal = 116, "LOAD_GLOBAL", Name;
    ContinueLoop = 119, "CONTINUE_LOOP", AbsJump;
    SetupLoop = 120, "SETUP_LOOP", RelJump;
    SetupExcept = 121, "SETUP_EXCEPT", RelJump;
    SetupFinally = 122, "SETUP_FINALLY", RelJump;
    LoadFast = 124, "LOAD_FAST", Local;
    StoreFast = 125, "STORE_FAST", Local;
    DeleteFast = 126, "DELETE_FAST", Local;
    RaiseVarargs = 130, "RAISE_VARARGS", Int;
    CallFunction = 131, "CALL_FUNCTION", Int;
    MakeFunction = 132, "MAKE_FUNCTION", Int;
    BuildSlice = 133, "BUILD_SLICE", Int;
    LoadClosure = 135, "LOAD_CLOSURE", Free;
    LoadDeref = 136, "LOAD_DEREF", Free;
    StoreDeref = 137, "STORE_DEREF", Free;
    DeleteDeref = 138, "DELETE_DEREF", Free;
    CallFunctionKw = 141, "CALL_FUNCTION_KW", Int;
    CallFunctionEx = 142, "CALL_FUNCTION_EX", Int;
    SetupWith = 143, "SETUP_WITH", RelJump;
    ExtendedArg = 144, "EXTENDED_ARG", Int;
    ListAppend = 145, "LIST_APPEND", Int;
    SetAdd = 146, "SET_ADD", Int;
    MapAdd = 147, "MAP_ADD", Int;
}

impl Opcode {
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    pub fn is_jump(self) -> bool {
        self.operand_kind().is_jump()
    }

    /// Whether control never continues with the next instruction.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Opcode::ReturnValue
                | Opcode::RaiseVarargs
                | Opcode::BreakLoop
                | Opcode::ContinueLoop
                | Opcode::JumpForward
                | Opcode::JumpAbsolute
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// MAKE_FUNCTION flag bits
pub const MAKE_DEFAULTS: u32 = 0x01;
pub const MAKE_KWDEFAULTS: u32 = 0x02;
pub const MAKE_ANNOTATIONS: u32 = 0x04;
pub const MAKE_CLOSURE: u32 = 0x08;

// CALL_FUNCTION_EX flag bit
pub const CALL_HAS_KWARGS: u32 = 0x01;

/// Operand of COMPARE_OP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    ExceptionMatch,
}

impl CompareOp {
    const TABLE: [CompareOp; 11] = [
        CompareOp::Lt,
        CompareOp::Le,
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Gt,
        CompareOp::Ge,
        CompareOp::In,
        CompareOp::NotIn,
        CompareOp::Is,
        CompareOp::IsNot,
        CompareOp::ExceptionMatch,
    ];

    pub fn index(self) -> u32 {
        Self::TABLE.iter().position(|op| *op == self).unwrap_or(0) as u32
    }

    pub fn from_index(index: u32) -> Option<CompareOp> {
        Self::TABLE.get(index as usize).copied()
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Is => "is",
            CompareOp::IsNot => "is not",
            CompareOp::ExceptionMatch => "exception match",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(*op as u8), Some(*op));
            assert_eq!(op.has_arg(), op.operand_kind() != OperandKind::None, "{}", op);
        }
        assert_eq!(Opcode::from_u8(0), None);
    }

    #[test]
    fn test_compare_table() {
        for index in 0..11 {
            assert_eq!(CompareOp::from_index(index).map(CompareOp::index), Some(index));
        }
        assert_eq!(CompareOp::from_index(11), None);
    }
}
