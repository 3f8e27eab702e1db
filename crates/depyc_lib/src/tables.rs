use std::fmt;

use serde::{Deserialize, Serialize};

/// Bytecode format version, ordered so gates read `version >= Version::new(3, 6)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn at_least(self, major: u8, minor: u8) -> bool {
        self >= Version::new(major, minor)
    }

    pub fn before(self, major: u8, minor: u8) -> bool {
        self < Version::new(major, minor)
    }

    /// 3.6 switched to fixed two-byte instructions.
    pub fn wordcode(self) -> bool {
        self.at_least(3, 6)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Version-independent instruction names. One variant per action the engine
/// distinguishes; numeric renumberings across versions collapse onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // no-ops and interpreter plumbing
    StopCode,
    Nop,
    Cache,
    Resume,
    ExtendedArg,
    GenStart,
    ReturnGenerator,
    MakeCell,
    CopyFreeVars,

    // stack shuffling
    PopTop,
    RotTwo,
    RotThree,
    RotFour,
    RotN,
    DupTop,
    DupTopTwo,
    DupTopX,
    Swap,
    Copy,
    PushNull,

    // unary / binary / compare
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryConvert,
    UnaryInvert,
    BinaryAdd,
    BinarySubtract,
    BinaryMultiply,
    BinaryDivide,
    BinaryTrueDivide,
    BinaryFloorDivide,
    BinaryModulo,
    BinaryPower,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,
    BinaryMatrixMultiply,
    InplaceAdd,
    InplaceSubtract,
    InplaceMultiply,
    InplaceDivide,
    InplaceTrueDivide,
    InplaceFloorDivide,
    InplaceModulo,
    InplacePower,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceXor,
    InplaceOr,
    InplaceMatrixMultiply,
    BinaryOp,
    CompareOp,
    IsOp,
    ContainsOp,

    // subscripts and slices
    BinarySubscr,
    BuildSlice,
    BinarySlice,
    StoreSliceOp,
    SlicePlus0,
    SlicePlus1,
    SlicePlus2,
    SlicePlus3,
    StoreSlicePlus0,
    StoreSlicePlus1,
    StoreSlicePlus2,
    StoreSlicePlus3,
    DeleteSlicePlus0,
    DeleteSlicePlus1,
    DeleteSlicePlus2,
    DeleteSlicePlus3,

    // container construction
    BuildTuple,
    BuildList,
    BuildSet,
    BuildMap,
    BuildConstKeyMap,
    BuildString,
    BuildTupleUnpack,
    BuildListUnpack,
    BuildSetUnpack,
    BuildMapUnpack,
    BuildMapUnpackWithCall,
    BuildTupleUnpackWithCall,
    FormatValue,
    StoreMap,
    ListAppend,
    SetAdd,
    MapAdd,
    ListExtend,
    SetUpdate,
    DictMerge,
    DictUpdate,
    ListToTuple,

    // loads
    LoadConst,
    LoadName,
    LoadGlobal,
    LoadFast,
    LoadFastCheck,
    LoadFastAndClear,
    LoadDeref,
    LoadClassDeref,
    LoadClosure,
    LoadLocals,
    LoadAttr,
    LoadMethod,
    LoadBuildClass,
    LoadAssertionError,
    LoadSuperAttr,

    // stores and deletes
    StoreName,
    StoreFast,
    StoreGlobal,
    StoreDeref,
    StoreAttr,
    StoreSubscr,
    StoreLocals,
    StoreAnnotation,
    SetupAnnotations,
    DeleteName,
    DeleteFast,
    DeleteGlobal,
    DeleteDeref,
    DeleteAttr,
    DeleteSubscr,
    UnpackSequence,
    UnpackEx,

    // imports
    ImportName,
    ImportFrom,
    ImportStar,

    // jumps
    JumpForward,
    JumpAbsolute,
    JumpBackward,
    JumpBackwardNoInterrupt,
    JumpIfFalse,
    JumpIfTrue,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,
    PopJumpIfFalse,
    PopJumpIfTrue,
    PopJumpBackwardIfFalse,
    PopJumpBackwardIfTrue,
    PopJumpIfNone,
    PopJumpIfNotNone,
    PopJumpBackwardIfNone,
    PopJumpBackwardIfNotNone,
    JumpIfNotExcMatch,

    // loops
    GetIter,
    GetYieldFromIter,
    ForIter,
    ForLoop,
    EndFor,
    SetupLoop,
    BreakLoop,
    ContinueLoop,
    PopBlock,

    // exceptions / with
    SetupExcept,
    SetupFinally,
    SetupWith,
    BeforeWith,
    PopExcept,
    EndFinally,
    BeginFinally,
    CallFinally,
    PopFinally,
    WithCleanup,
    WithCleanupStart,
    WithCleanupFinish,
    WithExceptStart,
    PushExcInfo,
    CheckExcMatch,
    Reraise,
    RaiseVarargs,

    // flow terminators
    ReturnValue,
    ReturnConst,
    YieldValue,
    YieldFrom,
    GetAwaitable,
    Send,

    // calls and scope construction
    CallFunction,
    CallFunctionVar,
    CallFunctionKw,
    CallFunctionVarKw,
    CallFunctionEx,
    CallMethod,
    Call,
    KwNames,
    Precall,
    MakeFunction,
    MakeClosure,
    BuildClass,
    BuildFunction,

    // Python 2 statements
    PrintExpr,
    PrintItem,
    PrintNewline,
    PrintItemTo,
    PrintNewlineTo,
    ExecStmt,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        // Canonical mnemonic, used by the disassembler and error messages.
        macro_rules! names {
            ($($v:ident => $s:literal,)*) => {
                match self { $(Opcode::$v => $s,)* }
            };
        }
        names! {
            StopCode => "STOP_CODE",
            Nop => "NOP",
            Cache => "CACHE",
            Resume => "RESUME",
            ExtendedArg => "EXTENDED_ARG",
            GenStart => "GEN_START",
            ReturnGenerator => "RETURN_GENERATOR",
            MakeCell => "MAKE_CELL",
            CopyFreeVars => "COPY_FREE_VARS",
            PopTop => "POP_TOP",
            RotTwo => "ROT_TWO",
            RotThree => "ROT_THREE",
            RotFour => "ROT_FOUR",
            RotN => "ROT_N",
            DupTop => "DUP_TOP",
            DupTopTwo => "DUP_TOP_TWO",
            DupTopX => "DUP_TOPX",
            Swap => "SWAP",
            Copy => "COPY",
            PushNull => "PUSH_NULL",
            UnaryPositive => "UNARY_POSITIVE",
            UnaryNegative => "UNARY_NEGATIVE",
            UnaryNot => "UNARY_NOT",
            UnaryConvert => "UNARY_CONVERT",
            UnaryInvert => "UNARY_INVERT",
            BinaryAdd => "BINARY_ADD",
            BinarySubtract => "BINARY_SUBTRACT",
            BinaryMultiply => "BINARY_MULTIPLY",
            BinaryDivide => "BINARY_DIVIDE",
            BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            BinaryModulo => "BINARY_MODULO",
            BinaryPower => "BINARY_POWER",
            BinaryLshift => "BINARY_LSHIFT",
            BinaryRshift => "BINARY_RSHIFT",
            BinaryAnd => "BINARY_AND",
            BinaryXor => "BINARY_XOR",
            BinaryOr => "BINARY_OR",
            BinaryMatrixMultiply => "BINARY_MATRIX_MULTIPLY",
            InplaceAdd => "INPLACE_ADD",
            InplaceSubtract => "INPLACE_SUBTRACT",
            InplaceMultiply => "INPLACE_MULTIPLY",
            InplaceDivide => "INPLACE_DIVIDE",
            InplaceTrueDivide => "INPLACE_TRUE_DIVIDE",
            InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
            InplaceModulo => "INPLACE_MODULO",
            InplacePower => "INPLACE_POWER",
            InplaceLshift => "INPLACE_LSHIFT",
            InplaceRshift => "INPLACE_RSHIFT",
            InplaceAnd => "INPLACE_AND",
            InplaceXor => "INPLACE_XOR",
            InplaceOr => "INPLACE_OR",
            InplaceMatrixMultiply => "INPLACE_MATRIX_MULTIPLY",
            BinaryOp => "BINARY_OP",
            CompareOp => "COMPARE_OP",
            IsOp => "IS_OP",
            ContainsOp => "CONTAINS_OP",
            BinarySubscr => "BINARY_SUBSCR",
            BuildSlice => "BUILD_SLICE",
            BinarySlice => "BINARY_SLICE",
            StoreSliceOp => "STORE_SLICE",
            SlicePlus0 => "SLICE+0",
            SlicePlus1 => "SLICE+1",
            SlicePlus2 => "SLICE+2",
            SlicePlus3 => "SLICE+3",
            StoreSlicePlus0 => "STORE_SLICE+0",
            StoreSlicePlus1 => "STORE_SLICE+1",
            StoreSlicePlus2 => "STORE_SLICE+2",
            StoreSlicePlus3 => "STORE_SLICE+3",
            DeleteSlicePlus0 => "DELETE_SLICE+0",
            DeleteSlicePlus1 => "DELETE_SLICE+1",
            DeleteSlicePlus2 => "DELETE_SLICE+2",
            DeleteSlicePlus3 => "DELETE_SLICE+3",
            BuildTuple => "BUILD_TUPLE",
            BuildList => "BUILD_LIST",
            BuildSet => "BUILD_SET",
            BuildMap => "BUILD_MAP",
            BuildConstKeyMap => "BUILD_CONST_KEY_MAP",
            BuildString => "BUILD_STRING",
            BuildTupleUnpack => "BUILD_TUPLE_UNPACK",
            BuildListUnpack => "BUILD_LIST_UNPACK",
            BuildSetUnpack => "BUILD_SET_UNPACK",
            BuildMapUnpack => "BUILD_MAP_UNPACK",
            BuildMapUnpackWithCall => "BUILD_MAP_UNPACK_WITH_CALL",
            BuildTupleUnpackWithCall => "BUILD_TUPLE_UNPACK_WITH_CALL",
            FormatValue => "FORMAT_VALUE",
            StoreMap => "STORE_MAP",
            ListAppend => "LIST_APPEND",
            SetAdd => "SET_ADD",
            MapAdd => "MAP_ADD",
            ListExtend => "LIST_EXTEND",
            SetUpdate => "SET_UPDATE",
            DictMerge => "DICT_MERGE",
            DictUpdate => "DICT_UPDATE",
            ListToTuple => "LIST_TO_TUPLE",
            LoadConst => "LOAD_CONST",
            LoadName => "LOAD_NAME",
            LoadGlobal => "LOAD_GLOBAL",
            LoadFast => "LOAD_FAST",
            LoadFastCheck => "LOAD_FAST_CHECK",
            LoadFastAndClear => "LOAD_FAST_AND_CLEAR",
            LoadDeref => "LOAD_DEREF",
            LoadClassDeref => "LOAD_CLASSDEREF",
            LoadClosure => "LOAD_CLOSURE",
            LoadLocals => "LOAD_LOCALS",
            LoadAttr => "LOAD_ATTR",
            LoadMethod => "LOAD_METHOD",
            LoadBuildClass => "LOAD_BUILD_CLASS",
            LoadAssertionError => "LOAD_ASSERTION_ERROR",
            LoadSuperAttr => "LOAD_SUPER_ATTR",
            StoreName => "STORE_NAME",
            StoreFast => "STORE_FAST",
            StoreGlobal => "STORE_GLOBAL",
            StoreDeref => "STORE_DEREF",
            StoreAttr => "STORE_ATTR",
            StoreSubscr => "STORE_SUBSCR",
            StoreLocals => "STORE_LOCALS",
            StoreAnnotation => "STORE_ANNOTATION",
            SetupAnnotations => "SETUP_ANNOTATIONS",
            DeleteName => "DELETE_NAME",
            DeleteFast => "DELETE_FAST",
            DeleteGlobal => "DELETE_GLOBAL",
            DeleteDeref => "DELETE_DEREF",
            DeleteAttr => "DELETE_ATTR",
            DeleteSubscr => "DELETE_SUBSCR",
            UnpackSequence => "UNPACK_SEQUENCE",
            UnpackEx => "UNPACK_EX",
            ImportName => "IMPORT_NAME",
            ImportFrom => "IMPORT_FROM",
            ImportStar => "IMPORT_STAR",
            JumpForward => "JUMP_FORWARD",
            JumpAbsolute => "JUMP_ABSOLUTE",
            JumpBackward => "JUMP_BACKWARD",
            JumpBackwardNoInterrupt => "JUMP_BACKWARD_NO_INTERRUPT",
            JumpIfFalse => "JUMP_IF_FALSE",
            JumpIfTrue => "JUMP_IF_TRUE",
            JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            PopJumpBackwardIfFalse => "POP_JUMP_BACKWARD_IF_FALSE",
            PopJumpBackwardIfTrue => "POP_JUMP_BACKWARD_IF_TRUE",
            PopJumpIfNone => "POP_JUMP_IF_NONE",
            PopJumpIfNotNone => "POP_JUMP_IF_NOT_NONE",
            PopJumpBackwardIfNone => "POP_JUMP_BACKWARD_IF_NONE",
            PopJumpBackwardIfNotNone => "POP_JUMP_BACKWARD_IF_NOT_NONE",
            JumpIfNotExcMatch => "JUMP_IF_NOT_EXC_MATCH",
            GetIter => "GET_ITER",
            GetYieldFromIter => "GET_YIELD_FROM_ITER",
            ForIter => "FOR_ITER",
            ForLoop => "FOR_LOOP",
            EndFor => "END_FOR",
            SetupLoop => "SETUP_LOOP",
            BreakLoop => "BREAK_LOOP",
            ContinueLoop => "CONTINUE_LOOP",
            PopBlock => "POP_BLOCK",
            SetupExcept => "SETUP_EXCEPT",
            SetupFinally => "SETUP_FINALLY",
            SetupWith => "SETUP_WITH",
            BeforeWith => "BEFORE_WITH",
            PopExcept => "POP_EXCEPT",
            EndFinally => "END_FINALLY",
            BeginFinally => "BEGIN_FINALLY",
            CallFinally => "CALL_FINALLY",
            PopFinally => "POP_FINALLY",
            WithCleanup => "WITH_CLEANUP",
            WithCleanupStart => "WITH_CLEANUP_START",
            WithCleanupFinish => "WITH_CLEANUP_FINISH",
            WithExceptStart => "WITH_EXCEPT_START",
            PushExcInfo => "PUSH_EXC_INFO",
            CheckExcMatch => "CHECK_EXC_MATCH",
            Reraise => "RERAISE",
            RaiseVarargs => "RAISE_VARARGS",
            ReturnValue => "RETURN_VALUE",
            ReturnConst => "RETURN_CONST",
            YieldValue => "YIELD_VALUE",
            YieldFrom => "YIELD_FROM",
            GetAwaitable => "GET_AWAITABLE",
            Send => "SEND",
            CallFunction => "CALL_FUNCTION",
            CallFunctionVar => "CALL_FUNCTION_VAR",
            CallFunctionKw => "CALL_FUNCTION_KW",
            CallFunctionVarKw => "CALL_FUNCTION_VAR_KW",
            CallFunctionEx => "CALL_FUNCTION_EX",
            CallMethod => "CALL_METHOD",
            Call => "CALL",
            KwNames => "KW_NAMES",
            Precall => "PRECALL",
            MakeFunction => "MAKE_FUNCTION",
            MakeClosure => "MAKE_CLOSURE",
            BuildClass => "BUILD_CLASS",
            BuildFunction => "BUILD_FUNCTION",
            PrintExpr => "PRINT_EXPR",
            PrintItem => "PRINT_ITEM",
            PrintNewline => "PRINT_NEWLINE",
            PrintItemTo => "PRINT_ITEM_TO",
            PrintNewlineTo => "PRINT_NEWLINE_TO",
            ExecStmt => "EXEC_STMT",
        }
    }
}

/// How the raw operand is interpreted. The closed set consumed by the engine
/// and the disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandClass {
    None,
    /// index into the names vector
    Name,
    /// index into the constant pool
    Const,
    /// index into the local-variable names
    Local,
    /// index into cell + free variable names
    Free,
    /// relative jump (forward unless the opcode says otherwise)
    JumpRel,
    /// absolute jump
    JumpAbs,
    /// index into the comparison-operator table
    Compare,
    /// plain unsigned argument
    ArgUint,
    /// two sub-fields packed into high/low bytes
    ArgPacked,
}

/// Raw numeric opcode at which operands begin for the pre-wordcode formats.
pub const HAVE_ARGUMENT: u8 = 90;

type Entry = (Opcode, OperandClass);

/// Resolve a raw opcode byte for the given bytecode version.
pub fn lookup(version: Version, raw: u8) -> Option<Entry> {
    if version.major >= 3 {
        if version.at_least(3, 12) {
            py312(raw)
        } else if version.at_least(3, 11) {
            py311(raw)
        } else {
            py3(version, raw)
        }
    } else {
        py12(version, raw)
    }
}

/// Python 1.x and 2.x share one numbering with era gates. The 1.x-only
/// opcodes sit in slots later reused by 2.x additions.
fn py12(v: Version, raw: u8) -> Option<Entry> {
    use OperandClass as C;
    use Opcode::*;
    let old = v.major == 1;
    Some(match raw {
        0 => (StopCode, C::None),
        1 => (PopTop, C::None),
        2 => (RotTwo, C::None),
        3 => (RotThree, C::None),
        4 => (DupTop, C::None),
        5 if v.at_least(2, 0) => (RotFour, C::None),
        9 if v.at_least(2, 4) => (Nop, C::None),
        10 => (UnaryPositive, C::None),
        11 => (UnaryNegative, C::None),
        12 => (UnaryNot, C::None),
        13 => (UnaryConvert, C::None),
        15 => (UnaryInvert, C::None),
        18 if v >= Version::new(2, 4) && v.before(2, 7) => (ListAppend, C::None),
        19 => (BinaryPower, C::None),
        20 => (BinaryMultiply, C::None),
        21 => (BinaryDivide, C::None),
        22 => (BinaryModulo, C::None),
        23 => (BinaryAdd, C::None),
        24 => (BinarySubtract, C::None),
        25 => (BinarySubscr, C::None),
        26 if v.at_least(2, 2) => (BinaryFloorDivide, C::None),
        27 if v.at_least(2, 2) => (BinaryTrueDivide, C::None),
        28 if v.at_least(2, 2) => (InplaceFloorDivide, C::None),
        29 if v.at_least(2, 2) => (InplaceTrueDivide, C::None),
        30 => (SlicePlus0, C::None),
        31 => (SlicePlus1, C::None),
        32 => (SlicePlus2, C::None),
        33 => (SlicePlus3, C::None),
        40 => (StoreSlicePlus0, C::None),
        41 => (StoreSlicePlus1, C::None),
        42 => (StoreSlicePlus2, C::None),
        43 => (StoreSlicePlus3, C::None),
        50 => (DeleteSlicePlus0, C::None),
        51 => (DeleteSlicePlus1, C::None),
        52 => (DeleteSlicePlus2, C::None),
        53 => (DeleteSlicePlus3, C::None),
        54 if v.at_least(2, 6) => (StoreMap, C::None),
        55 if v.at_least(2, 0) => (InplaceAdd, C::None),
        56 if v.at_least(2, 0) => (InplaceSubtract, C::None),
        57 if v.at_least(2, 0) => (InplaceMultiply, C::None),
        58 if v.at_least(2, 0) => (InplaceDivide, C::None),
        59 if v.at_least(2, 0) => (InplaceModulo, C::None),
        60 => (StoreSubscr, C::None),
        61 => (DeleteSubscr, C::None),
        62 => (BinaryLshift, C::None),
        63 => (BinaryRshift, C::None),
        64 => (BinaryAnd, C::None),
        65 => (BinaryXor, C::None),
        66 => (BinaryOr, C::None),
        67 if v.at_least(2, 0) => (InplacePower, C::None),
        68 if v.at_least(2, 2) => (GetIter, C::None),
        70 => (PrintExpr, C::None),
        71 => (PrintItem, C::None),
        72 => (PrintNewline, C::None),
        73 if v.at_least(2, 0) => (PrintItemTo, C::None),
        74 if v.at_least(2, 0) => (PrintNewlineTo, C::None),
        75 if v.at_least(2, 0) => (InplaceLshift, C::None),
        76 if v.at_least(2, 0) => (InplaceRshift, C::None),
        77 if v.at_least(2, 0) => (InplaceAnd, C::None),
        78 if v.at_least(2, 0) => (InplaceXor, C::None),
        79 if v.at_least(2, 0) => (InplaceOr, C::None),
        80 => (BreakLoop, C::None),
        81 if v.at_least(2, 5) => (WithCleanup, C::None),
        82 => (LoadLocals, C::None),
        83 => (ReturnValue, C::None),
        84 if v.at_least(2, 0) => (ImportStar, C::None),
        85 => (ExecStmt, C::None),
        86 if old && v.before(1, 3) => (BuildFunction, C::None),
        86 if v.at_least(2, 2) => (YieldValue, C::None),
        87 => (PopBlock, C::None),
        88 => (EndFinally, C::None),
        89 => (BuildClass, C::None),
        90 => (StoreName, C::Name),
        91 => (DeleteName, C::Name),
        92 if old => (UnpackSequence, C::ArgUint), // UNPACK_TUPLE
        92 if v.at_least(2, 0) => (UnpackSequence, C::ArgUint),
        93 if old => (UnpackSequence, C::ArgUint), // UNPACK_LIST
        93 if v.at_least(2, 2) => (ForIter, C::JumpRel),
        94 if v.at_least(2, 7) => (ListAppend, C::ArgUint),
        95 => (StoreAttr, C::Name),
        96 => (DeleteAttr, C::Name),
        97 => (StoreGlobal, C::Name),
        98 => (DeleteGlobal, C::Name),
        99 if v.at_least(2, 0) => (DupTopX, C::ArgUint),
        100 => (LoadConst, C::Const),
        101 => (LoadName, C::Name),
        102 => (BuildTuple, C::ArgUint),
        103 => (BuildList, C::ArgUint),
        104 if v.at_least(2, 7) => (BuildSet, C::ArgUint),
        104 => (BuildMap, C::ArgUint),
        105 if v.at_least(2, 7) => (BuildMap, C::ArgUint),
        105 => (LoadAttr, C::Name),
        106 if v.at_least(2, 7) => (LoadAttr, C::Name),
        106 => (CompareOp, C::Compare),
        107 if v.at_least(2, 7) => (CompareOp, C::Compare),
        107 => (ImportName, C::Name),
        108 if v.at_least(2, 7) => (ImportName, C::Name),
        108 => (ImportFrom, C::Name),
        109 if v.at_least(2, 7) => (ImportFrom, C::Name),
        110 => (JumpForward, C::JumpRel),
        111 if v.at_least(2, 7) => (JumpIfFalseOrPop, C::JumpAbs),
        111 => (JumpIfFalse, C::JumpRel),
        112 if v.at_least(2, 7) => (JumpIfTrueOrPop, C::JumpAbs),
        112 => (JumpIfTrue, C::JumpRel),
        113 => (JumpAbsolute, C::JumpAbs),
        114 if v.at_least(2, 7) => (PopJumpIfFalse, C::JumpAbs),
        114 if v.before(2, 2) => (ForLoop, C::JumpRel),
        115 if v.at_least(2, 7) => (PopJumpIfTrue, C::JumpAbs),
        116 if v.at_least(2, 0) => (LoadGlobal, C::Name),
        116 if old => (LoadGlobal, C::Name),
        119 if v.at_least(2, 1) => (ContinueLoop, C::JumpAbs),
        120 => (SetupLoop, C::JumpRel),
        121 => (SetupExcept, C::JumpRel),
        122 => (SetupFinally, C::JumpRel),
        124 => (LoadFast, C::Local),
        125 => (StoreFast, C::Local),
        126 => (DeleteFast, C::Local),
        130 => (RaiseVarargs, C::ArgUint),
        131 => (CallFunction, C::ArgPacked),
        132 => (MakeFunction, C::ArgUint),
        133 => (BuildSlice, C::ArgUint),
        134 if v.at_least(2, 1) => (MakeClosure, C::ArgUint),
        135 if v.at_least(2, 1) => (LoadClosure, C::Free),
        136 if v.at_least(2, 1) => (LoadDeref, C::Free),
        137 if v.at_least(2, 1) => (StoreDeref, C::Free),
        140 if v.at_least(2, 0) => (CallFunctionVar, C::ArgPacked),
        141 if v.at_least(2, 0) => (CallFunctionKw, C::ArgPacked),
        142 if v.at_least(2, 0) => (CallFunctionVarKw, C::ArgPacked),
        143 if v.at_least(2, 7) => (SetupWith, C::JumpRel),
        143 if v.at_least(2, 0) => (ExtendedArg, C::ArgUint),
        145 if v.at_least(2, 7) => (ExtendedArg, C::ArgUint),
        146 if v.at_least(2, 7) => (SetAdd, C::ArgUint),
        147 if v.at_least(2, 7) => (MapAdd, C::ArgUint),
        _ => return None,
    })
}

/// Python 3.0 through 3.10: one numbering, per-minor additions gated.
fn py3(v: Version, raw: u8) -> Option<Entry> {
    use OperandClass as C;
    use Opcode::*;
    Some(match raw {
        1 => (PopTop, C::None),
        2 => (RotTwo, C::None),
        3 => (RotThree, C::None),
        4 => (DupTop, C::None),
        5 if v.at_least(3, 2) => (DupTopTwo, C::None),
        5 => (RotFour, C::None),
        6 if v.at_least(3, 8) => (RotFour, C::None),
        9 => (Nop, C::None),
        10 => (UnaryPositive, C::None),
        11 => (UnaryNegative, C::None),
        12 => (UnaryNot, C::None),
        15 => (UnaryInvert, C::None),
        16 if v.at_least(3, 5) => (BinaryMatrixMultiply, C::None),
        17 if v.at_least(3, 5) => (InplaceMatrixMultiply, C::None),
        19 => (BinaryPower, C::None),
        20 => (BinaryMultiply, C::None),
        22 => (BinaryModulo, C::None),
        23 => (BinaryAdd, C::None),
        24 => (BinarySubtract, C::None),
        25 => (BinarySubscr, C::None),
        26 => (BinaryFloorDivide, C::None),
        27 => (BinaryTrueDivide, C::None),
        28 => (InplaceFloorDivide, C::None),
        29 => (InplaceTrueDivide, C::None),
        48 if v.at_least(3, 9) => (Reraise, C::None),
        49 if v.at_least(3, 9) => (WithExceptStart, C::None),
        53 if v.at_least(3, 8) => (BeginFinally, C::None),
        54 if v.before(3, 5) => (StoreMap, C::None),
        55 => (InplaceAdd, C::None),
        56 => (InplaceSubtract, C::None),
        57 => (InplaceMultiply, C::None),
        59 => (InplaceModulo, C::None),
        60 => (StoreSubscr, C::None),
        61 => (DeleteSubscr, C::None),
        62 => (BinaryLshift, C::None),
        63 => (BinaryRshift, C::None),
        64 => (BinaryAnd, C::None),
        65 => (BinaryXor, C::None),
        66 => (BinaryOr, C::None),
        67 => (InplacePower, C::None),
        68 => (GetIter, C::None),
        69 if v.at_least(3, 5) => (GetYieldFromIter, C::None),
        69 if v.before(3, 4) => (StoreLocals, C::None),
        70 => (PrintExpr, C::None),
        71 => (LoadBuildClass, C::None),
        72 if v.at_least(3, 3) => (YieldFrom, C::None),
        73 if v.at_least(3, 5) => (GetAwaitable, C::None),
        74 if v.at_least(3, 9) => (LoadAssertionError, C::None),
        75 => (InplaceLshift, C::None),
        76 => (InplaceRshift, C::None),
        77 => (InplaceAnd, C::None),
        78 => (InplaceXor, C::None),
        79 => (InplaceOr, C::None),
        80 if v.before(3, 8) => (BreakLoop, C::None),
        81 if v.at_least(3, 5) => (WithCleanupStart, C::None),
        81 => (WithCleanup, C::None),
        82 if v.at_least(3, 9) => (ListToTuple, C::None),
        82 if v.at_least(3, 5) && v.before(3, 9) => (WithCleanupFinish, C::None),
        83 => (ReturnValue, C::None),
        84 => (ImportStar, C::None),
        85 if v.at_least(3, 6) => (SetupAnnotations, C::None),
        86 => (YieldValue, C::None),
        87 => (PopBlock, C::None),
        88 if v.before(3, 9) => (EndFinally, C::None),
        89 => (PopExcept, C::None),
        90 => (StoreName, C::Name),
        91 => (DeleteName, C::Name),
        92 => (UnpackSequence, C::ArgUint),
        93 => (ForIter, C::JumpRel),
        94 => (UnpackEx, C::ArgPacked),
        95 => (StoreAttr, C::Name),
        96 => (DeleteAttr, C::Name),
        97 => (StoreGlobal, C::Name),
        98 => (DeleteGlobal, C::Name),
        99 if v.at_least(3, 10) => (RotN, C::ArgUint),
        99 if v.before(3, 2) => (DupTopX, C::ArgUint),
        100 => (LoadConst, C::Const),
        101 => (LoadName, C::Name),
        102 => (BuildTuple, C::ArgUint),
        103 => (BuildList, C::ArgUint),
        104 => (BuildSet, C::ArgUint),
        105 => (BuildMap, C::ArgUint),
        106 => (LoadAttr, C::Name),
        107 => (CompareOp, C::Compare),
        108 => (ImportName, C::Name),
        109 => (ImportFrom, C::Name),
        110 => (JumpForward, C::JumpRel),
        111 if v == Version::new(3, 0) => (JumpIfFalse, C::JumpRel),
        111 => (JumpIfFalseOrPop, C::JumpAbs),
        112 if v == Version::new(3, 0) => (JumpIfTrue, C::JumpRel),
        112 => (JumpIfTrueOrPop, C::JumpAbs),
        113 => (JumpAbsolute, C::JumpAbs),
        114 if v.at_least(3, 1) => (PopJumpIfFalse, C::JumpAbs),
        115 if v.at_least(3, 1) => (PopJumpIfTrue, C::JumpAbs),
        116 => (LoadGlobal, C::Name),
        117 if v.at_least(3, 9) => (IsOp, C::ArgUint),
        118 if v.at_least(3, 9) => (ContainsOp, C::ArgUint),
        119 if v.before(3, 8) => (ContinueLoop, C::JumpAbs),
        120 if v.before(3, 8) => (SetupLoop, C::JumpRel),
        121 if v.at_least(3, 9) => (JumpIfNotExcMatch, C::JumpAbs),
        121 if v.before(3, 8) => (SetupExcept, C::JumpRel),
        122 => (SetupFinally, C::JumpRel),
        124 => (LoadFast, C::Local),
        125 => (StoreFast, C::Local),
        126 => (DeleteFast, C::Local),
        127 if v == Version::new(3, 6) => (StoreAnnotation, C::Name),
        129 if v.at_least(3, 10) => (GenStart, C::ArgUint),
        130 => (RaiseVarargs, C::ArgUint),
        131 if v.at_least(3, 6) => (CallFunction, C::ArgUint),
        131 => (CallFunction, C::ArgPacked),
        132 => (MakeFunction, C::ArgUint),
        133 => (BuildSlice, C::ArgUint),
        134 if v.before(3, 6) => (MakeClosure, C::ArgUint),
        135 => (LoadClosure, C::Free),
        136 => (LoadDeref, C::Free),
        137 => (StoreDeref, C::Free),
        138 if v.at_least(3, 2) => (DeleteDeref, C::Free),
        140 if v.before(3, 6) => (CallFunctionVar, C::ArgPacked),
        141 if v.at_least(3, 6) => (CallFunctionKw, C::ArgUint),
        141 => (CallFunctionKw, C::ArgPacked),
        142 if v.at_least(3, 6) => (CallFunctionEx, C::ArgUint),
        142 => (CallFunctionVarKw, C::ArgPacked),
        143 if v.at_least(3, 1) => (SetupWith, C::JumpRel),
        143 => (ExtendedArg, C::ArgUint),
        144 if v.at_least(3, 1) => (ExtendedArg, C::ArgUint),
        145 => (ListAppend, C::ArgUint),
        146 => (SetAdd, C::ArgUint),
        147 if v.at_least(3, 1) => (MapAdd, C::ArgUint),
        148 if v.at_least(3, 4) => (LoadClassDeref, C::Free),
        149 if v.at_least(3, 5) => (BuildListUnpack, C::ArgUint),
        150 if v.at_least(3, 5) => (BuildMapUnpack, C::ArgUint),
        151 if v.at_least(3, 5) => (BuildMapUnpackWithCall, C::ArgUint),
        152 if v.at_least(3, 5) => (BuildTupleUnpack, C::ArgUint),
        153 if v.at_least(3, 5) => (BuildSetUnpack, C::ArgUint),
        154 if v.at_least(3, 5) => (SetupWith, C::JumpRel), // SETUP_ASYNC_WITH
        155 if v.at_least(3, 6) => (FormatValue, C::ArgUint),
        156 if v.at_least(3, 6) => (BuildConstKeyMap, C::ArgUint),
        157 if v.at_least(3, 6) => (BuildString, C::ArgUint),
        158 if v.at_least(3, 6) => (BuildTupleUnpackWithCall, C::ArgUint),
        160 if v.at_least(3, 7) => (LoadMethod, C::Name),
        161 if v.at_least(3, 7) => (CallMethod, C::ArgUint),
        162 if v.at_least(3, 9) => (ListExtend, C::ArgUint),
        162 if v == Version::new(3, 8) => (CallFinally, C::JumpRel),
        163 if v.at_least(3, 9) => (SetUpdate, C::ArgUint),
        163 if v == Version::new(3, 8) => (PopFinally, C::ArgUint),
        164 if v.at_least(3, 9) => (DictMerge, C::ArgUint),
        165 if v.at_least(3, 9) => (DictUpdate, C::ArgUint),
        _ => return None,
    })
}

fn py311(raw: u8) -> Option<Entry> {
    use OperandClass as C;
    use Opcode::*;
    Some(match raw {
        0 => (Cache, C::None),
        1 => (PopTop, C::None),
        2 => (PushNull, C::None),
        9 => (Nop, C::None),
        10 => (UnaryPositive, C::None),
        11 => (UnaryNegative, C::None),
        12 => (UnaryNot, C::None),
        15 => (UnaryInvert, C::None),
        25 => (BinarySubscr, C::None),
        35 => (PushExcInfo, C::None),
        36 => (CheckExcMatch, C::None),
        49 => (WithExceptStart, C::None),
        53 => (BeforeWith, C::None),
        60 => (StoreSubscr, C::None),
        61 => (DeleteSubscr, C::None),
        68 => (GetIter, C::None),
        69 => (GetYieldFromIter, C::None),
        70 => (PrintExpr, C::None),
        71 => (LoadBuildClass, C::None),
        74 => (LoadAssertionError, C::None),
        75 => (ReturnGenerator, C::None),
        82 => (ListToTuple, C::None),
        83 => (ReturnValue, C::None),
        84 => (ImportStar, C::None),
        85 => (SetupAnnotations, C::None),
        86 => (YieldValue, C::None),
        89 => (PopExcept, C::None),
        90 => (StoreName, C::Name),
        91 => (DeleteName, C::Name),
        92 => (UnpackSequence, C::ArgUint),
        93 => (ForIter, C::JumpRel),
        94 => (UnpackEx, C::ArgPacked),
        95 => (StoreAttr, C::Name),
        96 => (DeleteAttr, C::Name),
        97 => (StoreGlobal, C::Name),
        98 => (DeleteGlobal, C::Name),
        99 => (Swap, C::ArgUint),
        100 => (LoadConst, C::Const),
        101 => (LoadName, C::Name),
        102 => (BuildTuple, C::ArgUint),
        103 => (BuildList, C::ArgUint),
        104 => (BuildSet, C::ArgUint),
        105 => (BuildMap, C::ArgUint),
        106 => (LoadAttr, C::Name),
        107 => (CompareOp, C::Compare),
        108 => (ImportName, C::Name),
        109 => (ImportFrom, C::Name),
        110 => (JumpForward, C::JumpRel),
        111 => (JumpIfFalseOrPop, C::JumpRel),
        112 => (JumpIfTrueOrPop, C::JumpRel),
        114 => (PopJumpIfFalse, C::JumpRel), // POP_JUMP_FORWARD_IF_FALSE
        115 => (PopJumpIfTrue, C::JumpRel),
        116 => (LoadGlobal, C::Name),
        117 => (IsOp, C::ArgUint),
        118 => (ContainsOp, C::ArgUint),
        119 => (Reraise, C::ArgUint),
        120 => (Copy, C::ArgUint),
        122 => (BinaryOp, C::ArgUint),
        123 => (Send, C::JumpRel),
        124 => (LoadFast, C::Local),
        125 => (StoreFast, C::Local),
        126 => (DeleteFast, C::Local),
        128 => (PopJumpIfNotNone, C::JumpRel),
        129 => (PopJumpIfNone, C::JumpRel),
        130 => (RaiseVarargs, C::ArgUint),
        131 => (GetAwaitable, C::ArgUint),
        132 => (MakeFunction, C::ArgUint),
        133 => (BuildSlice, C::ArgUint),
        134 => (JumpBackwardNoInterrupt, C::JumpRel),
        135 => (MakeCell, C::Free),
        136 => (LoadClosure, C::Free),
        137 => (LoadDeref, C::Free),
        138 => (StoreDeref, C::Free),
        139 => (DeleteDeref, C::Free),
        140 => (JumpBackward, C::JumpRel),
        142 => (CallFunctionEx, C::ArgUint),
        144 => (ExtendedArg, C::ArgUint),
        145 => (ListAppend, C::ArgUint),
        146 => (SetAdd, C::ArgUint),
        147 => (MapAdd, C::ArgUint),
        148 => (LoadClassDeref, C::Free),
        149 => (CopyFreeVars, C::ArgUint),
        151 => (Resume, C::ArgUint),
        155 => (FormatValue, C::ArgUint),
        156 => (BuildConstKeyMap, C::ArgUint),
        157 => (BuildString, C::ArgUint),
        160 => (LoadMethod, C::Name),
        162 => (ListExtend, C::ArgUint),
        163 => (SetUpdate, C::ArgUint),
        164 => (DictMerge, C::ArgUint),
        165 => (DictUpdate, C::ArgUint),
        166 => (Precall, C::ArgUint),
        171 => (Call, C::ArgUint),
        172 => (KwNames, C::Const),
        173 => (PopJumpBackwardIfNotNone, C::JumpRel),
        174 => (PopJumpBackwardIfNone, C::JumpRel),
        175 => (PopJumpBackwardIfFalse, C::JumpRel),
        176 => (PopJumpBackwardIfTrue, C::JumpRel),
        _ => return None,
    })
}

fn py312(raw: u8) -> Option<Entry> {
    use OperandClass as C;
    use Opcode::*;
    Some(match raw {
        0 => (Cache, C::None),
        1 => (PopTop, C::None),
        2 => (PushNull, C::None),
        4 => (EndFor, C::None),
        9 => (Nop, C::None),
        11 => (UnaryNegative, C::None),
        12 => (UnaryNot, C::None),
        15 => (UnaryInvert, C::None),
        25 => (BinarySubscr, C::None),
        26 => (BinarySlice, C::None),
        27 => (StoreSliceOp, C::None),
        35 => (PushExcInfo, C::None),
        36 => (CheckExcMatch, C::None),
        49 => (WithExceptStart, C::None),
        53 => (BeforeWith, C::None),
        60 => (StoreSubscr, C::None),
        61 => (DeleteSubscr, C::None),
        68 => (GetIter, C::None),
        69 => (GetYieldFromIter, C::None),
        71 => (LoadBuildClass, C::None),
        74 => (LoadAssertionError, C::None),
        75 => (ReturnGenerator, C::None),
        83 => (ReturnValue, C::None),
        84 => (ImportStar, C::None),
        85 => (SetupAnnotations, C::None),
        87 => (LoadLocals, C::None),
        89 => (PopExcept, C::None),
        90 => (StoreName, C::Name),
        91 => (DeleteName, C::Name),
        92 => (UnpackSequence, C::ArgUint),
        93 => (ForIter, C::JumpRel),
        94 => (UnpackEx, C::ArgPacked),
        95 => (StoreAttr, C::Name),
        96 => (DeleteAttr, C::Name),
        97 => (StoreGlobal, C::Name),
        98 => (DeleteGlobal, C::Name),
        99 => (Swap, C::ArgUint),
        100 => (LoadConst, C::Const),
        101 => (LoadName, C::Name),
        102 => (BuildTuple, C::ArgUint),
        103 => (BuildList, C::ArgUint),
        104 => (BuildSet, C::ArgUint),
        105 => (BuildMap, C::ArgUint),
        106 => (LoadAttr, C::Name),
        107 => (CompareOp, C::Compare),
        108 => (ImportName, C::Name),
        109 => (ImportFrom, C::Name),
        110 => (JumpForward, C::JumpRel),
        114 => (PopJumpIfFalse, C::JumpRel),
        115 => (PopJumpIfTrue, C::JumpRel),
        116 => (LoadGlobal, C::Name),
        117 => (IsOp, C::ArgUint),
        118 => (ContainsOp, C::ArgUint),
        119 => (Reraise, C::ArgUint),
        120 => (Copy, C::ArgUint),
        121 => (ReturnConst, C::Const),
        122 => (BinaryOp, C::ArgUint),
        123 => (Send, C::JumpRel),
        124 => (LoadFast, C::Local),
        125 => (StoreFast, C::Local),
        126 => (DeleteFast, C::Local),
        127 => (LoadFastCheck, C::Local),
        128 => (PopJumpIfNotNone, C::JumpRel),
        129 => (PopJumpIfNone, C::JumpRel),
        130 => (RaiseVarargs, C::ArgUint),
        131 => (GetAwaitable, C::ArgUint),
        132 => (MakeFunction, C::ArgUint),
        133 => (BuildSlice, C::ArgUint),
        134 => (JumpBackwardNoInterrupt, C::JumpRel),
        135 => (MakeCell, C::Free),
        136 => (LoadClosure, C::Free),
        137 => (LoadDeref, C::Free),
        138 => (StoreDeref, C::Free),
        139 => (DeleteDeref, C::Free),
        140 => (JumpBackward, C::JumpRel),
        141 => (LoadSuperAttr, C::Name),
        142 => (CallFunctionEx, C::ArgUint),
        143 => (LoadFastAndClear, C::Local),
        144 => (ExtendedArg, C::ArgUint),
        145 => (ListAppend, C::ArgUint),
        146 => (SetAdd, C::ArgUint),
        147 => (MapAdd, C::ArgUint),
        149 => (CopyFreeVars, C::ArgUint),
        150 => (YieldValue, C::ArgUint),
        151 => (Resume, C::ArgUint),
        155 => (FormatValue, C::ArgUint),
        156 => (BuildConstKeyMap, C::ArgUint),
        157 => (BuildString, C::ArgUint),
        162 => (ListExtend, C::ArgUint),
        163 => (SetUpdate, C::ArgUint),
        164 => (DictMerge, C::ArgUint),
        165 => (DictUpdate, C::ArgUint),
        171 => (Call, C::ArgUint),
        172 => (KwNames, C::Const),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        assert!(Version::new(3, 11) > Version::new(3, 9));
        assert!(Version::new(3, 0) > Version::new(2, 7));
        assert!(Version::new(2, 7).before(3, 0));
        assert!(Version::new(3, 6).wordcode());
        assert!(!Version::new(3, 5).wordcode());
    }

    #[test]
    fn renumbering_collapses() {
        // The same raw byte resolves to different canonical opcodes per era.
        let (op, _) = lookup(Version::new(2, 6), 104).unwrap();
        assert_eq!(op, Opcode::BuildMap);
        let (op, _) = lookup(Version::new(2, 7), 104).unwrap();
        assert_eq!(op, Opcode::BuildSet);
        let (op, _) = lookup(Version::new(3, 11), 171).unwrap();
        assert_eq!(op, Opcode::Call);
        assert!(lookup(Version::new(2, 7), 171).is_none());
    }

    #[test]
    fn load_const_stable_across_eras() {
        for v in [
            Version::new(1, 5),
            Version::new(2, 7),
            Version::new(3, 4),
            Version::new(3, 8),
            Version::new(3, 11),
            Version::new(3, 12),
        ] {
            let (op, class) = lookup(v, 100).unwrap();
            assert_eq!(op, Opcode::LoadConst);
            assert_eq!(class, OperandClass::Const);
        }
    }

    #[test]
    fn version_gates_exclude_future_opcodes() {
        // SETUP_WITH appeared in 2.7 / 3.1.
        assert!(lookup(Version::new(2, 5), 143).is_some()); // EXTENDED_ARG there
        let (op, _) = lookup(Version::new(2, 7), 143).unwrap();
        assert_eq!(op, Opcode::SetupWith);
        // FORMAT_VALUE is 3.6+.
        assert!(lookup(Version::new(3, 5), 155).is_none());
        assert!(lookup(Version::new(3, 6), 155).is_some());
    }
}
