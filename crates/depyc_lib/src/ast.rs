//! Syntax tree rebuilt by the engine. Nodes are plainly owned values: the
//! evaluation stack owns its entries, block bodies own their children, and
//! speculative matches work on clones. Construction is strictly bottom-up,
//! so no cycles can form.

use crate::marshal::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Attr,
    Power,
    Multiply,
    Divide,
    FloorDivide,
    TrueDivide,
    Modulo,
    Add,
    Subtract,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
    MatMultiply,
    LogicalAnd,
    LogicalOr,
    InplaceAdd,
    InplaceSubtract,
    InplaceMultiply,
    InplaceDivide,
    InplaceFloorDivide,
    InplaceTrueDivide,
    InplaceModulo,
    InplacePower,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceXor,
    InplaceOr,
    InplaceMatMultiply,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Attr => ".",
            BinOp::Power => "**",
            BinOp::Multiply => "*",
            BinOp::Divide => "/",
            BinOp::FloorDivide => "//",
            BinOp::TrueDivide => "/",
            BinOp::Modulo => "%",
            BinOp::Add => "+",
            BinOp::Subtract => "-",
            BinOp::Lshift => "<<",
            BinOp::Rshift => ">>",
            BinOp::And => "&",
            BinOp::Xor => "^",
            BinOp::Or => "|",
            BinOp::MatMultiply => "@",
            BinOp::LogicalAnd => "and",
            BinOp::LogicalOr => "or",
            BinOp::InplaceAdd => "+=",
            BinOp::InplaceSubtract => "-=",
            BinOp::InplaceMultiply => "*=",
            BinOp::InplaceDivide => "/=",
            BinOp::InplaceFloorDivide => "//=",
            BinOp::InplaceTrueDivide => "/=",
            BinOp::InplaceModulo => "%=",
            BinOp::InplacePower => "**=",
            BinOp::InplaceLshift => "<<=",
            BinOp::InplaceRshift => ">>=",
            BinOp::InplaceAnd => "&=",
            BinOp::InplaceXor => "^=",
            BinOp::InplaceOr => "|=",
            BinOp::InplaceMatMultiply => "@=",
        }
    }

    pub fn is_inplace(self) -> bool {
        matches!(
            self,
            BinOp::InplaceAdd
                | BinOp::InplaceSubtract
                | BinOp::InplaceMultiply
                | BinOp::InplaceDivide
                | BinOp::InplaceFloorDivide
                | BinOp::InplaceTrueDivide
                | BinOp::InplaceModulo
                | BinOp::InplacePower
                | BinOp::InplaceLshift
                | BinOp::InplaceRshift
                | BinOp::InplaceAnd
                | BinOp::InplaceXor
                | BinOp::InplaceOr
                | BinOp::InplaceMatMultiply
        )
    }

    /// Operand index of the 3.11 unified BINARY_OP instruction.
    pub fn from_binary_op(idx: u32) -> Option<BinOp> {
        Some(match idx {
            0 => BinOp::Add,
            1 => BinOp::And,
            2 => BinOp::FloorDivide,
            3 => BinOp::Lshift,
            4 => BinOp::MatMultiply,
            5 => BinOp::Multiply,
            6 => BinOp::Modulo,
            7 => BinOp::Or,
            8 => BinOp::Power,
            9 => BinOp::Rshift,
            10 => BinOp::Subtract,
            11 => BinOp::TrueDivide,
            12 => BinOp::Xor,
            13 => BinOp::InplaceAdd,
            14 => BinOp::InplaceAnd,
            15 => BinOp::InplaceFloorDivide,
            16 => BinOp::InplaceLshift,
            17 => BinOp::InplaceMatMultiply,
            18 => BinOp::InplaceMultiply,
            19 => BinOp::InplaceModulo,
            20 => BinOp::InplaceOr,
            21 => BinOp::InplacePower,
            22 => BinOp::InplaceRshift,
            23 => BinOp::InplaceSubtract,
            24 => BinOp::InplaceTrueDivide,
            25 => BinOp::InplaceXor,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Positive,
    Negative,
    Not,
    Invert,
    /// Python 2 backquote conversion.
    Convert,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Positive => "+",
            UnaryOp::Negative => "-",
            UnaryOp::Not => "not ",
            UnaryOp::Invert => "~",
            UnaryOp::Convert => "`",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Less,
    LessEqual,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    In,
    NotIn,
    Is,
    IsNot,
    ExceptionMatch,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Less => "<",
            CmpOp::LessEqual => "<=",
            CmpOp::Equal => "==",
            CmpOp::NotEqual => "!=",
            CmpOp::Greater => ">",
            CmpOp::GreaterEqual => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
            CmpOp::ExceptionMatch => "exception match",
        }
    }

    pub fn from_operand(idx: u32) -> Option<CmpOp> {
        Some(match idx {
            0 => CmpOp::Less,
            1 => CmpOp::LessEqual,
            2 => CmpOp::Equal,
            3 => CmpOp::NotEqual,
            4 => CmpOp::Greater,
            5 => CmpOp::GreaterEqual,
            6 => CmpOp::In,
            7 => CmpOp::NotIn,
            8 => CmpOp::Is,
            9 => CmpOp::IsNot,
            10 => CmpOp::ExceptionMatch,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceKind {
    /// `[:]`
    Slice0,
    /// `[a:]`
    Slice1,
    /// `[:b]`
    Slice2,
    /// `[a:b]`
    Slice3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordKind {
    Break,
    Continue,
    Pass,
    Assert,
}

impl KeywordKind {
    pub fn word(self) -> &'static str {
        match self {
            KeywordKind::Break => "break",
            KeywordKind::Continue => "continue",
            KeywordKind::Pass => "pass",
            KeywordKind::Assert => "assert",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    // atoms
    Object(Value),
    Name(String),
    /// Cell reference pushed by LOAD_CLOSURE.
    CellName(String),
    LoadBuildClass,
    /// Callable sentinel pushed by PUSH_NULL, consumed by CALL.
    Null,
    /// Placeholder for an implicit locals dict (old class bodies).
    Locals,

    // collections
    Tuple(Vec<Node>),
    List(Vec<Node>),
    Set(Vec<Node>),
    Map(Vec<(Node, Node)>),
    ConstMap {
        keys: Vec<Value>,
        values: Vec<Node>,
    },
    Slice {
        kind: SliceKind,
        lower: Option<Box<Node>>,
        upper: Option<Box<Node>>,
    },
    Starred(Box<Node>),

    // operators
    Binary {
        op: BinOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Compare {
        left: Box<Node>,
        ops: Vec<(CmpOp, Node)>,
    },
    Subscript {
        value: Box<Node>,
        index: Box<Node>,
    },
    Ternary {
        cond: Box<Node>,
        then: Box<Node>,
        orelse: Box<Node>,
    },

    // calls and definitions
    Call {
        func: Box<Node>,
        args: Vec<Node>,
        kwargs: Vec<(Node, Node)>,
        star: Option<Box<Node>>,
        dstar: Option<Box<Node>>,
    },
    Function {
        code: Value,
        defaults: Vec<Node>,
        kw_defaults: Vec<(Node, Node)>,
    },
    Class {
        builder: Box<Node>,
        bases: Box<Node>,
        name: Box<Node>,
    },
    Comprehension {
        code: Value,
        iterable: Box<Node>,
    },
    /// Element produced inside a comprehension body by the append/add opcodes.
    CompElement {
        key: Option<Box<Node>>,
        value: Box<Node>,
    },

    // statements
    Store {
        value: Box<Node>,
        target: Box<Node>,
    },
    ChainStore {
        targets: Vec<Node>,
        value: Box<Node>,
    },
    Delete(Box<Node>),
    Return(Option<Box<Node>>),
    Yield {
        value: Option<Box<Node>>,
        from: bool,
    },
    Raise(Vec<Node>),
    Import {
        module: String,
        fromlist: Box<Node>,
        level: i64,
        alias: Option<String>,
        imports: Vec<(String, Option<String>)>,
    },
    ImportFrom(String),
    Keyword(KeywordKind),
    Print {
        values: Vec<Node>,
        stream: Option<Box<Node>>,
        eol: bool,
    },
    Exec {
        stmt: Box<Node>,
        globals: Option<Box<Node>>,
        locals: Option<Box<Node>>,
    },
    AnnotatedAssign {
        target: Box<Node>,
        annotation: Box<Node>,
        value: Option<Box<Node>>,
    },

    // interpolated strings
    FormattedValue {
        value: Box<Node>,
        conversion: u32,
        format_spec: Option<Box<Node>>,
    },
    JoinedStr(Vec<Node>),

    // meta
    KwNamesMap(Vec<(Node, Node)>),

    Block(Block),
}

impl Node {
    pub fn name(s: impl Into<String>) -> Node {
        Node::Name(s.into())
    }

    pub fn attr(value: Node, name: impl Into<String>) -> Node {
        Node::Binary {
            op: BinOp::Attr,
            left: Box::new(value),
            right: Box::new(Node::Name(name.into())),
        }
    }

    pub fn is_none_literal(&self) -> bool {
        matches!(self, Node::Object(Value::None))
    }

    /// True for nodes the class-builder speculation accepts as a base class.
    pub fn is_base_candidate(&self) -> bool {
        matches!(self, Node::Name(_) | Node::Binary { .. })
    }

    /// Nodes that stand alone as an expression statement when discarded.
    pub fn is_statement_worthy(&self) -> bool {
        !matches!(
            self,
            Node::Null | Node::LoadBuildClass | Node::Locals | Node::KwNamesMap(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Main,
    Function,
    Class,
    Comprehension,
    If {
        cond: Box<Node>,
        negative: bool,
        /// Opened by an or-pop jump: reduces to `and`/`or` instead of a
        /// statement block.
        or_pop: bool,
    },
    Elif {
        cond: Box<Node>,
        negative: bool,
    },
    Else,
    Try,
    Except {
        exc: Option<Box<Node>>,
        name: Option<Box<Node>>,
    },
    Finally,
    While {
        cond: Option<Box<Node>>,
        negative: bool,
    },
    For {
        iter: Box<Node>,
        index: Option<Box<Node>>,
    },
    With {
        expr: Box<Node>,
        var: Option<Box<Node>>,
    },
    Container {
        except: u32,
        finally: u32,
    },
}

impl BlockKind {
    pub fn label(&self) -> &'static str {
        match self {
            BlockKind::Main => "main",
            BlockKind::Function => "function",
            BlockKind::Class => "class",
            BlockKind::Comprehension => "comprehension",
            BlockKind::If { .. } => "if",
            BlockKind::Elif { .. } => "elif",
            BlockKind::Else => "else",
            BlockKind::Try => "try",
            BlockKind::Except { .. } => "except",
            BlockKind::Finally => "finally",
            BlockKind::While { .. } => "while",
            BlockKind::For { .. } => "for",
            BlockKind::With { .. } => "with",
            BlockKind::Container { .. } => "container",
        }
    }
}

/// One open control construct. `end` is the byte offset at which the block
/// must close; 0 means "not yet known".
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub end: u32,
    pub body: Vec<Node>,
    pub inited: bool,
    /// Hoisted docstring for scope-root blocks.
    pub docstring: Option<Value>,
    /// Names declared global inside this scope (scope roots only).
    pub globals: Vec<String>,
}

impl Block {
    pub fn new(kind: BlockKind, end: u32) -> Self {
        Self {
            kind,
            end,
            body: Vec::new(),
            inited: false,
            docstring: None,
            globals: Vec::new(),
        }
    }

    pub fn is_scope_root(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::Main | BlockKind::Function | BlockKind::Class | BlockKind::Comprehension
        )
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, BlockKind::Container { .. })
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, BlockKind::While { .. } | BlockKind::For { .. })
    }

    pub fn append(&mut self, node: Node) {
        self.body.push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_is_binary() {
        let n = Node::attr(Node::name("os"), "path");
        match n {
            Node::Binary { op, left, right } => {
                assert_eq!(op, BinOp::Attr);
                assert_eq!(*left, Node::name("os"));
                assert_eq!(*right, Node::name("path"));
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn binary_op_table_round_trips_symbols() {
        assert_eq!(BinOp::from_binary_op(0), Some(BinOp::Add));
        assert_eq!(BinOp::from_binary_op(11), Some(BinOp::TrueDivide));
        assert_eq!(BinOp::from_binary_op(13), Some(BinOp::InplaceAdd));
        assert!(BinOp::from_binary_op(26).is_none());
        assert!(BinOp::InplaceAdd.is_inplace());
        assert!(!BinOp::Add.is_inplace());
    }

    #[test]
    fn scope_roots() {
        assert!(Block::new(BlockKind::Main, 0).is_scope_root());
        assert!(Block::new(BlockKind::Comprehension, 0).is_scope_root());
        assert!(!Block::new(BlockKind::Else, 4).is_scope_root());
    }
}
