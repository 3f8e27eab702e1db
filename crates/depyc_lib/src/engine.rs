//! Bytecode-to-AST reconstruction engine.
//!
//! A linear pass over the instruction stream drives three pieces of state:
//! the evaluation stack (AST nodes standing in for runtime values), the
//! block stack (one entry per open control construct, bottomed by the scope
//! root), and the stack history used for speculative pattern matches and
//! branch save/restore.

use tracing::{debug, warn};

use crate::ast::{BinOp, Block, BlockKind, CmpOp, KeywordKind, Node, SliceKind, UnaryOp};
use crate::dispatch::{is_backward_jump, jump_target, Instr, InstrCursor};
use crate::marshal::{CodeObject, Value};
use crate::tables::{Opcode, Version};
use crate::DepycError;

/// Flags shared by one top-level decompile, threaded through the engine and
/// the printer. Scope-local fields are saved and restored around nested
/// code records.
#[derive(Debug, Clone)]
pub struct BuildCtx {
    pub version: Version,
    /// False once any soft decode error occurred; the output gets a warning
    /// banner when unset.
    pub clean: bool,
    pub in_lambda: bool,
    pub print_docstring_and_globals: bool,
    pub print_class_docstring: bool,
}

impl BuildCtx {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            clean: true,
            in_lambda: false,
            print_docstring_and_globals: false,
            print_class_docstring: true,
        }
    }
}

/// Decompile one code record into its scope-root block.
pub fn build(
    code: &CodeObject,
    root: BlockKind,
    ctx: &mut BuildCtx,
) -> Result<Block, DepycError> {
    debug!(name = %code.name, version = %ctx.version, "decompiling code record");
    let mut engine = Engine::new(code, root, ctx);
    engine.run()?;
    engine.finish()
}

/// One pending unpacked-assignment target list. Nested destructuring
/// targets (`a, (b, c) = t`) stack a frame per UNPACK opcode; the inner
/// frame completes into a tuple that becomes one target of the frame
/// below it.
struct UnpackFrame {
    remaining: usize,
    targets: Vec<Node>,
    /// Position of the starred target (UNPACK_EX).
    star_index: Option<usize>,
}

struct Engine<'a, 'c> {
    code: &'a CodeObject,
    ctx: &'c mut BuildCtx,
    version: Version,
    stack: Vec<Node>,
    hist: Vec<Vec<Node>>,
    blocks: Vec<Block>,
    curpos: u32,
    pos: u32,
    else_pop: bool,
    need_try: bool,
    variable_annotations: bool,
    chain_pending: bool,
    unpack: Vec<UnpackFrame>,
    last_cond: Option<Node>,
}

impl<'a, 'c> Engine<'a, 'c> {
    fn new(code: &'a CodeObject, root: BlockKind, ctx: &'c mut BuildCtx) -> Self {
        let version = ctx.version;
        // Very old modules declare no stack depth; give them a working floor.
        let depth = if version.major == 1 {
            20
        } else {
            code.stack_size as usize
        };
        Self {
            code,
            ctx,
            version,
            stack: Vec::with_capacity(depth.min(1024)),
            hist: Vec::new(),
            blocks: vec![Block::new(root, code.code.len() as u32)],
            curpos: 0,
            pos: 0,
            else_pop: false,
            need_try: false,
            variable_annotations: false,
            chain_pending: false,
            unpack: Vec::new(),
            last_cond: None,
        }
    }

    fn run(&mut self) -> Result<(), DepycError> {
        let mut cursor = InstrCursor::new(&self.code.code, self.version);
        while !cursor.at_end() {
            self.curpos = cursor.pos();
            let instr = cursor.next()?;
            self.pos = instr.next;

            if self.need_try && instr.opcode != Opcode::SetupExcept {
                self.need_try = false;
                // Save the stack for the handler blocks.
                self.hist.push(self.stack.clone());
                let end = self.cur().end;
                self.open(Block::new(BlockKind::Try, end));
            } else if self.else_pop && !is_branch(instr.opcode) {
                self.else_pop = false;
                self.close_ended_blocks()?;
            }

            self.enter_handler_blocks(instr.opcode);

            let was_chain = self.chain_pending;
            self.chain_pending = false;
            self.dispatch(&instr, &mut cursor, was_chain)?;

            if let Some(cur) = self.blocks.last() {
                if matches!(cur.kind, BlockKind::If { .. } | BlockKind::Elif { .. } | BlockKind::Else)
                    && cur.end != 0
                    && cur.end <= self.pos
                {
                    self.else_pop = true;
                }
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Block, DepycError> {
        while self.blocks.len() > 1 {
            if self.is_if_family() {
                self.hist.pop();
            }
            self.close()?;
            self.check_ternary();
        }
        if !self.hist.is_empty() {
            warn!(
                name = %self.code.name,
                depth = self.hist.len(),
                "stack history not empty after build"
            );
        }
        if !self.unpack.is_empty() {
            warn!(name = %self.code.name, "unfinished unpack target list");
            self.ctx.clean = false;
        }
        Ok(self.blocks.pop().expect("scope root"))
    }

    // ---- primitives -----------------------------------------------------

    fn cur(&mut self) -> &mut Block {
        self.blocks.last_mut().expect("block stack is never empty")
    }

    fn open(&mut self, block: Block) {
        debug!(kind = block.kind.label(), end = block.end, pos = self.curpos, "open block");
        self.blocks.push(block);
    }

    /// Pop the current block and append it to the new top's body.
    fn close(&mut self) -> Result<(), DepycError> {
        if self.blocks.len() == 1 {
            return Err(DepycError::BlockUnderflow { pos: self.curpos });
        }
        let block = self.blocks.pop().expect("checked above");
        debug!(kind = block.kind.label(), pos = self.curpos, "close block");
        self.cur().append(Node::Block(block));
        Ok(())
    }

    fn emit(&mut self, node: Node) {
        self.cur().append(node);
    }

    fn push(&mut self, node: Node) {
        self.stack.push(node);
    }

    fn pop(&mut self) -> Node {
        match self.stack.pop() {
            Some(node) => node,
            None => {
                self.soft("value stack underflow");
                Node::name("<unknown>")
            }
        }
    }

    fn pop_opt(&mut self) -> Option<Node> {
        self.stack.pop()
    }

    /// Pop `n` values, returned in push order.
    fn popn(&mut self, n: usize) -> Vec<Node> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.pop());
        }
        out.reverse();
        out
    }

    fn soft(&mut self, what: &str) {
        warn!(pos = self.curpos, name = %self.code.name, "{what}");
        self.ctx.clean = false;
    }

    /// Snapshot the stack, run `attempt`; restore on `None`, discard on
    /// `Some`.
    fn speculate<T>(&mut self, attempt: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        self.hist.push(self.stack.clone());
        match attempt(self) {
            Some(v) => {
                self.hist.pop();
                Some(v)
            }
            None => {
                self.stack = self.hist.pop().expect("snapshot pushed above");
                None
            }
        }
    }

    fn is_if_family(&self) -> bool {
        matches!(
            self.blocks.last().map(|b| &b.kind),
            Some(BlockKind::If { .. } | BlockKind::Elif { .. } | BlockKind::Else)
        )
    }

    // ---- block transitions ----------------------------------------------

    /// Close every block that has already ended, reducing or-pop condition
    /// blocks to `and`/`or` expressions and re-checking for ternaries after
    /// each close.
    fn close_ended_blocks(&mut self) -> Result<(), DepycError> {
        loop {
            let (ended, if_family) = {
                let cur = self.blocks.last().expect("non-empty");
                if cur.is_scope_root() || cur.is_container() {
                    break;
                }
                if cur.end == 0 {
                    break;
                }
                (cur.end <= self.curpos, self.is_if_family())
            };
            if !ended {
                break;
            }
            if self.reduce_or_pop()? {
                continue;
            }
            if if_family {
                self.hist.pop();
            }
            // An else branch holding only the compiler's cleanup pops adds
            // nothing to the output; in expression context it still feeds
            // the ternary recovery.
            let drop_empty_else = matches!(
                self.blocks.last(),
                Some(Block { kind: BlockKind::Else, body, .. }) if body.is_empty()
            ) && self.stack.is_empty();
            if drop_empty_else {
                self.blocks.pop();
                continue;
            }
            self.close()?;
            self.check_ternary();
        }
        Ok(())
    }

    /// An If opened by an or-pop jump with an empty body is a short-circuit
    /// operand, not a statement block.
    fn reduce_or_pop(&mut self) -> Result<bool, DepycError> {
        let is_reducible = matches!(
            self.blocks.last(),
            Some(Block {
                kind: BlockKind::If { or_pop: true, .. },
                body,
                ..
            }) if body.is_empty()
        ) && !self.stack.is_empty();
        if !is_reducible {
            return Ok(false);
        }
        let block = self.blocks.pop().expect("checked above");
        self.hist.pop();
        let (cond, negative) = match block.kind {
            BlockKind::If { cond, negative, .. } => (*cond, negative),
            _ => unreachable!("matched above"),
        };
        let rhs = self.pop();
        let op = if negative { BinOp::LogicalOr } else { BinOp::LogicalAnd };
        let merged = merge_logical(op, cond, rhs);
        self.push(merged);
        Ok(true)
    }

    /// Ternary recovery: an ELSE right after an IF, both leaving a value on
    /// the stack, collapses into a conditional expression.
    fn check_ternary(&mut self) {
        let ok = {
            let cur = self.blocks.last().expect("non-empty");
            let n = cur.body.len();
            self.stack.len() >= 2
                && n >= 2
                && matches!(cur.body[n - 1], Node::Block(Block { kind: BlockKind::Else, .. }))
                && matches!(cur.body[n - 2], Node::Block(Block { kind: BlockKind::If { .. }, .. }))
        };
        if !ok {
            return;
        }
        let orelse = self.pop();
        let cur = self.blocks.last_mut().expect("non-empty");
        cur.body.pop();
        let if_block = match cur.body.pop() {
            Some(Node::Block(b)) => b,
            _ => unreachable!("checked above"),
        };
        let then = self.pop();
        let (cond, negative) = match if_block.kind {
            BlockKind::If { cond, negative, .. } => (*cond, negative),
            _ => unreachable!("checked above"),
        };
        let cond = if negative {
            Node::Unary {
                op: UnaryOp::Not,
                operand: Box::new(cond),
            }
        } else {
            cond
        };
        self.push(Node::Ternary {
            cond: Box::new(cond),
            then: Box::new(then),
            orelse: Box::new(orelse),
        });
    }

    /// Open handler blocks when the scan reaches a container's recorded
    /// except/finally offsets.
    fn enter_handler_blocks(&mut self, opcode: Opcode) {
        let (except, finally) = match self.blocks.last().map(|b| &b.kind) {
            Some(&BlockKind::Container { except, finally }) => (except, finally),
            _ => return,
        };
        if except != 0 && self.curpos == except && opcode == Opcode::PopTop {
            // Bare `except:` handler: no match test, just stack cleanup.
            self.open(Block::new(BlockKind::Except { exc: None, name: None }, 0));
        } else if finally != 0 && self.curpos == finally {
            self.open(Block::new(BlockKind::Finally, 0));
        }
    }

    // ---- dispatch -------------------------------------------------------

    fn dispatch(
        &mut self,
        instr: &Instr,
        cursor: &mut InstrCursor,
        was_chain: bool,
    ) -> Result<(), DepycError> {
        use Opcode::*;
        let operand = instr.operand;
        match instr.opcode {
            // interpreter plumbing with no source-level effect
            StopCode | Nop | Cache | Resume | GenStart | ReturnGenerator | MakeCell
            | CopyFreeVars | Precall | GetIter | GetYieldFromIter | GetAwaitable | EndFor
            | Send | BeginFinally | CallFinally | WithExceptStart | Reraise | ExtendedArg => {}

            PushNull => self.push(Node::Null),
            PushExcInfo => self.push(Node::Null),

            PopTop => self.handle_pop_top(),
            RotTwo => self.rot(2),
            RotThree => self.rot(3),
            RotFour => self.rot(4),
            RotN => self.rot(operand as usize),
            DupTop => {
                if let Some(top) = self.stack.last().cloned() {
                    self.push(top);
                    self.chain_pending = true;
                }
            }
            DupTopTwo => {
                let n = self.stack.len();
                if n >= 2 {
                    let a = self.stack[n - 2].clone();
                    let b = self.stack[n - 1].clone();
                    self.push(a);
                    self.push(b);
                }
            }
            DupTopX => {
                let count = operand as usize;
                let n = self.stack.len();
                if count > 0 && n >= count {
                    for i in 0..count {
                        let v = self.stack[n - count + i].clone();
                        self.push(v);
                    }
                }
            }
            Swap => {
                let n = self.stack.len();
                let i = operand as usize;
                if i >= 2 && n >= i {
                    self.stack.swap(n - 1, n - i);
                }
            }
            Copy => {
                let n = self.stack.len();
                let i = operand as usize;
                if i >= 1 && n >= i {
                    let v = self.stack[n - i].clone();
                    self.push(v);
                }
            }

            UnaryPositive => self.unary(UnaryOp::Positive),
            UnaryNegative => self.unary(UnaryOp::Negative),
            UnaryNot => self.unary(UnaryOp::Not),
            UnaryInvert => self.unary(UnaryOp::Invert),
            UnaryConvert => self.unary(UnaryOp::Convert),

            BinaryAdd => self.binary(BinOp::Add),
            BinarySubtract => self.binary(BinOp::Subtract),
            BinaryMultiply => self.binary(BinOp::Multiply),
            BinaryDivide => self.binary(BinOp::Divide),
            BinaryTrueDivide => self.binary(BinOp::TrueDivide),
            BinaryFloorDivide => self.binary(BinOp::FloorDivide),
            BinaryModulo => self.binary(BinOp::Modulo),
            BinaryPower => self.binary(BinOp::Power),
            BinaryLshift => self.binary(BinOp::Lshift),
            BinaryRshift => self.binary(BinOp::Rshift),
            BinaryAnd => self.binary(BinOp::And),
            BinaryXor => self.binary(BinOp::Xor),
            BinaryOr => self.binary(BinOp::Or),
            BinaryMatrixMultiply => self.binary(BinOp::MatMultiply),
            InplaceAdd => self.binary(BinOp::InplaceAdd),
            InplaceSubtract => self.binary(BinOp::InplaceSubtract),
            InplaceMultiply => self.binary(BinOp::InplaceMultiply),
            InplaceDivide => self.binary(BinOp::InplaceDivide),
            InplaceTrueDivide => self.binary(BinOp::InplaceTrueDivide),
            InplaceFloorDivide => self.binary(BinOp::InplaceFloorDivide),
            InplaceModulo => self.binary(BinOp::InplaceModulo),
            InplacePower => self.binary(BinOp::InplacePower),
            InplaceLshift => self.binary(BinOp::InplaceLshift),
            InplaceRshift => self.binary(BinOp::InplaceRshift),
            InplaceAnd => self.binary(BinOp::InplaceAnd),
            InplaceXor => self.binary(BinOp::InplaceXor),
            InplaceOr => self.binary(BinOp::InplaceOr),
            InplaceMatrixMultiply => self.binary(BinOp::InplaceMatMultiply),
            BinaryOp => match crate::ast::BinOp::from_binary_op(operand) {
                Some(op) => self.binary(op),
                None => {
                    self.soft("unsupported BINARY_OP operand");
                    self.binary(crate::ast::BinOp::Add);
                }
            },

            CompareOp => self.handle_compare(operand),
            IsOp => {
                let op = if operand != 0 { CmpOp::IsNot } else { CmpOp::Is };
                self.compare_with(op);
            }
            ContainsOp => {
                let op = if operand != 0 { CmpOp::NotIn } else { CmpOp::In };
                self.compare_with(op);
            }

            BinarySubscr => {
                let index = self.pop();
                let value = self.pop();
                self.push(Node::Subscript {
                    value: Box::new(value),
                    index: Box::new(index),
                });
            }
            BuildSlice => self.handle_build_slice(operand),
            BinarySlice => {
                // 3.12 fused obj[a:b]
                let upper = self.pop();
                let lower = self.pop();
                let value = self.pop();
                let slice = make_slice(Some(lower), Some(upper));
                self.push(Node::Subscript {
                    value: Box::new(value),
                    index: Box::new(slice),
                });
            }
            StoreSliceOp => {
                let upper = self.pop();
                let lower = self.pop();
                let obj = self.pop();
                let slice = make_slice(Some(lower), Some(upper));
                let target = Node::Subscript {
                    value: Box::new(obj),
                    index: Box::new(slice),
                };
                self.do_store(target, was_chain)?;
            }
            SlicePlus0 | SlicePlus1 | SlicePlus2 | SlicePlus3 => {
                let node = self.old_slice(instr.opcode);
                self.push(node);
            }
            StoreSlicePlus0 | StoreSlicePlus1 | StoreSlicePlus2 | StoreSlicePlus3 => {
                let target = self.old_slice(op_store_to_load(instr.opcode));
                self.do_store(target, was_chain)?;
            }
            DeleteSlicePlus0 | DeleteSlicePlus1 | DeleteSlicePlus2 | DeleteSlicePlus3 => {
                let target = self.old_slice(op_delete_to_load(instr.opcode));
                self.emit(Node::Delete(Box::new(target)));
            }

            BuildTuple => {
                let values = self.popn(operand as usize);
                self.push(Node::Tuple(values));
            }
            BuildList => {
                let values = self.popn(operand as usize);
                self.push(Node::List(values));
            }
            BuildSet => {
                let values = self.popn(operand as usize);
                self.push(Node::Set(values));
            }
            BuildMap => self.handle_build_map(operand),
            BuildConstKeyMap => {
                let keys = match self.pop() {
                    Node::Object(Value::Tuple(keys)) => keys,
                    other => {
                        self.soft("BUILD_CONST_KEY_MAP without key tuple");
                        vec![Value::Str(format!("{other:?}"))]
                    }
                };
                let values = self.popn(operand as usize);
                self.push(Node::ConstMap { keys, values });
            }
            BuildString => {
                let parts = self.popn(operand as usize);
                self.push(Node::JoinedStr(parts));
            }
            FormatValue => {
                let format_spec = if operand & 0x4 != 0 {
                    Some(Box::new(self.pop()))
                } else {
                    None
                };
                let value = self.pop();
                self.push(Node::FormattedValue {
                    value: Box::new(value),
                    conversion: operand & 0x3,
                    format_spec,
                });
            }
            BuildTupleUnpack | BuildTupleUnpackWithCall => {
                let values = self.popn(operand as usize);
                self.push(Node::Tuple(star_all(values)));
            }
            BuildListUnpack => {
                let values = self.popn(operand as usize);
                self.push(Node::List(star_all(values)));
            }
            BuildSetUnpack => {
                let values = self.popn(operand as usize);
                self.push(Node::Set(star_all(values)));
            }
            BuildMapUnpack | BuildMapUnpackWithCall => {
                let values = self.popn(operand as usize);
                let mut pairs = Vec::new();
                for v in values {
                    match v {
                        Node::Map(inner) => pairs.extend(inner),
                        other => pairs.push((Node::Null, other)),
                    }
                }
                self.push(Node::Map(pairs));
            }
            StoreMap => {
                let key = self.pop();
                let value = self.pop();
                match self.stack.last_mut() {
                    Some(Node::Map(pairs)) => pairs.push((key, value)),
                    _ => self.soft("STORE_MAP without a map on the stack"),
                }
            }
            ListAppend | SetAdd => self.handle_comp_element(instr.opcode, operand),
            MapAdd => {
                let (key, value) = if self.version.at_least(3, 8) {
                    let value = self.pop();
                    let key = self.pop();
                    (key, value)
                } else {
                    let key = self.pop();
                    let value = self.pop();
                    (key, value)
                };
                self.emit(Node::CompElement {
                    key: Some(Box::new(key)),
                    value: Box::new(value),
                });
            }
            ListExtend => {
                let seq = self.pop();
                match (self.stack.last_mut(), seq) {
                    (Some(Node::List(items)), Node::Object(Value::Tuple(vs))) => {
                        items.extend(vs.into_iter().map(Node::Object));
                    }
                    (Some(Node::List(items)), other) => {
                        items.push(Node::Starred(Box::new(other)));
                    }
                    (_, _) => self.soft("LIST_EXTEND without a list on the stack"),
                }
            }
            SetUpdate => {
                let seq = self.pop();
                match (self.stack.last_mut(), seq) {
                    (Some(Node::Set(items)), Node::Object(Value::FrozenSet(vs) | Value::Tuple(vs))) => {
                        items.extend(vs.into_iter().map(Node::Object));
                    }
                    (Some(Node::Set(items)), other) => {
                        items.push(Node::Starred(Box::new(other)));
                    }
                    (_, _) => self.soft("SET_UPDATE without a set on the stack"),
                }
            }
            DictMerge | DictUpdate => {
                let other = self.pop();
                match (self.stack.last_mut(), other) {
                    (Some(Node::Map(pairs)), Node::Map(inner)) => pairs.extend(inner),
                    (Some(Node::Map(pairs)), Node::Object(Value::Dict(kvs))) => {
                        pairs.extend(
                            kvs.into_iter()
                                .map(|(k, v)| (Node::Object(k), Node::Object(v))),
                        );
                    }
                    (Some(Node::Map(pairs)), other) => pairs.push((Node::Null, other)),
                    (_, _) => self.soft("dict merge without a map on the stack"),
                }
            }
            ListToTuple => {
                if let Some(Node::List(items)) = self.pop_opt() {
                    self.push(Node::Tuple(items));
                } else {
                    self.soft("LIST_TO_TUPLE without a list on the stack");
                    self.push(Node::Tuple(Vec::new()));
                }
            }

            LoadConst => {
                let value = self.load_const(operand)?;
                self.push(Node::Object(value));
            }
            LoadName => {
                let name = self.load_name(operand)?;
                self.push(Node::Name(name));
            }
            LoadGlobal => {
                let idx = if self.version.at_least(3, 11) {
                    if operand & 1 != 0 {
                        self.push(Node::Null);
                    }
                    operand >> 1
                } else {
                    operand
                };
                let name = self.load_name(idx)?;
                self.push(Node::Name(name));
            }
            LoadFast | LoadFastCheck | LoadFastAndClear => {
                let name = self.load_local(operand)?;
                self.push(Node::Name(name));
            }
            LoadDeref | LoadClassDeref => {
                let name = self.load_deref(operand)?;
                self.push(Node::Name(name));
            }
            LoadClosure => {
                let name = self.load_deref(operand)?;
                self.push(Node::CellName(name));
            }
            LoadLocals => self.push(Node::Locals),
            LoadBuildClass => self.push(Node::LoadBuildClass),
            LoadAssertionError => self.push(Node::name("AssertionError")),
            LoadAttr => {
                let idx = if self.version.at_least(3, 12) {
                    operand >> 1
                } else {
                    operand
                };
                let name = self.load_name(idx)?;
                let obj = self.pop();
                self.push(Node::attr(obj, name));
            }
            LoadMethod => {
                let name = self.load_name(operand)?;
                let obj = self.pop();
                self.push(Node::attr(obj, name));
            }
            LoadSuperAttr => {
                let name = self.load_name(operand >> 2)?;
                let _self = self.pop();
                let _class = self.pop();
                let _super = self.pop();
                let call = Node::Call {
                    func: Box::new(Node::name("super")),
                    args: Vec::new(),
                    kwargs: Vec::new(),
                    star: None,
                    dstar: None,
                };
                self.push(Node::attr(call, name));
            }

            StoreName => {
                let name = self.load_name(operand)?;
                self.store_docstring_or(Node::Name(name), was_chain)?;
            }
            StoreFast => {
                let name = self.load_local(operand)?;
                self.do_store(Node::Name(name), was_chain)?;
            }
            StoreGlobal => {
                let name = self.load_name(operand)?;
                self.record_global(&name);
                self.do_store(Node::Name(name), was_chain)?;
            }
            StoreDeref => {
                let name = self.load_deref(operand)?;
                self.do_store(Node::Name(name), was_chain)?;
            }
            StoreAttr => {
                let name = self.load_name(operand)?;
                let obj = self.pop();
                self.do_store(Node::attr(obj, name), was_chain)?;
            }
            StoreSubscr => self.handle_store_subscr(was_chain)?,
            StoreLocals => {
                let _ = self.pop_opt();
            }
            StoreAnnotation => {
                let name = self.load_name(operand)?;
                let annotation = self.pop();
                self.emit_annotation(Node::Name(name), annotation);
            }
            SetupAnnotations => self.variable_annotations = true,

            DeleteName | DeleteGlobal => {
                let name = self.load_name(operand)?;
                if !self.suppress_except_cleanup(&name) {
                    self.emit(Node::Delete(Box::new(Node::Name(name))));
                }
            }
            DeleteFast => {
                let name = self.load_local(operand)?;
                if !self.suppress_except_cleanup(&name) {
                    self.emit(Node::Delete(Box::new(Node::Name(name))));
                }
            }
            DeleteDeref => {
                let name = self.load_deref(operand)?;
                self.emit(Node::Delete(Box::new(Node::Name(name))));
            }
            DeleteAttr => {
                let name = self.load_name(operand)?;
                let obj = self.pop();
                self.emit(Node::Delete(Box::new(Node::attr(obj, name))));
            }
            DeleteSubscr => {
                let index = self.pop();
                let value = self.pop();
                self.emit(Node::Delete(Box::new(Node::Subscript {
                    value: Box::new(value),
                    index: Box::new(index),
                })));
            }

            UnpackSequence => {
                let count = operand as usize;
                if count == 0 {
                    let value = self.pop();
                    self.emit(Node::Store {
                        value: Box::new(value),
                        target: Box::new(Node::Tuple(Vec::new())),
                    });
                } else {
                    self.unpack.push(UnpackFrame {
                        remaining: count,
                        targets: Vec::new(),
                        star_index: None,
                    });
                }
            }
            UnpackEx => {
                let before = (operand & 0xFF) as usize;
                let after = (operand >> 8) as usize;
                self.unpack.push(UnpackFrame {
                    remaining: before + after + 1,
                    targets: Vec::new(),
                    star_index: Some(before),
                });
            }

            ImportName => self.handle_import_name(operand)?,
            ImportFrom => {
                let name = self.load_name(operand)?;
                self.push(Node::ImportFrom(name));
            }
            ImportStar => {
                if let Node::Import {
                    module,
                    fromlist,
                    level,
                    alias,
                    mut imports,
                } = self.pop()
                {
                    imports.push(("*".to_string(), None));
                    self.emit(Node::Import {
                        module,
                        fromlist,
                        level,
                        alias,
                        imports,
                    });
                } else {
                    self.soft("IMPORT_STAR without import on the stack");
                }
            }

            JumpIfFalse | JumpIfTrue => self.handle_peek_jump(instr),
            PopJumpIfFalse | PopJumpIfTrue | PopJumpBackwardIfFalse | PopJumpBackwardIfTrue
            | JumpIfFalseOrPop | JumpIfTrueOrPop | PopJumpIfNone | PopJumpIfNotNone
            | PopJumpBackwardIfNone | PopJumpBackwardIfNotNone => {
                self.handle_cond_jump(instr)
            }
            JumpIfNotExcMatch => {
                let exc = self.pop();
                let _dup = self.pop_opt();
                let target = jump_target(self.version, instr);
                if self.cur().is_container() {
                    self.update_container_except(target);
                    self.open(Block::new(
                        BlockKind::Except {
                            exc: Some(Box::new(exc)),
                            name: None,
                        },
                        0,
                    ));
                }
            }
            JumpForward => {
                let target = jump_target(self.version, instr);
                self.handle_forward_jump(target, cursor)?;
            }
            JumpAbsolute | JumpBackward | JumpBackwardNoInterrupt => {
                let target = jump_target(self.version, instr);
                if target <= self.curpos {
                    self.handle_backward_jump(target)?;
                } else {
                    self.handle_forward_jump(target, cursor)?;
                }
            }
            ContinueLoop => self.emit(Node::Keyword(KeywordKind::Continue)),
            BreakLoop => self.emit(Node::Keyword(KeywordKind::Break)),

            ForIter => {
                let target = jump_target(self.version, instr);
                let iter = self.pop();
                if matches!(
                    self.blocks.last(),
                    Some(Block { kind: BlockKind::While { cond: None, .. }, inited: false, .. })
                ) {
                    // SETUP_LOOP opened a generic loop; the iterator makes
                    // it a for.
                    self.blocks.pop();
                }
                self.open(Block::new(
                    BlockKind::For {
                        iter: Box::new(iter),
                        index: None,
                    },
                    target,
                ));
            }
            ForLoop => {
                let target = jump_target(self.version, instr);
                let _counter = self.pop();
                let iter = self.pop();
                if matches!(
                    self.blocks.last(),
                    Some(Block { kind: BlockKind::While { cond: None, .. }, inited: false, .. })
                ) {
                    self.blocks.pop();
                }
                self.open(Block::new(
                    BlockKind::For {
                        iter: Box::new(iter),
                        index: None,
                    },
                    target,
                ));
            }
            SetupLoop => {
                let target = jump_target(self.version, instr);
                self.open(Block::new(
                    BlockKind::While {
                        cond: None,
                        negative: false,
                    },
                    target,
                ));
            }
            PopBlock => self.handle_pop_block()?,

            SetupExcept => {
                let target = jump_target(self.version, instr);
                if self.cur().is_container() {
                    self.update_container_except(target);
                } else {
                    let mut block = Block::new(BlockKind::Container { except: target, finally: 0 }, target);
                    block.inited = true;
                    self.open(block);
                }
                self.need_try = true;
            }
            SetupFinally => {
                let target = jump_target(self.version, instr);
                if self.version.at_least(3, 8) {
                    // 3.8+ uses SETUP_FINALLY for both except and finally
                    // containers; the handler shape decides later.
                    let block = Block::new(BlockKind::Container { except: target, finally: 0 }, target);
                    self.open(block);
                    self.need_try = true;
                } else if self.cur().is_container() {
                    if let BlockKind::Container { finally, .. } = &mut self.cur().kind {
                        *finally = target;
                    }
                } else {
                    let block = Block::new(BlockKind::Container { except: 0, finally: target }, target);
                    self.open(block);
                    self.need_try = true;
                }
            }
            SetupWith | BeforeWith => {
                let target = if instr.opcode == Opcode::SetupWith {
                    jump_target(self.version, instr)
                } else {
                    0
                };
                let expr = self.pop();
                self.open(Block::new(
                    BlockKind::With {
                        expr: Box::new(expr),
                        var: None,
                    },
                    target,
                ));
            }
            PopExcept => {
                if matches!(self.cur().kind, BlockKind::Except { .. }) {
                    self.close()?;
                }
            }
            EndFinally => self.handle_end_finally()?,
            PopFinally | WithCleanup | WithCleanupStart | WithCleanupFinish => {
                if matches!(self.stack.last(), Some(n) if n.is_none_literal()) {
                    self.pop_opt();
                }
            }
            CheckExcMatch => {
                let exc = self.pop();
                let left = self.pop_opt().unwrap_or(Node::Null);
                self.push(Node::Compare {
                    left: Box::new(left),
                    ops: vec![(CmpOp::ExceptionMatch, exc)],
                });
            }

            RaiseVarargs => {
                let args = self.popn(operand as usize);
                self.emit(Node::Raise(args));
            }
            ReturnValue => {
                let value = self.pop();
                self.emit(Node::Return(Some(Box::new(value))));
            }
            ReturnConst => {
                let value = self.load_const(operand)?;
                self.emit(Node::Return(Some(Box::new(Node::Object(value)))));
            }
            YieldValue => {
                let value = self.pop();
                self.push(Node::Yield {
                    value: Some(Box::new(value)),
                    from: false,
                });
            }
            YieldFrom => {
                let sent = self.pop();
                let value = if sent.is_none_literal() { self.pop() } else { sent };
                self.push(Node::Yield {
                    value: Some(Box::new(value)),
                    from: true,
                });
            }

            KwNames => self.handle_kw_names(operand)?,
            CallFunction | Call | CallMethod | CallFunctionVar | CallFunctionKw
            | CallFunctionVarKw | CallFunctionEx => self.handle_call(instr.opcode, operand)?,
            MakeFunction => self.handle_make_function(operand, false),
            MakeClosure => self.handle_make_function(operand, true),
            BuildClass => {
                let builder = self.pop();
                let bases = self.pop();
                let name = self.pop();
                self.push(Node::Class {
                    builder: Box::new(builder),
                    bases: Box::new(bases),
                    name: Box::new(name),
                });
            }
            BuildFunction => {
                let code = match self.pop() {
                    Node::Object(v @ Value::Code(_)) => v,
                    _ => {
                        self.soft("BUILD_FUNCTION without code object");
                        Value::None
                    }
                };
                self.push(Node::Function {
                    code,
                    defaults: Vec::new(),
                    kw_defaults: Vec::new(),
                });
            }

            PrintExpr => {
                let value = self.pop();
                if value.is_statement_worthy() {
                    self.emit(value);
                }
            }
            PrintItem => {
                let value = self.pop();
                self.append_print(Some(value), None, false);
            }
            PrintNewline => self.append_print(None, None, true),
            PrintItemTo => {
                let stream = self.pop();
                let value = self.pop();
                self.append_print(Some(value), Some(stream), false);
            }
            PrintNewlineTo => {
                let stream = self.pop();
                self.append_print(None, Some(stream), true);
            }
            ExecStmt => {
                let locals = self.pop();
                let globals = self.pop();
                let stmt = self.pop();
                let globals_opt = if globals.is_none_literal() { None } else { Some(globals) };
                let locals_opt = match (&globals_opt, locals) {
                    (_, l) if l.is_none_literal() => None,
                    (Some(g), l) if *g == l => None,
                    (_, l) => Some(l),
                };
                self.emit(Node::Exec {
                    stmt: Box::new(stmt),
                    globals: globals_opt.map(Box::new),
                    locals: locals_opt.map(Box::new),
                });
            }
        }
        Ok(())
    }

    // ---- operand resolution ---------------------------------------------

    fn load_const(&mut self, idx: u32) -> Result<Value, DepycError> {
        self.code
            .get_const(idx)
            .cloned()
            .ok_or(DepycError::BadConstIndex { index: idx, pos: self.curpos })
    }

    fn load_name(&mut self, idx: u32) -> Result<String, DepycError> {
        self.code
            .name_at(idx)
            .map(str::to_owned)
            .ok_or(DepycError::BadNameIndex { index: idx, pos: self.curpos })
    }

    fn load_local(&mut self, idx: u32) -> Result<String, DepycError> {
        self.code
            .local_at(idx)
            .map(str::to_owned)
            .ok_or(DepycError::BadNameIndex { index: idx, pos: self.curpos })
    }

    fn load_deref(&mut self, idx: u32) -> Result<String, DepycError> {
        self.code
            .deref_at(idx)
            .map(str::to_owned)
            .ok_or(DepycError::BadNameIndex { index: idx, pos: self.curpos })
    }

    // ---- expression helpers ---------------------------------------------

    fn unary(&mut self, op: UnaryOp) {
        let operand = self.pop();
        self.push(Node::Unary {
            op,
            operand: Box::new(operand),
        });
    }

    fn binary(&mut self, op: BinOp) {
        let right = self.pop();
        let left = self.pop();
        self.push(Node::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
    }

    fn handle_compare(&mut self, operand: u32) {
        let idx = if self.version.at_least(3, 12) {
            operand >> 4
        } else {
            operand
        };
        let op = match CmpOp::from_operand(idx) {
            Some(op) => op,
            None => {
                self.soft("unknown COMPARE_OP operand");
                CmpOp::Equal
            }
        };
        if op == CmpOp::ExceptionMatch {
            // Handler dispatch; the duplicated exception may be absent from
            // the simulated stack.
            let right = self.pop();
            let left = self.pop_opt().unwrap_or(Node::Null);
            self.push(Node::Compare {
                left: Box::new(left),
                ops: vec![(op, right)],
            });
        } else {
            self.compare_with(op);
        }
    }

    fn compare_with(&mut self, op: CmpOp) {
        let right = self.pop();
        let left = self.pop();
        self.push(Node::Compare {
            left: Box::new(left),
            ops: vec![(op, right)],
        });
    }

    fn old_slice(&mut self, load_kind: Opcode) -> Node {
        let (lower, upper) = match load_kind {
            Opcode::SlicePlus1 => {
                let lower = self.pop();
                (Some(lower), None)
            }
            Opcode::SlicePlus2 => {
                let upper = self.pop();
                (None, Some(upper))
            }
            Opcode::SlicePlus3 => {
                let upper = self.pop();
                let lower = self.pop();
                (Some(lower), Some(upper))
            }
            _ => (None, None),
        };
        let obj = self.pop();
        Node::Subscript {
            value: Box::new(obj),
            index: Box::new(make_slice(lower, upper)),
        }
    }

    fn handle_build_slice(&mut self, operand: u32) {
        if operand == 3 {
            let step = self.pop();
            let upper = self.pop();
            let lower = self.pop();
            let lhs = make_slice(none_to_opt(lower), none_to_opt(upper));
            // A stepped slice nests: [[a:b]:c].
            let step = none_to_opt(step);
            let kind = if step.is_some() { SliceKind::Slice3 } else { SliceKind::Slice1 };
            self.push(Node::Slice {
                kind,
                lower: Some(Box::new(lhs)),
                upper: step.map(Box::new),
            });
        } else {
            let upper = self.pop();
            let lower = self.pop();
            self.push(make_slice(none_to_opt(lower), none_to_opt(upper)));
        }
    }

    fn handle_build_map(&mut self, operand: u32) {
        if self.version.at_least(3, 5) {
            let mut pairs = Vec::with_capacity(operand as usize);
            for _ in 0..operand {
                let value = self.pop();
                let key = self.pop();
                pairs.push((key, value));
            }
            pairs.reverse();
            self.push(Node::Map(pairs));
        } else {
            // Old compilers build an empty map filled by STORE_MAP. A chain
            // store sentinel may sit on top; drop it only when present.
            if matches!(self.stack.last(), Some(Node::ChainStore { .. })) {
                self.pop_opt();
            }
            self.push(Node::Map(Vec::new()));
        }
    }

    fn handle_comp_element(&mut self, opcode: Opcode, _operand: u32) {
        let value = self.pop();
        let in_comprehension = matches!(
            self.blocks.first().map(|b| &b.kind),
            Some(BlockKind::Comprehension)
        );
        if in_comprehension {
            self.emit(Node::CompElement {
                key: None,
                value: Box::new(value),
            });
        } else {
            // Inline 2.x list comprehensions append through a hidden local.
            let method = if opcode == Opcode::SetAdd { "add" } else { "append" };
            let receiver = self.pop_opt().unwrap_or(Node::name("_"));
            self.push(receiver.clone());
            self.emit(Node::Call {
                func: Box::new(Node::attr(receiver, method)),
                args: vec![value],
                kwargs: Vec::new(),
                star: None,
                dstar: None,
            });
        }
    }

    // ---- stores ----------------------------------------------------------

    fn record_global(&mut self, name: &str) {
        let root = self.blocks.first_mut().expect("non-empty");
        if matches!(root.kind, BlockKind::Function) && !root.globals.iter().any(|g| g == name) {
            root.globals.push(name.to_owned());
        }
    }

    /// STORE_NAME with docstring hoisting and class-prelude suppression.
    fn store_docstring_or(&mut self, target: Node, was_chain: bool) -> Result<(), DepycError> {
        if let Node::Name(name) = &target {
            let at_root = self.blocks.len() == 1;
            if at_root {
                let root_kind = self.blocks[0].kind.clone();
                if name == "__doc__" && self.blocks[0].body.is_empty() {
                    if let Some(Node::Object(v @ (Value::Str(_) | Value::Unicode(_)))) =
                        self.stack.last().cloned()
                    {
                        self.pop_opt();
                        self.blocks[0].docstring = Some(v);
                        return Ok(());
                    }
                }
                if matches!(root_kind, BlockKind::Class)
                    && (name == "__module__" || name == "__qualname__")
                {
                    self.pop_opt();
                    return Ok(());
                }
            }
        }
        self.do_store(target, was_chain)
    }

    fn do_store(&mut self, target: Node, was_chain: bool) -> Result<(), DepycError> {
        if let Some(frame) = self.unpack.last_mut() {
            let target = if frame.star_index == Some(frame.targets.len()) {
                Node::Starred(Box::new(target))
            } else {
                target
            };
            frame.targets.push(target);
            frame.remaining -= 1;
            if frame.remaining == 0 {
                let frame = self.unpack.pop().expect("checked above");
                // A completed inner frame is one target of the frame below
                // it; the outermost one performs the store.
                return self.do_store(Node::Tuple(frame.targets), false);
            }
            return Ok(());
        }
        self.finish_store(target, was_chain)
    }

    fn finish_store(&mut self, target: Node, was_chain: bool) -> Result<(), DepycError> {
        // Loop/with/except binders capture the first store.
        enum Binder {
            No,
            For,
            With,
            ExceptName,
            ExceptBody,
        }
        let binder = {
            let cur = self.blocks.last().expect("non-empty");
            if cur.inited {
                Binder::No
            } else {
                match &cur.kind {
                    BlockKind::For { .. } => Binder::For,
                    BlockKind::With { .. } => Binder::With,
                    // The exception value itself is not simulated; a missing
                    // operand marks this store as the `as name` binder.
                    BlockKind::Except { .. } if self.stack.is_empty() && cur.body.is_empty() => {
                        Binder::ExceptName
                    }
                    BlockKind::Except { .. } => Binder::ExceptBody,
                    _ => Binder::No,
                }
            }
        };
        match binder {
            Binder::For => {
                let cur = self.cur();
                if let BlockKind::For { index, .. } = &mut cur.kind {
                    *index = Some(Box::new(target));
                }
                cur.inited = true;
                return Ok(());
            }
            Binder::With => {
                let cur = self.cur();
                if let BlockKind::With { var, .. } = &mut cur.kind {
                    *var = Some(Box::new(target));
                }
                cur.inited = true;
                return Ok(());
            }
            Binder::ExceptName => {
                let cur = self.cur();
                if let BlockKind::Except { name, .. } = &mut cur.kind {
                    *name = Some(Box::new(target));
                }
                cur.inited = true;
                return Ok(());
            }
            Binder::ExceptBody => self.cur().inited = true,
            Binder::No => {}
        }

        let value = self.pop();

        // `from x import a, b` collects its binders on the import node.
        if let Node::ImportFrom(imported) = value {
            let alias = match &target {
                Node::Name(n) if *n != imported => Some(n.clone()),
                _ => None,
            };
            match self.stack.last_mut() {
                Some(Node::Import { imports, .. }) => imports.push((imported, alias)),
                _ => self.soft("IMPORT_FROM store without import on the stack"),
            }
            return Ok(());
        }
        if let Node::Import {
            module,
            fromlist,
            level,
            imports,
            ..
        } = value
        {
            // `import a.b` binds the first dotted component; anything else
            // is an `as` alias.
            let alias = match &target {
                Node::Name(n) if module.split('.').next() != Some(n.as_str()) => Some(n.clone()),
                _ => None,
            };
            self.emit(Node::Import {
                module,
                fromlist,
                level,
                alias,
                imports,
            });
            return Ok(());
        }

        // Chained assignment: the duplicated value absorbs targets.
        if let Node::ChainStore { mut targets, value } = value {
            targets.push(target);
            if self.stack.last() == Some(value.as_ref()) {
                self.pop_opt();
                self.push(Node::ChainStore { targets, value });
            } else {
                self.emit(Node::Store {
                    value: value.clone(),
                    target: Box::new(Node::ChainStore {
                        targets,
                        value,
                    }),
                });
            }
            return Ok(());
        }
        if was_chain && self.stack.last() == Some(&value) {
            self.pop_opt();
            self.push(Node::ChainStore {
                targets: vec![target],
                value: Box::new(value),
            });
            return Ok(());
        }

        // `except E as e` epilogue stores None into the binder; drop it.
        if value.is_none_literal() {
            if let Node::Name(n) = &target {
                if self.in_except_named(n) {
                    return Ok(());
                }
            }
        }

        self.emit(Node::Store {
            value: Box::new(value),
            target: Box::new(target),
        });
        Ok(())
    }

    fn in_except_named(&self, name: &str) -> bool {
        self.blocks.iter().any(|b| {
            matches!(
                &b.kind,
                BlockKind::Except { name: Some(n), .. }
                    if matches!(n.as_ref(), Node::Name(s) if s == name)
            )
        })
    }

    fn suppress_except_cleanup(&self, name: &str) -> bool {
        self.in_except_named(name)
    }

    fn handle_store_subscr(&mut self, was_chain: bool) -> Result<(), DepycError> {
        let index = self.pop();
        let obj = self.pop();
        if self.variable_annotations {
            if let Node::Name(container) = &obj {
                if container == "__annotations__" {
                    let annotation = self.pop();
                    let target = match index {
                        Node::Object(Value::Str(s) | Value::Unicode(s)) => Node::Name(s),
                        other => other,
                    };
                    self.emit_annotation(target, annotation);
                    return Ok(());
                }
            }
        }
        self.do_store(
            Node::Subscript {
                value: Box::new(obj),
                index: Box::new(index),
            },
            was_chain,
        )
    }

    fn emit_annotation(&mut self, target: Node, annotation: Node) {
        // Merge with the value stored just before, when present.
        let prev_matches = matches!(target, Node::Name(_))
            && matches!(
                self.blocks.last().and_then(|b| b.body.last()),
                Some(Node::Store { target: t, .. }) if **t == target
            );
        let merged = if prev_matches {
            match self.cur().body.pop() {
                Some(Node::Store { value, .. }) => Some(value),
                _ => None,
            }
        } else {
            None
        };
        self.emit(Node::AnnotatedAssign {
            target: Box::new(target),
            annotation: Box::new(annotation),
            value: merged,
        });
    }

    // ---- pops and prints -------------------------------------------------

    fn handle_pop_top(&mut self) {
        let node = match self.pop_opt() {
            Some(node) => node,
            None => {
                if matches!(self.cur().kind, BlockKind::With { .. }) && !self.cur().inited {
                    self.cur().inited = true;
                }
                return;
            }
        };
        if self.last_cond.as_ref() == Some(&node) {
            // Branch cleanup of a peeked condition (pre-2.7 jumps).
            return;
        }
        if let Node::Import { .. } = &node {
            self.emit(node);
            return;
        }
        if node.is_statement_worthy() {
            self.emit(node);
        }
    }

    fn rot(&mut self, n: usize) {
        let len = self.stack.len();
        if n >= 2 && len >= n {
            let top = self.stack.remove(len - 1);
            self.stack.insert(len - n, top);
        }
    }

    fn append_print(&mut self, value: Option<Node>, stream: Option<Node>, newline: bool) {
        // Accumulate consecutive items into one print statement.
        if let Some(Node::Print {
            values,
            stream: prev_stream,
            eol,
        }) = self.cur().body.last_mut()
        {
            if !*eol && prev_stream.as_deref() == stream.as_ref() {
                if let Some(v) = value {
                    values.push(v);
                }
                if newline {
                    *eol = true;
                }
                return;
            }
        }
        self.emit(Node::Print {
            values: value.into_iter().collect(),
            stream: stream.map(Box::new),
            eol: newline,
        });
    }

    // ---- imports ---------------------------------------------------------

    fn handle_import_name(&mut self, operand: u32) -> Result<(), DepycError> {
        let module = self.load_name(operand)?;
        let (fromlist, level) = if self.version.at_least(2, 5) {
            let fromlist = self.pop();
            let level = self.pop();
            let level = match level {
                Node::Object(Value::Int(n)) => n,
                _ => -1,
            };
            (fromlist, level)
        } else if self.version.at_least(2, 0) {
            (self.pop(), -1)
        } else {
            (Node::Object(Value::None), -1)
        };
        self.push(Node::Import {
            module,
            fromlist: Box::new(fromlist),
            level,
            alias: None,
            imports: Vec::new(),
        });
        Ok(())
    }

    // ---- conditional jumps and loops -------------------------------------

    /// Pre-2.7 conditional jumps peek the condition; both branches clean it
    /// up with an explicit POP_TOP.
    fn handle_peek_jump(&mut self, instr: &Instr) {
        let negative = instr.opcode == Opcode::JumpIfTrue;
        let cond = match self.stack.last() {
            Some(c) => c.clone(),
            None => {
                self.soft("conditional jump with empty stack");
                Node::name("<unknown>")
            }
        };
        self.last_cond = Some(cond.clone());
        let target = jump_target(self.version, instr);
        self.open_cond_block(cond, negative, true, target);
    }

    fn handle_cond_jump(&mut self, instr: &Instr) {
        use Opcode::*;
        let negative = matches!(
            instr.opcode,
            PopJumpIfTrue | PopJumpBackwardIfTrue | JumpIfTrueOrPop | PopJumpIfNotNone
                | PopJumpBackwardIfNotNone
        );
        let or_pop = matches!(instr.opcode, JumpIfFalseOrPop | JumpIfTrueOrPop);
        let mut cond = self.pop();
        if matches!(
            instr.opcode,
            PopJumpIfNone | PopJumpIfNotNone | PopJumpBackwardIfNone | PopJumpBackwardIfNotNone
        ) {
            cond = Node::Compare {
                left: Box::new(cond),
                ops: vec![(CmpOp::Is, Node::Object(Value::None))],
            };
        }
        let target = jump_target(self.version, instr);

        if is_backward_jump(instr.opcode) || target <= self.curpos {
            // Bottom-tested loop; render as a conditional continue.
            let mut block = Block::new(
                BlockKind::If {
                    cond: Box::new(cond),
                    negative: !negative,
                    or_pop: false,
                },
                self.pos,
            );
            block.inited = true;
            block.append(Node::Keyword(KeywordKind::Continue));
            self.cur().append(Node::Block(block));
            return;
        }

        // Exception dispatch: the match test selects the handler.
        if self.cur().is_container() {
            if let Node::Compare { ops, .. } = &cond {
                if matches!(ops.first(), Some((CmpOp::ExceptionMatch, _))) {
                    let exc = ops[0].1.clone();
                    self.update_container_except(target);
                    self.open(Block::new(
                        BlockKind::Except {
                            exc: Some(Box::new(exc)),
                            name: None,
                        },
                        0,
                    ));
                    return;
                }
            }
        }

        // An uninitialized loop condition block takes the first test.
        if matches!(
            self.blocks.last(),
            Some(Block { kind: BlockKind::While { cond: None, .. }, inited: false, .. })
        ) {
            let cur = self.cur();
            if let BlockKind::While { cond: c, negative: n } = &mut cur.kind {
                *c = Some(Box::new(cond));
                *n = negative;
            }
            cur.inited = true;
            cur.end = target;
            return;
        }

        self.open_cond_block(cond, negative, or_pop, target);
    }

    fn open_cond_block(&mut self, cond: Node, negative: bool, or_pop: bool, target: u32) {
        // `else: if` with nothing between collapses to elif; its body runs
        // to the new test's jump target.
        if matches!(self.cur().kind, BlockKind::Else) && self.cur().body.is_empty() {
            let cur = self.cur();
            cur.kind = BlockKind::Elif {
                cond: Box::new(cond),
                negative,
            };
            cur.end = target;
            cur.inited = true;
            return;
        }
        // `if a and b:` produces two tests against the same join point.
        let mergeable = matches!(
            self.blocks.last(),
            Some(Block {
                kind: BlockKind::If { negative: n, or_pop: false, .. },
                body,
                end,
                ..
            }) if body.is_empty() && *end == target && *n == negative && !or_pop
        );
        if mergeable {
            let block = self.blocks.pop().expect("checked above");
            self.hist.pop();
            if let BlockKind::If { cond: prev, .. } = block.kind {
                let merged = merge_logical(BinOp::LogicalAnd, *prev, cond);
                let mut b = Block::new(
                    BlockKind::If {
                        cond: Box::new(merged),
                        negative,
                        or_pop: false,
                    },
                    target,
                );
                b.inited = true;
                self.hist.push(self.stack.clone());
                self.open(b);
            }
            return;
        }

        let mut block = Block::new(
            BlockKind::If {
                cond: Box::new(cond),
                negative,
                or_pop,
            },
            target,
        );
        block.inited = true;
        self.hist.push(self.stack.clone());
        self.open(block);
    }

    fn handle_forward_jump(
        &mut self,
        target: u32,
        cursor: &mut InstrCursor,
    ) -> Result<(), DepycError> {
        if or_pop_reducible(self.blocks.last().expect("non-empty"), &self.stack) {
            // Short-circuit operand: fold and step over the dead cleanup
            // branch, which is only reachable through the folded jump.
            self.reduce_or_pop()?;
            cursor.jump_to(target);
            self.pos = cursor.pos();
            return Ok(());
        }
        let cur_kind = self.blocks.last().expect("non-empty").kind.clone();
        match cur_kind {
            BlockKind::If { .. } | BlockKind::Elif { .. } => {
                let end = self.blocks.last().unwrap().end;
                if target > end {
                    // Jump over the else branch.
                    let block = self.blocks.pop().expect("non-empty");
                    self.cur().append(Node::Block(block));
                    self.open(Block::new(BlockKind::Else, target));
                    self.else_pop = true;
                } else {
                    self.else_pop = true;
                }
                Ok(())
            }
            BlockKind::Except { .. } => {
                self.close()?;
                if self.cur().is_container() && target > self.cur().end {
                    self.cur().end = target;
                }
                Ok(())
            }
            BlockKind::Container { .. } => {
                if target > self.cur().end {
                    self.cur().end = target;
                }
                Ok(())
            }
            BlockKind::For { .. } | BlockKind::While { .. } => {
                let end = self.blocks.last().unwrap().end;
                if target >= end && end != 0 {
                    self.emit(Node::Keyword(KeywordKind::Break));
                } else {
                    self.else_pop = true;
                }
                Ok(())
            }
            _ => {
                self.else_pop = true;
                Ok(())
            }
        }
    }

    fn handle_backward_jump(&mut self, _target: u32) -> Result<(), DepycError> {
        let (at_loop_bottom, if_to_while) = {
            let cur = self.blocks.last().expect("non-empty");
            let ended = cur.end != 0 && self.pos >= cur.end;
            (
                cur.is_loop() && ended,
                ended && matches!(cur.kind, BlockKind::If { .. }),
            )
        };
        if at_loop_bottom {
            // Loop bottom; the block closes here.
            self.close()?;
            return Ok(());
        }
        if if_to_while {
            // A conditional that jumps back to its own test is a while loop
            // in disguise (3.8+ dropped SETUP_LOOP).
            let cur = self.cur();
            if let BlockKind::If { cond, negative, .. } = cur.kind.clone() {
                cur.kind = BlockKind::While {
                    cond: Some(cond),
                    negative,
                };
            }
            self.hist.pop();
            self.close()?;
            return Ok(());
        }
        if self.blocks.iter().any(|b| b.is_loop()) {
            self.emit(Node::Keyword(KeywordKind::Continue));
        }
        Ok(())
    }

    fn handle_pop_block(&mut self) -> Result<(), DepycError> {
        match self.blocks.last().expect("non-empty").kind {
            BlockKind::Try => {
                self.close()?;
                if let Some(saved) = self.hist.pop() {
                    self.stack = saved;
                }
            }
            BlockKind::For { .. } | BlockKind::While { .. } | BlockKind::With { .. } => {
                self.close()?;
            }
            _ => {}
        }
        Ok(())
    }

    fn update_container_except(&mut self, next_handler: u32) {
        if let BlockKind::Container { except, .. } = &mut self.cur().kind {
            *except = next_handler;
        }
    }

    fn handle_end_finally(&mut self) -> Result<(), DepycError> {
        if matches!(self.stack.last(), Some(n) if n.is_none_literal()) {
            self.pop_opt();
        }
        match self.blocks.last().expect("non-empty").kind {
            BlockKind::Except { .. } => {
                self.close()?;
                if self.cur().is_container() {
                    self.close()?;
                    self.check_ternary();
                }
            }
            BlockKind::Finally => {
                self.close()?;
                if self.cur().is_container() {
                    self.close()?;
                }
            }
            BlockKind::Container { .. } => {
                self.close()?;
            }
            _ => {}
        }
        Ok(())
    }

    // ---- calls and definitions -------------------------------------------

    fn handle_kw_names(&mut self, operand: u32) -> Result<(), DepycError> {
        let names = match self.load_const(operand)? {
            Value::Tuple(names) => names,
            _ => {
                self.soft("KW_NAMES without a name tuple");
                return Ok(());
            }
        };
        let mut pairs = Vec::with_capacity(names.len());
        for name in names.into_iter().rev() {
            let value = self.pop();
            pairs.push((Node::Object(name), value));
        }
        pairs.reverse();
        self.push(Node::KwNamesMap(pairs));
        Ok(())
    }

    fn handle_call(&mut self, opcode: Opcode, operand: u32) -> Result<(), DepycError> {
        use Opcode::*;

        if matches!(opcode, CallFunction | Call) {
            if let Some(class) = self.try_build_class() {
                self.push(class);
                return Ok(());
            }
        }

        let mut star: Option<Node> = None;
        let mut dstar: Option<Node> = None;
        let mut kwargs: Vec<(Node, Node)> = Vec::new();
        let mut pos_count;

        match opcode {
            CallFunctionEx => {
                if operand & 1 != 0 {
                    dstar = Some(self.pop());
                }
                let args = self.pop();
                let callee = self.pop();
                if matches!(self.stack.last(), Some(Node::Null)) {
                    self.pop_opt();
                }
                let (args, star_arg) = match args {
                    Node::Tuple(items) => split_starred(items),
                    Node::Object(Value::Tuple(vs)) => {
                        (vs.into_iter().map(Node::Object).collect(), None)
                    }
                    other => (Vec::new(), Some(other)),
                };
                let dstar = match dstar {
                    Some(Node::Map(pairs)) if pairs.len() == 1 && pairs[0].0 == Node::Null => {
                        Some(pairs.into_iter().next().expect("len checked").1)
                    }
                    other => other,
                };
                self.finish_call(callee, args, Vec::new(), star_arg, dstar);
                return Ok(());
            }
            CallFunctionKw if self.version.at_least(3, 6) => {
                let names = match self.pop() {
                    Node::Object(Value::Tuple(names)) => names,
                    _ => {
                        self.soft("CALL_FUNCTION_KW without a name tuple");
                        Vec::new()
                    }
                };
                let mut values = self.popn(operand as usize);
                let split = values.len().saturating_sub(names.len());
                let kw_values = values.split_off(split);
                for (name, value) in names.into_iter().zip(kw_values) {
                    kwargs.push((Node::Object(name), value));
                }
                let callee = self.pop();
                self.finish_call(callee, values, kwargs, None, None);
                return Ok(());
            }
            Call => {
                let mut n = operand as usize;
                if let Some(Node::KwNamesMap(pairs)) = self.stack.last().cloned() {
                    self.pop_opt();
                    n = n.saturating_sub(pairs.len());
                    kwargs = pairs;
                }
                pos_count = n;
            }
            CallMethod => pos_count = operand as usize,
            CallFunction if self.version.at_least(3, 6) => pos_count = operand as usize,
            _ => {
                // Packed operand: keyword pairs in the high byte.
                let kw_count = ((operand >> 8) & 0xFF) as usize;
                pos_count = (operand & 0xFF) as usize;
                if matches!(opcode, CallFunctionVarKw) {
                    dstar = Some(self.pop());
                    star = Some(self.pop());
                } else if matches!(opcode, CallFunctionVar) {
                    star = Some(self.pop());
                } else if matches!(opcode, CallFunctionKw) {
                    dstar = Some(self.pop());
                }
                for _ in 0..kw_count {
                    let value = self.pop();
                    let key = self.pop();
                    kwargs.push((key, value));
                }
                kwargs.reverse();
            }
        }

        let mut args = Vec::with_capacity(pos_count);
        for _ in 0..pos_count {
            let param = self.pop();
            args.push(self.resolve_call_argument(param));
        }
        args.reverse();
        let callee = self.pop();
        if matches!(self.stack.last(), Some(Node::Null)) {
            self.pop_opt();
        }
        self.finish_call(callee, args, kwargs, star, dstar);
        Ok(())
    }

    /// An inline function argument is either a lambda (kept inline) or a
    /// decorator target (hoisted into a def + name reference).
    fn resolve_call_argument(&mut self, param: Node) -> Node {
        if let Node::Function { code, .. } = &param {
            if let Value::Code(c) = code {
                if !c.is_lambda() && c.comprehension_kind().is_none() {
                    let name = c.name.clone();
                    self.emit(Node::Store {
                        value: Box::new(param),
                        target: Box::new(Node::Name(name.clone())),
                    });
                    return Node::Name(name);
                }
            }
        }
        param
    }

    fn finish_call(
        &mut self,
        callee: Node,
        args: Vec<Node>,
        kwargs: Vec<(Node, Node)>,
        star: Option<Node>,
        dstar: Option<Node>,
    ) {
        // Comprehension scaffolding calls collapse into the node itself.
        if let Node::Function { code, .. } = &callee {
            if let Value::Code(c) = code {
                if c.comprehension_kind().is_some() {
                    let iterable = args.into_iter().next().unwrap_or(Node::name("<unknown>"));
                    let code = code.clone();
                    self.push(Node::Comprehension {
                        code,
                        iterable: Box::new(iterable),
                    });
                    return;
                }
            }
        }
        self.push(Node::Call {
            func: Box::new(callee),
            args,
            kwargs,
            star: star.map(Box::new),
            dstar: dstar.map(Box::new),
        });
    }

    /// Speculatively match the 3.x class-builder pattern below a CALL:
    /// bases (names or dotted paths), qualified name, body function, the
    /// LOAD_BUILD_CLASS sentinel. Restores the stack on mismatch.
    fn try_build_class(&mut self) -> Option<Node> {
        self.speculate(|e| {
            let mut bases = Vec::new();
            while matches!(e.stack.last(), Some(n) if n.is_base_candidate()) {
                bases.push(e.stack.pop().expect("matched above"));
            }
            bases.reverse();
            let name = match e.stack.pop()? {
                n @ Node::Object(Value::Str(_) | Value::Unicode(_)) => n,
                _ => return None,
            };
            let func = match e.stack.pop()? {
                f @ Node::Function { .. } => f,
                _ => return None,
            };
            match e.stack.pop()? {
                Node::LoadBuildClass => {}
                _ => return None,
            }
            if matches!(e.stack.last(), Some(Node::Null)) {
                e.stack.pop();
            }
            let call = Node::Call {
                func: Box::new(func),
                args: Vec::new(),
                kwargs: Vec::new(),
                star: None,
                dstar: None,
            };
            Some(Node::Class {
                builder: Box::new(call),
                bases: Box::new(Node::Tuple(bases)),
                name: Box::new(name),
            })
        })
    }

    fn handle_make_function(&mut self, operand: u32, closure: bool) {
        let mut defaults = Vec::new();
        let mut kw_defaults = Vec::new();

        let code = if self.version.at_least(3, 6) {
            let _qual = if self.version.before(3, 11) {
                self.pop_opt()
            } else {
                None
            };
            let code = self.pop();
            if operand & 0x8 != 0 {
                let _cells = self.pop();
            }
            if operand & 0x4 != 0 {
                let _annotations = self.pop();
            }
            if operand & 0x2 != 0 {
                kw_defaults = match self.pop() {
                    Node::Map(pairs) => pairs,
                    Node::ConstMap { keys, values } => keys
                        .into_iter()
                        .map(Node::Object)
                        .zip(values)
                        .collect(),
                    _ => Vec::new(),
                };
            }
            if operand & 0x1 != 0 {
                defaults = match self.pop() {
                    Node::Tuple(items) => items,
                    Node::Object(Value::Tuple(vs)) => vs.into_iter().map(Node::Object).collect(),
                    other => vec![other],
                };
            }
            code
        } else if self.version.major >= 3 {
            let _qual = if self.version.at_least(3, 3) {
                self.pop_opt()
            } else {
                None
            };
            let code = self.pop();
            if closure {
                let _cells = self.pop();
            }
            let nann = ((operand >> 16) & 0x7FFF) as usize;
            for _ in 0..nann {
                let _ = self.pop();
            }
            let kw_count = ((operand >> 8) & 0xFF) as usize;
            for _ in 0..kw_count {
                let value = self.pop();
                let key = self.pop();
                kw_defaults.push((key, value));
            }
            kw_defaults.reverse();
            defaults = self.popn((operand & 0xFF) as usize);
            code
        } else {
            let code = self.pop();
            if closure {
                let _cells = self.pop();
            }
            defaults = self.popn(operand as usize);
            code
        };

        let code = match code {
            Node::Object(v @ Value::Code(_)) => v,
            _ => {
                self.soft("MAKE_FUNCTION without code object");
                Value::None
            }
        };
        self.push(Node::Function {
            code,
            defaults,
            kw_defaults,
        });
    }
}

// ---- free helpers --------------------------------------------------------

fn is_branch(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        JumpForward
            | JumpAbsolute
            | JumpBackward
            | JumpBackwardNoInterrupt
            | JumpIfFalse
            | JumpIfTrue
            | JumpIfFalseOrPop
            | JumpIfTrueOrPop
            | PopJumpIfFalse
            | PopJumpIfTrue
            | PopJumpBackwardIfFalse
            | PopJumpBackwardIfTrue
            | PopJumpIfNone
            | PopJumpIfNotNone
            | PopJumpBackwardIfNone
            | PopJumpBackwardIfNotNone
            | JumpIfNotExcMatch
            | PopBlock
    )
}

fn or_pop_reducible(block: &Block, stack: &[Node]) -> bool {
    matches!(block.kind, BlockKind::If { or_pop: true, .. })
        && block.body.is_empty()
        && !stack.is_empty()
}

/// Combine short-circuit operands, merging adjacent comparison chains so
/// `a < b and b < c` prints back as `a < b < c`.
fn merge_logical(op: BinOp, left: Node, right: Node) -> Node {
    if op == BinOp::LogicalAnd {
        if let (
            Node::Compare { left: ll, ops: lops },
            Node::Compare { left: rl, ops: rops },
        ) = (&left, &right)
        {
            if let Some((_, last)) = lops.last() {
                if last == rl.as_ref() {
                    let mut ops = lops.clone();
                    ops.extend(rops.iter().cloned());
                    return Node::Compare {
                        left: ll.clone(),
                        ops,
                    };
                }
            }
        }
    }
    Node::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn make_slice(lower: Option<Node>, upper: Option<Node>) -> Node {
    let lower = lower.filter(|n| !n.is_none_literal());
    let upper = upper.filter(|n| !n.is_none_literal());
    let kind = match (&lower, &upper) {
        (None, None) => SliceKind::Slice0,
        (Some(_), None) => SliceKind::Slice1,
        (None, Some(_)) => SliceKind::Slice2,
        (Some(_), Some(_)) => SliceKind::Slice3,
    };
    Node::Slice {
        kind,
        lower: lower.map(Box::new),
        upper: upper.map(Box::new),
    }
}

fn none_to_opt(node: Node) -> Option<Node> {
    if node.is_none_literal() {
        None
    } else {
        Some(node)
    }
}

fn star_all(values: Vec<Node>) -> Vec<Node> {
    values
        .into_iter()
        .map(|v| Node::Starred(Box::new(v)))
        .collect()
}

/// Positional arguments rebuilt from a star-call tuple: literal entries stay
/// positional, a trailing starred entry becomes `*args`.
fn split_starred(items: Vec<Node>) -> (Vec<Node>, Option<Node>) {
    let mut args = Vec::new();
    let mut star = None;
    for item in items {
        match item {
            Node::Starred(inner) if star.is_none() && args.is_empty() => star = Some(*inner),
            other => args.push(other),
        }
    }
    (args, star)
}

fn op_store_to_load(op: Opcode) -> Opcode {
    match op {
        Opcode::StoreSlicePlus1 => Opcode::SlicePlus1,
        Opcode::StoreSlicePlus2 => Opcode::SlicePlus2,
        Opcode::StoreSlicePlus3 => Opcode::SlicePlus3,
        _ => Opcode::SlicePlus0,
    }
}

fn op_delete_to_load(op: Opcode) -> Opcode {
    match op {
        Opcode::DeleteSlicePlus1 => Opcode::SlicePlus1,
        Opcode::DeleteSlicePlus2 => Opcode::SlicePlus2,
        Opcode::DeleteSlicePlus3 => Opcode::SlicePlus3,
        _ => Opcode::SlicePlus0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn asm_word(instrs: &[(u8, u8)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(instrs.len() * 2);
        for &(op, arg) in instrs {
            out.push(op);
            out.push(arg);
        }
        out
    }

    fn module(code: Vec<u8>, consts: Vec<Value>, names: &[&str]) -> CodeObject {
        CodeObject {
            stack_size: 16,
            code,
            consts,
            names: names.iter().map(|s| s.to_string()).collect(),
            name: "<module>".to_string(),
            ..Default::default()
        }
    }

    fn if_else() -> CodeObject {
        module(
            asm_word(&[
                (101, 0),
                (114, 10),
                (100, 0),
                (90, 1),
                (110, 4),
                (100, 1),
                (90, 1),
                (100, 2),
                (83, 0),
            ]),
            vec![Value::Int(1), Value::Int(2), Value::None],
            &["a", "b"],
        )
    }

    #[test]
    fn block_stack_ends_at_scope_root() {
        let code = if_else();
        let mut ctx = BuildCtx::new(Version::new(3, 8));
        let mut engine = Engine::new(&code, BlockKind::Main, &mut ctx);
        engine.run().unwrap();
        assert_eq!(engine.blocks.len(), 1);
        assert!(engine.blocks[0].is_scope_root());
    }

    #[test]
    fn value_stack_empty_between_statements() {
        let code = if_else();
        let mut ctx = BuildCtx::new(Version::new(3, 8));
        let mut engine = Engine::new(&code, BlockKind::Main, &mut ctx);
        engine.run().unwrap();
        assert!(engine.stack.is_empty());
        assert!(engine.hist.is_empty());
        drop(engine);
        assert!(ctx.clean);
    }

    #[test]
    fn speculation_restores_on_mismatch() {
        let code = if_else();
        let mut ctx = BuildCtx::new(Version::new(3, 8));
        let mut engine = Engine::new(&code, BlockKind::Main, &mut ctx);
        engine.push(Node::name("a"));
        engine.push(Node::name("b"));
        let before = engine.stack.clone();
        let result: Option<()> = engine.speculate(|e| {
            e.stack.pop();
            e.stack.pop();
            None
        });
        assert!(result.is_none());
        assert_eq!(engine.stack, before);
        assert!(engine.hist.is_empty());
    }

    #[test]
    fn speculation_commits_on_match() {
        let code = if_else();
        let mut ctx = BuildCtx::new(Version::new(3, 8));
        let mut engine = Engine::new(&code, BlockKind::Main, &mut ctx);
        engine.push(Node::name("a"));
        let got = engine.speculate(|e| e.stack.pop());
        assert_eq!(got, Some(Node::name("a")));
        assert!(engine.stack.is_empty());
        assert!(engine.hist.is_empty());
    }

    #[test]
    fn nested_code_records_terminate() {
        // A function whose constant pool holds another function; recursion
        // over the nested-constant graph is bounded by source nesting.
        let inner = CodeObject {
            stack_size: 4,
            flags: crate::marshal::CodeFlags::OPTIMIZED,
            code: asm_word(&[(100, 0), (83, 0)]),
            consts: vec![Value::None],
            name: "inner".to_string(),
            ..Default::default()
        };
        let outer = CodeObject {
            stack_size: 4,
            flags: crate::marshal::CodeFlags::OPTIMIZED,
            code: asm_word(&[(100, 0), (100, 1), (132, 0), (125, 0), (100, 2), (83, 0)]),
            consts: vec![
                Value::Code(Rc::new(inner)),
                Value::Str("inner".into()),
                Value::None,
            ],
            var_names: vec!["inner".to_string()],
            name: "outer".to_string(),
            ..Default::default()
        };
        let mut ctx = BuildCtx::new(Version::new(3, 8));
        let root = build(&outer, BlockKind::Function, &mut ctx).unwrap();
        assert!(matches!(
            root.body.first(),
            Some(Node::Store { value, .. }) if matches!(value.as_ref(), Node::Function { .. })
        ));
    }

    #[test]
    fn soft_error_substitutes_placeholder() {
        // BINARY_ADD on an empty stack is a soft decode error: the build
        // continues but the context is marked dirty.
        let code = module(
            asm_word(&[(23, 0), (90, 0), (100, 0), (83, 0)]),
            vec![Value::None],
            &["x"],
        );
        let mut ctx = BuildCtx::new(Version::new(3, 8));
        let root = build(&code, BlockKind::Main, &mut ctx).unwrap();
        assert!(!ctx.clean);
        assert!(!root.body.is_empty());
    }

    #[test]
    fn block_underflow_is_fatal() {
        let code = if_else();
        let mut ctx = BuildCtx::new(Version::new(3, 8));
        let mut engine = Engine::new(&code, BlockKind::Main, &mut ctx);
        assert!(matches!(
            engine.close(),
            Err(DepycError::BlockUnderflow { .. })
        ));
    }
}
