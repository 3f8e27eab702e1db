//! Source-text emitter: walks the reconstructed tree and prints Python.
//! Also hosts the disassembly listing mode.

use std::fmt::Write as _;
use std::rc::Rc;

use crate::ast::{BinOp, Block, BlockKind, Node, UnaryOp};
use crate::dispatch::InstrCursor;
use crate::engine::{self, BuildCtx};
use crate::marshal::{CodeFlags, CodeObject, ComprehensionKind, PycModule, Value};
use crate::tables::{OperandClass, Version};
use crate::DepycError;

// Expression precedence, loosest first.
const PREC_LOWEST: u8 = 0;
const PREC_LAMBDA: u8 = 1;
const PREC_TERNARY: u8 = 2;
const PREC_OR: u8 = 3;
const PREC_AND: u8 = 4;
const PREC_NOT: u8 = 5;
const PREC_COMPARE: u8 = 6;
const PREC_BITOR: u8 = 7;
const PREC_BITXOR: u8 = 8;
const PREC_BITAND: u8 = 9;
const PREC_SHIFT: u8 = 10;
const PREC_ARITH: u8 = 11;
const PREC_TERM: u8 = 12;
const PREC_UNARY: u8 = 13;
const PREC_POWER: u8 = 14;
const PREC_ATOM: u8 = 15;

/// Decompile the whole module to source text.
pub fn print_module(module: &PycModule, ctx: &mut BuildCtx) -> Result<String, DepycError> {
    let root = engine::build(&module.code, BlockKind::Main, ctx)?;
    let mut p = Printer { ctx };
    let mut out = String::new();
    let has_doc = root.docstring.is_some();
    if let Some(doc) = root.docstring.clone() {
        let _ = writeln!(out, "{}", literal(p.ctx.version, &doc));
    }
    p.block_body(&mut out, &root, 0, has_doc)?;
    Ok(out)
}

struct Printer<'c> {
    ctx: &'c mut BuildCtx,
}

impl<'c> Printer<'c> {
    fn pad(indent: usize) -> String {
        "    ".repeat(indent)
    }

    /// Print the body of a scope-root or control block, eliding the
    /// compiler's implicit returns. `have_prelude` records whether the
    /// caller already printed something under the header (a docstring or
    /// global declarations), which satisfies the suite on its own.
    fn block_body(
        &mut self,
        out: &mut String,
        block: &Block,
        indent: usize,
        have_prelude: bool,
    ) -> Result<(), DepycError> {
        let mut body: Vec<&Node> = block.body.iter().collect();
        match block.kind {
            BlockKind::Main | BlockKind::Function => {
                while matches!(
                    body.last(),
                    Some(Node::Return(Some(v))) if v.is_none_literal()
                ) {
                    body.pop();
                }
            }
            BlockKind::Class => {
                while matches!(body.last(), Some(Node::Return(_))) {
                    body.pop();
                }
            }
            _ => {}
        }
        if body.is_empty() {
            if !have_prelude && !matches!(block.kind, BlockKind::Main) {
                let _ = writeln!(out, "{}pass", Self::pad(indent));
            }
            return Ok(());
        }
        for stmt in body {
            self.stmt(out, stmt, indent)?;
        }
        Ok(())
    }

    fn stmt(&mut self, out: &mut String, node: &Node, indent: usize) -> Result<(), DepycError> {
        let pad = Self::pad(indent);
        match node {
            Node::Block(block) => self.suite(out, block, indent)?,
            Node::Store { value, target } => self.store_stmt(out, value, target, indent)?,
            Node::AnnotatedAssign {
                target,
                annotation,
                value,
            } => {
                let t = self.expr(target, PREC_ATOM)?;
                let a = self.expr(annotation, PREC_LOWEST)?;
                match value {
                    Some(v) => {
                        let v = self.expr(v, PREC_LOWEST)?;
                        let _ = writeln!(out, "{pad}{t}: {a} = {v}");
                    }
                    None => {
                        let _ = writeln!(out, "{pad}{t}: {a}");
                    }
                }
            }
            Node::Return(value) => match value {
                Some(v) => {
                    let v = self.expr(v, PREC_LOWEST)?;
                    let _ = writeln!(out, "{pad}return {v}");
                }
                None => {
                    let _ = writeln!(out, "{pad}return");
                }
            },
            Node::Delete(target) => {
                let t = self.expr(target, PREC_LOWEST)?;
                let _ = writeln!(out, "{pad}del {t}");
            }
            Node::Raise(args) => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|a| self.expr(a, PREC_LOWEST))
                    .collect::<Result<_, _>>()?;
                match rendered.len() {
                    0 => {
                        let _ = writeln!(out, "{pad}raise");
                    }
                    1 => {
                        let _ = writeln!(out, "{pad}raise {}", rendered[0]);
                    }
                    2 if self.ctx.version.major >= 3 => {
                        let _ = writeln!(out, "{pad}raise {} from {}", rendered[0], rendered[1]);
                    }
                    _ => {
                        let _ = writeln!(out, "{pad}raise {}", rendered.join(", "));
                    }
                }
            }
            Node::Import {
                module,
                level,
                alias,
                imports,
                ..
            } => {
                if imports.is_empty() {
                    match alias {
                        Some(a) => {
                            let _ = writeln!(out, "{pad}import {module} as {a}");
                        }
                        None => {
                            let _ = writeln!(out, "{pad}import {module}");
                        }
                    }
                } else {
                    let dots = ".".repeat((*level).max(0) as usize);
                    let names: Vec<String> = imports
                        .iter()
                        .map(|(name, alias)| match alias {
                            Some(a) => format!("{name} as {a}"),
                            None => name.clone(),
                        })
                        .collect();
                    let _ = writeln!(out, "{pad}from {dots}{module} import {}", names.join(", "));
                }
            }
            Node::Keyword(kind) => {
                let _ = writeln!(out, "{pad}{}", kind.word());
            }
            Node::Print { values, stream, eol } => {
                let mut line = format!("{pad}print");
                if let Some(s) = stream {
                    let s = self.expr(s, PREC_LOWEST)?;
                    let _ = write!(line, " >>{s}");
                    if !values.is_empty() {
                        line.push(',');
                    }
                }
                let rendered: Vec<String> = values
                    .iter()
                    .map(|v| self.expr(v, PREC_LOWEST))
                    .collect::<Result<_, _>>()?;
                if !rendered.is_empty() {
                    let _ = write!(line, " {}", rendered.join(", "));
                }
                if !*eol {
                    line.push(',');
                }
                let _ = writeln!(out, "{line}");
            }
            Node::Exec {
                stmt,
                globals,
                locals,
            } => {
                let s = self.expr(stmt, PREC_LOWEST)?;
                let mut line = format!("{pad}exec {s}");
                if let Some(g) = globals {
                    let g = self.expr(g, PREC_LOWEST)?;
                    let _ = write!(line, " in {g}");
                    if let Some(l) = locals {
                        let l = self.expr(l, PREC_LOWEST)?;
                        let _ = write!(line, ", {l}");
                    }
                }
                let _ = writeln!(out, "{line}");
            }
            Node::CompElement { value, .. } => {
                let v = self.expr(value, PREC_LOWEST)?;
                let _ = writeln!(out, "{pad}{v}");
            }
            other => {
                let e = self.expr(other, PREC_LOWEST)?;
                let _ = writeln!(out, "{pad}{e}");
            }
        }
        Ok(())
    }

    fn store_stmt(
        &mut self,
        out: &mut String,
        value: &Node,
        target: &Node,
        indent: usize,
    ) -> Result<(), DepycError> {
        let pad = Self::pad(indent);
        // Definitions print as their statement forms.
        if let Node::Function {
            code: func_code,
            defaults,
            kw_defaults,
        } = value
        {
            if let Value::Code(c) = func_code {
                if !c.is_lambda() && c.comprehension_kind().is_none() {
                    let name = match target {
                        Node::Name(n) => n.clone(),
                        _ => c.name.clone(),
                    };
                    return self.function_def(out, &name, c.clone(), defaults, kw_defaults, indent);
                }
            }
        }
        if let Node::Class {
            builder,
            bases,
            name,
        } = value
        {
            return self.class_def(out, builder, bases, name, target, indent);
        }

        // Augmented assignment comes back as an inplace binary.
        if let Node::Binary { op, left, right } = value {
            if op.is_inplace() && left.as_ref() == target {
                let t = self.expr(target, PREC_ATOM)?;
                let r = self.expr(right, PREC_LOWEST)?;
                let _ = writeln!(out, "{pad}{t} {} {r}", op.symbol());
                return Ok(());
            }
        }

        let t = match target {
            Node::ChainStore { targets, .. } => {
                let rendered: Vec<String> = targets
                    .iter()
                    .map(|t| self.expr(t, PREC_ATOM))
                    .collect::<Result<_, _>>()?;
                rendered.join(" = ")
            }
            Node::Tuple(items) => self.target_list(items)?,
            other => self.expr(other, PREC_ATOM)?,
        };
        let v = self.expr(value, PREC_LOWEST)?;
        let _ = writeln!(out, "{pad}{t} = {v}");
        Ok(())
    }

    fn target_list(&mut self, items: &[Node]) -> Result<String, DepycError> {
        // Starred targets must stay bare; `(*b)` is not a valid target.
        let rendered: Vec<String> = items
            .iter()
            .map(|t| self.expr(t, PREC_TERNARY))
            .collect::<Result<_, _>>()?;
        Ok(rendered.join(", "))
    }

    fn suite(&mut self, out: &mut String, block: &Block, indent: usize) -> Result<(), DepycError> {
        let pad = Self::pad(indent);
        match &block.kind {
            BlockKind::If { cond, negative, .. } => {
                let c = self.cond_expr(cond, *negative)?;
                let _ = writeln!(out, "{pad}if {c}:");
                self.block_body(out, block, indent + 1, false)?;
            }
            BlockKind::Elif { cond, negative } => {
                let c = self.cond_expr(cond, *negative)?;
                let _ = writeln!(out, "{pad}elif {c}:");
                self.block_body(out, block, indent + 1, false)?;
            }
            BlockKind::Else => {
                let _ = writeln!(out, "{pad}else:");
                self.block_body(out, block, indent + 1, false)?;
            }
            BlockKind::While { cond, negative } => {
                let c = match cond {
                    Some(c) => self.cond_expr(c, *negative)?,
                    None => "True".to_string(),
                };
                let _ = writeln!(out, "{pad}while {c}:");
                self.block_body(out, block, indent + 1, false)?;
            }
            BlockKind::For { iter, index } => {
                let i = self.expr(iter, PREC_LOWEST)?;
                let t = self.loop_target(index.as_deref())?;
                let _ = writeln!(out, "{pad}for {t} in {i}:");
                self.block_body(out, block, indent + 1, false)?;
            }
            BlockKind::With { expr, var } => {
                let e = self.expr(expr, PREC_LOWEST)?;
                match var {
                    Some(v) => {
                        let v = self.expr(v, PREC_ATOM)?;
                        let _ = writeln!(out, "{pad}with {e} as {v}:");
                    }
                    None => {
                        let _ = writeln!(out, "{pad}with {e}:");
                    }
                }
                self.block_body(out, block, indent + 1, false)?;
            }
            BlockKind::Try => {
                let _ = writeln!(out, "{pad}try:");
                self.block_body(out, block, indent + 1, false)?;
            }
            BlockKind::Except { exc, name } => {
                match (exc, name) {
                    (None, _) => {
                        let _ = writeln!(out, "{pad}except:");
                    }
                    (Some(e), None) => {
                        let e = self.expr(e, PREC_LOWEST)?;
                        let _ = writeln!(out, "{pad}except {e}:");
                    }
                    (Some(e), Some(n)) => {
                        let e = self.expr(e, PREC_LOWEST)?;
                        let n = self.expr(n, PREC_ATOM)?;
                        let kw = if self.ctx.version.major >= 3 { "as" } else { "," };
                        let _ = writeln!(out, "{pad}except {e} {kw} {n}:");
                    }
                }
                self.block_body(out, block, indent + 1, false)?;
            }
            BlockKind::Finally => {
                let _ = writeln!(out, "{pad}finally:");
                self.block_body(out, block, indent + 1, false)?;
            }
            BlockKind::Container { .. } => {
                // The container's children are the try/except/finally
                // blocks themselves.
                for child in &block.body {
                    self.stmt(out, child, indent)?;
                }
            }
            BlockKind::Main
            | BlockKind::Function
            | BlockKind::Class
            | BlockKind::Comprehension => {
                self.block_body(out, block, indent, false)?;
            }
        }
        Ok(())
    }

    fn loop_target(&mut self, index: Option<&Node>) -> Result<String, DepycError> {
        match index {
            Some(Node::Tuple(items)) => self.target_list(items),
            Some(other) => self.expr(other, PREC_ATOM),
            None => Ok("_".to_string()),
        }
    }

    fn cond_expr(&mut self, cond: &Node, negative: bool) -> Result<String, DepycError> {
        if negative {
            let inner = self.expr(cond, PREC_NOT)?;
            Ok(format!("not {inner}"))
        } else {
            self.expr(cond, PREC_LOWEST)
        }
    }

    // ---- definitions -----------------------------------------------------

    fn function_def(
        &mut self,
        out: &mut String,
        name: &str,
        code: Rc<CodeObject>,
        defaults: &[Node],
        kw_defaults: &[(Node, Node)],
        indent: usize,
    ) -> Result<(), DepycError> {
        let pad = Self::pad(indent);
        let sig = self.signature(&code, defaults, kw_defaults)?;
        let _ = writeln!(out, "{pad}def {name}({sig}):");

        let saved_lambda = self.ctx.in_lambda;
        let saved_doc = self.ctx.print_docstring_and_globals;
        self.ctx.in_lambda = false;
        self.ctx.print_docstring_and_globals = true;
        let root = engine::build(&code, BlockKind::Function, self.ctx)?;

        let mut have_prelude = false;
        if self.ctx.print_docstring_and_globals {
            if let Some(doc) = code.docstring() {
                // Guard against `return 'text'` bodies whose constant pool
                // merely starts with a string.
                let is_returned = matches!(
                    root.body.first(),
                    Some(Node::Return(Some(v)))
                        if matches!(v.as_ref(), Node::Object(d) if d == doc)
                );
                if !is_returned {
                    let _ = writeln!(
                        out,
                        "{}{}",
                        Self::pad(indent + 1),
                        literal(self.ctx.version, doc)
                    );
                    have_prelude = true;
                }
            }
            for global in &root.globals {
                let _ = writeln!(out, "{}global {global}", Self::pad(indent + 1));
                have_prelude = true;
            }
        }
        self.ctx.in_lambda = saved_lambda;
        self.ctx.print_docstring_and_globals = saved_doc;
        self.block_body(out, &root, indent + 1, have_prelude)
    }

    fn class_def(
        &mut self,
        out: &mut String,
        builder: &Node,
        bases: &Node,
        name: &Node,
        target: &Node,
        indent: usize,
    ) -> Result<(), DepycError> {
        let pad = Self::pad(indent);
        let class_name = match (name, target) {
            (Node::Object(Value::Str(s) | Value::Unicode(s)), _) => s.clone(),
            (_, Node::Name(n)) => n.clone(),
            _ => "<class>".to_string(),
        };
        let base_list = match bases {
            Node::Tuple(items) => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|b| self.expr(b, PREC_LOWEST))
                    .collect::<Result<_, _>>()?;
                rendered
            }
            _ => Vec::new(),
        };
        if base_list.is_empty() {
            let _ = writeln!(out, "{pad}class {class_name}:");
        } else {
            let _ = writeln!(out, "{pad}class {class_name}({}):", base_list.join(", "));
        }

        let body_code = match builder {
            Node::Call { func, .. } => match func.as_ref() {
                Node::Function {
                    code: Value::Code(c),
                    ..
                } => Some(c.clone()),
                _ => None,
            },
            _ => None,
        };
        match body_code {
            Some(c) => {
                let root = engine::build(&c, BlockKind::Class, self.ctx)?;
                let mut have_prelude = false;
                if self.ctx.print_class_docstring {
                    if let Some(doc) = root.docstring.clone() {
                        let _ = writeln!(
                            out,
                            "{}{}",
                            Self::pad(indent + 1),
                            literal(self.ctx.version, &doc)
                        );
                        have_prelude = true;
                    }
                }
                self.block_body(out, &root, indent + 1, have_prelude)
            }
            None => {
                let _ = writeln!(out, "{}pass", Self::pad(indent + 1));
                Ok(())
            }
        }
    }

    fn signature(
        &mut self,
        code: &CodeObject,
        defaults: &[Node],
        kw_defaults: &[(Node, Node)],
    ) -> Result<String, DepycError> {
        let argc = code.arg_count as usize;
        let posonly = code.posonly_arg_count as usize;
        let kwonly = code.kwonly_arg_count as usize;
        let mut parts: Vec<String> = Vec::new();

        for i in 0..argc {
            let name = code
                .var_names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("arg{i}"));
            let default_idx = (i + defaults.len()).checked_sub(argc);
            let part = match default_idx.and_then(|d| defaults.get(d)) {
                Some(d) => format!("{name}={}", self.expr(d, PREC_LOWEST)?),
                None => name,
            };
            parts.push(part);
            if posonly > 0 && i + 1 == posonly {
                parts.push("/".to_string());
            }
        }

        let mut slot = argc + kwonly;
        if code.flags.contains(CodeFlags::VARARGS) {
            let name = code
                .var_names
                .get(slot)
                .cloned()
                .unwrap_or_else(|| "args".to_string());
            parts.push(format!("*{name}"));
            slot += 1;
        } else if kwonly > 0 {
            parts.push("*".to_string());
        }
        for i in 0..kwonly {
            let name = code
                .var_names
                .get(argc + i)
                .cloned()
                .unwrap_or_else(|| format!("kw{i}"));
            let default = kw_defaults.iter().find(|(k, _)| {
                matches!(k, Node::Object(Value::Str(s) | Value::Unicode(s)) if *s == name)
            });
            let part = match default {
                Some((_, v)) => format!("{name}={}", self.expr(v, PREC_LOWEST)?),
                None => name,
            };
            parts.push(part);
        }
        if code.flags.contains(CodeFlags::VARKEYWORDS) {
            let name = code
                .var_names
                .get(slot)
                .cloned()
                .unwrap_or_else(|| "kwargs".to_string());
            parts.push(format!("**{name}"));
        }
        Ok(parts.join(", "))
    }

    fn lambda_expr(
        &mut self,
        code: &Rc<CodeObject>,
        defaults: &[Node],
        kw_defaults: &[(Node, Node)],
    ) -> Result<String, DepycError> {
        let sig = self.signature(code, defaults, kw_defaults)?;
        let saved = self.ctx.in_lambda;
        self.ctx.in_lambda = true;
        let root = engine::build(code, BlockKind::Function, self.ctx)?;
        self.ctx.in_lambda = saved;
        // The lambda body is the pending return expression; the keyword is
        // suppressed.
        let body = root
            .body
            .iter()
            .rev()
            .find_map(|n| match n {
                Node::Return(Some(v)) => Some(v.as_ref().clone()),
                _ => None,
            })
            .unwrap_or(Node::Object(Value::None));
        let b = self.expr(&body, PREC_TERNARY)?;
        if sig.is_empty() {
            Ok(format!("lambda: {b}"))
        } else {
            Ok(format!("lambda {sig}: {b}"))
        }
    }

    fn comprehension_expr(
        &mut self,
        code: &Rc<CodeObject>,
        iterable: &Node,
    ) -> Result<String, DepycError> {
        let kind = code
            .comprehension_kind()
            .unwrap_or(ComprehensionKind::Generator);
        let root = engine::build(code, BlockKind::Comprehension, self.ctx)?;

        let mut generators: Vec<String> = Vec::new();
        let mut element: Option<(Option<String>, String)> = None;
        self.walk_comprehension(&root.body, iterable, true, &mut generators, &mut element)?;

        let (key, value) = element.unwrap_or((None, "None".to_string()));
        let gens = generators.join(" ");
        Ok(match kind {
            ComprehensionKind::List => format!("[{value} {gens}]"),
            ComprehensionKind::Set => format!("{{{value} {gens}}}"),
            ComprehensionKind::Dict => {
                let k = key.unwrap_or_else(|| "None".to_string());
                format!("{{{k}: {value} {gens}}}")
            }
            ComprehensionKind::Generator => format!("({value} {gens})"),
        })
    }

    fn walk_comprehension(
        &mut self,
        body: &[Node],
        iterable: &Node,
        outermost: bool,
        generators: &mut Vec<String>,
        element: &mut Option<(Option<String>, String)>,
    ) -> Result<(), DepycError> {
        for node in body {
            match node {
                Node::Block(b) => match &b.kind {
                    BlockKind::For { iter, index } => {
                        // The hidden `.0` argument is the call-site iterable.
                        let iter_node =
                            if outermost && matches!(iter.as_ref(), Node::Name(n) if n == ".0") {
                                iterable
                            } else {
                                iter.as_ref()
                            };
                        let i = self.expr(iter_node, PREC_TERNARY)?;
                        let t = self.loop_target(index.as_deref())?;
                        generators.push(format!("for {t} in {i}"));
                        self.walk_comprehension(&b.body, iterable, false, generators, element)?;
                    }
                    BlockKind::If { cond, negative, .. } | BlockKind::Elif { cond, negative } => {
                        let c = self.cond_expr(cond, *negative)?;
                        generators.push(format!("if {c}"));
                        self.walk_comprehension(&b.body, iterable, false, generators, element)?;
                    }
                    _ => {
                        self.walk_comprehension(&b.body, iterable, false, generators, element)?;
                    }
                },
                Node::CompElement { key, value } => {
                    let k = match key {
                        Some(k) => Some(self.expr(k, PREC_TERNARY)?),
                        None => None,
                    };
                    let v = self.expr(value, PREC_TERNARY)?;
                    *element = Some((k, v));
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ---- expressions -----------------------------------------------------

    fn expr(&mut self, node: &Node, prec: u8) -> Result<String, DepycError> {
        let (text, my_prec) = match node {
            Node::Object(v) => (literal(self.ctx.version, v), PREC_ATOM),
            Node::Name(n) | Node::CellName(n) => (n.clone(), PREC_ATOM),
            Node::LoadBuildClass => ("__build_class__".to_string(), PREC_ATOM),
            Node::Null | Node::Locals => ("None".to_string(), PREC_ATOM),

            Node::Tuple(items) => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|i| self.expr(i, PREC_TERNARY))
                    .collect::<Result<_, _>>()?;
                let inner = match rendered.len() {
                    1 => format!("{},", rendered[0]),
                    _ => rendered.join(", "),
                };
                (format!("({inner})"), PREC_ATOM)
            }
            Node::List(items) => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|i| self.expr(i, PREC_TERNARY))
                    .collect::<Result<_, _>>()?;
                (format!("[{}]", rendered.join(", ")), PREC_ATOM)
            }
            Node::Set(items) => {
                if items.is_empty() {
                    ("set()".to_string(), PREC_ATOM)
                } else {
                    let rendered: Vec<String> = items
                        .iter()
                        .map(|i| self.expr(i, PREC_TERNARY))
                        .collect::<Result<_, _>>()?;
                    (format!("{{{}}}", rendered.join(", ")), PREC_ATOM)
                }
            }
            Node::Map(pairs) => {
                let mut rendered = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    if matches!(k, Node::Null) {
                        rendered.push(format!("**{}", self.expr(v, PREC_ATOM)?));
                    } else {
                        rendered.push(format!(
                            "{}: {}",
                            self.expr(k, PREC_TERNARY)?,
                            self.expr(v, PREC_TERNARY)?
                        ));
                    }
                }
                (format!("{{{}}}", rendered.join(", ")), PREC_ATOM)
            }
            Node::ConstMap { keys, values } => {
                let mut rendered = Vec::with_capacity(values.len());
                for (k, v) in keys.iter().zip(values) {
                    rendered.push(format!(
                        "{}: {}",
                        literal(self.ctx.version, k),
                        self.expr(v, PREC_TERNARY)?
                    ));
                }
                (format!("{{{}}}", rendered.join(", ")), PREC_ATOM)
            }
            Node::Slice { lower, upper, .. } => {
                let mut text = String::new();
                match lower {
                    Some(l) if matches!(l.as_ref(), Node::Slice { .. }) => {
                        text.push_str(&self.expr(l, PREC_LOWEST)?);
                        text.push(':');
                    }
                    Some(l) => {
                        text.push_str(&self.expr(l, PREC_TERNARY)?);
                        text.push(':');
                    }
                    None => text.push(':'),
                }
                if let Some(u) = upper {
                    text.push_str(&self.expr(u, PREC_TERNARY)?);
                }
                (text, PREC_LOWEST)
            }
            Node::Starred(inner) => (format!("*{}", self.expr(inner, PREC_ATOM)?), PREC_UNARY),

            Node::Binary { op, left, right } => {
                if *op == BinOp::Attr {
                    let l = self.expr(left, PREC_ATOM)?;
                    let r = self.expr(right, PREC_ATOM)?;
                    (format!("{l}.{r}"), PREC_ATOM)
                } else {
                    let p = binop_prec(*op);
                    let l = self.expr(left, p)?;
                    let r = self.expr(right, p + 1)?;
                    (format!("{l} {} {r}", op.symbol()), p)
                }
            }
            Node::Unary { op, operand } => {
                if *op == UnaryOp::Convert {
                    let o = self.expr(operand, PREC_LOWEST)?;
                    (format!("`{o}`"), PREC_ATOM)
                } else {
                    let p = if *op == UnaryOp::Not { PREC_NOT } else { PREC_UNARY };
                    let o = self.expr(operand, p)?;
                    (format!("{}{o}", op.symbol()), p)
                }
            }
            Node::Compare { left, ops } => {
                let mut text = self.expr(left, PREC_COMPARE + 1)?;
                for (op, right) in ops {
                    let r = self.expr(right, PREC_COMPARE + 1)?;
                    let _ = write!(text, " {} {r}", op.symbol());
                }
                (text, PREC_COMPARE)
            }
            Node::Subscript { value, index } => {
                let v = self.expr(value, PREC_ATOM)?;
                let i = match index.as_ref() {
                    Node::Slice { .. } => self.expr(index, PREC_LOWEST)?,
                    Node::Tuple(items) if !items.is_empty() => {
                        let rendered: Vec<String> = items
                            .iter()
                            .map(|t| self.expr(t, PREC_TERNARY))
                            .collect::<Result<_, _>>()?;
                        rendered.join(", ")
                    }
                    other => self.expr(other, PREC_LOWEST)?,
                };
                (format!("{v}[{i}]"), PREC_ATOM)
            }
            Node::Ternary { cond, then, orelse } => {
                let c = self.expr(cond, PREC_OR)?;
                let t = self.expr(then, PREC_OR)?;
                let e = self.expr(orelse, PREC_TERNARY)?;
                (format!("{t} if {c} else {e}"), PREC_TERNARY)
            }

            Node::Call {
                func,
                args,
                kwargs,
                star,
                dstar,
            } => {
                let f = self.expr(func, PREC_ATOM)?;
                let mut rendered = Vec::new();
                for a in args {
                    rendered.push(self.expr(a, PREC_TERNARY)?);
                }
                if let Some(s) = star {
                    rendered.push(format!("*{}", self.expr(s, PREC_ATOM)?));
                }
                for (k, v) in kwargs {
                    let key = match k {
                        Node::Object(Value::Str(s) | Value::Unicode(s)) => s.clone(),
                        other => self.expr(other, PREC_ATOM)?,
                    };
                    rendered.push(format!("{key}={}", self.expr(v, PREC_TERNARY)?));
                }
                if let Some(d) = dstar {
                    rendered.push(format!("**{}", self.expr(d, PREC_ATOM)?));
                }
                (format!("{f}({})", rendered.join(", ")), PREC_ATOM)
            }
            Node::Function {
                code: func_code,
                defaults,
                kw_defaults,
            } => match func_code {
                Value::Code(c) if c.is_lambda() => {
                    (self.lambda_expr(c, defaults, kw_defaults)?, PREC_LAMBDA)
                }
                Value::Code(c) => (c.name.clone(), PREC_ATOM),
                _ => ("<function>".to_string(), PREC_ATOM),
            },
            Node::Comprehension {
                code: comp_code,
                iterable,
            } => match comp_code {
                Value::Code(c) => (self.comprehension_expr(c, iterable)?, PREC_ATOM),
                _ => ("<comprehension>".to_string(), PREC_ATOM),
            },
            Node::Class { name, .. } => {
                let n = match name.as_ref() {
                    Node::Object(Value::Str(s) | Value::Unicode(s)) => s.clone(),
                    _ => "<class>".to_string(),
                };
                (n, PREC_ATOM)
            }
            Node::CompElement { value, .. } => (self.expr(value, prec)?, PREC_ATOM),

            Node::Yield { value, from } => {
                let kw = if *from { "yield from" } else { "yield" };
                match value {
                    Some(v) => {
                        let v = self.expr(v, PREC_TERNARY)?;
                        (format!("{kw} {v}"), PREC_LAMBDA)
                    }
                    None => (kw.to_string(), PREC_LAMBDA),
                }
            }

            Node::FormattedValue { .. } => {
                (format!("f'''{}'''", self.fstring_part(node)?), PREC_ATOM)
            }
            Node::JoinedStr(parts) => {
                let mut text = String::new();
                for part in parts {
                    text.push_str(&self.fstring_part(part)?);
                }
                (format!("f'''{text}'''"), PREC_ATOM)
            }

            // Anything else surfaces as a marker rather than aborting the
            // whole print.
            Node::ImportFrom(name) => (format!("<import {name}>"), PREC_ATOM),
            other => (format!("<node {}>", node_label(other)), PREC_ATOM),
        };
        if my_prec < prec {
            Ok(format!("({text})"))
        } else {
            Ok(text)
        }
    }

    fn fstring_part(&mut self, node: &Node) -> Result<String, DepycError> {
        Ok(match node {
            Node::Object(Value::Str(s) | Value::Unicode(s)) => {
                s.replace('{', "{{").replace('}', "}}")
            }
            Node::FormattedValue {
                value,
                conversion,
                format_spec,
            } => {
                let v = self.expr(value, PREC_TERNARY)?;
                let conv = match conversion {
                    1 => "!s",
                    2 => "!r",
                    3 => "!a",
                    _ => "",
                };
                let spec = match format_spec {
                    Some(s) => {
                        let rendered = match s.as_ref() {
                            Node::Object(Value::Str(t) | Value::Unicode(t)) => t.clone(),
                            Node::JoinedStr(parts) => {
                                let mut text = String::new();
                                for p in parts {
                                    text.push_str(&self.fstring_part(p)?);
                                }
                                text
                            }
                            other => self.expr(other, PREC_LOWEST)?,
                        };
                        format!(":{rendered}")
                    }
                    None => String::new(),
                };
                format!("{{{v}{conv}{spec}}}")
            }
            other => self.expr(other, PREC_LOWEST)?,
        })
    }
}

fn node_label(node: &Node) -> &'static str {
    match node {
        Node::KwNamesMap(_) => "kw-names",
        Node::ChainStore { .. } => "chain-store",
        Node::Store { .. } => "store",
        Node::Block(_) => "block",
        _ => "unknown",
    }
}

fn binop_prec(op: BinOp) -> u8 {
    match op {
        BinOp::LogicalOr => PREC_OR,
        BinOp::LogicalAnd => PREC_AND,
        BinOp::Or | BinOp::InplaceOr => PREC_BITOR,
        BinOp::Xor | BinOp::InplaceXor => PREC_BITXOR,
        BinOp::And | BinOp::InplaceAnd => PREC_BITAND,
        BinOp::Lshift | BinOp::Rshift | BinOp::InplaceLshift | BinOp::InplaceRshift => PREC_SHIFT,
        BinOp::Add | BinOp::Subtract | BinOp::InplaceAdd | BinOp::InplaceSubtract => PREC_ARITH,
        BinOp::Power | BinOp::InplacePower => PREC_POWER,
        BinOp::Attr => PREC_ATOM,
        _ => PREC_TERM,
    }
}

/// Python literal rendering for pool constants.
pub fn literal(version: Version, v: &Value) -> String {
    match v {
        Value::None => "None".to_string(),
        Value::Ellipsis => "...".to_string(),
        Value::StopIteration => "StopIteration".to_string(),
        Value::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Long { negative, decimal } => {
            let sign = if *negative { "-" } else { "" };
            let suffix = if version.major < 3 { "L" } else { "" };
            format!("{sign}{decimal}{suffix}")
        }
        Value::Float(f) => {
            if f.is_nan() {
                "float('nan')".to_string()
            } else if f.is_infinite() {
                if *f > 0.0 {
                    "float('inf')".to_string()
                } else {
                    "-float('inf')".to_string()
                }
            } else {
                format!("{f:?}")
            }
        }
        Value::Complex(re, im) => {
            if *re == 0.0 {
                format!("{im:?}j")
            } else if *im < 0.0 {
                format!("({re:?}-{:?}j)", -im)
            } else {
                format!("({re:?}+{im:?}j)")
            }
        }
        Value::Str(s) => quote_str(s),
        Value::Unicode(s) => {
            if version.major < 3 {
                format!("u{}", quote_str(s))
            } else {
                quote_str(s)
            }
        }
        Value::Bytes(b) => {
            let prefix = if version.major >= 3 { "b" } else { "" };
            let mut out = format!("{prefix}'");
            for &byte in b {
                match byte {
                    b'\\' => out.push_str("\\\\"),
                    b'\'' => out.push_str("\\'"),
                    b'\n' => out.push_str("\\n"),
                    b'\r' => out.push_str("\\r"),
                    b'\t' => out.push_str("\\t"),
                    0x20..=0x7E => out.push(byte as char),
                    _ => {
                        let _ = write!(out, "\\x{byte:02x}");
                    }
                }
            }
            out.push('\'');
            out
        }
        Value::Tuple(items) => {
            let rendered: Vec<String> = items.iter().map(|i| literal(version, i)).collect();
            match rendered.len() {
                1 => format!("({},)", rendered[0]),
                _ => format!("({})", rendered.join(", ")),
            }
        }
        Value::List(items) => {
            let rendered: Vec<String> = items.iter().map(|i| literal(version, i)).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Set(items) => {
            if items.is_empty() {
                "set()".to_string()
            } else {
                let rendered: Vec<String> = items.iter().map(|i| literal(version, i)).collect();
                format!("{{{}}}", rendered.join(", "))
            }
        }
        Value::FrozenSet(items) => {
            if items.is_empty() {
                "frozenset()".to_string()
            } else {
                let rendered: Vec<String> = items.iter().map(|i| literal(version, i)).collect();
                format!("frozenset({{{}}})", rendered.join(", "))
            }
        }
        Value::Dict(pairs) => {
            let rendered: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}: {}", literal(version, k), literal(version, v)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
        Value::Code(c) => format!("<code object {}>", c.name),
    }
}

fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

// ---- disassembly listing --------------------------------------------------

/// Flat listing of every code record reachable from the module root,
/// depth-first.
pub fn disassemble_module(module: &PycModule) -> Result<String, DepycError> {
    let mut out = String::new();
    disassemble_code(&module.code, module.version, &mut out)?;
    Ok(out)
}

fn disassemble_code(
    code: &CodeObject,
    version: Version,
    out: &mut String,
) -> Result<(), DepycError> {
    let name = if code.qual_name.is_empty() {
        &code.name
    } else {
        &code.qual_name
    };
    let _ = writeln!(
        out,
        "code {} (args={}, stack={}, flags=0x{:x})",
        name,
        code.arg_count,
        code.stack_size,
        code.flags.bits()
    );
    let mut cursor = InstrCursor::new(&code.code, version);
    while !cursor.at_end() {
        let instr = cursor.next()?;
        let _ = write!(out, "{:05} {:<25}", instr.offset, instr.opcode.name());
        match instr.class {
            OperandClass::None => {}
            OperandClass::Name => {
                let resolved = code.name_at(instr.operand).unwrap_or("?");
                let _ = write!(out, " {} ; {}", instr.operand, resolved);
            }
            OperandClass::Const => {
                let resolved = code
                    .get_const(instr.operand)
                    .map(|v| literal(version, v))
                    .unwrap_or_else(|| "?".to_string());
                let _ = write!(out, " {} ; {}", instr.operand, resolved);
            }
            OperandClass::Local => {
                let resolved = code.local_at(instr.operand).unwrap_or("?");
                let _ = write!(out, " {} ; {}", instr.operand, resolved);
            }
            OperandClass::Free => {
                let resolved = code.deref_at(instr.operand).unwrap_or("?");
                let _ = write!(out, " {} ; {}", instr.operand, resolved);
            }
            OperandClass::JumpRel | OperandClass::JumpAbs => {
                let target = crate::dispatch::jump_target(version, &instr);
                let _ = write!(out, " {} ; to {}", instr.operand, target);
            }
            OperandClass::Compare => {
                let resolved = crate::ast::CmpOp::from_operand(instr.operand)
                    .map(|c| c.symbol())
                    .unwrap_or("?");
                let _ = write!(out, " {} ; {}", instr.operand, resolved);
            }
            OperandClass::ArgUint | OperandClass::ArgPacked => {
                let _ = write!(out, " {}", instr.operand);
            }
        }
        out.push('\n');
    }
    out.push('\n');
    for value in &code.consts {
        if let Value::Code(nested) = value {
            disassemble_code(nested, version, out)?;
        }
    }
    Ok(())
}
