//! The abstract syntax tree.
//!
//! One variant per node kind; every node owns its children and carries its
//! source token for diagnostics. The analyzer fills in `ty` for every
//! value-producing node.

use crate::common::Id;
use crate::front::lex::TokenId;
use crate::front::types::{StructRecord, Type, Var, VarId};

/// A parsed translation unit plus the arenas its nodes index into.
#[derive(Debug)]
pub struct Program {
    /// Function definitions, global declarations, top-level `__asm__` items.
    pub items: Vec<Node>,
    pub vars: Vec<Var>,
    pub structs: Vec<StructRecord>,
    /// String-literal pool: key and decoded bytes. Each occurrence gets its
    /// own slot.
    pub strings: Vec<(Id, String)>,
}

#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub tok: TokenId,
    /// Set by the analyzer on every value-producing node.
    pub ty: Option<Type>,
}

impl Node {
    pub fn new(kind: NodeKind, tok: TokenId) -> Node {
        Node { kind, tok, ty: None }
    }

    pub fn num(val: i64, tok: TokenId) -> Node {
        Node::new(NodeKind::Num(val), tok)
    }

    /// The node's type; only valid after analysis.
    pub fn ty(&self) -> &Type {
        self.ty
            .as_ref()
            .unwrap_or_else(|| unreachable!("node was not typed: {:?}", self.kind))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnOp {
    /// `-x`
    Neg,
    /// `!x`
    LogNot,
    /// `~x`
    BitNot,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Neq,
    /// `<` (and `>` with the operands swapped).
    Lt,
    /// `<=` (and `>=` with the operands swapped).
    Lte,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    LogAnd,
    LogOr,
    Comma,
}

/// One `case`/`default` entry of a `switch`, in source order. The position in
/// the vector is the case index used for label naming.
#[derive(Debug)]
pub struct SwitchCase {
    pub value: i64,
    pub is_default: bool,
}

#[derive(Debug)]
pub enum NodeKind {
    Num(i64),
    /// A string literal, by pool key.
    Str(Id),
    Var {
        var: VarId,
        /// True on the defining occurrence.
        is_new: bool,
    },
    Unary(UnOp, Box<Node>),
    /// `&x`
    Addr(Box<Node>),
    /// `*p`
    Deref(Box<Node>),
    /// `a[i]`; rewritten to `*(a+i)` by the analyzer.
    Subscript(Box<Node>, Box<Node>),
    /// `base.field` / `base->field`; `offset` is resolved by the analyzer.
    Member {
        base: Box<Node>,
        arrow: bool,
        field: String,
        offset: usize,
    },
    Binary(BinOp, Box<Node>, Box<Node>),
    Assign(Box<Node>, Box<Node>),
    PreInc(Box<Node>),
    PreDec(Box<Node>),
    PostInc(Box<Node>),
    PostDec(Box<Node>),
    /// `(T)x`; the analyzer rewrites it into the conversion nodes below.
    Cast(Type, Box<Node>),
    /// Analyzer-inserted width conversions.
    SignExtend(Box<Node>),
    ZeroExtend(Box<Node>),
    Truncate(Box<Node>),
    /// Analyzer-inserted scalar-to-`_Bool` normalization (`x != 0`).
    Eval(Box<Node>),
    /// `sizeof expr`; rewritten to a `long` literal by the analyzer.
    Sizeof(Box<Node>),
    /// `sizeof(type-name)`.
    SizeofType(Type),
    Ternary {
        cond: Box<Node>,
        then: Box<Node>,
        els: Box<Node>,
    },
    FuncCall {
        name: Id,
        args: Vec<Node>,
    },
    /// `__asm__("...")` with the escape sequences already decoded.
    BuiltinAsm(String),
    FuncDef {
        name: Id,
        is_static: bool,
        params: Vec<Node>,
        body: Vec<Node>,
        /// Total frame bytes, assigned by the analyzer.
        stack_size: usize,
    },
    /// `int a = 1, *b;` with one node per declarator.
    DeclList(Vec<Node>),
    /// `{ ... }` brace-enclosed initializer.
    Initializer(Vec<Node>),
    Block(Vec<Node>),
    ExprStmt(Box<Node>),
    If {
        cond: Box<Node>,
        then: Box<Node>,
        els: Option<Box<Node>>,
    },
    While {
        /// Function-qualified label core, e.g. `_0_main`.
        label: Id,
        cond: Box<Node>,
        body: Box<Node>,
    },
    DoWhile {
        label: Id,
        body: Box<Node>,
        cond: Box<Node>,
    },
    For {
        label: Id,
        init: Option<Box<Node>>,
        cond: Option<Box<Node>>,
        update: Option<Box<Node>>,
        body: Box<Node>,
    },
    Switch {
        label: Id,
        cond: Box<Node>,
        cases: Vec<SwitchCase>,
        body: Box<Node>,
    },
    /// A `case`/`default` label site inside a switch body.
    Case {
        /// The owning switch's label core.
        switch_label: Id,
        index: usize,
        stmt: Box<Node>,
    },
    Return(Option<Box<Node>>),
    /// `goto`, and the jumps `break`/`continue` desugar into. Carries the
    /// full assembly label.
    Goto(Id),
    /// A user label site; carries the full assembly label.
    LabelStmt {
        label: Id,
        stmt: Box<Node>,
    },
    Nop,
}
