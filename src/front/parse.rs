//! The parser.
//!
//! Recursive descent over the usual C expression precedence chain, with the
//! declaration/expression split decided by one token of lookahead: a
//! statement opens a declaration iff it starts with a type specifier,
//! storage class, or a registered typedef name.
//!
//! Structured statements get a unique function-qualified label core
//! (`_<n>_<funcname>`), so generated jump labels never collide across
//! functions. `break`/`continue` desugar into `goto` against those labels.

use log::debug;

use crate::common::{id, CompileError, Id, Result};
use crate::front::ast::*;
use crate::front::lex::{Cursor, Keyword, Token, TokenId, TokenKind, TokenStream};
use crate::front::types::{
    layout_fields, try_size_of, Env, StorageClass, StructId, Type, TypeKind,
};

pub fn parse(ts: &TokenStream) -> Result<Program> {
    debug!("start parser");
    let mut parser = Parser {
        ts,
        cur: Cursor::new(ts),
        env: Env::new(),
        strings: vec![],
        func: id(""),
        label_counter: 0,
        breaks: vec![],
        continues: vec![],
        switches: vec![],
    };
    let mut items = vec![];
    while !parser.cur.at_eof() {
        items.push(parser.external_declaration()?);
    }
    debug!("parsed {} top-level items", items.len());
    Ok(Program {
        items,
        vars: parser.env.vars,
        structs: parser.env.structs,
        strings: parser.strings,
    })
}

/// The result of a declaration-specifier run.
struct Spec {
    ty: Type,
    storage: StorageClass,
    is_typedef: bool,
}

struct SwitchCtx {
    label: Id,
    cases: Vec<SwitchCase>,
}

struct Parser<'a, 'src> {
    ts: &'a TokenStream<'src>,
    cur: Cursor<'a, 'src>,
    env: Env,
    strings: Vec<(Id, String)>,
    /// Name of the function being parsed, for label mangling.
    func: Id,
    label_counter: usize,
    /// Innermost-last targets for `break` and `continue`.
    breaks: Vec<Id>,
    continues: Vec<Id>,
    switches: Vec<SwitchCtx>,
}

impl<'a, 'src> Parser<'a, 'src> {
    fn err_at(&self, tok: TokenId, msg: impl Into<String>) -> CompileError {
        let t = self.ts.tok(tok);
        CompileError::at(t.pos, t.len().max(1), msg.into())
    }

    /// A fresh function-qualified label core such as `_0_main`.
    fn new_label(&mut self) -> Id {
        let label = id(format!("_{}_{}", self.label_counter, self.func));
        self.label_counter += 1;
        label
    }

    // ------------------------------------------------------------------
    // declarations
    // ------------------------------------------------------------------

    fn external_declaration(&mut self) -> Result<Node> {
        if self.cur.peek().text == "__asm__" && self.cur.peek().kind == TokenKind::Ident {
            let node = self.builtin_asm()?;
            self.cur.expect(";")?;
            return Ok(node);
        }
        if !self.is_declaration_start() {
            return Err(self.cur.error("declaration has no type specifier"));
        }
        let spec = self.declaration_specifiers()?;
        if self.cur.peek().kind == TokenKind::Ident && self.cur.peek_next().is("(") {
            return self.function_definition(spec);
        }
        self.declaration_rest(spec)
    }

    /// Does the current token open a declaration?
    fn is_declaration_start(&self) -> bool {
        is_type_start(self.cur.peek(), &self.env, true)
    }

    /// Consume a run of declaration specifiers and trailing `*`s.
    fn declaration_specifiers(&mut self) -> Result<Spec> {
        let start = *self.cur.peek();
        let mut long_count = 0usize;
        let mut signed_count = 0usize;
        let mut unsigned_count = 0usize;
        let mut int_count = 0usize;
        let mut bool_count = 0usize;
        let mut char_count = 0usize;
        let mut short_count = 0usize;
        let mut void_count = 0usize;
        let mut struct_count = 0usize;
        let mut union_count = 0usize;
        let mut enum_count = 0usize;
        let mut storage = StorageClass::Auto;
        let mut is_typedef = false;
        loop {
            if self.cur.consume_kw(Keyword::Typedef).is_some() {
                is_typedef = true;
            } else if self.cur.consume_kw(Keyword::Static).is_some() {
                storage = StorageClass::Static;
            } else if self.cur.consume_kw(Keyword::Extern).is_some() {
                storage = StorageClass::Extern;
            } else if self.cur.consume_kw(Keyword::Long).is_some() {
                long_count += 1;
            } else if self.cur.consume_ident_text("signed").is_some() {
                signed_count += 1;
            } else if self.cur.consume_ident_text("unsigned").is_some() {
                unsigned_count += 1;
            } else if self.cur.consume_kw(Keyword::Int).is_some() {
                int_count += 1;
            } else if self.cur.consume_kw(Keyword::Bool).is_some() {
                bool_count += 1;
            } else if self.cur.consume_kw(Keyword::Char).is_some() {
                char_count += 1;
            } else if self.cur.consume_kw(Keyword::Short).is_some() {
                short_count += 1;
            } else if self.cur.consume_kw(Keyword::Void).is_some() {
                void_count += 1;
            } else if self.cur.consume_kw(Keyword::Struct).is_some() {
                struct_count += 1;
            } else if self.cur.consume_kw(Keyword::Union).is_some() {
                union_count += 1;
            } else if self.cur.consume_kw(Keyword::Enum).is_some() {
                enum_count += 1;
            } else {
                break;
            }
        }

        let scalar =
            int_count + bool_count + char_count + short_count + void_count;
        let base_selectors = scalar + struct_count + union_count + enum_count;
        let invalid = long_count > 2
            || (long_count > 0
                && (bool_count + char_count + short_count + void_count > 0))
            || signed_count + unsigned_count > 1
            || base_selectors > 1
            || (signed_count + unsigned_count > 0 && (void_count + bool_count > 0))
            || ((long_count + signed_count + unsigned_count + scalar > 0)
                && struct_count + union_count + enum_count > 0);
        if invalid {
            let end = self.cur.peek().pos;
            return Err(CompileError::at(
                start.pos,
                end.saturating_sub(start.pos).max(start.len()),
                "invalid type specifier",
            ));
        }

        let mut ty = if struct_count + union_count > 0 {
            self.struct_specifier(union_count > 0)?
        } else if enum_count > 0 {
            self.enum_specifier()?
        } else if long_count + signed_count + unsigned_count + scalar == 0 {
            // No base selector; a typedef name can stand in.
            let tok = *self.cur.peek();
            let alias = if tok.kind == TokenKind::Ident {
                self.env.lookup_typedef(tok.text).cloned()
            } else {
                None
            };
            match alias {
                Some(ty) => {
                    self.cur.advance();
                    ty
                }
                None => {
                    return Err(CompileError::at(
                        start.pos,
                        start.len().max(1),
                        "invalid type specifier",
                    ));
                }
            }
        } else {
            let kind = if long_count == 2 {
                TypeKind::LongLong
            } else if long_count == 1 {
                TypeKind::Long
            } else if bool_count > 0 {
                TypeKind::Bool
            } else if char_count > 0 {
                TypeKind::Char
            } else if void_count > 0 {
                TypeKind::Void
            } else if short_count > 0 {
                TypeKind::Short
            } else {
                TypeKind::Int
            };
            let mut ty = Type::new(kind);
            ty.signed = unsigned_count == 0;
            ty
        };

        while self.cur.consume("*").is_some() {
            ty = Type::ptr_to(ty);
        }
        if is_typedef {
            ty = Type {
                kind: TypeKind::Typedef,
                pointee: Some(Box::new(ty)),
                signed: false,
            };
        }
        Ok(Spec {
            ty,
            storage,
            is_typedef,
        })
    }

    /// `struct`/`union` specifier after the keyword: tag, body, or both.
    fn struct_specifier(&mut self, is_union: bool) -> Result<Type> {
        let name_tok = self.cur.consume_ident();
        let name = name_tok.map(|t| self.ts.tok(t).text.to_string());
        if name.is_none() && !self.cur.peek().is("{") {
            return Err(self.cur.error("invalid struct specifier"));
        }
        let sid = self.env.declare_struct(name.as_deref(), is_union);

        if let Some(brace) = self.cur.consume("{") {
            if self.env.structs[sid].defined {
                return Err(self.err_at(brace, "struct redefinition"));
            }
            let mut members = vec![];
            loop {
                if !self.is_declaration_start() {
                    return Err(self.cur.error("invalid struct definition"));
                }
                let spec = self.declaration_specifiers()?;
                if spec.is_typedef {
                    return Err(self.cur.error("invalid struct definition"));
                }
                let mtok = self.cur.expect_ident()?;
                let mname = self.ts.tok(mtok).text.to_string();
                let mty = self.array_dims(spec.ty)?;
                members.push((mname, mty));
                self.cur.expect(";")?;
                if self.cur.consume("}").is_some() {
                    break;
                }
            }
            let (fields, size, align) = layout_fields(members, is_union, &self.env.structs)
                .ok_or_else(|| self.err_at(brace, "struct not defined"))?;
            let record = &mut self.env.structs[sid];
            record.fields = fields;
            record.size = size;
            record.align = align;
            record.defined = true;
        }
        Ok(Type::new(TypeKind::Struct(sid)))
    }

    /// `enum` specifier: registers the constants, yields `int`.
    fn enum_specifier(&mut self) -> Result<Type> {
        self.cur.consume_ident();
        if self.cur.consume("{").is_some() {
            let mut next = 0i64;
            loop {
                let tok = self.cur.expect_ident()?;
                let name = self.ts.tok(tok).text.to_string();
                if self.cur.consume("=").is_some() {
                    next = self.constant_expression()?;
                }
                self.env.define_enum_const(&name, next);
                next += 1;
                if self.cur.consume(",").is_some() {
                    if self.cur.consume("}").is_some() {
                        break;
                    }
                    continue;
                }
                self.cur.expect("}")?;
                break;
            }
        }
        Ok(Type::int())
    }

    /// Trailing `[N]` dimensions after a declarator name. `int a[2][3]` is
    /// an array of 2 arrays of 3 ints, so the dimensions nest left to right.
    fn array_dims(&mut self, base: Type) -> Result<Type> {
        let mut dims = vec![];
        while self.cur.consume("[").is_some() {
            let len_tok = self.cur.mark();
            let len = self.constant_expression()?;
            if len < 0 {
                return Err(self.err_at(len_tok, "invalid array size"));
            }
            self.cur.expect("]")?;
            dims.push(len as usize);
        }
        let mut ty = base;
        for dim in dims.into_iter().rev() {
            ty = Type::array_of(ty, dim);
        }
        Ok(ty)
    }

    /// Declarator list after the specifiers: variables or typedef aliases.
    fn declaration_rest(&mut self, spec: Spec) -> Result<Node> {
        let first = self.cur.mark();
        if spec.is_typedef {
            // Strip the transient wrapper and register the alias.
            let aliased = match spec.ty.kind {
                TypeKind::Typedef => *spec.ty.pointee.clone().unwrap(),
                _ => unreachable!("typedef declaration without a wrapper"),
            };
            loop {
                let tok = self.cur.expect_ident()?;
                let name = self.ts.tok(tok).text.to_string();
                let ty = self.array_dims(aliased.clone())?;
                self.env.define_typedef(&name, ty);
                if self.cur.consume(",").is_none() {
                    break;
                }
            }
            self.cur.expect(";")?;
            return Ok(Node::new(NodeKind::Nop, first));
        }

        // A bare `struct s { ... };` or `enum { ... };` declares no variable.
        if self.cur.consume(";").is_some() {
            return Ok(Node::new(NodeKind::Nop, first));
        }

        let mut decls = vec![];
        loop {
            let tok = self.cur.expect_ident()?;
            let name = self.ts.tok(tok).text.to_string();
            let ty = self.array_dims(spec.ty.clone())?;
            if let Some(sid) = bare_struct(&ty) {
                if !self.env.structs[sid].defined {
                    return Err(self.err_at(tok, "struct not defined"));
                }
            }
            let var = self
                .env
                .define_var(&name, ty, spec.storage)
                .ok_or_else(|| self.err_at(tok, "variable is already defined"))?;
            let var_node = Node::new(NodeKind::Var { var, is_new: true }, tok);
            let node = if let Some(eq) = self.cur.consume("=") {
                let init = self.initializer()?;
                Node::new(
                    NodeKind::Assign(Box::new(var_node), Box::new(init)),
                    eq,
                )
            } else {
                var_node
            };
            decls.push(node);
            if self.cur.consume(",").is_none() {
                break;
            }
        }
        self.cur.expect(";")?;
        if decls.len() == 1 {
            Ok(decls.pop().unwrap())
        } else {
            Ok(Node::new(NodeKind::DeclList(decls), first))
        }
    }

    /// `= { ... }` or a plain assignment expression.
    fn initializer(&mut self) -> Result<Node> {
        if let Some(brace) = self.cur.consume("{") {
            let mut elems = vec![];
            if self.cur.consume("}").is_none() {
                loop {
                    elems.push(self.initializer()?);
                    if self.cur.consume(",").is_some() {
                        if self.cur.consume("}").is_some() {
                            break;
                        }
                        continue;
                    }
                    self.cur.expect("}")?;
                    break;
                }
            }
            Ok(Node::new(NodeKind::Initializer(elems), brace))
        } else {
            self.assignment()
        }
    }

    fn function_definition(&mut self, spec: Spec) -> Result<Node> {
        let name_tok = self.cur.expect_ident()?;
        let name = self.ts.tok(name_tok).text.to_string();
        if spec.is_typedef {
            return Err(self.err_at(name_tok, "invalid function definition"));
        }
        self.cur.expect("(")?;
        self.func = id(name.clone());
        self.label_counter = 0;
        self.env.enter();

        let mut params = vec![];
        if self.cur.consume(")").is_none() {
            if self.cur.peek().kind == TokenKind::Keyword(Keyword::Void)
                && self.cur.peek_next().is(")")
            {
                self.cur.advance();
                self.cur.expect(")")?;
            } else {
                loop {
                    if !self.is_declaration_start() {
                        return Err(self.cur.error("expected a parameter declaration"));
                    }
                    let pspec = self.declaration_specifiers()?;
                    if pspec.is_typedef || pspec.storage != StorageClass::Auto {
                        return Err(self.cur.error("invalid parameter declaration"));
                    }
                    let ptok = self.cur.expect_ident()?;
                    let pname = self.ts.tok(ptok).text.to_string();
                    let var = self
                        .env
                        .define_var(&pname, pspec.ty, StorageClass::Auto)
                        .ok_or_else(|| self.err_at(ptok, "variable is already defined"))?;
                    params.push(Node::new(NodeKind::Var { var, is_new: true }, ptok));
                    if self.cur.consume(",").is_some() {
                        continue;
                    }
                    self.cur.expect(")")?;
                    break;
                }
            }
        }
        if params.len() > 6 {
            return Err(self.err_at(name_tok, "too many parameters"));
        }

        // A trailing ';' makes this a prototype; nothing to generate.
        if self.cur.consume(";").is_some() {
            self.env.exit();
            return Ok(Node::new(NodeKind::Nop, name_tok));
        }

        self.cur.expect("{")?;
        let mut body = vec![];
        while self.cur.consume("}").is_none() {
            body.push(self.stmt()?);
        }
        self.env.exit();
        Ok(Node::new(
            NodeKind::FuncDef {
                name: id(name),
                is_static: spec.storage == StorageClass::Static,
                params,
                body,
                stack_size: 0,
            },
            name_tok,
        ))
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    fn stmt(&mut self) -> Result<Node> {
        if let Some(tok) = self.cur.consume(";") {
            return Ok(Node::new(NodeKind::Nop, tok));
        }

        if let Some(tok) = self.cur.consume("{") {
            self.env.enter();
            let mut stmts = vec![];
            while self.cur.consume("}").is_none() {
                stmts.push(self.stmt()?);
            }
            self.env.exit();
            return Ok(Node::new(NodeKind::Block(stmts), tok));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::If) {
            self.cur.expect("(")?;
            let cond = self.expr()?;
            self.cur.expect(")")?;
            let then = self.stmt()?;
            let els = if self.cur.consume_kw(Keyword::Else).is_some() {
                Some(Box::new(self.stmt()?))
            } else {
                None
            };
            return Ok(Node::new(
                NodeKind::If {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    els,
                },
                tok,
            ));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::While) {
            let label = self.new_label();
            self.cur.expect("(")?;
            let cond = self.expr()?;
            self.cur.expect(")")?;
            self.breaks.push(id(format!(".Lendwhile{label}")));
            self.continues.push(id(format!(".Lbeginwhile{label}")));
            let body = self.stmt()?;
            self.breaks.pop();
            self.continues.pop();
            return Ok(Node::new(
                NodeKind::While {
                    label,
                    cond: Box::new(cond),
                    body: Box::new(body),
                },
                tok,
            ));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::Do) {
            let label = self.new_label();
            self.breaks.push(id(format!(".Lenddo{label}")));
            self.continues.push(id(format!(".Lcontdo{label}")));
            let body = self.stmt()?;
            self.breaks.pop();
            self.continues.pop();
            self.cur.expect_kw(Keyword::While)?;
            self.cur.expect("(")?;
            let cond = self.expr()?;
            self.cur.expect(")")?;
            self.cur.expect(";")?;
            return Ok(Node::new(
                NodeKind::DoWhile {
                    label,
                    body: Box::new(body),
                    cond: Box::new(cond),
                },
                tok,
            ));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::For) {
            let label = self.new_label();
            self.env.enter();
            self.cur.expect("(")?;
            let init = if self.cur.consume(";").is_some() {
                None
            } else if self.is_declaration_start() {
                let spec = self.declaration_specifiers()?;
                Some(Box::new(self.declaration_rest(spec)?))
            } else {
                let e = self.expr_stmt_node()?;
                self.cur.expect(";")?;
                Some(Box::new(e))
            };
            let cond = if self.cur.consume(";").is_some() {
                None
            } else {
                let e = self.expr()?;
                self.cur.expect(";")?;
                Some(Box::new(e))
            };
            let update = if self.cur.peek().is(")") {
                None
            } else {
                Some(Box::new(self.expr_stmt_node()?))
            };
            self.cur.expect(")")?;
            self.breaks.push(id(format!(".Lendfor{label}")));
            self.continues.push(id(format!(".Lcontfor{label}")));
            let body = self.stmt()?;
            self.breaks.pop();
            self.continues.pop();
            self.env.exit();
            return Ok(Node::new(
                NodeKind::For {
                    label,
                    init,
                    cond,
                    update,
                    body: Box::new(body),
                },
                tok,
            ));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::Switch) {
            let label = self.new_label();
            self.cur.expect("(")?;
            let cond = self.expr()?;
            self.cur.expect(")")?;
            self.switches.push(SwitchCtx {
                label,
                cases: vec![],
            });
            self.breaks.push(id(format!(".Lendswitch{label}")));
            let body = self.stmt()?;
            self.breaks.pop();
            let ctx = self.switches.pop().unwrap();
            return Ok(Node::new(
                NodeKind::Switch {
                    label,
                    cond: Box::new(cond),
                    cases: ctx.cases,
                    body: Box::new(body),
                },
                tok,
            ));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::Case) {
            let value = self.constant_expression()?;
            self.cur.expect(":")?;
            let Some(ctx) = self.switches.last_mut() else {
                return Err(self.err_at(tok, "'case' outside a switch"));
            };
            let switch_label = ctx.label;
            let index = ctx.cases.len();
            ctx.cases.push(SwitchCase {
                value,
                is_default: false,
            });
            let stmt = self.stmt()?;
            return Ok(Node::new(
                NodeKind::Case {
                    switch_label,
                    index,
                    stmt: Box::new(stmt),
                },
                tok,
            ));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::Default) {
            self.cur.expect(":")?;
            let Some(ctx) = self.switches.last_mut() else {
                return Err(self.err_at(tok, "'default' outside a switch"));
            };
            if ctx.cases.iter().any(|c| c.is_default) {
                return Err(self.err_at(tok, "multiple 'default' labels"));
            }
            let switch_label = ctx.label;
            let index = ctx.cases.len();
            ctx.cases.push(SwitchCase {
                value: 0,
                is_default: true,
            });
            let stmt = self.stmt()?;
            return Ok(Node::new(
                NodeKind::Case {
                    switch_label,
                    index,
                    stmt: Box::new(stmt),
                },
                tok,
            ));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::Return) {
            if self.cur.consume(";").is_some() {
                return Ok(Node::new(NodeKind::Return(None), tok));
            }
            let value = self.expr()?;
            self.cur.expect(";")?;
            return Ok(Node::new(NodeKind::Return(Some(Box::new(value))), tok));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::Break) {
            self.cur.expect(";")?;
            let Some(&target) = self.breaks.last() else {
                return Err(self.err_at(tok, "'break' outside a loop or switch"));
            };
            return Ok(Node::new(NodeKind::Goto(target), tok));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::Continue) {
            self.cur.expect(";")?;
            let Some(&target) = self.continues.last() else {
                return Err(self.err_at(tok, "'continue' outside a loop"));
            };
            return Ok(Node::new(NodeKind::Goto(target), tok));
        }

        if let Some(tok) = self.cur.consume_kw(Keyword::Goto) {
            let name_tok = self.cur.expect_ident()?;
            let name = self.ts.tok(name_tok).text;
            self.cur.expect(";")?;
            return Ok(Node::new(
                NodeKind::Goto(id(format!(".Lgoto_{}_{}", name, self.func))),
                tok,
            ));
        }

        // A label site: `name: stmt` (unless the name is a typedef).
        if self.cur.peek().kind == TokenKind::Ident
            && self.cur.peek_next().is(":")
            && !self.env.is_typedef_name(self.cur.peek().text)
        {
            let name_tok = self.cur.advance();
            let name = self.ts.tok(name_tok).text;
            let label = id(format!(".Lgoto_{}_{}", name, self.func));
            self.cur.expect(":")?;
            let stmt = self.stmt()?;
            return Ok(Node::new(
                NodeKind::LabelStmt {
                    label,
                    stmt: Box::new(stmt),
                },
                name_tok,
            ));
        }

        if self.is_declaration_start() {
            let spec = self.declaration_specifiers()?;
            return self.declaration_rest(spec);
        }

        let node = self.expr_stmt_node()?;
        self.cur.expect(";")?;
        Ok(node)
    }

    /// An expression evaluated for its side effect; the value is discarded.
    fn expr_stmt_node(&mut self) -> Result<Node> {
        let tok = self.cur.mark();
        let e = self.expr()?;
        Ok(Node::new(NodeKind::ExprStmt(Box::new(e)), tok))
    }

    // ------------------------------------------------------------------
    // expressions
    // ------------------------------------------------------------------

    fn expr(&mut self) -> Result<Node> {
        let mut node = self.assignment()?;
        while let Some(tok) = self.cur.consume(",") {
            let rhs = self.assignment()?;
            node = Node::new(
                NodeKind::Binary(BinOp::Comma, Box::new(node), Box::new(rhs)),
                tok,
            );
        }
        Ok(node)
    }

    fn assignment(&mut self) -> Result<Node> {
        let node = self.conditional()?;
        if let Some(tok) = self.cur.consume("=") {
            let rhs = self.assignment()?;
            return Ok(Node::new(
                NodeKind::Assign(Box::new(node), Box::new(rhs)),
                tok,
            ));
        }
        Ok(node)
    }

    fn conditional(&mut self) -> Result<Node> {
        let cond = self.logical_or()?;
        let Some(tok) = self.cur.consume("?") else {
            return Ok(cond);
        };
        let then = self.expr()?;
        self.cur.expect(":")?;
        let els = self.conditional()?;
        Ok(Node::new(
            NodeKind::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                els: Box::new(els),
            },
            tok,
        ))
    }

    fn binary_chain(
        &mut self,
        next: fn(&mut Self) -> Result<Node>,
        ops: &[(&str, BinOp)],
    ) -> Result<Node> {
        let mut node = next(self)?;
        'outer: loop {
            for &(text, op) in ops {
                if let Some(tok) = self.cur.consume(text) {
                    let rhs = next(self)?;
                    node = Node::new(
                        NodeKind::Binary(op, Box::new(node), Box::new(rhs)),
                        tok,
                    );
                    continue 'outer;
                }
            }
            return Ok(node);
        }
    }

    fn logical_or(&mut self) -> Result<Node> {
        self.binary_chain(Self::logical_and, &[("||", BinOp::LogOr)])
    }

    fn logical_and(&mut self) -> Result<Node> {
        self.binary_chain(Self::inclusive_or, &[("&&", BinOp::LogAnd)])
    }

    fn inclusive_or(&mut self) -> Result<Node> {
        self.binary_chain(Self::exclusive_or, &[("|", BinOp::BitOr)])
    }

    fn exclusive_or(&mut self) -> Result<Node> {
        self.binary_chain(Self::and_expr, &[("^", BinOp::BitXor)])
    }

    fn and_expr(&mut self) -> Result<Node> {
        self.binary_chain(Self::equality, &[("&", BinOp::BitAnd)])
    }

    fn equality(&mut self) -> Result<Node> {
        self.binary_chain(
            Self::relational,
            &[("==", BinOp::Eq), ("!=", BinOp::Neq)],
        )
    }

    fn relational(&mut self) -> Result<Node> {
        let mut node = self.shift()?;
        loop {
            if let Some(tok) = self.cur.consume("<=") {
                let rhs = self.shift()?;
                node = Node::new(
                    NodeKind::Binary(BinOp::Lte, Box::new(node), Box::new(rhs)),
                    tok,
                );
            } else if let Some(tok) = self.cur.consume("<") {
                let rhs = self.shift()?;
                node = Node::new(
                    NodeKind::Binary(BinOp::Lt, Box::new(node), Box::new(rhs)),
                    tok,
                );
            } else if let Some(tok) = self.cur.consume(">=") {
                // a >= b parses as b <= a
                let rhs = self.shift()?;
                node = Node::new(
                    NodeKind::Binary(BinOp::Lte, Box::new(rhs), Box::new(node)),
                    tok,
                );
            } else if let Some(tok) = self.cur.consume(">") {
                let rhs = self.shift()?;
                node = Node::new(
                    NodeKind::Binary(BinOp::Lt, Box::new(rhs), Box::new(node)),
                    tok,
                );
            } else {
                return Ok(node);
            }
        }
    }

    fn shift(&mut self) -> Result<Node> {
        self.binary_chain(Self::add, &[("<<", BinOp::Shl), (">>", BinOp::Shr)])
    }

    fn add(&mut self) -> Result<Node> {
        self.binary_chain(Self::mul, &[("+", BinOp::Add), ("-", BinOp::Sub)])
    }

    fn mul(&mut self) -> Result<Node> {
        self.binary_chain(
            Self::cast_expr,
            &[("*", BinOp::Mul), ("/", BinOp::Div), ("%", BinOp::Rem)],
        )
    }

    fn cast_expr(&mut self) -> Result<Node> {
        if self.cur.peek().is("(") && is_type_start(self.cur.peek_next(), &self.env, false) {
            let tok = self.cur.advance();
            let ty = self.type_name()?;
            self.cur.expect(")")?;
            let operand = self.cast_expr()?;
            return Ok(Node::new(NodeKind::Cast(ty, Box::new(operand)), tok));
        }
        self.unary()
    }

    /// A type name inside a cast or `sizeof`.
    fn type_name(&mut self) -> Result<Type> {
        let start = self.cur.mark();
        let spec = self.declaration_specifiers()?;
        if spec.is_typedef || spec.storage != StorageClass::Auto {
            return Err(self.err_at(start, "invalid type name"));
        }
        Ok(spec.ty)
    }

    fn unary(&mut self) -> Result<Node> {
        if let Some(tok) = self.cur.consume_kw(Keyword::Sizeof) {
            if self.cur.peek().is("(") && is_type_start(self.cur.peek_next(), &self.env, false) {
                self.cur.advance();
                let ty = self.type_name()?;
                self.cur.expect(")")?;
                return Ok(Node::new(NodeKind::SizeofType(ty), tok));
            }
            let operand = self.unary()?;
            return Ok(Node::new(NodeKind::Sizeof(Box::new(operand)), tok));
        }
        if self.cur.consume("+").is_some() {
            // unary plus does nothing
            return self.cast_expr();
        }
        if let Some(tok) = self.cur.consume("-") {
            let operand = self.cast_expr()?;
            return Ok(Node::new(NodeKind::Unary(UnOp::Neg, Box::new(operand)), tok));
        }
        if let Some(tok) = self.cur.consume("!") {
            let operand = self.cast_expr()?;
            return Ok(Node::new(
                NodeKind::Unary(UnOp::LogNot, Box::new(operand)),
                tok,
            ));
        }
        if let Some(tok) = self.cur.consume("~") {
            let operand = self.cast_expr()?;
            return Ok(Node::new(
                NodeKind::Unary(UnOp::BitNot, Box::new(operand)),
                tok,
            ));
        }
        if let Some(tok) = self.cur.consume("*") {
            let operand = self.cast_expr()?;
            return Ok(Node::new(NodeKind::Deref(Box::new(operand)), tok));
        }
        if let Some(tok) = self.cur.consume("&") {
            let operand = self.cast_expr()?;
            return Ok(Node::new(NodeKind::Addr(Box::new(operand)), tok));
        }
        if let Some(tok) = self.cur.consume("++") {
            let operand = self.unary()?;
            return Ok(Node::new(NodeKind::PreInc(Box::new(operand)), tok));
        }
        if let Some(tok) = self.cur.consume("--") {
            let operand = self.unary()?;
            return Ok(Node::new(NodeKind::PreDec(Box::new(operand)), tok));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Node> {
        let mut node = self.primary()?;
        loop {
            if let Some(tok) = self.cur.consume("[") {
                let index = self.expr()?;
                self.cur.expect("]")?;
                node = Node::new(
                    NodeKind::Subscript(Box::new(node), Box::new(index)),
                    tok,
                );
            } else if let Some(tok) = self.cur.consume(".") {
                let field_tok = self.cur.expect_ident()?;
                node = Node::new(
                    NodeKind::Member {
                        base: Box::new(node),
                        arrow: false,
                        field: self.ts.tok(field_tok).text.to_string(),
                        offset: 0,
                    },
                    tok,
                );
            } else if let Some(tok) = self.cur.consume("->") {
                let field_tok = self.cur.expect_ident()?;
                node = Node::new(
                    NodeKind::Member {
                        base: Box::new(node),
                        arrow: true,
                        field: self.ts.tok(field_tok).text.to_string(),
                        offset: 0,
                    },
                    tok,
                );
            } else if let Some(tok) = self.cur.consume("++") {
                node = Node::new(NodeKind::PostInc(Box::new(node)), tok);
            } else if let Some(tok) = self.cur.consume("--") {
                node = Node::new(NodeKind::PostDec(Box::new(node)), tok);
            } else {
                return Ok(node);
            }
        }
    }

    fn primary(&mut self) -> Result<Node> {
        if self.cur.consume("(").is_some() {
            let node = self.expr()?;
            self.cur.expect(")")?;
            return Ok(node);
        }

        if let Some(tok) = self.cur.consume_string() {
            let text = self.ts.tok(tok);
            let decoded = decode_string_literal(text.text, text.pos)?;
            let key = id(format!(".LC{}", self.strings.len()));
            self.strings.push((key, decoded));
            return Ok(Node::new(NodeKind::Str(key), tok));
        }

        if let Some((tok, val)) = self.cur.consume_number() {
            return Ok(Node::num(val, tok));
        }

        if self.cur.peek().kind == TokenKind::Ident {
            if self.cur.peek().text == "__asm__" {
                return self.builtin_asm();
            }
            if self.cur.peek_next().is("(") {
                let name_tok = self.cur.advance();
                let name = self.ts.tok(name_tok).text;
                self.cur.expect("(")?;
                let mut args = vec![];
                if self.cur.consume(")").is_none() {
                    loop {
                        args.push(self.assignment()?);
                        if self.cur.consume(",").is_some() {
                            continue;
                        }
                        self.cur.expect(")")?;
                        break;
                    }
                }
                if args.len() > 6 {
                    return Err(self.err_at(name_tok, "too many arguments"));
                }
                return Ok(Node::new(
                    NodeKind::FuncCall {
                        name: id(name),
                        args,
                    },
                    name_tok,
                ));
            }
            let tok = self.cur.advance();
            let name = self.ts.tok(tok).text;
            if let Some(val) = self.env.lookup_enum_const(name) {
                return Ok(Node::num(val, tok));
            }
            let Some(var) = self.env.lookup_var(name) else {
                return Err(self.err_at(tok, "undeclared identifier"));
            };
            return Ok(Node::new(NodeKind::Var { var, is_new: false }, tok));
        }

        Err(self.cur.error("unexpected token"))
    }

    /// `__asm__("...")`.
    fn builtin_asm(&mut self) -> Result<Node> {
        let tok = self.cur.advance();
        self.cur.expect("(")?;
        let Some(stok) = self.cur.consume_string() else {
            return Err(self.cur.error("__asm__ takes a string literal"));
        };
        let text = self.ts.tok(stok);
        let decoded = decode_string_literal(text.text, text.pos)?;
        self.cur.expect(")")?;
        Ok(Node::new(NodeKind::BuiltinAsm(decoded), tok))
    }

    // ------------------------------------------------------------------
    // constant expressions
    // ------------------------------------------------------------------

    /// Parse and evaluate a constant expression (case labels, array sizes,
    /// enum values).
    fn constant_expression(&mut self) -> Result<i64> {
        let node = self.conditional()?;
        self.eval_constant(&node)
    }

    fn eval_constant(&self, node: &Node) -> Result<i64> {
        let fail = || self.err_at(node.tok, "failed to evaluate constant expression");
        match &node.kind {
            NodeKind::Num(v) => Ok(*v),
            NodeKind::Unary(UnOp::Neg, x) => Ok(-self.eval_constant(x)?),
            NodeKind::Unary(UnOp::LogNot, x) => Ok((self.eval_constant(x)? == 0) as i64),
            NodeKind::Unary(UnOp::BitNot, x) => Ok(!self.eval_constant(x)?),
            NodeKind::Binary(op, l, r) => {
                let l = self.eval_constant(l)?;
                let r = self.eval_constant(r)?;
                Ok(match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l.checked_div(r).ok_or_else(fail)?,
                    BinOp::Rem => l.checked_rem(r).ok_or_else(fail)?,
                    BinOp::Eq => (l == r) as i64,
                    BinOp::Neq => (l != r) as i64,
                    BinOp::Lt => (l < r) as i64,
                    BinOp::Lte => (l <= r) as i64,
                    BinOp::BitAnd => l & r,
                    BinOp::BitOr => l | r,
                    BinOp::BitXor => l ^ r,
                    BinOp::Shl => l.checked_shl(r.try_into().map_err(|_| fail())?).ok_or_else(fail)?,
                    BinOp::Shr => l.checked_shr(r.try_into().map_err(|_| fail())?).ok_or_else(fail)?,
                    BinOp::LogAnd => (l != 0 && r != 0) as i64,
                    BinOp::LogOr => (l != 0 || r != 0) as i64,
                    BinOp::Comma => return Err(fail()),
                })
            }
            NodeKind::SizeofType(ty) => {
                try_size_of(ty, &self.env.structs).map(|s| s as i64).ok_or_else(fail)
            }
            NodeKind::Sizeof(inner) => match &inner.kind {
                NodeKind::Var { var, .. } => try_size_of(&self.env.vars[*var].ty, &self.env.structs)
                    .map(|s| s as i64)
                    .ok_or_else(fail),
                NodeKind::Num(_) => Ok(4),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        }
    }
}

/// Can this token start a type? Storage classes count only in declaration
/// position, not in casts or `sizeof`.
fn is_type_start(tok: &Token, env: &Env, allow_storage: bool) -> bool {
    match tok.kind {
        TokenKind::Keyword(k) => matches!(
            k,
            Keyword::Int
                | Keyword::Char
                | Keyword::Long
                | Keyword::Short
                | Keyword::Void
                | Keyword::Bool
                | Keyword::Struct
                | Keyword::Union
                | Keyword::Enum
        ) || (allow_storage
            && matches!(k, Keyword::Typedef | Keyword::Static | Keyword::Extern)),
        TokenKind::Ident => {
            tok.text == "signed" || tok.text == "unsigned" || env.is_typedef_name(tok.text)
        }
        _ => false,
    }
}

/// The struct id of a struct-typed declarator (possibly behind array
/// layers, but not behind a pointer).
fn bare_struct(ty: &Type) -> Option<StructId> {
    match ty.kind {
        TypeKind::Struct(sid) => Some(sid),
        TypeKind::Array(_) => bare_struct(ty.pointee()),
        _ => None,
    }
}

/// Resolve the escape sequences of a string literal (quotes included).
pub fn decode_string_literal(text: &str, pos: usize) -> Result<String> {
    let body = &text[1..text.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some((_, esc)) = chars.next() else {
            unreachable!("lexer passed a dangling backslash");
        };
        out.push(match esc {
            'n' => '\n',
            't' => '\t',
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            '0' => '\0',
            'e' => '\x1b',
            _ => {
                return Err(CompileError::at(
                    pos + 1 + i,
                    2,
                    "unknown escape sequence",
                ));
            }
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::lex::Lexer;

    fn parse_src(src: &str) -> Result<Program> {
        let ts = Lexer::new(src, false).tokenize().unwrap();
        parse(&ts)
    }

    fn first_func(prog: &Program) -> (&Vec<Node>, &Program) {
        for item in &prog.items {
            if let NodeKind::FuncDef { body, .. } = &item.kind {
                return (body, prog);
            }
        }
        panic!("no function in program");
    }

    #[test]
    fn precedence_nests_mul_under_add() {
        let prog = parse_src("int main() { return 1 + 2 * 3; }").unwrap();
        let (body, _) = first_func(&prog);
        let NodeKind::Return(Some(e)) = &body[0].kind else {
            panic!("not a return");
        };
        let NodeKind::Binary(BinOp::Add, _, rhs) = &e.kind else {
            panic!("top is not +");
        };
        assert!(matches!(rhs.kind, NodeKind::Binary(BinOp::Mul, _, _)));
    }

    #[test]
    fn greater_than_swaps_into_less_than() {
        let prog = parse_src("int main() { return 2 > 1; }").unwrap();
        let (body, _) = first_func(&prog);
        let NodeKind::Return(Some(e)) = &body[0].kind else {
            panic!("not a return");
        };
        let NodeKind::Binary(BinOp::Lt, lhs, _) = &e.kind else {
            panic!("top is not <");
        };
        assert!(matches!(lhs.kind, NodeKind::Num(1)));
    }

    #[test]
    fn declarations_define_variables_with_their_types() {
        let prog = parse_src("int main() { int *p; long x; }").unwrap();
        assert_eq!(prog.vars.len(), 2);
        assert_eq!(prog.vars[0].ty.kind, TypeKind::Ptr);
        assert_eq!(prog.vars[1].ty.kind, TypeKind::Long);
        assert!(prog.vars[0].is_local);
    }

    #[test]
    fn array_declarators_build_the_array_type_directly() {
        let prog = parse_src("int main() { int a[2][3]; }").unwrap();
        let ty = &prog.vars[0].ty;
        assert_eq!(ty.kind, TypeKind::Array(2));
        assert_eq!(ty.pointee().kind, TypeKind::Array(3));
        assert_eq!(ty.pointee().pointee().kind, TypeKind::Int);
    }

    #[test]
    fn duplicate_locals_in_one_scope_fail() {
        let err = parse_src("int main() { int a; int a; }").unwrap_err();
        assert_eq!(err.msg, "variable is already defined");
    }

    #[test]
    fn shadowing_in_an_inner_scope_is_fine() {
        assert!(parse_src("int main() { int a; { int a; } }").is_ok());
    }

    #[test]
    fn undeclared_identifiers_fail() {
        let err = parse_src("int main() { return x; }").unwrap_err();
        assert_eq!(err.msg, "undeclared identifier");
    }

    #[test]
    fn typedef_names_act_as_type_specifiers() {
        let prog = parse_src("typedef int myint; int main() { myint x; x = 1; }").unwrap();
        assert_eq!(prog.vars[0].ty.kind, TypeKind::Int);
    }

    #[test]
    fn typedef_of_an_array_reorders_the_wrapper() {
        let prog = parse_src("typedef int triple[3]; int main() { triple t; t[0] = 1; }").unwrap();
        assert_eq!(prog.vars[0].ty.kind, TypeKind::Array(3));
    }

    #[test]
    fn struct_fields_get_laid_out() {
        let prog =
            parse_src("struct point { int x; int y; }; int main() { struct point p; p.x = 1; }")
                .unwrap();
        let record = &prog.structs[0];
        assert!(record.defined);
        assert_eq!(record.size, 8);
        assert_eq!(record.field("y").unwrap().offset, 4);
    }

    #[test]
    fn struct_redefinition_fails() {
        let err =
            parse_src("struct s { int x; }; struct s { int y; }; int main() { return 0; }")
                .unwrap_err();
        assert_eq!(err.msg, "struct redefinition");
    }

    #[test]
    fn enum_constants_become_numbers() {
        let prog = parse_src("enum { A, B = 5, C }; int main() { return C; }").unwrap();
        let (body, _) = first_func(&prog);
        let NodeKind::Return(Some(e)) = &body[0].kind else {
            panic!("not a return");
        };
        assert!(matches!(e.kind, NodeKind::Num(6)));
    }

    #[test]
    fn break_desugars_into_goto_the_loop_end() {
        let prog = parse_src("int main() { while (1) break; }").unwrap();
        let (body, _) = first_func(&prog);
        let NodeKind::While { body: b, .. } = &body[0].kind else {
            panic!("not a while");
        };
        let NodeKind::Goto(target) = &b.kind else {
            panic!("break did not desugar");
        };
        assert_eq!(target.as_str(), ".Lendwhile_0_main");
    }

    #[test]
    fn switch_collects_its_cases_in_order() {
        let prog = parse_src(
            "int main(int x) { switch (x) { case 1: return 1; default: return 9; } }",
        )
        .unwrap();
        let (body, _) = first_func(&prog);
        let NodeKind::Switch { cases, .. } = &body[0].kind else {
            panic!("not a switch");
        };
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].value, 1);
        assert!(cases[1].is_default);
    }

    #[test]
    fn invalid_specifier_combinations_fail() {
        let err = parse_src("long char x; int main() { return 0; }").unwrap_err();
        assert_eq!(err.msg, "invalid type specifier");
    }

    #[test]
    fn missing_type_specifier_fails() {
        let err = parse_src("x; int main() { return 0; }").unwrap_err();
        assert_eq!(err.msg, "declaration has no type specifier");
    }

    #[test]
    fn too_many_call_arguments_fail() {
        let err =
            parse_src("int main() { return f(1, 2, 3, 4, 5, 6, 7); }").unwrap_err();
        assert_eq!(err.msg, "too many arguments");
    }

    #[test]
    fn string_literals_land_in_the_pool_per_occurrence() {
        let prog = parse_src("int main() { char *a = \"hi\"; char *b = \"hi\"; }").unwrap();
        assert_eq!(prog.strings.len(), 2);
        assert_eq!(prog.strings[0].1, "hi");
    }

    #[test]
    fn escape_sequences_decode() {
        assert_eq!(decode_string_literal("\"a\\n\\t\\\\\"", 0).unwrap(), "a\n\t\\");
        assert!(decode_string_literal("\"\\q\"", 0).is_err());
    }

    #[test]
    fn labels_are_function_qualified() {
        let prog = parse_src("int main() { goto out; out: return 0; }").unwrap();
        let (body, _) = first_func(&prog);
        let NodeKind::Goto(target) = &body[0].kind else {
            panic!("not a goto");
        };
        assert_eq!(target.as_str(), ".Lgoto_out_main");
    }

    #[test]
    fn sizeof_a_type_name_parses() {
        let prog = parse_src("int main() { return sizeof(long); }").unwrap();
        let (body, _) = first_func(&prog);
        let NodeKind::Return(Some(e)) = &body[0].kind else {
            panic!("not a return");
        };
        assert!(matches!(e.kind, NodeKind::SizeofType(_)));
    }
}
