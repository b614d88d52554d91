//! The semantic analyzer.
//!
//! Two passes over every function. Pass one walks post-order, assigns a type
//! to every value-producing node, inserts the implicit conversions, rewrites
//! `sizeof` into a `long` literal and `a[i]` into `*(a+i)`, and scales the
//! integer side of pointer arithmetic by the pointee size. Pass two assigns
//! stack offsets to local variables and records each function's frame size.

use log::debug;

use crate::common::{align_up, CompileError, Result};
use crate::front::ast::{BinOp, Node, NodeKind, Program, UnOp};
use crate::front::lex::{TokenId, TokenStream};
use crate::front::types::{
    align_of, size_of, try_size_of, StructRecord, Type, TypeKind, Var,
};

pub fn analyze(prog: &mut Program, ts: &TokenStream) -> Result<()> {
    debug!("start analyzer");
    let mut analyzer = Analyzer {
        vars: &mut prog.vars,
        structs: &prog.structs,
        ts,
    };
    for item in &mut prog.items {
        analyzer.add_type(item)?;
    }
    for item in &mut prog.items {
        assign_offsets_item(item, &mut prog.vars, &prog.structs);
    }
    Ok(())
}

struct Analyzer<'a, 'src> {
    vars: &'a mut Vec<Var>,
    structs: &'a [StructRecord],
    ts: &'a TokenStream<'src>,
}

/// Conversion rank; a higher rank wins the implicit conversion.
fn rank(ty: &Type) -> u32 {
    match ty.kind {
        TypeKind::LongLong => 6,
        TypeKind::Long => 5,
        TypeKind::Int => 4,
        TypeKind::Short => 3,
        TypeKind::Char => 2,
        TypeKind::Bool => 1,
        _ => 0,
    }
}

impl<'a, 'src> Analyzer<'a, 'src> {
    fn err_at(&self, tok: TokenId, msg: impl Into<String>) -> CompileError {
        let t = self.ts.tok(tok);
        CompileError::at(t.pos, t.len().max(1), msg.into())
    }

    fn size_of_checked(&self, ty: &Type, tok: TokenId) -> Result<usize> {
        try_size_of(ty, self.structs).ok_or_else(|| self.err_at(tok, "struct not defined"))
    }

    /// The wider of two integer types.
    fn usual_conversion(&self, lhs: &Node, rhs: &Node, tok: TokenId) -> Result<Type> {
        let lt = lhs.ty();
        let rt = rhs.ty();
        if !lt.is_integer() || !rt.is_integer() {
            return Err(self.err_at(tok, "incompatible operand types"));
        }
        Ok(if rank(lt) >= rank(rt) {
            lt.clone()
        } else {
            rt.clone()
        })
    }

    /// Multiply a pointer-arithmetic index by the pointee size, in place.
    fn scale_index(&self, n: &mut Node, elem: &Type, tok: TokenId) -> Result<()> {
        if !n.ty().is_integer() {
            return Err(self.err_at(tok, "incompatible operand types"));
        }
        let size = self.size_of_checked(elem, tok)? as i64;
        let inner = std::mem::replace(n, Node::num(0, tok));
        let mut size_node = Node::num(size, tok);
        size_node.ty = Some(Type::long());
        *n = Node {
            kind: NodeKind::Binary(BinOp::Mul, Box::new(inner), Box::new(size_node)),
            tok,
            ty: Some(Type::long()),
        };
        Ok(())
    }

    /// Replace a node with a conversion wrapped around its old self.
    fn wrap(&self, n: &mut Node, make: fn(Box<Node>) -> NodeKind, ty: Type) {
        let tok = n.tok;
        let inner = std::mem::replace(n, Node::num(0, tok));
        *n = Node {
            kind: make(Box::new(inner)),
            tok,
            ty: Some(ty),
        };
    }

    /// Insert the conversion that narrows or widens `rhs` to `target`.
    fn convert_to(&self, rhs: &mut Node, target: &Type, tok: TokenId) -> Result<()> {
        let from = rhs.ty().clone();
        if from == *target {
            return Ok(());
        }
        if target.kind == TypeKind::Bool {
            self.wrap(rhs, NodeKind::Eval, target.clone());
            return Ok(());
        }
        let to_size = self.size_of_checked(target, tok)?;
        let from_size = self.size_of_checked(&from, tok)?;
        if to_size > from_size {
            if from.signed {
                self.wrap(rhs, NodeKind::SignExtend, target.clone());
            } else {
                self.wrap(rhs, NodeKind::ZeroExtend, target.clone());
            }
        } else if to_size < from_size {
            self.wrap(rhs, NodeKind::Truncate, target.clone());
        }
        Ok(())
    }

    fn add_type(&mut self, node: &mut Node) -> Result<()> {
        // Rewrites re-enter this function on subtrees whose children are
        // already typed; a typed node is done.
        if node.ty.is_some() {
            return Ok(());
        }
        let tok = node.tok;
        match &mut node.kind {
            NodeKind::Num(_) => node.ty = Some(Type::int()),
            NodeKind::Str(_) => node.ty = Some(Type::new(TypeKind::Str)),
            NodeKind::Var { var, .. } => node.ty = Some(self.vars[*var].ty.clone()),
            NodeKind::Addr(x) => {
                self.add_type(x)?;
                node.ty = Some(Type::ptr_to(x.ty().clone()));
            }
            NodeKind::Deref(x) => {
                self.add_type(x)?;
                if !x.ty().is_ptr_like() {
                    return Err(self.err_at(tok, "invalid dereference"));
                }
                node.ty = Some(x.ty().pointee().clone());
            }
            NodeKind::Subscript(..) => {
                let NodeKind::Subscript(mut base, mut index) =
                    std::mem::replace(&mut node.kind, NodeKind::Nop)
                else {
                    unreachable!();
                };
                self.add_type(&mut base)?;
                self.add_type(&mut index)?;
                if let (TypeKind::Array(len), NodeKind::Num(v)) = (&base.ty().kind, &index.kind) {
                    if *v < 0 || *v >= *len as i64 {
                        return Err(self.err_at(tok, "array index out of bounds"));
                    }
                }
                // a[i] is *(a + i)
                let sum = Node {
                    kind: NodeKind::Binary(BinOp::Add, base, index),
                    tok,
                    ty: None,
                };
                node.kind = NodeKind::Deref(Box::new(sum));
                return self.add_type(node);
            }
            NodeKind::Member {
                base,
                arrow,
                field,
                offset,
            } => {
                self.add_type(base)?;
                let bt = base.ty();
                let sid = match (&bt.kind, *arrow) {
                    (TypeKind::Struct(sid), false) => *sid,
                    (TypeKind::Ptr, true) => match bt.pointee().kind {
                        TypeKind::Struct(sid) => sid,
                        _ => return Err(self.err_at(tok, "invalid member access")),
                    },
                    _ => return Err(self.err_at(tok, "invalid member access")),
                };
                let Some(f) = self.structs[sid].field(field) else {
                    return Err(self.err_at(tok, format!("struct has no field '{field}'")));
                };
                *offset = f.offset;
                node.ty = Some(f.ty.clone());
            }
            NodeKind::Unary(op, x) => {
                self.add_type(x)?;
                match op {
                    UnOp::LogNot => node.ty = Some(Type::int()),
                    UnOp::Neg | UnOp::BitNot => {
                        if !x.ty().is_integer() {
                            return Err(self.err_at(tok, "incompatible operand types"));
                        }
                        node.ty = Some(x.ty().clone());
                    }
                }
            }
            NodeKind::Binary(op, l, r) => {
                self.add_type(l)?;
                self.add_type(r)?;
                let ty = match op {
                    BinOp::Add => {
                        let lp = l.ty().is_ptr_like();
                        let rp = r.ty().is_ptr_like();
                        if lp && rp {
                            return Err(self.err_at(tok, "invalid use of the '+' operator"));
                        }
                        if lp {
                            let elem = l.ty().pointee().clone();
                            self.scale_index(r, &elem, tok)?;
                            l.ty().clone()
                        } else if rp {
                            // The scale applies whichever side the integer is
                            // on; n+p mirrors p+n.
                            let elem = r.ty().pointee().clone();
                            self.scale_index(l, &elem, tok)?;
                            r.ty().clone()
                        } else {
                            self.usual_conversion(l, r, tok)?
                        }
                    }
                    BinOp::Sub => {
                        let lp = l.ty().is_ptr_like();
                        let rp = r.ty().is_ptr_like();
                        if rp && !lp {
                            return Err(self.err_at(tok, "invalid use of the '-' operator"));
                        }
                        if lp && rp {
                            // pointer difference, in bytes
                            Type::int()
                        } else if lp {
                            let elem = l.ty().pointee().clone();
                            self.scale_index(r, &elem, tok)?;
                            l.ty().clone()
                        } else {
                            self.usual_conversion(l, r, tok)?
                        }
                    }
                    BinOp::Mul
                    | BinOp::Div
                    | BinOp::Rem
                    | BinOp::BitAnd
                    | BinOp::BitOr
                    | BinOp::BitXor
                    | BinOp::Shl
                    | BinOp::Shr => self.usual_conversion(l, r, tok)?,
                    BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Lte => {
                        let lp = l.ty().is_ptr_like();
                        let rp = r.ty().is_ptr_like();
                        if lp != rp {
                            return Err(self.err_at(tok, "incompatible operand types"));
                        }
                        Type::int()
                    }
                    BinOp::LogAnd | BinOp::LogOr => Type::int(),
                    BinOp::Comma => r.ty().clone(),
                };
                node.ty = Some(ty);
            }
            NodeKind::Assign(l, r) => {
                self.add_type(l)?;
                if let NodeKind::Initializer(_) = r.kind {
                    let target = l.ty().clone();
                    self.type_initializer(r, &target)?;
                    node.ty = Some(target);
                    return Ok(());
                }
                self.add_type(r)?;
                let lt = l.ty().clone();
                let rt = r.ty().clone();
                if matches!(lt.kind, TypeKind::Struct(_)) {
                    return Err(self.err_at(tok, "struct assignment is not implemented"));
                }
                let ty = if lt == rt {
                    lt
                } else if lt.kind == TypeKind::Ptr
                    && lt.pointee().kind == TypeKind::Char
                    && rt.kind == TypeKind::Str
                {
                    // char *p = "...";
                    lt
                } else if lt.kind == TypeKind::Ptr
                    && matches!(rt.kind, TypeKind::Array(_))
                    && *lt.pointee() == *rt.pointee()
                {
                    // the array decays to a pointer to its first element
                    lt
                } else if lt.is_ptr_like() || rt.is_ptr_like() {
                    return Err(self.err_at(tok, "incompatible pointer assignment"));
                } else {
                    let wider = self.usual_conversion(l, r, tok)?;
                    self.convert_to(r, &lt, tok)?;
                    wider
                };
                node.ty = Some(ty);
            }
            NodeKind::PreInc(x) | NodeKind::PreDec(x) | NodeKind::PostInc(x)
            | NodeKind::PostDec(x) => {
                self.add_type(x)?;
                node.ty = Some(x.ty().clone());
            }
            NodeKind::Cast(..) => {
                let NodeKind::Cast(target, mut inner) =
                    std::mem::replace(&mut node.kind, NodeKind::Nop)
                else {
                    unreachable!();
                };
                self.add_type(&mut inner)?;
                let from = inner.ty().clone();
                *node = *inner;
                node.tok = tok;
                if target.kind == TypeKind::Bool && from.kind != TypeKind::Bool {
                    self.wrap(node, NodeKind::Eval, target);
                } else if target.is_integer() && from.is_integer() && target != from {
                    let to_size = self.size_of_checked(&target, tok)?;
                    let from_size = self.size_of_checked(&from, tok)?;
                    if to_size > from_size {
                        if from.signed {
                            self.wrap(node, NodeKind::SignExtend, target);
                        } else {
                            self.wrap(node, NodeKind::ZeroExtend, target);
                        }
                    } else if to_size < from_size {
                        self.wrap(node, NodeKind::Truncate, target);
                    } else {
                        node.ty = Some(target);
                    }
                } else {
                    // pointer casts and same-type casts just retype
                    node.ty = Some(target);
                }
            }
            NodeKind::SignExtend(_) | NodeKind::ZeroExtend(_) | NodeKind::Truncate(_)
            | NodeKind::Eval(_) => {
                // Inserted by this pass with the type already set; the guard
                // above returns before we can get here.
                unreachable!("conversion node without a type");
            }
            NodeKind::Sizeof(x) => {
                self.add_type(x)?;
                let size = self.size_of_checked(x.ty(), tok)?;
                node.kind = NodeKind::Num(size as i64);
                node.ty = Some(Type::long());
            }
            NodeKind::SizeofType(ty) => {
                let size = self.size_of_checked(&ty.clone(), tok)?;
                node.kind = NodeKind::Num(size as i64);
                node.ty = Some(Type::long());
            }
            NodeKind::Ternary { cond, then, els } => {
                self.add_type(cond)?;
                self.add_type(then)?;
                self.add_type(els)?;
                node.ty = Some(then.ty().clone());
            }
            NodeKind::FuncCall { args, .. } => {
                for arg in args {
                    self.add_type(arg)?;
                    if matches!(arg.ty().kind, TypeKind::Struct(_)) {
                        return Err(
                            self.err_at(arg.tok, "passing structs by value is not implemented")
                        );
                    }
                }
                node.ty = Some(Type::int());
            }
            NodeKind::Initializer(_) => {
                unreachable!("initializer list outside an assignment");
            }
            // statements: recurse only
            NodeKind::FuncDef { params, body, .. } => {
                for p in params {
                    self.add_type(p)?;
                    if matches!(p.ty().kind, TypeKind::Struct(_)) {
                        return Err(
                            self.err_at(p.tok, "passing structs by value is not implemented")
                        );
                    }
                }
                for s in body {
                    self.add_type(s)?;
                }
            }
            NodeKind::DeclList(decls) => {
                for d in decls {
                    self.add_type(d)?;
                }
            }
            NodeKind::Block(stmts) => {
                for s in stmts {
                    self.add_type(s)?;
                }
            }
            NodeKind::ExprStmt(e) => self.add_type(e)?,
            NodeKind::If { cond, then, els } => {
                self.add_type(cond)?;
                self.add_type(then)?;
                if let Some(els) = els {
                    self.add_type(els)?;
                }
            }
            NodeKind::While { cond, body, .. } => {
                self.add_type(cond)?;
                self.add_type(body)?;
            }
            NodeKind::DoWhile { body, cond, .. } => {
                self.add_type(body)?;
                self.add_type(cond)?;
            }
            NodeKind::For {
                init,
                cond,
                update,
                body,
                ..
            } => {
                if let Some(init) = init {
                    self.add_type(init)?;
                }
                if let Some(cond) = cond {
                    self.add_type(cond)?;
                }
                if let Some(update) = update {
                    self.add_type(update)?;
                }
                self.add_type(body)?;
            }
            NodeKind::Switch { cond, body, .. } => {
                self.add_type(cond)?;
                self.add_type(body)?;
            }
            NodeKind::Case { stmt, .. } => self.add_type(stmt)?,
            NodeKind::Return(value) => {
                if let Some(value) = value {
                    self.add_type(value)?;
                    if matches!(value.ty().kind, TypeKind::Struct(_)) {
                        return Err(self
                            .err_at(value.tok, "returning structs by value is not implemented"));
                    }
                }
            }
            NodeKind::LabelStmt { stmt, .. } => self.add_type(stmt)?,
            NodeKind::BuiltinAsm(_) | NodeKind::Goto(_) | NodeKind::Nop => {}
        }
        Ok(())
    }

    /// Type a brace initializer against the declared type, element-wise.
    fn type_initializer(&mut self, init: &mut Node, target: &Type) -> Result<()> {
        let tok = init.tok;
        let NodeKind::Initializer(elems) = &mut init.kind else {
            // scalar element inside the braces
            self.add_type(init)?;
            return Ok(());
        };
        match target.kind {
            TypeKind::Array(len) => {
                if elems.len() > len {
                    return Err(self.err_at(tok, "too many initializers"));
                }
                let elem_ty = target.pointee().clone();
                for e in elems {
                    self.type_initializer(e, &elem_ty)?;
                }
            }
            TypeKind::Struct(sid) => {
                let fields: Vec<Type> = self.structs[sid]
                    .fields
                    .iter()
                    .map(|f| f.ty.clone())
                    .collect();
                if elems.len() > fields.len() {
                    return Err(self.err_at(tok, "too many initializers"));
                }
                for (e, fty) in elems.iter_mut().zip(fields) {
                    self.type_initializer(e, &fty)?;
                }
            }
            _ => return Err(self.err_at(tok, "invalid initializer")),
        }
        init.ty = Some(target.clone());
        Ok(())
    }
}

/// Pass two: allocate local offsets, innermost scopes reusing the space of
/// their exited siblings; record each function's rounded frame size.
struct OffsetCtx {
    stack: Vec<usize>,
    max: usize,
}

impl OffsetCtx {
    fn top(&mut self) -> &mut usize {
        self.stack.last_mut().unwrap()
    }

    fn enter(&mut self) {
        let top = *self.stack.last().unwrap();
        self.stack.push(top);
    }

    fn exit(&mut self) {
        self.stack.pop();
    }

    fn alloc(&mut self, size: usize, align: usize) -> usize {
        let cursor = align_up(*self.top(), align.max(1)) + size;
        *self.top() = cursor;
        self.max = self.max.max(cursor);
        cursor
    }
}

fn assign_offsets_item(item: &mut Node, vars: &mut [Var], structs: &[StructRecord]) {
    if let NodeKind::FuncDef {
        params,
        body,
        stack_size,
        ..
    } = &mut item.kind
    {
        let mut ctx = OffsetCtx {
            stack: vec![0],
            max: 0,
        };
        for p in params.iter_mut() {
            assign_offsets(p, vars, structs, &mut ctx);
        }
        for s in body.iter_mut() {
            assign_offsets(s, vars, structs, &mut ctx);
        }
        *stack_size = align_up(ctx.max, 8);
    }
}

fn assign_offsets(node: &mut Node, vars: &mut [Var], structs: &[StructRecord], ctx: &mut OffsetCtx) {
    match &mut node.kind {
        NodeKind::Var { var, is_new } => {
            if *is_new && vars[*var].is_local {
                let ty = vars[*var].ty.clone();
                let size = size_of(&ty, structs);
                let align = align_of(&ty, structs);
                vars[*var].offset = ctx.alloc(size, align);
            }
        }
        NodeKind::Block(stmts) => {
            ctx.enter();
            for s in stmts {
                assign_offsets(s, vars, structs, ctx);
            }
            ctx.exit();
        }
        NodeKind::For {
            init,
            cond,
            update,
            body,
            ..
        } => {
            ctx.enter();
            if let Some(init) = init {
                assign_offsets(init, vars, structs, ctx);
            }
            if let Some(cond) = cond {
                assign_offsets(cond, vars, structs, ctx);
            }
            if let Some(update) = update {
                assign_offsets(update, vars, structs, ctx);
            }
            assign_offsets(body, vars, structs, ctx);
            ctx.exit();
        }
        NodeKind::DeclList(nodes) | NodeKind::Initializer(nodes) => {
            for n in nodes {
                assign_offsets(n, vars, structs, ctx);
            }
        }
        NodeKind::FuncCall { args, .. } => {
            for a in args {
                assign_offsets(a, vars, structs, ctx);
            }
        }
        NodeKind::Assign(l, r) | NodeKind::Binary(_, l, r) => {
            assign_offsets(l, vars, structs, ctx);
            assign_offsets(r, vars, structs, ctx);
        }
        NodeKind::Unary(_, x)
        | NodeKind::Addr(x)
        | NodeKind::Deref(x)
        | NodeKind::SignExtend(x)
        | NodeKind::ZeroExtend(x)
        | NodeKind::Truncate(x)
        | NodeKind::Eval(x)
        | NodeKind::PreInc(x)
        | NodeKind::PreDec(x)
        | NodeKind::PostInc(x)
        | NodeKind::PostDec(x)
        | NodeKind::ExprStmt(x) => assign_offsets(x, vars, structs, ctx),
        NodeKind::Member { base, .. } => assign_offsets(base, vars, structs, ctx),
        NodeKind::Ternary { cond, then, els } => {
            assign_offsets(cond, vars, structs, ctx);
            assign_offsets(then, vars, structs, ctx);
            assign_offsets(els, vars, structs, ctx);
        }
        NodeKind::If { cond, then, els } => {
            assign_offsets(cond, vars, structs, ctx);
            assign_offsets(then, vars, structs, ctx);
            if let Some(els) = els {
                assign_offsets(els, vars, structs, ctx);
            }
        }
        NodeKind::While { cond, body, .. } => {
            assign_offsets(cond, vars, structs, ctx);
            assign_offsets(body, vars, structs, ctx);
        }
        NodeKind::DoWhile { body, cond, .. } => {
            assign_offsets(body, vars, structs, ctx);
            assign_offsets(cond, vars, structs, ctx);
        }
        NodeKind::Switch { cond, body, .. } => {
            assign_offsets(cond, vars, structs, ctx);
            assign_offsets(body, vars, structs, ctx);
        }
        NodeKind::Case { stmt, .. } => assign_offsets(stmt, vars, structs, ctx),
        NodeKind::Return(Some(x)) => assign_offsets(x, vars, structs, ctx),
        NodeKind::LabelStmt { stmt, .. } => assign_offsets(stmt, vars, structs, ctx),
        NodeKind::Subscript(..) | NodeKind::Sizeof(_) | NodeKind::SizeofType(_)
        | NodeKind::Cast(..) => {
            unreachable!("not rewritten by pass one")
        }
        NodeKind::FuncDef { .. } => unreachable!("nested function definition"),
        NodeKind::Num(_)
        | NodeKind::Str(_)
        | NodeKind::BuiltinAsm(_)
        | NodeKind::Goto(_)
        | NodeKind::Return(None)
        | NodeKind::Nop => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::lex::Lexer;
    use crate::front::parse::parse;

    fn analyzed(src: &str) -> Program {
        let ts = Lexer::new(src, false).tokenize().unwrap();
        let mut prog = parse(&ts).unwrap();
        analyze(&mut prog, &ts).unwrap();
        prog
    }

    fn analyze_err(src: &str) -> CompileError {
        let ts = Lexer::new(src, false).tokenize().unwrap();
        let mut prog = parse(&ts).unwrap();
        analyze(&mut prog, &ts).unwrap_err()
    }

    fn func_body(prog: &Program) -> &Vec<Node> {
        for item in &prog.items {
            if let NodeKind::FuncDef { body, .. } = &item.kind {
                return body;
            }
        }
        panic!("no function");
    }

    fn func_stack_size(prog: &Program) -> usize {
        for item in &prog.items {
            if let NodeKind::FuncDef { stack_size, .. } = &item.kind {
                return *stack_size;
            }
        }
        panic!("no function");
    }

    #[test]
    fn sizeof_rewrites_into_a_long_literal() {
        let prog = analyzed("int main() { int x; return sizeof x; }");
        let body = func_body(&prog);
        let NodeKind::Return(Some(e)) = &body[1].kind else {
            panic!("not a return");
        };
        assert!(matches!(e.kind, NodeKind::Num(4)));
        assert_eq!(e.ty.as_ref().unwrap().kind, TypeKind::Long);
    }

    #[test]
    fn subscript_rewrites_into_deref_of_add() {
        let prog = analyzed("int main() { int a[3]; return a[2]; }");
        let body = func_body(&prog);
        let NodeKind::Return(Some(e)) = &body[1].kind else {
            panic!("not a return");
        };
        let NodeKind::Deref(inner) = &e.kind else {
            panic!("subscript not rewritten: {:?}", e.kind);
        };
        let NodeKind::Binary(BinOp::Add, _, idx) = &inner.kind else {
            panic!("no add under deref");
        };
        // the index is scaled by sizeof(int)
        let NodeKind::Binary(BinOp::Mul, _, size) = &idx.kind else {
            panic!("index not scaled");
        };
        assert!(matches!(size.kind, NodeKind::Num(4)));
    }

    #[test]
    fn constant_subscript_out_of_bounds_fails() {
        let err = analyze_err("int main() { int a[3]; return a[3]; }");
        assert_eq!(err.msg, "array index out of bounds");
    }

    #[test]
    fn pointer_plus_integer_scales_either_order() {
        for src in [
            "int main() { int a[4]; int *p; p = a + 1; }",
            "int main() { int a[4]; int *p; p = 1 + a; }",
        ] {
            let prog = analyzed(src);
            let body = func_body(&prog);
            let NodeKind::ExprStmt(assign) = &body[2].kind else {
                panic!("not an expr stmt");
            };
            let NodeKind::Assign(_, rhs) = &assign.kind else {
                panic!("not an assign");
            };
            assert!(rhs.ty().is_ptr_like(), "in {src}");
        }
    }

    #[test]
    fn pointer_plus_pointer_fails() {
        let err = analyze_err("int main() { int *p; int *q; return p + q; }");
        assert_eq!(err.msg, "invalid use of the '+' operator");
    }

    #[test]
    fn integer_minus_pointer_fails() {
        let err = analyze_err("int main() { int *p; return 1 - p; }");
        assert_eq!(err.msg, "invalid use of the '-' operator");
    }

    #[test]
    fn deref_of_an_integer_fails() {
        let err = analyze_err("int main() { int x; return *x; }");
        assert_eq!(err.msg, "invalid dereference");
    }

    #[test]
    fn pointer_assignment_mismatch_has_its_own_diagnostic() {
        let err = analyze_err("int main() { int *p; long q; p = q; }");
        assert_eq!(err.msg, "incompatible pointer assignment");
    }

    #[test]
    fn narrowing_assignment_inserts_truncate() {
        let prog = analyzed("int main() { char c; long v; c = v; }");
        let body = func_body(&prog);
        let NodeKind::ExprStmt(assign) = &body[2].kind else {
            panic!("not an expr stmt");
        };
        let NodeKind::Assign(_, rhs) = &assign.kind else {
            panic!("not an assign");
        };
        assert!(matches!(rhs.kind, NodeKind::Truncate(_)));
        // the expression's own type is the wider operand
        assert_eq!(assign.ty.as_ref().unwrap().kind, TypeKind::Long);
    }

    #[test]
    fn widening_assignment_inserts_sign_extend() {
        let prog = analyzed("int main() { long v; char c; v = c; }");
        let body = func_body(&prog);
        let NodeKind::ExprStmt(assign) = &body[2].kind else {
            panic!("not an expr stmt");
        };
        let NodeKind::Assign(_, rhs) = &assign.kind else {
            panic!("not an assign");
        };
        assert!(matches!(rhs.kind, NodeKind::SignExtend(_)));
    }

    #[test]
    fn bool_assignment_inserts_eval() {
        let prog = analyzed("int main() { _Bool b; b = 5; }");
        let body = func_body(&prog);
        let NodeKind::ExprStmt(assign) = &body[1].kind else {
            panic!("not an expr stmt");
        };
        let NodeKind::Assign(_, rhs) = &assign.kind else {
            panic!("not an assign");
        };
        assert!(matches!(rhs.kind, NodeKind::Eval(_)));
    }

    #[test]
    fn member_access_resolves_offsets() {
        let prog = analyzed(
            "struct p { int x; int y; }; int main() { struct p v; return v.y; }",
        );
        let body = func_body(&prog);
        let NodeKind::Return(Some(e)) = &body[1].kind else {
            panic!("not a return");
        };
        let NodeKind::Member { offset, .. } = &e.kind else {
            panic!("not a member access");
        };
        assert_eq!(*offset, 4);
    }

    #[test]
    fn missing_field_fails() {
        let err = analyze_err(
            "struct p { int x; }; int main() { struct p v; return v.z; }",
        );
        assert_eq!(err.msg, "struct has no field 'z'");
    }

    #[test]
    fn locals_are_aligned_and_the_frame_is_rounded_to_eight() {
        let prog = analyzed("int main() { char c; int i; char d; return 0; }");
        // c at 1, i aligned up to 4 then +4 = 8, d at 9; frame rounds to 16
        assert_eq!(prog.vars[0].offset, 1);
        assert_eq!(prog.vars[1].offset, 8);
        assert_eq!(prog.vars[2].offset, 9);
        assert_eq!(func_stack_size(&prog), 16);
    }

    #[test]
    fn sibling_scopes_reuse_stack_space() {
        let prog = analyzed("int main() { { int a; } { int b; } return 0; }");
        assert_eq!(prog.vars[0].offset, prog.vars[1].offset);
        assert_eq!(func_stack_size(&prog), 8);
    }

    #[test]
    fn every_value_node_is_typed_after_analysis() {
        let prog = analyzed("int main() { int a; a = 1 + 2 * 3; return a; }");
        let mut stack: Vec<&Node> = prog.items.iter().collect();
        while let Some(n) = stack.pop() {
            match &n.kind {
                NodeKind::Num(_)
                | NodeKind::Var { .. }
                | NodeKind::Binary(..)
                | NodeKind::Assign(..) => {
                    assert!(n.ty.is_some(), "untyped node {:?}", n.kind)
                }
                _ => {}
            }
            match &n.kind {
                NodeKind::Assign(a, b) | NodeKind::Binary(_, a, b) => {
                    stack.push(a);
                    stack.push(b);
                }
                NodeKind::Return(Some(x)) | NodeKind::ExprStmt(x) => stack.push(x),
                NodeKind::FuncDef { params, body, .. } => {
                    stack.extend(params.iter());
                    stack.extend(body.iter());
                }
                _ => {}
            }
        }
    }
}
