//! The constant folder.
//!
//! A post-analyzer rewrite: any numeric-only subtree collapses into a
//! literal carrying the subtree's type. Division by zero and signed-64
//! overflow disable the fold (the node stays put, no diagnostic). Running
//! the folder twice yields the same tree as running it once.

use crate::front::ast::{BinOp, Node, NodeKind, Program, UnOp};

pub fn fold(prog: &mut Program) {
    for item in &mut prog.items {
        fold_node(item);
    }
}

fn literal(node: &Node) -> Option<i64> {
    match node.kind {
        NodeKind::Num(v) => Some(v),
        _ => None,
    }
}

fn fold_binary(op: BinOp, l: i64, r: i64) -> Option<i64> {
    Some(match op {
        BinOp::Add => l.checked_add(r)?,
        BinOp::Sub => l.checked_sub(r)?,
        BinOp::Mul => l.checked_mul(r)?,
        BinOp::Div => l.checked_div(r)?,
        BinOp::Rem => l.checked_rem(r)?,
        BinOp::Eq => (l == r) as i64,
        BinOp::Neq => (l != r) as i64,
        BinOp::Lt => (l < r) as i64,
        BinOp::Lte => (l <= r) as i64,
        BinOp::BitAnd => l & r,
        BinOp::BitOr => l | r,
        BinOp::BitXor => l ^ r,
        BinOp::Shl => l.checked_shl(u32::try_from(r).ok()?)?,
        BinOp::Shr => l.checked_shr(u32::try_from(r).ok()?)?,
        BinOp::LogAnd => (l != 0 && r != 0) as i64,
        BinOp::LogOr => (l != 0 || r != 0) as i64,
        BinOp::Comma => return None,
    })
}

fn fold_node(node: &mut Node) {
    match &mut node.kind {
        NodeKind::Binary(op, l, r) => {
            fold_node(l);
            fold_node(r);
            if let (Some(lv), Some(rv)) = (literal(l), literal(r)) {
                if let Some(v) = fold_binary(*op, lv, rv) {
                    node.kind = NodeKind::Num(v);
                }
            }
        }
        NodeKind::Unary(op, x) => {
            fold_node(x);
            if let Some(v) = literal(x) {
                let folded = match op {
                    UnOp::Neg => v.checked_neg(),
                    UnOp::LogNot => Some((v == 0) as i64),
                    UnOp::BitNot => Some(!v),
                };
                if let Some(v) = folded {
                    node.kind = NodeKind::Num(v);
                }
            }
        }
        NodeKind::Assign(l, r) => {
            fold_node(l);
            fold_node(r);
        }
        NodeKind::Addr(x)
        | NodeKind::Deref(x)
        | NodeKind::SignExtend(x)
        | NodeKind::ZeroExtend(x)
        | NodeKind::Truncate(x)
        | NodeKind::Eval(x)
        | NodeKind::PreInc(x)
        | NodeKind::PreDec(x)
        | NodeKind::PostInc(x)
        | NodeKind::PostDec(x)
        | NodeKind::ExprStmt(x) => fold_node(x),
        NodeKind::Member { base, .. } => fold_node(base),
        NodeKind::Ternary { cond, then, els } => {
            fold_node(cond);
            fold_node(then);
            fold_node(els);
        }
        NodeKind::FuncCall { args, .. } => {
            for a in args {
                fold_node(a);
            }
        }
        NodeKind::FuncDef { params, body, .. } => {
            for p in params {
                fold_node(p);
            }
            for s in body {
                fold_node(s);
            }
        }
        NodeKind::DeclList(nodes) | NodeKind::Initializer(nodes) | NodeKind::Block(nodes) => {
            for n in nodes {
                fold_node(n);
            }
        }
        NodeKind::If { cond, then, els } => {
            fold_node(cond);
            fold_node(then);
            if let Some(els) = els {
                fold_node(els);
            }
        }
        NodeKind::While { cond, body, .. } => {
            fold_node(cond);
            fold_node(body);
        }
        NodeKind::DoWhile { body, cond, .. } => {
            fold_node(body);
            fold_node(cond);
        }
        NodeKind::For {
            init,
            cond,
            update,
            body,
            ..
        } => {
            if let Some(init) = init {
                fold_node(init);
            }
            if let Some(cond) = cond {
                fold_node(cond);
            }
            if let Some(update) = update {
                fold_node(update);
            }
            fold_node(body);
        }
        NodeKind::Switch { cond, body, .. } => {
            fold_node(cond);
            fold_node(body);
        }
        NodeKind::Case { stmt, .. } => fold_node(stmt),
        NodeKind::Return(Some(x)) => fold_node(x),
        NodeKind::LabelStmt { stmt, .. } => fold_node(stmt),
        NodeKind::Subscript(..) | NodeKind::Sizeof(_) | NodeKind::SizeofType(_)
        | NodeKind::Cast(..) => unreachable!("not rewritten by the analyzer"),
        NodeKind::Num(_)
        | NodeKind::Str(_)
        | NodeKind::Var { .. }
        | NodeKind::BuiltinAsm(_)
        | NodeKind::Goto(_)
        | NodeKind::Return(None)
        | NodeKind::Nop => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::analyze::analyze;
    use crate::front::lex::Lexer;
    use crate::front::parse::parse;

    fn folded(src: &str) -> Program {
        let ts = Lexer::new(src, false).tokenize().unwrap();
        let mut prog = parse(&ts).unwrap();
        analyze(&mut prog, &ts).unwrap();
        fold(&mut prog);
        prog
    }

    fn returned_expr(prog: &Program) -> &Node {
        for item in &prog.items {
            if let NodeKind::FuncDef { body, .. } = &item.kind {
                for stmt in body {
                    if let NodeKind::Return(Some(e)) = &stmt.kind {
                        return e;
                    }
                }
            }
        }
        panic!("no return");
    }

    #[test]
    fn arithmetic_collapses_to_a_literal() {
        let prog = folded("int main() { return 2 * 3 + 10 / 5; }");
        assert!(matches!(returned_expr(&prog).kind, NodeKind::Num(8)));
    }

    #[test]
    fn comparisons_fold_to_zero_or_one() {
        let prog = folded("int main() { return 3 < 5; }");
        assert!(matches!(returned_expr(&prog).kind, NodeKind::Num(1)));
    }

    #[test]
    fn short_circuit_folds_only_with_two_literals() {
        let prog = folded("int main() { return 1 && 0; }");
        assert!(matches!(returned_expr(&prog).kind, NodeKind::Num(0)));
        let prog = folded("int main() { int x; x = 1; return x && 0; }");
        assert!(matches!(
            returned_expr(&prog).kind,
            NodeKind::Binary(BinOp::LogAnd, _, _)
        ));
    }

    #[test]
    fn unary_operators_fold() {
        let prog = folded("int main() { return -(3) + !0 + ~(-1); }");
        assert!(matches!(returned_expr(&prog).kind, NodeKind::Num(-2)));
    }

    #[test]
    fn division_by_zero_is_left_in_place() {
        let prog = folded("int main() { return 1 / 0; }");
        assert!(matches!(
            returned_expr(&prog).kind,
            NodeKind::Binary(BinOp::Div, _, _)
        ));
    }

    #[test]
    fn the_folded_type_is_preserved() {
        let prog = folded("int main() { return sizeof(int) + 1; }");
        let e = returned_expr(&prog);
        assert!(matches!(e.kind, NodeKind::Num(5)));
        assert_eq!(
            e.ty.as_ref().unwrap().kind,
            crate::front::types::TypeKind::Long
        );
    }

    #[test]
    fn folding_is_idempotent() {
        let mut prog = folded("int main() { return (1 + 2) * (3 - 1); }");
        let once = format!("{:?}", returned_expr(&prog).kind);
        fold(&mut prog);
        let twice = format!("{:?}", returned_expr(&prog).kind);
        assert_eq!(once, twice);
    }
}
