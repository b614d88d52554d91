//! Lowering from the typed AST to the three-address IR.
//!
//! Each function becomes a vector of basic blocks. A terminator always
//! closes its block; every jump target is placed as a label-only block, so a
//! jump never lands mid-block. Structured statements use their parser-given
//! label cores (`.Lbeginwhile_0_main`), everything else draws from a
//! program-wide scratch counter (`.L<n>`).

use log::debug;

use crate::common::{id, CompileError, Id, Result};
use crate::front::ast::{self, BinOp, Node, NodeKind, UnOp};
use crate::front::lex::{TokenId, TokenStream};
use crate::front::types::{size_of, StorageClass, StructRecord, Type, TypeKind, Var};
use crate::middle::tir::{
    BinIr, Block, Function, GlobalInit, GlobalVar, Inst, LeaTarget, Program, Reg, RegSize, UnIr,
    UserFunc,
};

pub fn lower(prog: &ast::Program, ts: &TokenStream) -> Result<Program> {
    debug!("start IR generator");
    let mut lower = Lower {
        vars: &prog.vars,
        structs: &prog.structs,
        ts,
        label_id: 0,
    };
    let mut funcs = vec![];
    let mut globals = vec![];
    for item in &prog.items {
        lower.lower_item(item, &mut funcs, &mut globals)?;
    }
    Ok(Program {
        funcs,
        globals,
        strings: prog.strings.clone(),
    })
}

/// Per-function lowering state: the growing block list and register table.
struct FnLower {
    blocks: Vec<Block>,
    label_blocks: Vec<usize>,
    cur: usize,
    reg_sizes: Vec<RegSize>,
}

impl FnLower {
    fn new() -> FnLower {
        FnLower {
            blocks: vec![Block::default()],
            label_blocks: vec![],
            cur: 0,
            reg_sizes: vec![],
        }
    }

    fn push(&mut self, inst: Inst) {
        self.blocks[self.cur].insts.push(inst);
    }

    /// Start a fresh block (after a terminator).
    fn new_block(&mut self) {
        self.blocks.push(Block::default());
        self.cur = self.blocks.len() - 1;
    }

    /// Place `label` as the sole instruction of its own block and open a new
    /// block behind it.
    fn place_label(&mut self, name: Id) {
        if !self.blocks[self.cur].insts.is_empty() {
            self.new_block();
        }
        self.push(Inst::Label { name });
        debug_assert!(self.blocks[self.cur].is_label_block());
        self.label_blocks.push(self.cur);
        self.new_block();
    }

    fn gen_reg(&mut self, size: RegSize) -> Reg {
        let id = self.reg_sizes.len();
        self.reg_sizes.push(size);
        Reg { id, size }
    }
}

struct Lower<'a, 'src> {
    vars: &'a [Var],
    structs: &'a [StructRecord],
    ts: &'a TokenStream<'src>,
    /// Program-wide scratch label counter.
    label_id: usize,
}

impl<'a, 'src> Lower<'a, 'src> {
    fn err_at(&self, tok: TokenId, msg: impl Into<String>) -> CompileError {
        let t = self.ts.tok(tok);
        CompileError::at(t.pos, t.len().max(1), msg.into())
    }

    fn scratch_label(&mut self) -> Id {
        let label = id(format!(".L{}", self.label_id));
        self.label_id += 1;
        label
    }

    fn size_of(&self, ty: &Type) -> usize {
        size_of(ty, self.structs)
    }

    fn reg_size(&self, ty: &Type) -> RegSize {
        RegSize::from_bytes(self.size_of(ty))
    }

    // ------------------------------------------------------------------
    // top level
    // ------------------------------------------------------------------

    fn lower_item(
        &mut self,
        item: &Node,
        funcs: &mut Vec<Function>,
        globals: &mut Vec<GlobalVar>,
    ) -> Result<()> {
        match &item.kind {
            NodeKind::Nop => Ok(()),
            NodeKind::DeclList(decls) => {
                for d in decls {
                    self.lower_item(d, funcs, globals)?;
                }
                Ok(())
            }
            NodeKind::FuncDef {
                name,
                is_static,
                params,
                body,
                stack_size,
            } => {
                funcs.push(Function::User(self.lower_func(
                    *name,
                    *is_static,
                    params,
                    body,
                    *stack_size,
                )?));
                Ok(())
            }
            NodeKind::BuiltinAsm(text) => {
                funcs.push(Function::Asm(text.clone()));
                Ok(())
            }
            NodeKind::Var { var, .. } => {
                let v = &self.vars[*var];
                if v.storage == StorageClass::Extern {
                    return Ok(());
                }
                let size = self.size_of(&v.ty);
                globals.push(GlobalVar {
                    name: id(v.name.clone()),
                    size,
                    is_static: v.storage == StorageClass::Static,
                    init: vec![GlobalInit::Zero(size)],
                });
                Ok(())
            }
            NodeKind::Assign(lhs, rhs) => {
                let NodeKind::Var { var, .. } = lhs.kind else {
                    unreachable!("global initializer without a variable");
                };
                let v = &self.vars[var];
                let mut init = vec![];
                self.gen_gvar_init(&v.ty, rhs, &mut init)?;
                globals.push(GlobalVar {
                    name: id(v.name.clone()),
                    size: self.size_of(&v.ty),
                    is_static: v.storage == StorageClass::Static,
                    init,
                });
                Ok(())
            }
            _ => unreachable!("unexpected top-level item"),
        }
    }

    /// Flatten a constant initializer into data records.
    fn gen_gvar_init(
        &mut self,
        target: &Type,
        node: &Node,
        out: &mut Vec<GlobalInit>,
    ) -> Result<()> {
        match &node.kind {
            NodeKind::Num(v) => {
                out.push(GlobalInit::Val {
                    value: *v,
                    size: self.size_of(target),
                });
                Ok(())
            }
            NodeKind::SignExtend(x)
            | NodeKind::ZeroExtend(x)
            | NodeKind::Truncate(x)
            | NodeKind::Eval(x) => self.gen_gvar_init(target, x, out),
            NodeKind::Addr(inner) => {
                let NodeKind::Var { var, .. } = inner.kind else {
                    return Err(self.err_at(node.tok, "initializer element is not constant"));
                };
                out.push(GlobalInit::Pointer(id(self.vars[var].name.clone())));
                Ok(())
            }
            NodeKind::Str(name) => {
                out.push(GlobalInit::Str(*name));
                Ok(())
            }
            NodeKind::Initializer(elems) => {
                let total = self.size_of(target);
                let mut pos = 0usize;
                match target.kind {
                    TypeKind::Array(_) => {
                        let elem_ty = target.pointee().clone();
                        let stride = self.size_of(&elem_ty);
                        for e in elems {
                            self.gen_gvar_init(&elem_ty, e, out)?;
                            pos += stride;
                        }
                    }
                    TypeKind::Struct(sid) => {
                        let fields = self.structs[sid].fields.clone();
                        for (e, field) in elems.iter().zip(&fields) {
                            if field.offset > pos {
                                out.push(GlobalInit::Zero(field.offset - pos));
                            }
                            self.gen_gvar_init(&field.ty, e, out)?;
                            pos = field.offset + self.size_of(&field.ty);
                        }
                    }
                    _ => {
                        return Err(self.err_at(node.tok, "initializer element is not constant"));
                    }
                }
                if total > pos {
                    out.push(GlobalInit::Zero(total - pos));
                }
                Ok(())
            }
            _ => Err(self.err_at(node.tok, "initializer element is not constant")),
        }
    }

    fn lower_func(
        &mut self,
        name: Id,
        is_static: bool,
        params: &[Node],
        body: &[Node],
        stack_size: usize,
    ) -> Result<UserFunc> {
        debug!("lower function '{name}'");
        let mut f = FnLower::new();
        f.push(Inst::FuncPrologue);

        // Pull the ABI argument registers into the parameter slots.
        for (index, param) in params.iter().enumerate() {
            let addr = self.gen_addr(&mut f, param)?;
            let size = self.size_of(param.ty());
            f.push(Inst::StoreArg { addr, index, size });
        }

        for stmt in body {
            self.gen_expr(&mut f, stmt)?;
        }
        f.push(Inst::FuncEpilogue);

        let mut func = UserFunc {
            name,
            is_static,
            stack_size,
            blocks: f.blocks,
            label_blocks: f.label_blocks,
            reg_sizes: f.reg_sizes,
        };
        func.connect_blocks();
        func.analyze_liveness();
        Ok(func)
    }

    // ------------------------------------------------------------------
    // addresses
    // ------------------------------------------------------------------

    /// Evaluate a node as an lvalue: the result register holds its address.
    fn gen_addr(&mut self, f: &mut FnLower, node: &Node) -> Result<Reg> {
        match &node.kind {
            NodeKind::Var { var, .. } => {
                let v = &self.vars[*var];
                let dst = f.gen_reg(RegSize::Qword);
                let target = if v.is_local {
                    LeaTarget::Local { offset: v.offset }
                } else {
                    LeaTarget::Global {
                        name: id(v.name.clone()),
                    }
                };
                f.push(Inst::Lea { dst, target });
                Ok(dst)
            }
            NodeKind::Str(name) => {
                let dst = f.gen_reg(RegSize::Qword);
                f.push(Inst::Lea {
                    dst,
                    target: LeaTarget::Global { name: *name },
                });
                Ok(dst)
            }
            NodeKind::Deref(inner) => {
                let reg = self.gen_expr(f, inner)?;
                Ok(expect_reg(reg))
            }
            NodeKind::Member {
                base,
                arrow,
                offset,
                ..
            } => {
                let base_addr = if *arrow {
                    expect_reg(self.gen_expr(f, base)?)
                } else {
                    self.gen_addr(f, base)?
                };
                let off = f.gen_reg(RegSize::Qword);
                f.push(Inst::MovImm {
                    dst: off,
                    imm: *offset as i64,
                });
                let dst = f.gen_reg(RegSize::Qword);
                f.push(Inst::Bin {
                    op: BinIr::Add,
                    dst,
                    lhs: base_addr,
                    rhs: off,
                });
                Ok(dst)
            }
            _ => Err(self.err_at(node.tok, "not an lvalue")),
        }
    }

    // ------------------------------------------------------------------
    // statements and expressions
    // ------------------------------------------------------------------

    /// Lower a statement or expression. Expressions yield the register
    /// holding their value; statements yield `None`.
    fn gen_expr(&mut self, f: &mut FnLower, node: &Node) -> Result<Option<Reg>> {
        match &node.kind {
            NodeKind::Nop => Ok(None),
            NodeKind::Num(v) => {
                let dst = f.gen_reg(self.reg_size(node.ty()));
                f.push(Inst::MovImm { dst, imm: *v });
                Ok(Some(dst))
            }
            NodeKind::Str(_) => Ok(Some(self.gen_addr(f, node)?)),
            NodeKind::Var { is_new, .. } => {
                if *is_new {
                    // a bare declaration generates no code
                    return Ok(None);
                }
                self.gen_scalar_load(f, node).map(Some)
            }
            NodeKind::Member { .. } => self.gen_scalar_load(f, node).map(Some),
            NodeKind::Deref(inner) => {
                let addr = expect_reg(self.gen_expr(f, inner)?);
                let ty = node.ty();
                if matches!(ty.kind, TypeKind::Array(_) | TypeKind::Struct(_)) {
                    return Ok(Some(addr));
                }
                let dst = f.gen_reg(self.reg_size(ty));
                f.push(Inst::Load {
                    dst,
                    addr,
                    offset: 0,
                    size: self.size_of(ty),
                    signed: ty.signed,
                });
                Ok(Some(dst))
            }
            NodeKind::Addr(inner) => Ok(Some(self.gen_addr(f, inner)?)),
            NodeKind::Assign(lhs, rhs) => {
                let size = self.size_of(lhs.ty());
                self.gen_assign(f, lhs, rhs, 0, size)
            }
            NodeKind::Return(value) => {
                let src = match value {
                    Some(v) => Some(expect_reg(self.gen_expr(f, v)?)),
                    None => None,
                };
                f.push(Inst::Ret { src });
                f.new_block();
                Ok(None)
            }
            NodeKind::If { cond, then, els } => {
                let else_label = self.scratch_label();
                let end_label = self.scratch_label();
                let cond_reg = expect_reg(self.gen_expr(f, cond)?);
                f.push(Inst::Je {
                    label: else_label,
                    cond: cond_reg,
                });
                f.new_block();
                self.gen_expr(f, then)?;
                f.push(Inst::Jmp { label: end_label });
                f.new_block();
                f.place_label(else_label);
                if let Some(els) = els {
                    self.gen_expr(f, els)?;
                }
                f.place_label(end_label);
                Ok(None)
            }
            NodeKind::While { label, cond, body } => {
                let begin = id(format!(".Lbeginwhile{label}"));
                let end = id(format!(".Lendwhile{label}"));
                f.place_label(begin);
                let cond_reg = expect_reg(self.gen_expr(f, cond)?);
                f.push(Inst::Je {
                    label: end,
                    cond: cond_reg,
                });
                f.new_block();
                self.gen_expr(f, body)?;
                f.push(Inst::Jmp { label: begin });
                f.new_block();
                f.place_label(end);
                Ok(None)
            }
            NodeKind::DoWhile { label, body, cond } => {
                let begin = id(format!(".Lbegindo{label}"));
                let cont = id(format!(".Lcontdo{label}"));
                let end = id(format!(".Lenddo{label}"));
                f.place_label(begin);
                self.gen_expr(f, body)?;
                f.place_label(cont);
                let cond_reg = expect_reg(self.gen_expr(f, cond)?);
                f.push(Inst::Jne {
                    label: begin,
                    cond: cond_reg,
                });
                f.new_block();
                f.place_label(end);
                Ok(None)
            }
            NodeKind::For {
                label,
                init,
                cond,
                update,
                body,
            } => {
                let begin = id(format!(".Lbeginfor{label}"));
                let cont = id(format!(".Lcontfor{label}"));
                let end = id(format!(".Lendfor{label}"));
                if let Some(init) = init {
                    self.gen_expr(f, init)?;
                }
                f.place_label(begin);
                if let Some(cond) = cond {
                    let cond_reg = expect_reg(self.gen_expr(f, cond)?);
                    f.push(Inst::Je {
                        label: end,
                        cond: cond_reg,
                    });
                    f.new_block();
                }
                self.gen_expr(f, body)?;
                f.place_label(cont);
                if let Some(update) = update {
                    self.gen_expr(f, update)?;
                }
                f.push(Inst::Jmp { label: begin });
                f.new_block();
                f.place_label(end);
                Ok(None)
            }
            NodeKind::Switch {
                label,
                cond,
                cases,
                body,
            } => {
                let end = id(format!(".Lendswitch{label}"));
                let scrut = expect_reg(self.gen_expr(f, cond)?);
                for (index, case) in cases.iter().enumerate() {
                    if case.is_default {
                        continue;
                    }
                    let case_label = id(format!(".Lswitch{label}_{index}"));
                    let k = f.gen_reg(scrut.size);
                    f.push(Inst::MovImm {
                        dst: k,
                        imm: case.value,
                    });
                    let hit = f.gen_reg(RegSize::Dword);
                    f.push(Inst::Bin {
                        op: BinIr::Eq,
                        dst: hit,
                        lhs: scrut,
                        rhs: k,
                    });
                    // the compare already inverted the condition
                    f.push(Inst::Jne {
                        label: case_label,
                        cond: hit,
                    });
                    f.new_block();
                }
                let fallback = match cases.iter().position(|c| c.is_default) {
                    Some(index) => id(format!(".Lswitch{label}_{index}")),
                    None => end,
                };
                f.push(Inst::Jmp { label: fallback });
                f.new_block();
                self.gen_expr(f, body)?;
                f.place_label(end);
                Ok(None)
            }
            NodeKind::Case {
                switch_label,
                index,
                stmt,
            } => {
                f.place_label(id(format!(".Lswitch{switch_label}_{index}")));
                self.gen_expr(f, stmt)
            }
            NodeKind::Goto(label) => {
                f.push(Inst::Jmp { label: *label });
                f.new_block();
                Ok(None)
            }
            NodeKind::LabelStmt { label, stmt } => {
                f.place_label(*label);
                self.gen_expr(f, stmt)
            }
            NodeKind::Block(stmts) => {
                for s in stmts {
                    self.gen_expr(f, s)?;
                }
                Ok(None)
            }
            NodeKind::ExprStmt(e) => {
                self.gen_expr(f, e)?;
                Ok(None)
            }
            NodeKind::DeclList(decls) => {
                for d in decls {
                    self.gen_expr(f, d)?;
                }
                Ok(None)
            }
            NodeKind::Ternary { cond, then, els } => {
                let false_label = self.scratch_label();
                let end_label = self.scratch_label();
                let dst = f.gen_reg(self.reg_size(node.ty()));
                let cond_reg = expect_reg(self.gen_expr(f, cond)?);
                f.push(Inst::Je {
                    label: false_label,
                    cond: cond_reg,
                });
                f.new_block();
                let then_reg = expect_reg(self.gen_expr(f, then)?);
                f.push(Inst::Mov {
                    dst,
                    src: then_reg,
                });
                f.push(Inst::Jmp { label: end_label });
                f.new_block();
                f.place_label(false_label);
                let els_reg = expect_reg(self.gen_expr(f, els)?);
                f.push(Inst::Mov { dst, src: els_reg });
                f.place_label(end_label);
                Ok(Some(dst))
            }
            NodeKind::Binary(BinOp::LogOr, l, r) => {
                let true_label = self.scratch_label();
                let end_label = self.scratch_label();
                let dst = f.gen_reg(RegSize::Dword);
                let lhs = expect_reg(self.gen_expr(f, l)?);
                f.push(Inst::Jne {
                    label: true_label,
                    cond: lhs,
                });
                f.new_block();
                let rhs = expect_reg(self.gen_expr(f, r)?);
                f.push(Inst::Jne {
                    label: true_label,
                    cond: rhs,
                });
                f.new_block();
                f.push(Inst::MovImm { dst, imm: 0 });
                f.push(Inst::Jmp { label: end_label });
                f.new_block();
                f.place_label(true_label);
                f.push(Inst::MovImm { dst, imm: 1 });
                f.place_label(end_label);
                Ok(Some(dst))
            }
            NodeKind::Binary(BinOp::LogAnd, l, r) => {
                let false_label = self.scratch_label();
                let end_label = self.scratch_label();
                let dst = f.gen_reg(RegSize::Dword);
                let lhs = expect_reg(self.gen_expr(f, l)?);
                f.push(Inst::Je {
                    label: false_label,
                    cond: lhs,
                });
                f.new_block();
                let rhs = expect_reg(self.gen_expr(f, r)?);
                f.push(Inst::Je {
                    label: false_label,
                    cond: rhs,
                });
                f.new_block();
                f.push(Inst::MovImm { dst, imm: 1 });
                f.push(Inst::Jmp { label: end_label });
                f.new_block();
                f.place_label(false_label);
                f.push(Inst::MovImm { dst, imm: 0 });
                f.place_label(end_label);
                Ok(Some(dst))
            }
            NodeKind::Binary(BinOp::Comma, l, r) => {
                self.gen_expr(f, l)?;
                self.gen_expr(f, r)
            }
            NodeKind::Binary(op, l, r) => {
                let lhs = expect_reg(self.gen_expr(f, l)?);
                let rhs = expect_reg(self.gen_expr(f, r)?);
                let signed = l.ty().signed;
                let ir_op = match op {
                    BinOp::Add => BinIr::Add,
                    BinOp::Sub => BinIr::Sub,
                    BinOp::Mul => {
                        if signed {
                            BinIr::Mul
                        } else {
                            BinIr::Mulu
                        }
                    }
                    BinOp::Div => {
                        if signed {
                            BinIr::Div
                        } else {
                            BinIr::Divu
                        }
                    }
                    BinOp::Rem => {
                        if signed {
                            BinIr::Rem
                        } else {
                            BinIr::Remu
                        }
                    }
                    BinOp::Eq => BinIr::Eq,
                    BinOp::Neq => BinIr::Neq,
                    BinOp::Lt => {
                        if signed {
                            BinIr::Lt
                        } else {
                            BinIr::Ltu
                        }
                    }
                    BinOp::Lte => {
                        if signed {
                            BinIr::Lte
                        } else {
                            BinIr::Lteu
                        }
                    }
                    BinOp::BitAnd => BinIr::And,
                    BinOp::BitOr => BinIr::Or,
                    BinOp::BitXor => BinIr::Xor,
                    BinOp::Shl => {
                        if signed {
                            BinIr::Sal
                        } else {
                            BinIr::Shl
                        }
                    }
                    BinOp::Shr => {
                        if signed {
                            BinIr::Sar
                        } else {
                            BinIr::Shr
                        }
                    }
                    BinOp::LogAnd | BinOp::LogOr | BinOp::Comma => unreachable!(),
                };
                let dst = f.gen_reg(self.reg_size(node.ty()));
                f.push(Inst::Bin {
                    op: ir_op,
                    dst,
                    lhs,
                    rhs,
                });
                Ok(Some(dst))
            }
            NodeKind::Unary(op, x) => {
                let src = expect_reg(self.gen_expr(f, x)?);
                let ir_op = match op {
                    UnOp::LogNot => UnIr::Not,
                    UnOp::BitNot => UnIr::BitNot,
                    UnOp::Neg => UnIr::Neg,
                };
                let dst = f.gen_reg(self.reg_size(node.ty()));
                f.push(Inst::Un {
                    op: ir_op,
                    dst,
                    src,
                });
                Ok(Some(dst))
            }
            NodeKind::Eval(x) => {
                // normalize a scalar to 0/1
                let lhs = expect_reg(self.gen_expr(f, x)?);
                let zero = f.gen_reg(lhs.size);
                f.push(Inst::MovImm { dst: zero, imm: 0 });
                let dst = f.gen_reg(self.reg_size(node.ty()));
                f.push(Inst::Bin {
                    op: BinIr::Neq,
                    dst,
                    lhs,
                    rhs: zero,
                });
                Ok(Some(dst))
            }
            NodeKind::SignExtend(x) => {
                let src = expect_reg(self.gen_expr(f, x)?);
                let dst = f.gen_reg(self.reg_size(node.ty()));
                f.push(Inst::SignExtend { dst, src });
                Ok(Some(dst))
            }
            NodeKind::ZeroExtend(x) => {
                let src = expect_reg(self.gen_expr(f, x)?);
                let dst = f.gen_reg(self.reg_size(node.ty()));
                f.push(Inst::ZeroExtend { dst, src });
                Ok(Some(dst))
            }
            NodeKind::Truncate(x) => {
                let src = expect_reg(self.gen_expr(f, x)?);
                let dst = f.gen_reg(self.reg_size(node.ty()));
                f.push(Inst::Truncate {
                    dst,
                    src,
                    signed: node.ty().signed,
                });
                Ok(Some(dst))
            }
            NodeKind::PreInc(x) | NodeKind::PreDec(x) | NodeKind::PostInc(x)
            | NodeKind::PostDec(x) => {
                let is_inc =
                    matches!(node.kind, NodeKind::PreInc(_) | NodeKind::PostInc(_));
                let is_pre =
                    matches!(node.kind, NodeKind::PreInc(_) | NodeKind::PreDec(_));
                let ty = node.ty().clone();
                let old = expect_reg(self.gen_expr(f, x)?);
                let new = f.gen_reg(self.reg_size(&ty));
                if ty.kind == TypeKind::Bool {
                    // ++/-- clamp a _Bool to 1/0
                    f.push(Inst::MovImm {
                        dst: new,
                        imm: if is_inc { 1 } else { 0 },
                    });
                } else {
                    let amount = if ty.is_ptr_like() {
                        self.size_of(ty.pointee()) as i64
                    } else {
                        1
                    };
                    let step = f.gen_reg(self.reg_size(&ty));
                    f.push(Inst::MovImm {
                        dst: step,
                        imm: amount,
                    });
                    f.push(Inst::Bin {
                        op: if is_inc { BinIr::Add } else { BinIr::Sub },
                        dst: new,
                        lhs: old,
                        rhs: step,
                    });
                }
                let addr = self.gen_addr(f, x)?;
                f.push(Inst::Store {
                    src: new,
                    addr,
                    offset: 0,
                    size: self.size_of(&ty),
                });
                Ok(Some(if is_pre { new } else { old }))
            }
            NodeKind::FuncCall { name, args } => {
                let mut arg_regs = vec![];
                for arg in args {
                    arg_regs.push(expect_reg(self.gen_expr(f, arg)?));
                }
                let dst = f.gen_reg(self.reg_size(node.ty()));
                f.push(Inst::Call {
                    name: *name,
                    args: arg_regs,
                    dst,
                });
                Ok(Some(dst))
            }
            NodeKind::BuiltinAsm(text) => {
                f.push(Inst::BuiltinAsm { text: text.clone() });
                Ok(None)
            }
            NodeKind::Initializer(_) => {
                unreachable!("initializer list outside an assignment")
            }
            NodeKind::FuncDef { .. } => unreachable!("nested function definition"),
            NodeKind::Subscript(..)
            | NodeKind::Sizeof(_)
            | NodeKind::SizeofType(_)
            | NodeKind::Cast(..) => unreachable!("not rewritten by the analyzer"),
        }
    }

    /// Load a scalar variable or member; arrays and structs yield their
    /// address instead (the array decays to a pointer).
    fn gen_scalar_load(&mut self, f: &mut FnLower, node: &Node) -> Result<Reg> {
        let ty = node.ty();
        if matches!(ty.kind, TypeKind::Array(_) | TypeKind::Struct(_)) {
            return self.gen_addr(f, node);
        }
        let addr = self.gen_addr(f, node)?;
        let dst = f.gen_reg(self.reg_size(ty));
        f.push(Inst::Load {
            dst,
            addr,
            offset: 0,
            size: self.size_of(ty),
            signed: ty.signed,
        });
        Ok(dst)
    }

    /// Store `value` through the address of `assigned`, recursing through
    /// initializer lists; unlisted trailing bytes get zero-stores in 8-byte
    /// chunks with a remainder.
    fn gen_assign(
        &mut self,
        f: &mut FnLower,
        assigned: &Node,
        value: &Node,
        padding: usize,
        assign_size: usize,
    ) -> Result<Option<Reg>> {
        if let NodeKind::Initializer(elems) = &value.kind {
            let target = value.ty();
            let total = self.size_of(target);
            let mut done = 0usize;
            match target.kind {
                TypeKind::Array(_) => {
                    let elem_ty = target.pointee().clone();
                    let stride = self.size_of(&elem_ty);
                    for (i, e) in elems.iter().enumerate() {
                        self.gen_assign(f, assigned, e, padding + i * stride, stride)?;
                    }
                    done = elems.len() * stride;
                }
                TypeKind::Struct(sid) => {
                    let fields = self.structs[sid].fields.clone();
                    for (e, field) in elems.iter().zip(&fields) {
                        let fsize = self.size_of(&field.ty);
                        self.gen_assign(f, assigned, e, padding + field.offset, fsize)?;
                        done = field.offset + fsize;
                    }
                }
                _ => unreachable!("initializer against a scalar"),
            }
            while done < total {
                let chunk = (total - done).min(8);
                let zero = f.gen_reg(RegSize::Qword);
                f.push(Inst::MovImm { dst: zero, imm: 0 });
                let addr = self.gen_addr(f, assigned)?;
                f.push(Inst::Store {
                    src: zero,
                    addr,
                    offset: padding + done,
                    size: chunk,
                });
                done += chunk;
            }
            return Ok(None);
        }

        let src = expect_reg(self.gen_expr(f, value)?);
        let addr = self.gen_addr(f, assigned)?;
        f.push(Inst::Store {
            src,
            addr,
            offset: padding,
            size: assign_size,
        });
        // the value of an assignment expression is its right-hand side
        Ok(Some(src))
    }
}

fn expect_reg(reg: Option<Reg>) -> Reg {
    reg.unwrap_or_else(|| unreachable!("expression produced no value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::{analyze, fold, parse};
    use crate::front::lex::Lexer;

    fn lowered(src: &str) -> Program {
        let ts = Lexer::new(src, false).tokenize().unwrap();
        let mut prog = parse(&ts).unwrap();
        analyze(&mut prog, &ts).unwrap();
        fold(&mut prog);
        lower(&prog, &ts).unwrap()
    }

    fn first_user(prog: &Program) -> &UserFunc {
        for func in &prog.funcs {
            if let Function::User(user) = func {
                return user;
            }
        }
        panic!("no user function");
    }

    #[test]
    fn prologue_opens_and_epilogue_closes_each_function() {
        let prog = lowered("int main() { return 0; }");
        let func = first_user(&prog);
        assert!(matches!(func.blocks[0].insts[0], Inst::FuncPrologue));
        let last = func
            .blocks
            .iter()
            .rev()
            .find(|b| !b.insts.is_empty())
            .unwrap();
        assert!(matches!(last.insts.last(), Some(Inst::FuncEpilogue)));
    }

    #[test]
    fn every_label_lands_in_a_label_only_block() {
        let prog = lowered(
            "int main() { int i; for (i = 0; i < 5; i = i + 1) { if (i) continue; } return i; }",
        );
        let func = first_user(&prog);
        for &i in &func.label_blocks {
            assert!(func.blocks[i].is_label_block(), "block {i} grew past its label");
        }
    }

    #[test]
    fn virtual_registers_are_defined_once() {
        let prog = lowered("int main() { int a; a = 1; return a + a * 2; }");
        let func = first_user(&prog);
        let mut defs = vec![0usize; func.reg_sizes.len()];
        for block in &func.blocks {
            for inst in &block.insts {
                if let Some(def) = inst.def() {
                    defs[def.id] += 1;
                }
            }
        }
        for (reg, &count) in defs.iter().enumerate() {
            assert!(count <= 1, "virtual register {reg} defined {count} times");
        }
    }

    #[test]
    fn blocks_end_at_their_terminator() {
        let prog = lowered("int main() { if (1) return 2; return 3; }");
        let func = first_user(&prog);
        for block in &func.blocks {
            for (i, inst) in block.insts.iter().enumerate() {
                if inst.is_terminator() {
                    assert_eq!(i, block.insts.len() - 1, "terminator mid-block");
                }
            }
        }
    }

    #[test]
    fn while_loops_use_their_structured_labels() {
        let prog = lowered("int main() { while (1) break; return 0; }");
        let func = first_user(&prog);
        let labels: Vec<String> = func
            .label_blocks
            .iter()
            .filter_map(|&i| func.blocks[i].label())
            .map(|l| l.as_str().to_string())
            .collect();
        assert!(labels.contains(&".Lbeginwhile_0_main".to_string()));
        assert!(labels.contains(&".Lendwhile_0_main".to_string()));
    }

    #[test]
    fn switch_compares_and_pre_inverts_into_jne() {
        let prog = lowered(
            "int main(int x) { switch (x) { case 3: return 1; default: return 2; } }",
        );
        let func = first_user(&prog);
        let insts: Vec<&Inst> = func.blocks.iter().flat_map(|b| &b.insts).collect();
        assert!(insts
            .iter()
            .any(|i| matches!(i, Inst::Bin { op: BinIr::Eq, .. })));
        assert!(insts.iter().any(
            |i| matches!(i, Inst::Jne { label, .. } if label.as_str() == ".Lswitch_0_main_0")
        ));
        // default jumps straight to its case label
        assert!(insts.iter().any(
            |i| matches!(i, Inst::Jmp { label } if label.as_str() == ".Lswitch_0_main_1")
        ));
    }

    #[test]
    fn array_initializers_zero_their_tail() {
        let prog = lowered("int main() { int a[4] = {1}; return a[3]; }");
        let func = first_user(&prog);
        let stores: Vec<&Inst> = func
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i, Inst::Store { .. }))
            .collect();
        // one element store plus 8 + 4 bytes of zero tail
        assert_eq!(stores.len(), 3);
        let Inst::Store { offset, size, .. } = stores[1] else {
            unreachable!();
        };
        assert_eq!((*offset, *size), (4, 8));
        let Inst::Store { offset, size, .. } = stores[2] else {
            unreachable!();
        };
        assert_eq!((*offset, *size), (12, 4));
    }

    #[test]
    fn globals_lower_to_data_records() {
        let prog = lowered("int g; long h = 7; int main() { return g; }");
        assert_eq!(prog.globals.len(), 2);
        assert_eq!(prog.globals[0].init, vec![GlobalInit::Zero(4)]);
        assert_eq!(
            prog.globals[1].init,
            vec![GlobalInit::Val { value: 7, size: 8 }]
        );
    }

    #[test]
    fn call_arguments_stay_in_source_order() {
        let prog = lowered("int f(int a, int b) { return a - b; } int main() { return f(7, 3); }");
        let main = prog
            .funcs
            .iter()
            .filter_map(|f| match f {
                Function::User(u) if u.name.as_str() == "main" => Some(u),
                _ => None,
            })
            .next()
            .unwrap();
        let call = main
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .find_map(|i| match i {
                Inst::Call { args, .. } => Some(args.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(call.len(), 2);
        // the first argument register was created before the second
        assert!(call[0].id < call[1].id);
    }

    #[test]
    fn liveness_sets_are_populated() {
        let prog = lowered("int main() { int a; a = 1; while (a) a = a - 1; return a; }");
        let func = first_user(&prog);
        let any_live = func
            .blocks
            .iter()
            .any(|b| !b.live_in.is_empty() || !b.live_out.is_empty());
        assert!(any_live, "liveness analysis produced empty sets everywhere");
    }

    #[test]
    fn param_store_arg_sizes_follow_the_declared_type() {
        let prog = lowered("int f(char c, long v) { return c; } int main() { return f(1, 2); }");
        let func = first_user(&prog);
        let sizes: Vec<usize> = func
            .blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter_map(|i| match i {
                Inst::StoreArg { size, .. } => Some(*size),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, [1, 8]);
    }
}
