//! Lowering from the three-address IR to x86-64 instructions.
//!
//! Registers stay virtual; ABI-pinned values move through explicit
//! physical-register operands (`rdi..r9` for arguments, `rax`/`rdx` around a
//! division, `cl` for shift counts). Two-address arithmetic fuses its
//! destination with the left operand when that operand is dead afterwards,
//! falling back to a copy when liveness says otherwise.
//!
//! Values live in canonical 64-bit form: sub-quadword loads and ABI results
//! are re-extended on the way in, stores truncate on the way out. That keeps
//! every register-to-register operation a plain 64-bit one.

use log::debug;

use crate::common::{align_up, Map};
use crate::middle::tir::{self, BinIr, Block, Function, Inst, LeaTarget, Reg, RegSize, UnIr};
use crate::back::x64::{
    resolve, Binding, MemBase, Operand, PhysReg, X64Function, X64Inst, X64Item, X64Kind,
    X64Program, ARG_REGISTERS,
};

pub fn codegen(prog: tir::Program) -> X64Program {
    debug!("start x86-64 lowering");
    let items = prog
        .funcs
        .into_iter()
        .map(|func| match func {
            Function::User(user) => X64Item::Func(gen_func(&user)),
            Function::Asm(text) => X64Item::Asm(text),
        })
        .collect();
    X64Program {
        items,
        globals: prog.globals,
        strings: prog.strings,
    }
}

fn vreg(r: Reg) -> Operand {
    Operand::Vreg {
        id: r.id,
        size: r.size,
    }
}

fn real(reg: PhysReg, size: RegSize) -> Operand {
    Operand::Reg { reg, size }
}

/// Is `reg` still needed after instruction `idx` of `block`?
fn live_later(block: &Block, idx: usize, reg: usize) -> bool {
    block.insts[idx + 1..]
        .iter()
        .any(|i| i.uses().iter().any(|r| r.id == reg))
        || block.live_out.contains(&reg)
}

/// Move an ABI result register into a virtual register, re-extending
/// sub-quadword values into canonical 64-bit form.
fn extend_into_vreg(dst: Reg, src: PhysReg) -> X64Inst {
    let kind = match dst.size {
        RegSize::Qword => X64Kind::Mov,
        RegSize::Dword => X64Kind::Movsxd,
        RegSize::Word | RegSize::Byte => X64Kind::Movsx,
    };
    let src_size = match dst.size {
        RegSize::Qword => RegSize::Qword,
        other => other,
    };
    X64Inst::new(kind, vec![vreg(dst), real(src, src_size)]).implicit(src.bit())
}

fn gen_func(func: &tir::UserFunc) -> X64Function {
    debug!("lower '{}' to x86-64", func.name);
    let mut bindings = vec![Binding::Virtual; func.reg_sizes.len()];
    let mut blocks = vec![];
    for block in &func.blocks {
        let mut out = vec![];
        for (idx, inst) in block.insts.iter().enumerate() {
            gen_inst(func, block, idx, inst, &mut bindings, &mut out);
        }
        blocks.push(out);
    }

    // One 8-byte spill slot per canonical virtual register, below the
    // named locals; the whole frame keeps the 16-byte call alignment.
    let mut slots = Map::new();
    for id in 0..bindings.len() {
        let canonical = resolve(&bindings, id);
        let next = slots.len();
        slots.entry(canonical).or_insert(next);
    }
    let frame_bytes = align_up(func.stack_size + 8 * slots.len(), 16);

    X64Function {
        name: func.name,
        is_static: func.is_static,
        frame_bytes,
        locals_bytes: func.stack_size,
        blocks,
        bindings,
        slots,
    }
}

fn gen_inst(
    func: &tir::UserFunc,
    block: &Block,
    idx: usize,
    inst: &Inst,
    bindings: &mut Vec<Binding>,
    out: &mut Vec<X64Inst>,
) {
    match inst {
        Inst::FuncPrologue => {
            // rendered from the function header at emission time
        }
        Inst::FuncEpilogue => {
            if func.name.as_str() == "main" {
                // implicit `return 0` for main only
                out.push(
                    X64Inst::new(
                        X64Kind::Mov,
                        vec![real(PhysReg::Rax, RegSize::Dword), Operand::Imm(0)],
                    )
                    .implicit(PhysReg::Rax.bit()),
                );
            }
            out.push(X64Inst::new(X64Kind::Return, vec![]));
        }
        Inst::Ret { src } => {
            if let Some(src) = src {
                // Sub-dword values widen into eax; callers read the full
                // return register.
                let inst = match src.size {
                    RegSize::Byte | RegSize::Word => X64Inst::new(
                        X64Kind::Movsx,
                        vec![real(PhysReg::Rax, RegSize::Dword), vreg(*src)],
                    ),
                    _ => X64Inst::new(
                        X64Kind::Mov,
                        vec![real(PhysReg::Rax, src.size), vreg(*src)],
                    ),
                };
                out.push(inst.implicit(PhysReg::Rax.bit()));
            }
            out.push(X64Inst::new(X64Kind::Return, vec![]));
        }
        Inst::Call { name, args, dst } => {
            let mut mask = PhysReg::Rax.bit() | PhysReg::R10.bit() | PhysReg::R11.bit();
            for (i, arg) in args.iter().enumerate() {
                let reg = ARG_REGISTERS[i];
                mask |= reg.bit();
                out.push(
                    X64Inst::new(X64Kind::Mov, vec![real(reg, arg.size), vreg(*arg)])
                        .implicit(reg.bit()),
                );
            }
            out.push(X64Inst::with_target(X64Kind::Call, *name).implicit(mask));
            out.push(extend_into_vreg(*dst, PhysReg::Rax));
        }
        Inst::MovImm { dst, imm } => {
            out.push(X64Inst::new(X64Kind::Mov, vec![vreg(*dst), Operand::Imm(*imm)]));
        }
        Inst::Mov { dst, src } => {
            out.push(X64Inst::new(X64Kind::Mov, vec![vreg(*dst), vreg(*src)]));
        }
        Inst::Bin {
            op,
            dst,
            lhs,
            rhs,
        } => gen_bin(block, idx, *op, *dst, *lhs, *rhs, bindings, out),
        Inst::Un { op, dst, src } => match op {
            UnIr::Neg | UnIr::BitNot => {
                let kind = if *op == UnIr::Neg {
                    X64Kind::Neg
                } else {
                    X64Kind::Not
                };
                let target = fuse_or_copy(block, idx, *dst, *src, bindings, out);
                out.push(X64Inst::new(kind, vec![target]));
            }
            UnIr::Not => {
                out.push(X64Inst::new(
                    X64Kind::Cmp,
                    vec![vreg(*src), Operand::Imm(0)],
                ));
                out.push(X64Inst::new(X64Kind::Xor, vec![vreg(*dst), vreg(*dst)]));
                out.push(X64Inst::new(
                    X64Kind::Sete,
                    vec![Operand::Vreg {
                        id: dst.id,
                        size: RegSize::Byte,
                    }],
                ));
            }
        },
        Inst::Jmp { label } => out.push(X64Inst::with_target(X64Kind::Jmp, *label)),
        Inst::Je { label, cond } => {
            out.push(X64Inst::new(
                X64Kind::Cmp,
                vec![vreg(*cond), Operand::Imm(0)],
            ));
            out.push(X64Inst::with_target(X64Kind::Je, *label));
        }
        Inst::Jne { label, cond } => {
            out.push(X64Inst::new(
                X64Kind::Cmp,
                vec![vreg(*cond), Operand::Imm(0)],
            ));
            out.push(X64Inst::with_target(X64Kind::Jne, *label));
        }
        Inst::Load {
            dst,
            addr,
            offset,
            size,
            signed,
        } => {
            out.push(X64Inst::new(
                X64Kind::Mov,
                vec![
                    vreg(*dst),
                    Operand::Mem {
                        base: MemBase::Vreg(addr.id),
                        disp: *offset as i64,
                        size: *size,
                        signed: *signed,
                    },
                ],
            ));
        }
        Inst::Store {
            src,
            addr,
            offset,
            size,
        } => {
            out.push(X64Inst::new(
                X64Kind::Mov,
                vec![
                    Operand::Mem {
                        base: MemBase::Vreg(addr.id),
                        disp: *offset as i64,
                        size: *size,
                        signed: false,
                    },
                    vreg(*src),
                ],
            ));
        }
        Inst::StoreArg { addr, index, size } => {
            let reg = ARG_REGISTERS[*index];
            out.push(
                X64Inst::new(
                    X64Kind::Mov,
                    vec![
                        Operand::Mem {
                            base: MemBase::Vreg(addr.id),
                            disp: 0,
                            size: *size,
                            signed: false,
                        },
                        real(reg, RegSize::from_bytes(*size)),
                    ],
                )
                .implicit(reg.bit()),
            );
        }
        Inst::Lea { dst, target } => {
            let src = match target {
                LeaTarget::Local { offset } => Operand::Mem {
                    base: MemBase::Reg(PhysReg::Rbp),
                    disp: -(*offset as i64),
                    size: 8,
                    signed: false,
                },
                LeaTarget::Global { name } => Operand::Rip { symbol: *name },
            };
            out.push(
                X64Inst::new(X64Kind::Lea, vec![vreg(*dst), src])
                    .implicit(PhysReg::Rbp.bit()),
            );
        }
        Inst::SignExtend { dst, src } => {
            let (kind, src_size) = match src.size {
                RegSize::Byte | RegSize::Word => (X64Kind::Movsx, src.size),
                RegSize::Dword => (X64Kind::Movsxd, RegSize::Dword),
                RegSize::Qword => (X64Kind::Mov, RegSize::Qword),
            };
            out.push(X64Inst::new(
                kind,
                vec![
                    vreg(*dst),
                    Operand::Vreg {
                        id: src.id,
                        size: src_size,
                    },
                ],
            ));
        }
        Inst::ZeroExtend { dst, src } => {
            let kind = match src.size {
                RegSize::Byte | RegSize::Word | RegSize::Dword => X64Kind::Movzx,
                RegSize::Qword => X64Kind::Mov,
            };
            out.push(X64Inst::new(
                kind,
                vec![
                    vreg(*dst),
                    Operand::Vreg {
                        id: src.id,
                        size: src.size,
                    },
                ],
            ));
        }
        Inst::Truncate { dst, src, signed } => {
            let (kind, width) = match (dst.size, signed) {
                (RegSize::Qword, _) => (X64Kind::Mov, RegSize::Qword),
                (RegSize::Dword, true) => (X64Kind::Movsxd, RegSize::Dword),
                (RegSize::Dword, false) => (X64Kind::Movzx, RegSize::Dword),
                (size, true) => (X64Kind::Movsx, size),
                (size, false) => (X64Kind::Movzx, size),
            };
            out.push(X64Inst::new(
                kind,
                vec![
                    vreg(*dst),
                    Operand::Vreg {
                        id: src.id,
                        size: width,
                    },
                ],
            ));
        }
        Inst::Label { name } => out.push(X64Inst::with_target(X64Kind::Label, *name)),
        Inst::Phi { dst, lhs, rhs } => {
            // Aliasing resolves the phi: both inputs and the destination
            // share one slot.
            let l = resolve(bindings, lhs.id);
            let r = resolve(bindings, rhs.id);
            if r != l {
                bindings[r] = Binding::Alias(l);
            }
            let d = resolve(bindings, dst.id);
            if d != l {
                bindings[d] = Binding::Alias(l);
            }
        }
        Inst::BuiltinAsm { text } => {
            let mut pseudo = X64Inst::new(X64Kind::BuiltinAsm, vec![]);
            pseudo.text = Some(text.clone());
            out.push(pseudo);
        }
    }
}

/// Two-address destination handling: alias `dst` onto `lhs` when `lhs` dies
/// here, otherwise copy `lhs` into `dst` first. Returns the destination
/// operand for the arithmetic instruction.
fn fuse_or_copy(
    block: &Block,
    idx: usize,
    dst: Reg,
    lhs: Reg,
    bindings: &mut Vec<Binding>,
    out: &mut Vec<X64Inst>,
) -> Operand {
    if !live_later(block, idx, lhs.id) {
        let canonical = resolve(bindings, lhs.id);
        if resolve(bindings, dst.id) != canonical {
            bindings[dst.id] = Binding::Alias(canonical);
        }
    } else {
        out.push(X64Inst::new(X64Kind::Mov, vec![vreg(dst), vreg(lhs)]));
    }
    vreg(dst)
}

fn gen_bin(
    block: &Block,
    idx: usize,
    op: BinIr,
    dst: Reg,
    lhs: Reg,
    rhs: Reg,
    bindings: &mut Vec<Binding>,
    out: &mut Vec<X64Inst>,
) {
    match op {
        BinIr::Add
        | BinIr::Sub
        | BinIr::Mul
        | BinIr::Mulu
        | BinIr::And
        | BinIr::Or
        | BinIr::Xor => {
            let kind = match op {
                BinIr::Add => X64Kind::Add,
                BinIr::Sub => X64Kind::Sub,
                BinIr::Mul | BinIr::Mulu => X64Kind::Imul,
                BinIr::And => X64Kind::And,
                BinIr::Or => X64Kind::Or,
                BinIr::Xor => X64Kind::Xor,
                _ => unreachable!(),
            };
            let target = fuse_or_copy(block, idx, dst, lhs, bindings, out);
            out.push(X64Inst::new(kind, vec![target, vreg(rhs)]));
        }
        BinIr::Shl | BinIr::Shr | BinIr::Sal | BinIr::Sar => {
            let kind = match op {
                BinIr::Shl => X64Kind::Shl,
                BinIr::Shr => X64Kind::Shr,
                BinIr::Sal => X64Kind::Sal,
                BinIr::Sar => X64Kind::Sar,
                _ => unreachable!(),
            };
            // the shift count lives in cl
            out.push(
                X64Inst::new(
                    X64Kind::Mov,
                    vec![real(PhysReg::Rcx, RegSize::Byte), vreg(rhs)],
                )
                .implicit(PhysReg::Rcx.bit()),
            );
            let target = fuse_or_copy(block, idx, dst, lhs, bindings, out);
            out.push(
                X64Inst::new(kind, vec![target, real(PhysReg::Rcx, RegSize::Byte)])
                    .implicit(PhysReg::Rcx.bit()),
            );
        }
        BinIr::Div | BinIr::Divu | BinIr::Rem | BinIr::Remu => {
            let mask = PhysReg::Rax.bit() | PhysReg::Rdx.bit();
            out.push(
                X64Inst::new(
                    X64Kind::Mov,
                    vec![real(PhysReg::Rax, RegSize::Qword), vreg(lhs)],
                )
                .implicit(PhysReg::Rax.bit()),
            );
            let signed = matches!(op, BinIr::Div | BinIr::Rem);
            if signed {
                // sign-extend rax into rdx:rax
                out.push(X64Inst::new(X64Kind::Cqo, vec![]).implicit(mask));
            } else {
                out.push(
                    X64Inst::new(
                        X64Kind::Mov,
                        vec![real(PhysReg::Rdx, RegSize::Qword), Operand::Imm(0)],
                    )
                    .implicit(PhysReg::Rdx.bit()),
                );
            }
            let kind = if signed { X64Kind::Idiv } else { X64Kind::Div };
            out.push(X64Inst::new(kind, vec![vreg(rhs)]).implicit(mask));
            let result = if matches!(op, BinIr::Div | BinIr::Divu) {
                PhysReg::Rax
            } else {
                PhysReg::Rdx
            };
            out.push(extend_into_vreg(dst, result));
        }
        BinIr::Eq | BinIr::Neq | BinIr::Lt | BinIr::Ltu | BinIr::Lte | BinIr::Lteu => {
            let set = match op {
                BinIr::Eq => X64Kind::Sete,
                BinIr::Neq => X64Kind::Setne,
                BinIr::Lt => X64Kind::Setl,
                BinIr::Ltu => X64Kind::Setb,
                BinIr::Lte => X64Kind::Setle,
                BinIr::Lteu => X64Kind::Setbe,
                _ => unreachable!(),
            };
            out.push(X64Inst::new(X64Kind::Cmp, vec![vreg(lhs), vreg(rhs)]));
            out.push(X64Inst::new(X64Kind::Xor, vec![vreg(dst), vreg(dst)]));
            out.push(X64Inst::new(
                set,
                vec![Operand::Vreg {
                    id: dst.id,
                    size: RegSize::Byte,
                }],
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::lex::Lexer;
    use crate::front::{analyze, fold, parse};
    use crate::middle::lower;

    fn compiled(src: &str) -> X64Program {
        let ts = Lexer::new(src, false).tokenize().unwrap();
        let mut prog = parse(&ts).unwrap();
        analyze(&mut prog, &ts).unwrap();
        fold(&mut prog);
        codegen(lower(&prog, &ts).unwrap())
    }

    fn func<'a>(prog: &'a X64Program, name: &str) -> &'a X64Function {
        prog.items
            .iter()
            .find_map(|item| match item {
                X64Item::Func(f) if f.name.as_str() == name => Some(f),
                _ => None,
            })
            .unwrap()
    }

    fn kinds(f: &X64Function) -> Vec<X64Kind> {
        f.blocks.iter().flatten().map(|i| i.kind).collect()
    }

    #[test]
    fn division_goes_through_cqo_and_idiv() {
        let prog = compiled("int main() { int a; a = 10; return a / 3; }");
        let ks = kinds(func(&prog, "main"));
        let cqo = ks.iter().position(|k| *k == X64Kind::Cqo).unwrap();
        assert_eq!(ks[cqo + 1], X64Kind::Idiv);
        let idiv = func(&prog, "main")
            .blocks
            .iter()
            .flatten()
            .find(|i| i.kind == X64Kind::Idiv)
            .unwrap();
        assert_eq!(
            idiv.implicit_used_registers,
            PhysReg::Rax.bit() | PhysReg::Rdx.bit()
        );
    }

    #[test]
    fn comparison_is_cmp_xor_setcc() {
        let prog = compiled("int main() { int a; a = 1; return a < 2; }");
        let ks = kinds(func(&prog, "main"));
        let cmp = ks
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == X64Kind::Cmp)
            .map(|(i, _)| i)
            .next()
            .unwrap();
        assert_eq!(ks[cmp + 1], X64Kind::Xor);
        assert_eq!(ks[cmp + 2], X64Kind::Setl);
    }

    #[test]
    fn call_marshals_arguments_into_the_sysv_bank() {
        let prog = compiled("int f(int a, int b) { return a + b; } int main() { return f(1, 2); }");
        let main = func(&prog, "main");
        let movs: Vec<&X64Inst> = main
            .blocks
            .iter()
            .flatten()
            .filter(|i| {
                i.kind == X64Kind::Mov
                    && matches!(
                        i.ops.first(),
                        Some(Operand::Reg {
                            reg: PhysReg::Rdi | PhysReg::Rsi,
                            ..
                        })
                    )
            })
            .collect();
        assert_eq!(movs.len(), 2);
        let call = main
            .blocks
            .iter()
            .flatten()
            .find(|i| i.kind == X64Kind::Call)
            .unwrap();
        assert_eq!(call.target.unwrap().as_str(), "f");
        assert_ne!(call.implicit_used_registers & PhysReg::Rdi.bit(), 0);
        assert_ne!(call.implicit_used_registers & PhysReg::Rax.bit(), 0);
    }

    #[test]
    fn main_gets_the_implicit_zero_return() {
        let prog = compiled("int main() { int a; a = 1; }");
        let main = func(&prog, "main");
        let insts: Vec<&X64Inst> = main.blocks.iter().flatten().collect();
        let ret = insts
            .iter()
            .position(|i| i.kind == X64Kind::Return)
            .unwrap();
        let mov = insts[ret - 1];
        assert_eq!(mov.kind, X64Kind::Mov);
        assert!(matches!(
            mov.ops[0],
            Operand::Reg {
                reg: PhysReg::Rax,
                size: RegSize::Dword
            }
        ));
        assert!(matches!(mov.ops[1], Operand::Imm(0)));
    }

    #[test]
    fn shifts_route_their_count_through_cl() {
        let prog = compiled("int main() { int a; a = 1; return a << 3; }");
        let main = func(&prog, "main");
        let mov_cl = main
            .blocks
            .iter()
            .flatten()
            .find(|i| {
                i.kind == X64Kind::Mov
                    && matches!(
                        i.ops.first(),
                        Some(Operand::Reg {
                            reg: PhysReg::Rcx,
                            size: RegSize::Byte
                        })
                    )
            })
            .is_some();
        assert!(mov_cl);
        assert!(kinds(main).contains(&X64Kind::Sal));
    }

    #[test]
    fn dead_lhs_fuses_into_the_destination() {
        // `1 + 2` is folded, so force registers with a variable
        let prog = compiled("int main() { int a; a = 1; return a + 2; }");
        let main = func(&prog, "main");
        let aliased = main
            .bindings
            .iter()
            .any(|b| matches!(b, Binding::Alias(_)));
        assert!(aliased, "no two-address fusion happened");
    }

    #[test]
    fn live_lhs_is_copied_not_fused() {
        // `a` stays live across the post-increment's add
        let prog = compiled("int main() { int a; a = 1; return a++; }");
        let main = func(&prog, "main");
        // the old value's register keeps its own slot: some Mov vreg<-vreg
        let copy = main.blocks.iter().flatten().any(|i| {
            i.kind == X64Kind::Mov
                && matches!(i.ops.first(), Some(Operand::Vreg { .. }))
                && matches!(i.ops.get(1), Some(Operand::Vreg { .. }))
        });
        assert!(copy, "expected a copy for the live left operand");
    }

    #[test]
    fn frames_hold_locals_plus_spill_slots_sixteen_aligned() {
        let prog = compiled("int main() { int a; a = 1; return a; }");
        let main = func(&prog, "main");
        assert!(main.frame_bytes >= main.locals_bytes + 8 * main.slots.len());
        assert_eq!(main.frame_bytes % 16, 0);
    }
}
