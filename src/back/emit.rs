//! Assembly text emission.
//!
//! The x86-64 listing still uses virtual registers; this writer is the
//! simplest possible collaborator on the other side of that interface. Every
//! canonical virtual register owns an 8-byte stack slot below the named
//! locals, instruction operands materialize through the scratch registers
//! `r10`/`r11` (values the ABI pins elsewhere use their pinned register),
//! and results store straight back. Slots always hold values extended to 64
//! bits, so register-to-register operations render at quadword width.

use std::fmt::Write;

use crate::back::x64::{
    resolve, MemBase, Operand, PhysReg, X64Function, X64Inst, X64Item, X64Kind, X64Program,
};
use crate::middle::tir::{GlobalInit, RegSize};

pub fn emit(prog: &X64Program) -> String {
    let mut out = String::new();
    out.push_str(".intel_syntax noprefix\n");
    out.push_str(".data\n");
    for global in &prog.globals {
        let _ = writeln!(out, "{}:", global.name);
        for init in &global.init {
            match init {
                GlobalInit::Zero(n) => {
                    let _ = writeln!(out, "  .zero {n}");
                }
                GlobalInit::Val { value, size } => {
                    let directive = match size {
                        1 => ".byte",
                        2 => ".value",
                        4 => ".long",
                        8 => ".quad",
                        _ => unreachable!("unknown data size {size}"),
                    };
                    let _ = writeln!(out, "  {directive} {value}");
                }
                GlobalInit::Pointer(name) => {
                    let _ = writeln!(out, "  .quad {name}");
                }
                GlobalInit::Str(name) => {
                    let _ = writeln!(out, "  .quad {name}");
                }
            }
        }
    }
    for (name, text) in &prog.strings {
        let _ = writeln!(out, "{name}:");
        let _ = writeln!(out, "  .string \"{}\"", escape_asm_string(text));
    }
    out.push_str(".text\n");
    for item in &prog.items {
        match item {
            X64Item::Asm(text) => {
                out.push_str(text);
                if !text.ends_with('\n') {
                    out.push('\n');
                }
            }
            X64Item::Func(func) => emit_func(func, &mut out),
        }
    }
    out
}

fn emit_func(func: &X64Function, out: &mut String) {
    if !func.is_static {
        let _ = writeln!(out, ".global {}", func.name);
    }
    let _ = writeln!(out, "{}:", func.name);
    out.push_str("  push rbp\n");
    out.push_str("  mov rbp, rsp\n");
    if func.frame_bytes > 0 {
        let _ = writeln!(out, "  sub rsp, {}", func.frame_bytes);
    }
    for block in &func.blocks {
        for inst in block {
            emit_inst(func, inst, out);
        }
    }
}

/// Displacement of a virtual register's spill slot below `rbp`.
fn slot_disp(func: &X64Function, id: usize) -> usize {
    let canonical = resolve(&func.bindings, id);
    let index = func.slots[&canonical];
    func.locals_bytes + 8 * (index + 1)
}

fn size_ptr(size: usize) -> &'static str {
    match size {
        1 => "BYTE PTR",
        2 => "WORD PTR",
        4 => "DWORD PTR",
        8 => "QWORD PTR",
        _ => unreachable!("unsupported access size {size}"),
    }
}

fn mem_addr(base: &str, disp: i64) -> String {
    if disp > 0 {
        format!("[{base}+{disp}]")
    } else if disp < 0 {
        format!("[{base}-{}]", -disp)
    } else {
        format!("[{base}]")
    }
}

/// What instruction kinds do with their first operand.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Dst,
    Both,
    Src,
}

fn op0_role(kind: X64Kind) -> Role {
    use X64Kind::*;
    match kind {
        Mov | Lea | Movsx | Movsxd | Movzx | Pop => Role::Dst,
        Add | Sub | Imul | And | Or | Xor | Shl | Shr | Sal | Sar | Neg | Not | Sete | Setne
        | Setl | Setb | Setle | Setbe => Role::Both,
        _ => Role::Src,
    }
}

/// The width a virtual-register operand renders at.
fn render_width(kind: X64Kind, index: usize, size: RegSize) -> RegSize {
    use X64Kind::*;
    match kind {
        Sete | Setne | Setl | Setb | Setle | Setbe => RegSize::Byte,
        Movsx | Movzx if index == 1 => size,
        Movsxd if index == 1 => RegSize::Dword,
        _ => RegSize::Qword,
    }
}

fn emit_inst(func: &X64Function, inst: &X64Inst, out: &mut String) {
    match inst.kind {
        X64Kind::Label => {
            let _ = writeln!(out, "{}:", inst.target.expect("label without a name"));
            return;
        }
        X64Kind::Jmp | X64Kind::Je | X64Kind::Jne | X64Kind::Jz => {
            let _ = writeln!(
                out,
                "  {} {}",
                inst.kind,
                inst.target.expect("jump without a target")
            );
            return;
        }
        X64Kind::Call => {
            let _ = writeln!(out, "  call {}", inst.target.expect("call without a target"));
            return;
        }
        X64Kind::Return => {
            out.push_str("  leave\n");
            out.push_str("  ret\n");
            return;
        }
        X64Kind::Leave => {
            out.push_str("  leave\n");
            return;
        }
        X64Kind::Ret => {
            out.push_str("  ret\n");
            return;
        }
        X64Kind::Cqo => {
            out.push_str("  cqo\n");
            return;
        }
        X64Kind::BuiltinAsm => {
            let text = inst.text.as_deref().expect("builtin-asm without a body");
            out.push_str(text);
            if !text.ends_with('\n') {
                out.push('\n');
            }
            return;
        }
        _ => {}
    }

    // Memory-touching movs pick their own mnemonic.
    if inst.kind == X64Kind::Mov {
        if let Some(Operand::Mem { .. }) = inst.ops.get(1) {
            emit_load(func, inst, out);
            return;
        }
        if let Some(Operand::Mem { .. }) = inst.ops.first() {
            emit_store(func, inst, out);
            return;
        }
        if let (Some(Operand::Reg { reg, size }), Some(Operand::Vreg { id, .. })) =
            (inst.ops.first(), inst.ops.get(1))
        {
            // ABI move: read the slot at the pinned register's own width
            let disp = slot_disp(func, *id);
            let _ = writeln!(
                out,
                "  mov {}, {} {}",
                reg.name(*size),
                size_ptr(size.bytes()),
                mem_addr("rbp", -(disp as i64))
            );
            return;
        }
    }

    // `movzx dst, r/m32` does not exist; a 32-bit mov zero-extends.
    let (kind, force_dword) = if inst.kind == X64Kind::Movzx
        && matches!(inst.ops.get(1), Some(Operand::Vreg { size: RegSize::Dword, .. }))
    {
        (X64Kind::Mov, true)
    } else {
        (inst.kind, false)
    };

    let mut scratch = [PhysReg::R10, PhysReg::R11].into_iter();
    let mut pre: Vec<String> = vec![];
    let mut post: Vec<String> = vec![];
    let mut rendered: Vec<String> = vec![];

    for (i, op) in inst.ops.iter().enumerate() {
        let role = if i == 0 { op0_role(kind) } else { Role::Src };
        match op {
            Operand::Reg { reg, size } => rendered.push(reg.name(*size).to_string()),
            Operand::Imm(v) => rendered.push(v.to_string()),
            Operand::Vreg { id, size } => {
                let disp = slot_disp(func, *id);
                let reg = scratch.next().expect("more than two register operands");
                if role != Role::Dst {
                    pre.push(format!(
                        "  mov {}, QWORD PTR {}",
                        reg.name(RegSize::Qword),
                        mem_addr("rbp", -(disp as i64))
                    ));
                }
                if role != Role::Src {
                    post.push(format!(
                        "  mov QWORD PTR {}, {}",
                        mem_addr("rbp", -(disp as i64)),
                        reg.name(RegSize::Qword)
                    ));
                }
                let width = if force_dword {
                    RegSize::Dword
                } else {
                    render_width(kind, i, *size)
                };
                rendered.push(reg.name(width).to_string());
            }
            Operand::Mem { base, disp, size, .. } => {
                let base_name = match base {
                    MemBase::Reg(r) => r.name(RegSize::Qword).to_string(),
                    MemBase::Vreg(id) => {
                        let slot = slot_disp(func, *id);
                        let reg = scratch.next().expect("more than two register operands");
                        pre.push(format!(
                            "  mov {}, QWORD PTR {}",
                            reg.name(RegSize::Qword),
                            mem_addr("rbp", -(slot as i64))
                        ));
                        reg.name(RegSize::Qword).to_string()
                    }
                };
                // lea takes a bare address, data movs carry the access size
                if kind == X64Kind::Lea {
                    rendered.push(mem_addr(&base_name, *disp));
                } else {
                    rendered.push(format!("{} {}", size_ptr(*size), mem_addr(&base_name, *disp)));
                }
            }
            Operand::Rip { symbol } => rendered.push(format!("[rip+{symbol}]")),
        }
    }

    for line in &pre {
        out.push_str(line);
        out.push('\n');
    }
    let _ = writeln!(out, "  {} {}", kind, rendered.join(", "));
    for line in &post {
        out.push_str(line);
        out.push('\n');
    }
}

/// A `mov` whose source is memory: the mnemonic extends by access size and
/// signedness so the destination holds the canonical 64-bit value.
fn emit_load(func: &X64Function, inst: &X64Inst, out: &mut String) {
    let Some(Operand::Mem { base, disp, size, signed }) = inst.ops.get(1) else {
        unreachable!();
    };
    let mut scratch = [PhysReg::R10, PhysReg::R11].into_iter();
    let (dst, store_back) = match inst.ops.first() {
        Some(Operand::Vreg { id, .. }) => {
            let reg = scratch.next().unwrap();
            (reg, Some(slot_disp(func, *id)))
        }
        Some(Operand::Reg { reg, .. }) => (*reg, None),
        _ => unreachable!("load without a register destination"),
    };
    let base_name = match base {
        MemBase::Reg(r) => r.name(RegSize::Qword).to_string(),
        MemBase::Vreg(id) => {
            let slot = slot_disp(func, *id);
            let reg = scratch.next().unwrap();
            let _ = writeln!(
                out,
                "  mov {}, QWORD PTR {}",
                reg.name(RegSize::Qword),
                mem_addr("rbp", -(slot as i64))
            );
            reg.name(RegSize::Qword).to_string()
        }
    };
    let src = format!("{} {}", size_ptr(*size), mem_addr(&base_name, *disp));
    let (mnemonic, dst_name) = match (size, signed) {
        (1 | 2, true) => ("movsx", dst.name(RegSize::Qword)),
        (1 | 2, false) => ("movzx", dst.name(RegSize::Qword)),
        (4, true) => ("movsxd", dst.name(RegSize::Qword)),
        (4, false) => ("mov", dst.name(RegSize::Dword)),
        (8, _) => ("mov", dst.name(RegSize::Qword)),
        _ => unreachable!("unsupported access size {size}"),
    };
    let _ = writeln!(out, "  {mnemonic} {dst_name}, {src}");
    if let Some(disp) = store_back {
        let _ = writeln!(
            out,
            "  mov QWORD PTR {}, {}",
            mem_addr("rbp", -(disp as i64)),
            dst.name(RegSize::Qword)
        );
    }
}

/// A `mov` whose destination is memory: the source renders at the access
/// width, truncating naturally.
fn emit_store(func: &X64Function, inst: &X64Inst, out: &mut String) {
    let Some(Operand::Mem { base, disp, size, .. }) = inst.ops.first() else {
        unreachable!();
    };
    let mut scratch = [PhysReg::R10, PhysReg::R11].into_iter();
    let base_name = match base {
        MemBase::Reg(r) => r.name(RegSize::Qword).to_string(),
        MemBase::Vreg(id) => {
            let slot = slot_disp(func, *id);
            let reg = scratch.next().unwrap();
            let _ = writeln!(
                out,
                "  mov {}, QWORD PTR {}",
                reg.name(RegSize::Qword),
                mem_addr("rbp", -(slot as i64))
            );
            reg.name(RegSize::Qword).to_string()
        }
    };
    let width = RegSize::from_bytes(*size);
    let src_name = match inst.ops.get(1) {
        Some(Operand::Vreg { id, .. }) => {
            let slot = slot_disp(func, *id);
            let reg = scratch.next().unwrap();
            let _ = writeln!(
                out,
                "  mov {}, QWORD PTR {}",
                reg.name(RegSize::Qword),
                mem_addr("rbp", -(slot as i64))
            );
            reg.name(width).to_string()
        }
        Some(Operand::Reg { reg, .. }) => reg.name(width).to_string(),
        _ => unreachable!("store without a register source"),
    };
    let _ = writeln!(
        out,
        "  mov {} {}, {}",
        size_ptr(*size),
        mem_addr(&base_name, *disp),
        src_name
    );
}

/// Escape a decoded string literal back into `.string` form.
fn escape_asm_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\000"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\{:03o}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::codegen::codegen;
    use crate::front::lex::Lexer;
    use crate::front::{analyze, fold, parse};
    use crate::middle::lower;

    fn asm(src: &str) -> String {
        let ts = Lexer::new(src, false).tokenize().unwrap();
        let mut prog = parse(&ts).unwrap();
        analyze(&mut prog, &ts).unwrap();
        fold(&mut prog);
        emit(&codegen(lower(&prog, &ts).unwrap()))
    }

    #[test]
    fn the_listing_has_the_two_sections_in_order() {
        let out = asm("int g; int main() { return g; }");
        let data = out.find(".data").unwrap();
        let text = out.find(".text").unwrap();
        assert!(out.starts_with(".intel_syntax noprefix\n"));
        assert!(data < text);
        assert!(out[data..text].contains("g:"));
        assert!(out[data..text].contains(".zero 4"));
    }

    #[test]
    fn functions_get_prologue_label_and_leave_ret() {
        let out = asm("int main() { return 0; }");
        assert!(out.contains(".global main"));
        assert!(out.contains("main:\n  push rbp\n  mov rbp, rsp"));
        assert!(out.contains("  leave\n  ret\n"));
    }

    #[test]
    fn static_functions_are_not_exported() {
        let out = asm("static int f() { return 1; } int main() { return f(); }");
        assert!(!out.contains(".global f"));
        assert!(out.contains(".global main"));
        assert!(out.contains("f:"));
    }

    #[test]
    fn frames_are_sixteen_byte_aligned() {
        let out = asm("int main() { int a; a = 1; return a; }");
        let sub = out
            .lines()
            .find(|l| l.trim_start().starts_with("sub rsp,"))
            .unwrap();
        let bytes: usize = sub.rsplit(' ').next().unwrap().parse().unwrap();
        assert_eq!(bytes % 16, 0);
    }

    #[test]
    fn byte_loads_sign_extend() {
        let out = asm("int main() { char c; c = 7; return c; }");
        assert!(out.contains("movsx"), "no sign-extending load:\n{out}");
        assert!(out.contains("BYTE PTR"));
    }

    #[test]
    fn global_initializers_use_sized_directives() {
        let out = asm("long g = 7; char c = 1; int main() { return 0; }");
        assert!(out.contains("  .quad 7"));
        assert!(out.contains("  .byte 1"));
    }

    #[test]
    fn string_literals_land_in_the_pool() {
        let out = asm("char *s = \"hi\\n\"; int main() { return 0; }");
        assert!(out.contains(".LC0:"));
        assert!(out.contains("  .string \"hi\\n\""));
        assert!(out.contains("  .quad .LC0"));
    }

    #[test]
    fn locals_address_below_the_frame_pointer() {
        let out = asm("int main() { int a; a = 5; return a; }");
        assert!(out.contains("lea"), "no lea in:\n{out}");
        assert!(out.contains("[rbp-"), "no rbp-relative access:\n{out}");
    }

    #[test]
    fn globals_address_rip_relative() {
        let out = asm("int g; int main() { g = 7; return g; }");
        assert!(out.contains("[rip+g]"));
    }

    #[test]
    fn builtin_asm_bodies_pass_through_verbatim() {
        let out = asm("__asm__(\".global magic\\nmagic:\\n  ret\\n\"); int main() { return 0; }");
        assert!(out.contains(".global magic\nmagic:\n  ret\n"));
    }

    #[test]
    fn division_renders_the_full_sequence() {
        let out = asm("int main() { int a; a = 9; return a / 2; }");
        assert!(out.contains("  cqo\n"));
        assert!(out.contains("  idiv r10\n"));
    }

    #[test]
    fn control_flow_labels_are_function_qualified() {
        let out = asm("int main() { while (1) break; return 0; }");
        assert!(out.contains(".Lbeginwhile_0_main:"));
        assert!(out.contains(".Lendwhile_0_main:"));
        assert!(out.contains("jmp .Lendwhile_0_main"));
    }
}
