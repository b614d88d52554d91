//! The x86-64 instruction model.
//!
//! Instructions carry up to two operands; an operand is a virtual register,
//! a physical register of a given width, an immediate, a `[base + disp]`
//! memory reference, or a rip-relative symbol. Physical registers that an
//! instruction touches without naming (the `rdx:rax` pair of a division,
//! the argument bank of a call) are recorded in a bitmask so a register
//! allocator downstream can see them.

use derive_more::Display;

use crate::common::{Id, Map};
use crate::middle::tir::{GlobalVar, RegId, RegSize};

/// The sixteen integer registers, in the conventional operand order:
/// `rdi..r9` is the SysV integer argument sequence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum PhysReg {
    #[display("rdi")]
    Rdi,
    #[display("rsi")]
    Rsi,
    #[display("rdx")]
    Rdx,
    #[display("rcx")]
    Rcx,
    #[display("r8")]
    R8,
    #[display("r9")]
    R9,
    #[display("r10")]
    R10,
    #[display("r11")]
    R11,
    #[display("rax")]
    Rax,
    #[display("rbx")]
    Rbx,
    #[display("rsp")]
    Rsp,
    #[display("rbp")]
    Rbp,
    #[display("r12")]
    R12,
    #[display("r13")]
    R13,
    #[display("r14")]
    R14,
    #[display("r15")]
    R15,
}

/// SysV integer argument order.
pub const ARG_REGISTERS: [PhysReg; 6] = [
    PhysReg::Rdi,
    PhysReg::Rsi,
    PhysReg::Rdx,
    PhysReg::Rcx,
    PhysReg::R8,
    PhysReg::R9,
];

static NAMES_64: [&str; 16] = [
    "rdi", "rsi", "rdx", "rcx", "r8", "r9", "r10", "r11", "rax", "rbx", "rsp", "rbp", "r12",
    "r13", "r14", "r15",
];
static NAMES_32: [&str; 16] = [
    "edi", "esi", "edx", "ecx", "r8d", "r9d", "r10d", "r11d", "eax", "ebx", "esp", "ebp", "r12d",
    "r13d", "r14d", "r15d",
];
static NAMES_16: [&str; 16] = [
    "di", "si", "dx", "cx", "r8w", "r9w", "r10w", "r11w", "ax", "bx", "sp", "bp", "r12w", "r13w",
    "r14w", "r15w",
];
static NAMES_8: [&str; 16] = [
    "dil", "sil", "dl", "cl", "r8b", "r9b", "r10b", "r11b", "al", "bl", "spl", "bpl", "r12b",
    "r13b", "r14b", "r15b",
];

impl PhysReg {
    /// The register's name at the given operand width.
    pub fn name(self, size: RegSize) -> &'static str {
        let table = match size {
            RegSize::Byte => &NAMES_8,
            RegSize::Word => &NAMES_16,
            RegSize::Dword => &NAMES_32,
            RegSize::Qword => &NAMES_64,
        };
        table[self as usize]
    }

    /// This register's bit in an `implicit_used_registers` mask.
    pub fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum X64Kind {
    // data transfer
    #[display("mov")]
    Mov,
    #[display("push")]
    Push,
    #[display("pop")]
    Pop,
    #[display("lea")]
    Lea,
    #[display("movsx")]
    Movsx,
    #[display("movsxd")]
    Movsxd,
    #[display("movzx")]
    Movzx,
    // arithmetic
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("imul")]
    Imul,
    #[display("mul")]
    Mul,
    #[display("idiv")]
    Idiv,
    #[display("div")]
    Div,
    #[display("cqo")]
    Cqo,
    #[display("neg")]
    Neg,
    // logical
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("and")]
    And,
    #[display("not")]
    Not,
    #[display("shl")]
    Shl,
    #[display("shr")]
    Shr,
    #[display("sal")]
    Sal,
    #[display("sar")]
    Sar,
    // control flow
    #[display("jmp")]
    Jmp,
    #[display("jz")]
    Jz,
    #[display("je")]
    Je,
    #[display("jne")]
    Jne,
    #[display("cmp")]
    Cmp,
    #[display("sete")]
    Sete,
    #[display("setne")]
    Setne,
    #[display("setl")]
    Setl,
    #[display("setb")]
    Setb,
    #[display("setle")]
    Setle,
    #[display("setbe")]
    Setbe,
    #[display("call")]
    Call,
    #[display("leave")]
    Leave,
    #[display("ret")]
    Ret,
    /// Assembler label site, not an instruction.
    #[display("label")]
    Label,
    /// Virtual: expands to `leave; ret`.
    #[display("return")]
    Return,
    /// Virtual: verbatim `__asm__` text.
    #[display("builtin-asm")]
    BuiltinAsm,
}

/// Base of a `[base + disp]` memory operand.
#[derive(Clone, Copy, Debug)]
pub enum MemBase {
    Vreg(RegId),
    Reg(PhysReg),
}

#[derive(Clone, Debug)]
pub enum Operand {
    /// A virtual register, rendered at the given width.
    Vreg { id: RegId, size: RegSize },
    /// A physical register, pre-reserved by the ABI.
    Reg { reg: PhysReg, size: RegSize },
    Imm(i64),
    Mem {
        base: MemBase,
        disp: i64,
        /// Access size in bytes.
        size: usize,
        /// Loads of sub-quadword values extend by this signedness.
        signed: bool,
    },
    /// `[rip + symbol]`.
    Rip { symbol: Id },
}

#[derive(Clone, Debug)]
pub struct X64Inst {
    pub kind: X64Kind,
    pub ops: Vec<Operand>,
    /// Jump target, call target, or label name.
    pub target: Option<Id>,
    /// Bitmask over [PhysReg] for registers used without being named.
    pub implicit_used_registers: u16,
    /// Body of a `builtin-asm` pseudo instruction.
    pub text: Option<String>,
}

impl X64Inst {
    pub fn new(kind: X64Kind, ops: Vec<Operand>) -> X64Inst {
        X64Inst {
            kind,
            ops,
            target: None,
            implicit_used_registers: 0,
            text: None,
        }
    }

    pub fn with_target(kind: X64Kind, target: Id) -> X64Inst {
        X64Inst {
            kind,
            ops: vec![],
            target: Some(target),
            implicit_used_registers: 0,
            text: None,
        }
    }

    pub fn implicit(mut self, mask: u16) -> X64Inst {
        self.implicit_used_registers |= mask;
        self
    }
}

/// Where a virtual register ended up during lowering.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Binding {
    /// Still virtual; the emitter gives it a stack slot.
    Virtual,
    /// Fused with another virtual register (two-address destination reuse).
    Alias(RegId),
}

/// Follow alias links to the canonical register id.
pub fn resolve(bindings: &[Binding], mut id: RegId) -> RegId {
    loop {
        match bindings[id] {
            Binding::Alias(next) => id = next,
            Binding::Virtual => return id,
        }
    }
}

pub struct X64Function {
    pub name: Id,
    pub is_static: bool,
    /// Frame bytes reserved below `rbp`: named locals plus one 8-byte slot
    /// per surviving virtual register, rounded for the call alignment rule.
    pub frame_bytes: usize,
    pub blocks: Vec<Vec<X64Inst>>,
    pub bindings: Vec<Binding>,
    /// Stack slot index per canonical virtual register.
    pub slots: Map<RegId, usize>,
    /// Frame bytes taken by named locals (slot area starts below them).
    pub locals_bytes: usize,
}

pub enum X64Item {
    Func(X64Function),
    /// A top-level `__asm__` chunk.
    Asm(String),
}

pub struct X64Program {
    pub items: Vec<X64Item>,
    pub globals: Vec<GlobalVar>,
    pub strings: Vec<(Id, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_names_shrink_with_the_width() {
        assert_eq!(PhysReg::Rax.name(RegSize::Qword), "rax");
        assert_eq!(PhysReg::Rax.name(RegSize::Dword), "eax");
        assert_eq!(PhysReg::Rax.name(RegSize::Word), "ax");
        assert_eq!(PhysReg::Rax.name(RegSize::Byte), "al");
        assert_eq!(PhysReg::R9.name(RegSize::Byte), "r9b");
        assert_eq!(PhysReg::Rdi.name(RegSize::Dword), "edi");
    }

    #[test]
    fn argument_order_is_sysv() {
        let names: Vec<&str> = ARG_REGISTERS
            .iter()
            .map(|r| r.name(RegSize::Qword))
            .collect();
        assert_eq!(names, ["rdi", "rsi", "rdx", "rcx", "r8", "r9"]);
    }

    #[test]
    fn implicit_masks_distinguish_registers() {
        assert_ne!(PhysReg::Rax.bit(), PhysReg::Rdx.bit());
        let div_mask = PhysReg::Rax.bit() | PhysReg::Rdx.bit();
        assert_eq!(div_mask.count_ones(), 2);
    }

    #[test]
    fn alias_chains_resolve_to_the_root() {
        let bindings = vec![
            Binding::Virtual,
            Binding::Alias(0),
            Binding::Alias(1),
            Binding::Virtual,
        ];
        assert_eq!(resolve(&bindings, 2), 0);
        assert_eq!(resolve(&bindings, 3), 3);
    }
}
