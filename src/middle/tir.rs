//! The three-address IR.
//!
//! Every instruction names the virtual register it defines and each register
//! it uses, so block-local use/def sets and global liveness fall out of a
//! plain walk. A function is an ordered list of basic blocks; a block whose
//! sole instruction is a label is a safe jump target no matter how its
//! predecessor ended.

use derive_more::Display;

use crate::common::{Id, Set};

pub type RegId = usize;

/// Operand width of a virtual register.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum RegSize {
    #[display("byte")]
    Byte,
    #[display("word")]
    Word,
    #[display("dword")]
    Dword,
    #[display("qword")]
    Qword,
}

impl RegSize {
    pub fn from_bytes(bytes: usize) -> RegSize {
        match bytes {
            1 => RegSize::Byte,
            2 => RegSize::Word,
            4 => RegSize::Dword,
            0 | 8 => RegSize::Qword,
            _ => unreachable!("no register holds {bytes} bytes"),
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            RegSize::Byte => 1,
            RegSize::Word => 2,
            RegSize::Dword => 4,
            RegSize::Qword => 8,
        }
    }

    pub fn bits(self) -> usize {
        self.bytes() * 8
    }
}

/// A virtual register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Reg {
    pub id: RegId,
    pub size: RegSize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BinIr {
    Add,
    Sub,
    /// signed / unsigned multiply
    Mul,
    Mulu,
    Div,
    Divu,
    Rem,
    Remu,
    /// comparisons produce 0/1
    Eq,
    Neq,
    Lt,
    Ltu,
    Lte,
    Lteu,
    And,
    Or,
    Xor,
    /// unsigned / signed shifts
    Shl,
    Shr,
    Sal,
    Sar,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UnIr {
    /// logical not (compare with zero)
    Not,
    BitNot,
    Neg,
}

/// What a `lea` takes the address of.
#[derive(Clone, Debug)]
pub enum LeaTarget {
    /// A local, as a negative displacement from the frame pointer.
    Local { offset: usize },
    /// A global or string literal, rip-relative by name.
    Global { name: Id },
}

#[derive(Clone, Debug)]
pub enum Inst {
    FuncPrologue,
    FuncEpilogue,
    Ret {
        src: Option<Reg>,
    },
    Call {
        name: Id,
        args: Vec<Reg>,
        dst: Reg,
    },
    MovImm {
        dst: Reg,
        imm: i64,
    },
    Mov {
        dst: Reg,
        src: Reg,
    },
    Bin {
        op: BinIr,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    Un {
        op: UnIr,
        dst: Reg,
        src: Reg,
    },
    Jmp {
        label: Id,
    },
    /// Jump when the condition register equals zero.
    Je {
        label: Id,
        cond: Reg,
    },
    /// Jump when the condition register differs from zero.
    Jne {
        label: Id,
        cond: Reg,
    },
    Load {
        dst: Reg,
        addr: Reg,
        offset: usize,
        size: usize,
        signed: bool,
    },
    Store {
        src: Reg,
        addr: Reg,
        offset: usize,
        size: usize,
    },
    /// Store the i-th ABI argument register through `addr`.
    StoreArg {
        addr: Reg,
        index: usize,
        size: usize,
    },
    Lea {
        dst: Reg,
        target: LeaTarget,
    },
    SignExtend {
        dst: Reg,
        src: Reg,
    },
    ZeroExtend {
        dst: Reg,
        src: Reg,
    },
    Truncate {
        dst: Reg,
        src: Reg,
        /// Signedness of the narrowed type; decides how the low bytes are
        /// re-extended into the canonical 64-bit form.
        signed: bool,
    },
    Label {
        name: Id,
    },
    Phi {
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    /// Verbatim `__asm__` text.
    BuiltinAsm {
        text: String,
    },
}

impl Inst {
    /// The register this instruction defines, if any.
    pub fn def(&self) -> Option<Reg> {
        match self {
            Inst::Call { dst, .. }
            | Inst::MovImm { dst, .. }
            | Inst::Mov { dst, .. }
            | Inst::Bin { dst, .. }
            | Inst::Un { dst, .. }
            | Inst::Load { dst, .. }
            | Inst::Lea { dst, .. }
            | Inst::SignExtend { dst, .. }
            | Inst::ZeroExtend { dst, .. }
            | Inst::Truncate { dst, .. }
            | Inst::Phi { dst, .. } => Some(*dst),
            _ => None,
        }
    }

    /// Every register this instruction reads.
    pub fn uses(&self) -> Vec<Reg> {
        match self {
            Inst::Ret { src: Some(src) } => vec![*src],
            Inst::Call { args, .. } => args.clone(),
            Inst::Mov { src, .. }
            | Inst::Un { src, .. }
            | Inst::SignExtend { src, .. }
            | Inst::ZeroExtend { src, .. }
            | Inst::Truncate { src, .. } => vec![*src],
            Inst::Bin { lhs, rhs, .. } | Inst::Phi { lhs, rhs, .. } => vec![*lhs, *rhs],
            Inst::Je { cond, .. } | Inst::Jne { cond, .. } => vec![*cond],
            Inst::Load { addr, .. } | Inst::StoreArg { addr, .. } => vec![*addr],
            Inst::Store { src, addr, .. } => vec![*src, *addr],
            _ => vec![],
        }
    }

    /// Does this instruction close its block?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Jmp { .. }
                | Inst::Je { .. }
                | Inst::Jne { .. }
                | Inst::Ret { .. }
                | Inst::FuncEpilogue
        )
    }
}

/// A basic block plus its CFG edges and liveness sets.
#[derive(Default, Debug)]
pub struct Block {
    pub insts: Vec<Inst>,
    pub parents: Vec<usize>,
    /// Fall-through or taken successor.
    pub lhs: Option<usize>,
    /// Not-taken successor of a conditional jump.
    pub rhs: Option<usize>,
    pub live_in: Set<RegId>,
    pub use_set: Set<RegId>,
    pub def_set: Set<RegId>,
    pub live_out: Set<RegId>,
}

impl Block {
    /// Is this a label-only block (a safe jump target)?
    pub fn is_label_block(&self) -> bool {
        self.insts.len() == 1 && matches!(self.insts[0], Inst::Label { .. })
    }

    pub fn label(&self) -> Option<Id> {
        match self.insts.first() {
            Some(Inst::Label { name }) => Some(*name),
            _ => None,
        }
    }
}

pub struct UserFunc {
    pub name: Id,
    pub is_static: bool,
    /// Total bytes of named locals in the frame.
    pub stack_size: usize,
    pub blocks: Vec<Block>,
    /// Indices of the label-only blocks, for O(1) jump resolution.
    pub label_blocks: Vec<usize>,
    /// Width of each virtual register, indexed by [RegId].
    pub reg_sizes: Vec<RegSize>,
}

pub enum Function {
    User(UserFunc),
    /// A top-level `__asm__` chunk, emitted verbatim into `.text`.
    Asm(String),
}

/// How one run of bytes of a global variable is initialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GlobalInit {
    Zero(usize),
    Val { value: i64, size: usize },
    /// The address of another global.
    Pointer(Id),
    /// The address of a string literal.
    Str(Id),
}

pub struct GlobalVar {
    pub name: Id,
    pub size: usize,
    pub is_static: bool,
    pub init: Vec<GlobalInit>,
}

pub struct Program {
    pub funcs: Vec<Function>,
    pub globals: Vec<GlobalVar>,
    pub strings: Vec<(Id, String)>,
}

impl UserFunc {
    /// Wire up successor and parent links: explicit jumps by label,
    /// everything else by fall-through.
    pub fn connect_blocks(&mut self) {
        let mut by_label = std::collections::HashMap::new();
        for &i in &self.label_blocks {
            if let Some(name) = self.blocks[i].label() {
                by_label.insert(name, i);
            }
        }
        let n = self.blocks.len();
        for i in 0..n {
            let (lhs, rhs) = match self.blocks[i].insts.last() {
                Some(Inst::Jmp { label }) => (by_label.get(label).copied(), None),
                Some(Inst::Je { label, .. }) | Some(Inst::Jne { label, .. }) => {
                    let fall = (i + 1 < n).then_some(i + 1);
                    (by_label.get(label).copied(), fall)
                }
                Some(Inst::Ret { .. }) | Some(Inst::FuncEpilogue) => (None, None),
                _ => ((i + 1 < n).then_some(i + 1), None),
            };
            self.blocks[i].lhs = lhs;
            self.blocks[i].rhs = rhs;
            if let Some(s) = lhs {
                self.blocks[s].parents.push(i);
            }
            if let Some(s) = rhs {
                self.blocks[s].parents.push(i);
            }
        }
    }

    /// Classic backward liveness over the connected CFG.
    pub fn analyze_liveness(&mut self) {
        for block in &mut self.blocks {
            let mut use_set = Set::new();
            let mut def_set = Set::new();
            for inst in &block.insts {
                for reg in inst.uses() {
                    if !def_set.contains(&reg.id) {
                        use_set.insert(reg.id);
                    }
                }
                if let Some(def) = inst.def() {
                    def_set.insert(def.id);
                }
            }
            block.use_set = use_set;
            block.def_set = def_set;
        }

        let mut changed = true;
        while changed {
            changed = false;
            for i in (0..self.blocks.len()).rev() {
                let mut live_out = Set::new();
                for succ in [self.blocks[i].lhs, self.blocks[i].rhs].into_iter().flatten() {
                    live_out.extend(self.blocks[succ].live_in.iter().copied());
                }
                let block = &self.blocks[i];
                let mut live_in = block.use_set.clone();
                live_in.extend(live_out.difference(&block.def_set).copied());
                if live_in != self.blocks[i].live_in || live_out != self.blocks[i].live_out {
                    changed = true;
                    self.blocks[i].live_in = live_in;
                    self.blocks[i].live_out = live_out;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id;

    fn reg(n: usize) -> Reg {
        Reg {
            id: n,
            size: RegSize::Dword,
        }
    }

    #[test]
    fn defs_and_uses_cover_the_operands() {
        let inst = Inst::Bin {
            op: BinIr::Add,
            dst: reg(2),
            lhs: reg(0),
            rhs: reg(1),
        };
        assert_eq!(inst.def().unwrap().id, 2);
        assert_eq!(inst.uses().iter().map(|r| r.id).collect::<Vec<_>>(), [0, 1]);

        let store = Inst::Store {
            src: reg(3),
            addr: reg(4),
            offset: 0,
            size: 4,
        };
        assert!(store.def().is_none());
        assert_eq!(store.uses().len(), 2);
    }

    #[test]
    fn liveness_flows_backwards_through_a_loop() {
        // b0: def r0            -> b1
        // b1: label             -> b2
        // b2: use r0, jne b1    -> b3
        // b3: ret
        let label = id(".Ltest");
        let mut func = UserFunc {
            name: id("f"),
            is_static: false,
            stack_size: 0,
            blocks: vec![
                Block {
                    insts: vec![Inst::MovImm { dst: reg(0), imm: 1 }],
                    ..Block::default()
                },
                Block {
                    insts: vec![Inst::Label { name: label }],
                    ..Block::default()
                },
                Block {
                    insts: vec![Inst::Jne {
                        label,
                        cond: reg(0),
                    }],
                    ..Block::default()
                },
                Block {
                    insts: vec![Inst::Ret { src: None }],
                    ..Block::default()
                },
            ],
            label_blocks: vec![1],
            reg_sizes: vec![RegSize::Dword],
        };
        func.connect_blocks();
        assert_eq!(func.blocks[2].lhs, Some(1));
        assert_eq!(func.blocks[2].rhs, Some(3));
        assert!(func.blocks[1].parents.contains(&2));

        func.analyze_liveness();
        // r0 is live around the loop but not before its definition
        assert!(func.blocks[1].live_in.contains(&0));
        assert!(func.blocks[2].live_in.contains(&0));
        assert!(!func.blocks[0].live_in.contains(&0));
        assert!(func.blocks[0].live_out.contains(&0));
    }

    #[test]
    fn label_blocks_hold_exactly_one_instruction() {
        let block = Block {
            insts: vec![Inst::Label { name: id(".L0") }],
            ..Block::default()
        };
        assert!(block.is_label_block());
    }
}
