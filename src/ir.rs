//! Structured form of a function body.
//!
//! Every operand-stack position becomes a typed slot addressed by depth and
//! kind, so a value never moves unless a branch carries it to another depth.

use std::collections::BTreeSet;
use std::fmt;

use crate::mapper::{LoadOp, NumOp, StoreOp};
use crate::wasm::{ValKind, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot {
    pub depth: u32,
    pub kind: ValKind,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}_{}", self.depth, self.kind)
    }
}

/// Identifies one control construct within a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Local(u32),
    Global(u32),
    Const(Value),
    Numeric(NumOp, Vec<Slot>),
    Load {
        op: LoadOp,
        addr: Slot,
        offset: u64,
    },
    Select {
        cond: Slot,
        then: Slot,
        other: Slot,
    },
    MemorySize,
    MemoryGrow(Slot),
    Call {
        func: u32,
        args: Vec<Slot>,
    },
    /// `signature` is the canonical signature index the callee must have.
    CallIndirect {
        signature: u32,
        table: u32,
        index: Slot,
        args: Vec<Slot>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub from: Slot,
    pub to: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Past the end of a block or if.
    Exit(Label),
    /// Back to the head of a loop.
    Continue(Label),
    Return(Option<Slot>),
}

/// A transfer of control, preceded by the slot copies that carry branch values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jump {
    pub moves: Vec<Move>,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign(Slot, Expr),
    /// A call whose callee returns nothing.
    Effect(Expr),
    SetLocal(u32, Slot),
    SetGlobal(u32, Slot),
    Store {
        op: StoreOp,
        addr: Slot,
        offset: u64,
        value: Slot,
    },
    MemoryCopy {
        dst: Slot,
        src: Slot,
        len: Slot,
    },
    MemoryFill {
        dst: Slot,
        value: Slot,
        len: Slot,
    },
    /// `label` is only present when some branch targets the construct.
    Block {
        label: Option<Label>,
        body: Vec<Stmt>,
    },
    Loop {
        label: Option<Label>,
        body: Vec<Stmt>,
    },
    If {
        label: Option<Label>,
        cond: Slot,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    Jump(Jump),
    BranchIf {
        cond: Slot,
        jump: Jump,
    },
    Switch {
        index: Slot,
        targets: Vec<Jump>,
        default: Jump,
    },
    Trap(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub index: u32,
    pub name: Option<String>,
    pub signature: u32,
    pub params: Vec<ValKind>,
    pub results: Vec<ValKind>,
    /// Declared locals; they follow the parameters in the local index space.
    pub locals: Vec<ValKind>,
    pub slots: BTreeSet<Slot>,
    pub body: Vec<Stmt>,
}
