//! Opcode vocabulary of the lazy graph, grouped into disjoint categories.

use std::fmt;

/// Operations that produce a base buffer without computing it from other buffers elementwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Empty,
    Rand,
    Const,
    From,
    Custom,
    Contiguous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Noop,
    Exp2,
    Log2,
    Cast,
    Sin,
    Sqrt,
    Recip,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Mod,
    CmpLt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TernaryOp {
    /// `a * b + c`
    MulAcc,
    /// `if a != 0 { b } else { c }`
    Where,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// Backend-facing leaves of a resolved tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferOp {
    /// Reads kernel slot `MemBuffer::idx` through a view.
    Mem,
    /// Broadcasts a literal through a view.
    Const,
}

/// Tagged opcode; the tag is the opcode's category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Load(LoadOp),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Ternary(TernaryOp),
    Reduce(ReduceOp),
    Buffer(BufferOp),
}

impl Opcode {
    /// Unary, binary, and ternary ops: computed lane by lane with no cross-element dependency.
    pub fn is_elementwise(self) -> bool {
        matches!(
            self,
            Opcode::Unary(_) | Opcode::Binary(_) | Opcode::Ternary(_)
        )
    }

    pub fn is_reduce(self) -> bool {
        matches!(self, Opcode::Reduce(_))
    }

    pub fn is_load(self) -> bool {
        matches!(self, Opcode::Load(_))
    }

    pub fn as_load(self) -> Option<LoadOp> {
        match self {
            Opcode::Load(op) => Some(op),
            _ => None,
        }
    }

    /// Number of sources an op of this kind expects, when fixed.
    pub fn arity(self) -> Option<usize> {
        match self {
            Opcode::Unary(_) | Opcode::Reduce(_) => Some(1),
            Opcode::Binary(_) => Some(2),
            Opcode::Ternary(_) => Some(3),
            Opcode::Buffer(_) => Some(0),
            Opcode::Load(LoadOp::From | LoadOp::Contiguous) => Some(1),
            Opcode::Load(LoadOp::Empty | LoadOp::Rand | LoadOp::Const) => Some(0),
            Opcode::Load(LoadOp::Custom) => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Load(op) => match op {
                LoadOp::Empty => "EMPTY",
                LoadOp::Rand => "RAND",
                LoadOp::Const => "CONST",
                LoadOp::From => "FROM",
                LoadOp::Custom => "CUSTOM",
                LoadOp::Contiguous => "CONTIGUOUS",
            },
            Opcode::Unary(op) => match op {
                UnaryOp::Noop => "NOOP",
                UnaryOp::Exp2 => "EXP2",
                UnaryOp::Log2 => "LOG2",
                UnaryOp::Cast => "CAST",
                UnaryOp::Sin => "SIN",
                UnaryOp::Sqrt => "SQRT",
                UnaryOp::Recip => "RECIP",
                UnaryOp::Neg => "NEG",
            },
            Opcode::Binary(op) => match op {
                BinaryOp::Add => "ADD",
                BinaryOp::Sub => "SUB",
                BinaryOp::Mul => "MUL",
                BinaryOp::Div => "DIV",
                BinaryOp::Max => "MAX",
                BinaryOp::Mod => "MOD",
                BinaryOp::CmpLt => "CMPLT",
            },
            Opcode::Ternary(op) => match op {
                TernaryOp::MulAcc => "MULACC",
                TernaryOp::Where => "WHERE",
            },
            Opcode::Reduce(op) => match op {
                ReduceOp::Sum => "SUM",
                ReduceOp::Max => "RMAX",
            },
            Opcode::Buffer(op) => match op {
                BufferOp::Mem => "MEM",
                BufferOp::Const => "CONST",
            },
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<LoadOp> for Opcode {
    fn from(op: LoadOp) -> Self {
        Opcode::Load(op)
    }
}

impl From<UnaryOp> for Opcode {
    fn from(op: UnaryOp) -> Self {
        Opcode::Unary(op)
    }
}

impl From<BinaryOp> for Opcode {
    fn from(op: BinaryOp) -> Self {
        Opcode::Binary(op)
    }
}

impl From<TernaryOp> for Opcode {
    fn from(op: TernaryOp) -> Self {
        Opcode::Ternary(op)
    }
}

impl From<ReduceOp> for Opcode {
    fn from(op: ReduceOp) -> Self {
        Opcode::Reduce(op)
    }
}

impl From<BufferOp> for Opcode {
    fn from(op: BufferOp) -> Self {
        Opcode::Buffer(op)
    }
}
