//! Arithmetic and memory operations representable by a single IR node.
//!
//! Every op takes at most four inputs. Operations that conceptually want
//! more are split into intermediate variables by the caller instead of
//! widening the dependency array.

use nanoserde::{DeBin, SerBin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, SerBin, DeBin)]
#[repr(u32)]
pub enum Op {
    // Unary
    Neg,
    Not,
    Sqrt,
    Abs,
    Ceil,
    Floor,
    Round,
    Trunc,
    Popc,
    Clz,
    Ctz,
    Rcp,
    Rsqrt,
    Sin,
    Cos,
    Exp2,
    Log2,
    Cast,
    Bitcast,

    // Binary
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Mulhi,
    Min,
    Max,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Xor,
    Shl,
    Shr,

    // Ternary
    Fma,
    Select,

    // Memory
    /// deps: [source pointer, index, mask]
    Gather,
    /// deps: [target pointer, index, value, mask]; writes to memory
    Scatter,

    /// Lane counter 0..size, no inputs
    Counter,
}

impl Op {
    /// Number of dependency slots the op populates.
    pub const fn arity(self) -> usize {
        match self {
            Op::Counter => 0,
            Op::Neg
            | Op::Not
            | Op::Sqrt
            | Op::Abs
            | Op::Ceil
            | Op::Floor
            | Op::Round
            | Op::Trunc
            | Op::Popc
            | Op::Clz
            | Op::Ctz
            | Op::Rcp
            | Op::Rsqrt
            | Op::Sin
            | Op::Cos
            | Op::Exp2
            | Op::Log2
            | Op::Cast
            | Op::Bitcast => 1,
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Mulhi
            | Op::Min
            | Op::Max
            | Op::Eq
            | Op::Neq
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::Shl
            | Op::Shr => 2,
            Op::Fma | Op::Select | Op::Gather => 3,
            Op::Scatter => 4,
        }
    }

    /// Scatters write to memory. They order against other operations and
    /// never participate in common subexpression elimination.
    pub const fn is_side_effect(self) -> bool {
        matches!(self, Op::Scatter)
    }

    /// Comparison ops produce a mask regardless of the operand type.
    pub const fn is_comparison(self) -> bool {
        matches!(self, Op::Eq | Op::Neq | Op::Lt | Op::Le | Op::Gt | Op::Ge)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Op::Neg => "neg",
            Op::Not => "not",
            Op::Sqrt => "sqrt",
            Op::Abs => "abs",
            Op::Ceil => "ceil",
            Op::Floor => "floor",
            Op::Round => "round",
            Op::Trunc => "trunc",
            Op::Popc => "popc",
            Op::Clz => "clz",
            Op::Ctz => "ctz",
            Op::Rcp => "rcp",
            Op::Rsqrt => "rsqrt",
            Op::Sin => "sin",
            Op::Cos => "cos",
            Op::Exp2 => "exp2",
            Op::Log2 => "log2",
            Op::Cast => "cast",
            Op::Bitcast => "bitcast",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Mulhi => "mulhi",
            Op::Min => "min",
            Op::Max => "max",
            Op::Eq => "eq",
            Op::Neq => "neq",
            Op::Lt => "lt",
            Op::Le => "le",
            Op::Gt => "gt",
            Op::Ge => "ge",
            Op::And => "and",
            Op::Or => "or",
            Op::Xor => "xor",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::Fma => "fma",
            Op::Select => "select",
            Op::Gather => "gather",
            Op::Scatter => "scatter",
            Op::Counter => "counter",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
