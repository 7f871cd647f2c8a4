//! AST for the factory script language.
//!
//! The parser produces a block-structured AST; `compile` flattens it into a
//! position-addressable instruction list so a runner can resume anywhere.

use serde::{Deserialize, Serialize};

/// A literal value appearing in source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal(Literal),
    /// Plain runner variable
    Variable(String),
    /// Value supplied by a registered module, e.g. `part.hostname`
    ModuleValue { module: String, name: String },
    List(Vec<Expression>),
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
}

/// Named arguments at a call site, in source order
pub type ArgList = Vec<(String, Expression)>;

/// Block-structured statements as parsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Assign {
        target: String,
        expr: Expression,
    },
    /// External function invocation: `target = module.function( args )`
    Invoke {
        target: Option<String>,
        module: String,
        function: String,
        args: ArgList,
    },
    /// Runner-handled builtin: pause / fail / abort / message
    Builtin { builtin: Builtin, msg: Expression },
    If {
        cond: Expression,
        then_block: Vec<Statement>,
        else_block: Vec<Statement>,
    },
    While {
        cond: Expression,
        body: Vec<Statement>,
    },
    Label(String),
    Goto(String),
}

/// Builtins the runner executes directly instead of dispatching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Builtin {
    /// Halt the job until an operator resumes it
    Pause,
    /// Raise a recoverable execution error
    Fail,
    /// Raise an unrecoverable error
    Abort,
    /// Post a message without stopping
    Message,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pause" => Some(Builtin::Pause),
            "fail" => Some(Builtin::Fail),
            "abort" => Some(Builtin::Abort),
            "message" => Some(Builtin::Message),
            _ => None,
        }
    }
}

/// Flattened, position-addressable instructions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Assign {
        target: String,
        expr: Expression,
    },
    Invoke {
        target: Option<String>,
        module: String,
        function: String,
        args: ArgList,
    },
    Builtin { builtin: Builtin, msg: Expression },
    Jump { dest: usize },
    JumpIfFalse { cond: Expression, dest: usize },
}

/// A compiled program: an ordered instruction list addressable by position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub instructions: Vec<Instruction>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, pc: usize) -> Option<&Instruction> {
        self.instructions.get(pc)
    }
}
