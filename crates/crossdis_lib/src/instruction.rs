use std::fmt;

use serde::Serialize;

use crate::constant::Constant;

/// How an instruction's operand was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandKind {
    /// No operand.
    None,
    Const,
    Name,
    Local,
    Free,
    JumpRel,
    JumpAbs,
    Compare,
    /// The operand is itself the value: argument counts, flags and the like.
    Count,
    Cache,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    None,
    Int(u64),
    Const(Constant),
    Name(String),
    /// Paired local loads and stores.
    Names(Vec<String>),
    Target(usize),
    /// A comparison operator.
    Symbol(String),
}

impl ArgValue {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            ArgValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            ArgValue::Name(name) | ArgValue::Symbol(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            ArgValue::Const(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::None => Ok(()),
            ArgValue::Int(n) => write!(f, "{n}"),
            ArgValue::Const(c) => f.write_str(&c.repr()),
            ArgValue::Name(name) | ArgValue::Symbol(name) => f.write_str(name),
            ArgValue::Names(names) => f.write_str(&names.join(", ")),
            ArgValue::Target(offset) => write!(f, "{offset}"),
        }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: u16,
    pub opname: String,
    pub arg: Option<u64>,
    pub argval: ArgValue,
    pub argrepr: String,
    pub has_arg: bool,
    /// The operand includes one or more preceding EXTENDED_ARG prefixes.
    pub has_extended_arg: bool,
    pub kind: OperandKind,
    /// Bytes from the first EXTENDED_ARG prefix through the operand.
    pub inst_size: usize,
    pub is_jump_target: bool,
    pub starts_line: Option<u32>,
    pub is_cache: bool,
    /// Net stack effect, resolved from the full operand.
    pub stack_effect: Option<i32>,
    /// Offset of the first instruction folded into `tos_str`.
    pub start_offset: Option<usize>,
    pub tos_str: Option<String>,
}

impl Instruction {
    pub fn new(offset: usize, opcode: u16, opname: impl Into<String>) -> Self {
        Self {
            offset,
            opcode,
            opname: opname.into(),
            arg: None,
            argval: ArgValue::None,
            argrepr: String::new(),
            has_arg: false,
            has_extended_arg: false,
            kind: OperandKind::None,
            inst_size: 1,
            is_jump_target: false,
            starts_line: None,
            is_cache: false,
            stack_effect: None,
            start_offset: None,
            tos_str: None,
        }
    }

    pub fn with_arg(mut self, arg: u64, argval: ArgValue, argrepr: impl Into<String>, kind: OperandKind) -> Self {
        self.arg = Some(arg);
        self.has_arg = true;
        self.argval = argval;
        self.argrepr = argrepr.into();
        self.kind = kind;
        self
    }

    pub fn jump_target(&self) -> Option<usize> {
        match (self.kind, &self.argval) {
            (OperandKind::JumpRel | OperandKind::JumpAbs, ArgValue::Target(t)) => Some(*t),
            _ => None,
        }
    }
}
