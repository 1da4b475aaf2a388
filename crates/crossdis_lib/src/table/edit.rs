use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{LineTableFormat, OpClass, OperandEncoding};
use crate::extended::ExtFormat;
use crate::format::ArgFormat;
use crate::stack::StackRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreTarget {
    Plain,
    Name,
    Local,
    Free,
}

/// Composite constructor used by a definition. Each kind implies a fixed
/// group of classification sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Plain,
    Name,
    Local,
    Free,
    Const,
    JumpRel,
    JumpAbs,
    Compare,
    Unary,
    Binary,
    Ternary,
    Nargs,
    Call,
    Varargs,
    Store(StoreTarget),
}

impl OpKind {
    pub fn classes(self) -> &'static [OpClass] {
        match self {
            OpKind::Plain => &[],
            OpKind::Name => &[OpClass::Name, OpClass::NullaryOp],
            OpKind::Local => &[OpClass::Local, OpClass::NullaryOp],
            OpKind::Const => &[OpClass::Const, OpClass::NullaryOp],
            OpKind::Free => &[OpClass::Free],
            OpKind::JumpRel => &[OpClass::JumpRel],
            OpKind::JumpAbs => &[OpClass::JumpAbs],
            OpKind::Compare => &[OpClass::Compare, OpClass::Binary],
            OpKind::Unary => &[OpClass::Unary],
            OpKind::Binary => &[OpClass::Binary],
            OpKind::Ternary => &[OpClass::Ternary],
            OpKind::Nargs => &[OpClass::Nargs],
            OpKind::Call => &[OpClass::Call, OpClass::Nargs],
            OpKind::Varargs => &[OpClass::Varargs],
            OpKind::Store(StoreTarget::Plain) => &[OpClass::Store],
            OpKind::Store(StoreTarget::Name) => &[OpClass::Name, OpClass::Store],
            OpKind::Store(StoreTarget::Local) => &[OpClass::Local, OpClass::Store],
            OpKind::Store(StoreTarget::Free) => &[OpClass::Free, OpClass::Store],
        }
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "op" => OpKind::Plain,
            "name" => OpKind::Name,
            "local" => OpKind::Local,
            "free" => OpKind::Free,
            "const" => OpKind::Const,
            "jrel" => OpKind::JumpRel,
            "jabs" => OpKind::JumpAbs,
            "compare" => OpKind::Compare,
            "unary" => OpKind::Unary,
            "binary" => OpKind::Binary,
            "ternary" => OpKind::Ternary,
            "nargs" => OpKind::Nargs,
            "call" => OpKind::Call,
            "varargs" => OpKind::Varargs,
            "store" => OpKind::Store(StoreTarget::Plain),
            "store_name" => OpKind::Store(StoreTarget::Name),
            "store_local" => OpKind::Store(StoreTarget::Local),
            "store_free" => OpKind::Store(StoreTarget::Free),
            other => return Err(format!("unknown opcode kind {other:?}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpFlag {
    NoFollow,
    Conditional,
    NullaryLoad,
    Backward,
    EncodedArg,
    HasExc,
}

impl FromStr for OpFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "nofollow" => OpFlag::NoFollow,
            "cond" => OpFlag::Conditional,
            "nullary_load" => OpFlag::NullaryLoad,
            "backward" => OpFlag::Backward,
            "encoded_arg" => OpFlag::EncodedArg,
            "exc" => OpFlag::HasExc,
            other => return Err(format!("unknown opcode flag {other:?}")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDef {
    pub name: String,
    pub opcode: u16,
    pub pop: i32,
    pub push: i32,
    pub kind: OpKind,
    pub flags: Vec<OpFlag>,
}

impl OpDef {
    pub fn new(name: &str, opcode: u16, pop: i32, push: i32, kind: OpKind) -> Self {
        Self { name: name.to_string(), opcode, pop, push, kind, flags: Vec::new() }
    }

    pub fn with(mut self, flag: OpFlag) -> Self {
        self.flags.push(flag);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Setting {
    Wordcode(bool),
    HaveArgument(u16),
    ExtendedArgShift(u32),
    JumpUnit(u32),
    LocalsPlus(bool),
    LineTable(LineTableFormat),
    ExceptionTable(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    ArgFormat(Option<ArgFormat>),
    ExtFormat(Option<ExtFormat>),
    StackRule(Option<StackRule>),
    Encoding(OperandEncoding),
    CacheEntries(u8),
}

/// One step of a table definition, applied strictly in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edit {
    Remove { name: String, opcode: u16 },
    Define(OpDef),
    /// Last definition wins: whatever occupies the opcode number or the name
    /// is dropped before defining.
    Redefine(OpDef),
    RemoveAll,
    Setting(Setting),
    Bind { name: String, binding: Binding },
}

impl Edit {
    pub fn remove(name: &str, opcode: u16) -> Self {
        Edit::Remove { name: name.to_string(), opcode }
    }

    pub fn bind(name: &str, binding: Binding) -> Self {
        Edit::Bind { name: name.to_string(), binding }
    }
}
