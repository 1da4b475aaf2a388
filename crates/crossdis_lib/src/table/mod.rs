//! Per-version opcode tables.
//!
//! A table is produced by [`OpcodeTableBuilder`] from a parent table (or from
//! nothing) and a list of [`Edit`]s, then finalized into an immutable
//! [`OpcodeTable`] that decoders share read-only.

mod builder;
mod edit;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CrossdisError, Result};
use crate::extended::ExtFormat;
use crate::format::ArgFormat;
use crate::stack::StackRule;

pub use builder::{OpcodeTableBuilder, build};
pub use edit::{Binding, Edit, OpDef, OpFlag, OpKind, Setting, StoreTarget};

/// Comparison operator names indexed by the COMPARE_OP operand.
pub const CMP_OP: [&str; 12] = [
    "<",
    "<=",
    "==",
    "!=",
    ">",
    ">=",
    "in",
    "not in",
    "is",
    "is not",
    "exception match",
    "BAD",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = CrossdisError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CrossdisError::InvalidVersion(s.to_string());
        let mut parts = s.trim().split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        // A micro component ("3.8.10") is accepted and ignored.
        if let Some(micro) = parts.next() {
            if micro.parse::<u32>().is_err() {
                return Err(invalid());
            }
        }
        Ok(Self { major, minor })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Implementation {
    CPython,
    PyPy,
    Graal,
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Implementation::CPython => "cpython",
            Implementation::PyPy => "pypy",
            Implementation::Graal => "graal",
        })
    }
}

impl FromStr for Implementation {
    type Err = CrossdisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpython" => Ok(Implementation::CPython),
            "pypy" => Ok(Implementation::PyPy),
            "graal" | "graalpy" => Ok(Implementation::Graal),
            other => Err(CrossdisError::UnknownTable(format!("implementation {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub version: Version,
    pub implementation: Implementation,
}

impl TableKey {
    pub const fn new(version: Version, implementation: Implementation) -> Self {
        Self { version, implementation }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.implementation, self.version)
    }
}

/// Classification sets an opcode can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpClass {
    Name,
    Const,
    Local,
    Free,
    JumpRel,
    JumpAbs,
    Compare,
    Nargs,
    Varargs,
    Call,
    Unary,
    Binary,
    Ternary,
    Store,
    NullaryOp,
    NullaryLoad,
    NoFollow,
    Conditional,
    EncodedArg,
    HasExc,
}

impl OpClass {
    pub const ALL: [OpClass; 20] = [
        OpClass::Name,
        OpClass::Const,
        OpClass::Local,
        OpClass::Free,
        OpClass::JumpRel,
        OpClass::JumpAbs,
        OpClass::Compare,
        OpClass::Nargs,
        OpClass::Varargs,
        OpClass::Call,
        OpClass::Unary,
        OpClass::Binary,
        OpClass::Ternary,
        OpClass::Store,
        OpClass::NullaryOp,
        OpClass::NullaryLoad,
        OpClass::NoFollow,
        OpClass::Conditional,
        OpClass::EncodedArg,
        OpClass::HasExc,
    ];

    /// Classes that decide how an operand is resolved. An opcode may be in at
    /// most one of them.
    pub const OPERAND: [OpClass; 7] = [
        OpClass::Name,
        OpClass::Const,
        OpClass::Local,
        OpClass::Free,
        OpClass::JumpRel,
        OpClass::JumpAbs,
        OpClass::Compare,
    ];
}

/// How the raw operand of a name/local/compare opcode packs its index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandEncoding {
    #[default]
    Plain,
    /// Low bit requests a NULL push before the global.
    NullPush,
    /// Low bit marks a method load.
    MethodFlag,
    /// Two flag bits below the name index.
    SuperMethodFlag,
    /// Two local slots packed as high and low nibble.
    NibblePair,
    /// Comparison index stored above `n` flag bits.
    CompareShift(u8),
    /// 3.13 comparison: index above 5 bits, bit 4 requests a bool coercion.
    CompareBool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineTableFormat {
    #[default]
    Lnotab,
    LnotabSigned,
    Linetable,
    Locations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub wordcode: bool,
    pub have_argument: u16,
    pub extended_arg_shift: u32,
    pub jump_unit: u32,
    pub localsplus: bool,
    pub line_table: LineTableFormat,
    pub exception_table: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wordcode: false,
            have_argument: 90,
            extended_arg_shift: 16,
            jump_unit: 1,
            localsplus: false,
            line_table: LineTableFormat::Lnotab,
            exception_table: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpInfo {
    pub name: String,
    pub pop: i32,
    pub push: i32,
    pub arg_format: Option<ArgFormat>,
    pub ext_format: Option<ExtFormat>,
    pub stack_rule: Option<StackRule>,
    pub encoding: OperandEncoding,
    pub cache_entries: u8,
    pub backward: bool,
}

impl OpInfo {
    pub(crate) fn new(name: &str, pop: i32, push: i32) -> Self {
        Self {
            name: name.to_string(),
            pop,
            push,
            arg_format: None,
            ext_format: None,
            stack_rule: None,
            encoding: OperandEncoding::Plain,
            cache_entries: 0,
            backward: false,
        }
    }
}

/// A finalized opcode table. Immutable; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpcodeTable {
    key: TableKey,
    parent: Option<TableKey>,
    settings: Settings,
    ops: BTreeMap<u16, OpInfo>,
    opmap: BTreeMap<String, u16>,
    classes: BTreeMap<OpClass, BTreeSet<u16>>,
    operator_set: BTreeSet<u16>,
    jump_ops: BTreeSet<u16>,
    binary_ops: BTreeSet<u16>,
    extended_arg: Option<u8>,
}

impl OpcodeTable {
    pub(crate) fn empty(key: TableKey) -> Self {
        Self {
            key,
            parent: None,
            settings: Settings::default(),
            ops: BTreeMap::new(),
            opmap: BTreeMap::new(),
            classes: OpClass::ALL.iter().map(|c| (*c, BTreeSet::new())).collect(),
            operator_set: BTreeSet::new(),
            jump_ops: BTreeSet::new(),
            binary_ops: BTreeSet::new(),
            extended_arg: None,
        }
    }

    /// Deep-copies this table into a fresh, unfrozen builder for a child table.
    pub fn to_builder(&self, key: TableKey) -> OpcodeTableBuilder {
        OpcodeTableBuilder::from_parent(self, key)
    }

    pub fn key(&self) -> TableKey {
        self.key
    }

    pub fn version(&self) -> Version {
        self.key.version
    }

    pub fn implementation(&self) -> Implementation {
        self.key.implementation
    }

    pub fn parent(&self) -> Option<TableKey> {
        self.parent
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn info(&self, opcode: u16) -> Option<&OpInfo> {
        self.ops.get(&opcode)
    }

    pub fn opcode_of(&self, name: &str) -> Option<u16> {
        self.opmap.get(name).copied()
    }

    /// Name of `opcode`, or the `<N>` placeholder for unassigned numbers.
    pub fn name_of(&self, opcode: u16) -> String {
        match self.ops.get(&opcode) {
            Some(info) => info.name.clone(),
            None => format!("<{opcode}>"),
        }
    }

    pub fn is(&self, opcode: u16, class: OpClass) -> bool {
        self.classes.get(&class).is_some_and(|s| s.contains(&opcode))
    }

    pub fn members(&self, class: OpClass) -> &BTreeSet<u16> {
        &self.classes[&class]
    }

    pub fn has_argument(&self, opcode: u16) -> bool {
        opcode >= self.settings.have_argument
    }

    pub fn is_jump(&self, opcode: u16) -> bool {
        self.jump_ops.contains(&opcode)
    }

    /// Opcodes whose result can serve as a folded operand.
    pub fn operator_set(&self) -> &BTreeSet<u16> {
        &self.operator_set
    }

    pub fn binary_ops(&self) -> &BTreeSet<u16> {
        &self.binary_ops
    }

    pub fn extended_arg(&self) -> Option<u8> {
        self.extended_arg
    }

    pub fn cmp_op(&self, index: u64) -> Option<&'static str> {
        usize::try_from(index).ok().and_then(|i| CMP_OP.get(i)).copied()
    }

    /// Iterates over defined opcodes in numeric order.
    pub fn opcodes(&self) -> impl Iterator<Item = (u16, &OpInfo)> {
        self.ops.iter().map(|(op, info)| (*op, info))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parsing() {
        assert_eq!("3.11".parse::<Version>().unwrap(), Version::new(3, 11));
        assert_eq!("2.7.18".parse::<Version>().unwrap(), Version::new(2, 7));
        assert!("3".parse::<Version>().is_err());
        assert!("3.x".parse::<Version>().is_err());
        assert!(Version::new(3, 9) < Version::new(3, 10));
    }

    #[test]
    fn implementation_parsing() {
        assert_eq!("CPython".parse::<Implementation>().unwrap(), Implementation::CPython);
        assert_eq!("pypy".parse::<Implementation>().unwrap(), Implementation::PyPy);
        assert!("jython".parse::<Implementation>().is_err());
    }

    #[test]
    fn undefined_opcode_has_placeholder_name() {
        let table = OpcodeTable::empty(TableKey::new(Version::new(3, 6), Implementation::CPython));
        assert_eq!(table.name_of(7), "<7>");
        assert_eq!(table.opcode_of("NOP"), None);
    }
}
