use std::collections::BTreeSet;

use tracing::{debug, trace};

use super::{Binding, Edit, OpClass, OpDef, OpFlag, OpInfo, OpcodeTable, Setting, TableKey};
use crate::error::{CrossdisError, Result};

/// Mutable scratch state for one table. Edits apply in order; after
/// [`finalize`](Self::finalize) every further edit fails with `FrozenTable`.
#[derive(Debug, Clone)]
pub struct OpcodeTableBuilder {
    table: OpcodeTable,
    frozen: bool,
}

/// Builds a finalized table from an optional parent and an ordered edit list.
pub fn build(parent: Option<&OpcodeTable>, key: TableKey, edits: impl IntoIterator<Item = Edit>) -> Result<OpcodeTable> {
    let mut builder = match parent {
        Some(p) => OpcodeTableBuilder::from_parent(p, key),
        None => OpcodeTableBuilder::new(key),
    };
    for edit in edits {
        builder.apply(edit)?;
    }
    builder.into_table()
}

impl OpcodeTableBuilder {
    pub fn new(key: TableKey) -> Self {
        Self { table: OpcodeTable::empty(key), frozen: false }
    }

    pub fn from_parent(parent: &OpcodeTable, key: TableKey) -> Self {
        let mut table = parent.clone();
        table.key = key;
        table.parent = Some(parent.key);
        Self { table, frozen: false }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn table(&self) -> &OpcodeTable {
        &self.table
    }

    fn inconsistent(&self, reason: String) -> CrossdisError {
        CrossdisError::inconsistent(self.table.key, reason)
    }

    pub fn apply(&mut self, edit: Edit) -> Result<&mut Self> {
        if self.frozen {
            return Err(CrossdisError::FrozenTable(self.table.key.to_string()));
        }
        trace!(table = %self.table.key, ?edit, "apply edit");
        match edit {
            Edit::Remove { name, opcode } => self.remove(&name, opcode)?,
            Edit::Define(def) => self.define(def)?,
            Edit::Redefine(def) => {
                if let Some(old) = self.table.ops.get(&def.opcode).map(|i| i.name.clone()) {
                    self.remove(&old, def.opcode)?;
                }
                if let Some(old) = self.table.opmap.get(&def.name).copied() {
                    let name = def.name.clone();
                    self.remove(&name, old)?;
                }
                self.define(def)?;
            }
            Edit::RemoveAll => {
                self.table.ops.clear();
                self.table.opmap.clear();
                for set in self.table.classes.values_mut() {
                    set.clear();
                }
            }
            Edit::Setting(setting) => self.set(setting),
            Edit::Bind { name, binding } => self.bind(&name, binding)?,
        }
        Ok(self)
    }

    fn remove(&mut self, name: &str, opcode: u16) -> Result<()> {
        match self.table.opmap.get(name) {
            Some(op) if *op == opcode => {}
            Some(op) => {
                return Err(self.inconsistent(format!("cannot remove {name}/{opcode}: {name} is opcode {op}")));
            }
            None => {
                return Err(self.inconsistent(format!("cannot remove {name}/{opcode}: {name} is not defined")));
            }
        }
        self.table.opmap.remove(name);
        self.table.ops.remove(&opcode);
        for set in self.table.classes.values_mut() {
            set.remove(&opcode);
        }
        Ok(())
    }

    fn define(&mut self, def: OpDef) -> Result<()> {
        let OpDef { name, opcode, pop, push, kind, flags } = def;
        if let Some(existing) = self.table.ops.get(&opcode) {
            if existing.name != name {
                return Err(self.inconsistent(format!(
                    "cannot define {name} as opcode {opcode}: already defined as {}",
                    existing.name
                )));
            }
        }
        if let Some(op) = self.table.opmap.get(&name) {
            if *op != opcode {
                return Err(self.inconsistent(format!("cannot define {name} as opcode {opcode}: already opcode {op}")));
            }
        }

        let info = self.table.ops.entry(opcode).or_insert_with(|| OpInfo::new(&name, pop, push));
        info.pop = pop;
        info.push = push;
        self.table.opmap.insert(name, opcode);

        let mut classes: Vec<OpClass> = kind.classes().to_vec();
        for flag in &flags {
            match flag {
                OpFlag::NoFollow => classes.push(OpClass::NoFollow),
                OpFlag::Conditional => classes.push(OpClass::Conditional),
                OpFlag::NullaryLoad => classes.extend([OpClass::NullaryLoad, OpClass::NullaryOp]),
                OpFlag::EncodedArg => classes.push(OpClass::EncodedArg),
                OpFlag::HasExc => classes.push(OpClass::HasExc),
                OpFlag::Backward => info.backward = true,
            }
        }
        for class in classes {
            self.table.classes.entry(class).or_default().insert(opcode);
        }
        Ok(())
    }

    fn set(&mut self, setting: Setting) {
        let s = &mut self.table.settings;
        match setting {
            Setting::Wordcode(v) => s.wordcode = v,
            Setting::HaveArgument(v) => s.have_argument = v,
            Setting::ExtendedArgShift(v) => s.extended_arg_shift = v,
            Setting::JumpUnit(v) => s.jump_unit = v,
            Setting::LocalsPlus(v) => s.localsplus = v,
            Setting::LineTable(v) => s.line_table = v,
            Setting::ExceptionTable(v) => s.exception_table = v,
        }
    }

    fn bind(&mut self, name: &str, binding: Binding) -> Result<()> {
        let key = self.table.key;
        let Some(opcode) = self.table.opmap.get(name).copied() else {
            return Err(CrossdisError::inconsistent(key, format!("cannot bind {binding:?}: {name} is not defined")));
        };
        let Some(info) = self.table.ops.get_mut(&opcode) else {
            return Err(CrossdisError::inconsistent(key, format!("{name} maps to empty slot {opcode}")));
        };
        match binding {
            Binding::ArgFormat(f) => info.arg_format = f,
            Binding::ExtFormat(f) => info.ext_format = f,
            Binding::StackRule(r) => info.stack_rule = r,
            Binding::Encoding(e) => info.encoding = e,
            Binding::CacheEntries(n) => info.cache_entries = n,
        }
        Ok(())
    }

    /// Validates the table and computes the derived sets. Calling it again is
    /// a no-op.
    pub fn finalize(&mut self) -> Result<&OpcodeTable> {
        if self.frozen {
            return Ok(&self.table);
        }

        for (i, a) in OpClass::OPERAND.iter().enumerate() {
            for b in &OpClass::OPERAND[i + 1..] {
                let overlap: Vec<u16> = self.table.members(*a).intersection(self.table.members(*b)).copied().collect();
                if let Some(op) = overlap.first() {
                    return Err(self.inconsistent(format!(
                        "opcode {} ({}) is both {a:?} and {b:?}",
                        op,
                        self.table.name_of(*op)
                    )));
                }
            }
        }
        for (op, info) in &self.table.ops {
            if self.table.opmap.get(&info.name) != Some(op) {
                return Err(self.inconsistent(format!("opcode {op} ({}) is missing from the name map", info.name)));
            }
        }

        let extended_arg = match self.table.opmap.get("EXTENDED_ARG") {
            Some(op) => u8::try_from(*op).map_err(|_| self.inconsistent("EXTENDED_ARG is a pseudo opcode".into()))?,
            None => return Err(self.inconsistent("EXTENDED_ARG is not defined".into())),
        };

        let t = &self.table;
        let nargs_following: BTreeSet<u16> = t.members(OpClass::Nargs).difference(t.members(OpClass::NoFollow)).copied().collect();
        let operator_set: BTreeSet<u16> = [OpClass::NullaryOp, OpClass::Unary, OpClass::Binary, OpClass::Ternary, OpClass::Varargs]
            .iter()
            .flat_map(|c| t.members(*c).iter().copied())
            .chain(nargs_following)
            .collect();
        let jump_ops: BTreeSet<u16> = t.members(OpClass::JumpRel).union(t.members(OpClass::JumpAbs)).copied().collect();
        let binary_ops = t.members(OpClass::Binary).clone();

        self.table.operator_set = operator_set;
        self.table.jump_ops = jump_ops;
        self.table.binary_ops = binary_ops;
        self.table.extended_arg = Some(extended_arg);
        self.frozen = true;
        debug!(table = %self.table.key, opcodes = self.table.ops.len(), "finalized opcode table");
        Ok(&self.table)
    }

    pub fn into_table(mut self) -> Result<OpcodeTable> {
        self.finalize()?;
        Ok(self.table)
    }
}
