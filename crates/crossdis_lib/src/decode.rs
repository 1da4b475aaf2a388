use std::collections::BTreeSet;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::{trace, warn};

use crate::DisassembleOptions;
use crate::code::Environment;
use crate::error::{CrossdisError, Malformed};
use crate::format::BasicFormatter;
use crate::instruction::{ArgValue, Instruction, OperandKind};
use crate::stack::stack_effect;
use crate::table::{OpClass, OpInfo, OpcodeTable, OperandEncoding};

/// A per-instruction decode failure. Decoding continues past it when the
/// stream can be resynchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub offset: usize,
    pub error: CrossdisError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decoded {
    pub instructions: Vec<Instruction>,
    pub faults: Vec<Fault>,
}

impl Decoded {
    pub fn fault_at(&self, offset: usize) -> Option<&Fault> {
        self.faults.iter().find(|f| f.offset == offset)
    }
}

struct Decoder<'a> {
    code: &'a [u8],
    table: &'a OpcodeTable,
    env: &'a Environment<'a>,
    options: &'a DisassembleOptions,
    instructions: Vec<Instruction>,
    faults: Vec<Fault>,
}

/// A resolved operand before it is attached to an instruction.
struct Operand {
    value: ArgValue,
    repr: String,
    kind: OperandKind,
}

impl Operand {
    fn new(value: ArgValue, repr: impl Into<String>, kind: OperandKind) -> Self {
        Self { value, repr: repr.into(), kind }
    }
}

fn pool_entry<'p>(pool: &'p [&str], name: &'static str, index: u64) -> Result<&'p str, Malformed> {
    usize::try_from(index)
        .ok()
        .and_then(|i| pool.get(i))
        .copied()
        .ok_or(Malformed::IndexOutOfRange { pool: name, index, len: pool.len() })
}

impl<'a> Decoder<'a> {
    fn fault(&mut self, offset: usize, problem: Malformed) {
        let error = CrossdisError::malformed(offset, problem);
        warn!(table = %self.table.key(), "{error}");
        self.faults.push(Fault { offset, error });
    }

    fn name_operand(&self, info: &OpInfo, arg: u64) -> Result<Operand, Malformed> {
        let (index, prefix) = match info.encoding {
            OperandEncoding::NullPush => (arg >> 1, if arg & 1 != 0 { "NULL + " } else { "" }),
            OperandEncoding::MethodFlag => (arg >> 1, if arg & 1 != 0 { "NULL|self + " } else { "" }),
            OperandEncoding::SuperMethodFlag => (arg >> 2, if arg & 1 != 0 { "NULL|self + " } else { "" }),
            _ => (arg, ""),
        };
        let name = pool_entry(&self.env.names, "names", index)?;
        Ok(Operand::new(ArgValue::Name(name.to_string()), format!("{prefix}{name}"), OperandKind::Name))
    }

    fn local_operand(&self, info: &OpInfo, arg: u64, pool: &[&str], kind: OperandKind) -> Result<Operand, Malformed> {
        let pool_name = if kind == OperandKind::Local { "locals" } else { "free variables" };
        if info.encoding == OperandEncoding::NibblePair {
            let first = pool_entry(pool, pool_name, arg >> 4)?;
            let second = pool_entry(pool, pool_name, arg & 0x0F)?;
            let names = vec![first.to_string(), second.to_string()];
            return Ok(Operand::new(ArgValue::Names(names), format!("{first}, {second}"), kind));
        }
        let name = pool_entry(pool, pool_name, arg)?;
        Ok(Operand::new(ArgValue::Name(name.to_string()), name, kind))
    }

    fn compare_operand(&self, info: &OpInfo, arg: u64) -> Result<Operand, Malformed> {
        let (index, coerce) = match info.encoding {
            OperandEncoding::CompareShift(bits) => (arg >> bits, false),
            OperandEncoding::CompareBool => (arg >> 5, arg & 0x10 != 0),
            _ => (arg, false),
        };
        let symbol = self.table.cmp_op(index).ok_or(Malformed::IndexOutOfRange {
            pool: "comparison operators",
            index,
            len: crate::table::CMP_OP.len(),
        })?;
        let repr = if coerce { format!("bool({symbol})") } else { symbol.to_string() };
        Ok(Operand::new(ArgValue::Symbol(symbol.to_string()), repr, OperandKind::Compare))
    }

    fn jump_operand(&self, opcode: u16, info: &OpInfo, arg: u64, next: usize) -> Result<Operand, Malformed> {
        let unit = u64::from(self.table.settings().jump_unit);
        let distance = arg.checked_mul(unit).ok_or(Malformed::JumpOutOfRange)?;
        let (target, kind) = if self.table.is(opcode, OpClass::JumpAbs) {
            (Some(distance), OperandKind::JumpAbs)
        } else {
            let base = next as u64 + 2 * u64::from(info.cache_entries);
            let target = if info.backward { base.checked_sub(distance) } else { base.checked_add(distance) };
            (target, OperandKind::JumpRel)
        };
        let target = target.and_then(|t| usize::try_from(t).ok()).ok_or(Malformed::JumpOutOfRange)?;
        Ok(Operand::new(ArgValue::Target(target), format!("to {target}"), kind))
    }

    fn resolve(&self, opcode: u16, info: &OpInfo, arg: u64, next: usize) -> Result<Operand, Malformed> {
        let table = self.table;
        if table.is(opcode, OpClass::Const) {
            let constant = usize::try_from(arg)
                .ok()
                .and_then(|i| self.env.consts.get(i))
                .ok_or(Malformed::IndexOutOfRange { pool: "consts", index: arg, len: self.env.consts.len() })?;
            let repr = constant.repr_double_quoted();
            return Ok(Operand::new(ArgValue::Const(constant.clone()), repr, OperandKind::Const));
        }
        if table.is(opcode, OpClass::Name) {
            return self.name_operand(info, arg);
        }
        if table.is(opcode, OpClass::Local) {
            return self.local_operand(info, arg, &self.env.locals, OperandKind::Local);
        }
        if table.is(opcode, OpClass::Free) {
            return self.local_operand(info, arg, &self.env.free, OperandKind::Free);
        }
        if table.is_jump(opcode) {
            return self.jump_operand(opcode, info, arg, next);
        }
        if table.is(opcode, OpClass::Compare) {
            return self.compare_operand(info, arg);
        }
        let repr = BasicFormatter::new(table).render(opcode, arg);
        Ok(Operand::new(ArgValue::Int(arg), repr, OperandKind::Count))
    }

    fn run(mut self) -> Decoded {
        let table = self.table;
        let code = self.code;
        let settings = *table.settings();
        let len = code.len();
        let extended_arg = table.extended_arg().map(u16::from);
        let cache_opcode = table.opcode_of("CACHE").unwrap_or(0);

        let mut pos = 0usize;
        let mut pending: u64 = 0;
        let mut prefix_start: Option<usize> = None;

        while pos < len {
            let offset = pos;
            let opcode = u16::from(code[pos]);
            let takes_arg = table.has_argument(opcode);
            let width = if settings.wordcode {
                2
            } else if takes_arg {
                3
            } else {
                1
            };
            if len - pos < width {
                self.fault(offset, Malformed::Truncated { needed: width, remaining: len - pos });
                break;
            }
            let raw = if settings.wordcode {
                u64::from(code[pos + 1])
            } else if takes_arg {
                u64::from(LittleEndian::read_u16(&code[pos + 1..pos + 3]))
            } else {
                0
            };
            pos += width;

            let Some(info) = table.info(opcode) else {
                let mut inst = Instruction::new(offset, opcode, table.name_of(opcode));
                inst.inst_size = width;
                inst.starts_line = self.env.linestarts.get(&offset).copied();
                self.instructions.push(inst);
                self.fault(offset, Malformed::UnknownOpcode(code[offset]));
                pending = 0;
                prefix_start = None;
                continue;
            };

            let mut inst = Instruction::new(offset, opcode, info.name.clone());
            inst.starts_line = self.env.linestarts.get(&offset).copied();
            inst.has_extended_arg = prefix_start.is_some();
            inst.inst_size = pos - prefix_start.unwrap_or(offset);

            let mut arg = None;
            if takes_arg {
                match raw.checked_add(pending) {
                    Some(value) => arg = Some(value),
                    None => self.fault(offset, Malformed::OperandOverflow),
                }
            }
            pending = 0;

            if Some(opcode) == extended_arg {
                if let Some(value) = arg {
                    match value.checked_shl(settings.extended_arg_shift).filter(|v| v >> settings.extended_arg_shift == value) {
                        Some(shifted) => pending = shifted,
                        None => self.fault(offset, Malformed::OperandOverflow),
                    }
                }
                prefix_start.get_or_insert(offset);
                inst.has_extended_arg = false;
                inst.inst_size = width;
            } else {
                prefix_start = None;
            }

            if let Some(value) = arg {
                match self.resolve(opcode, info, value, pos) {
                    Ok(operand) => {
                        inst = inst.with_arg(value, operand.value, operand.repr, operand.kind);
                    }
                    Err(problem) => {
                        let repr = match &problem {
                            Malformed::IndexOutOfRange { index, .. } => format!("<index {index}>"),
                            _ => String::new(),
                        };
                        inst = inst.with_arg(value, ArgValue::Int(value), repr, OperandKind::Count);
                        self.fault(offset, problem);
                    }
                }
            }
            inst.stack_effect = stack_effect(table, opcode, arg);
            trace!(offset, opname = %inst.opname, arg = ?inst.arg, effect = ?inst.stack_effect, "decoded");
            self.instructions.push(inst);

            let caches = usize::from(info.cache_entries);
            if settings.wordcode && caches > 0 {
                if len - pos < caches * 2 {
                    self.fault(pos, Malformed::Truncated { needed: caches * 2, remaining: len - pos });
                    break;
                }
                if self.options.show_caches {
                    for slot in 0..caches {
                        let at = pos + slot * 2;
                        let mut cache = Instruction::new(at, cache_opcode, "CACHE");
                        cache.inst_size = 2;
                        cache.is_cache = true;
                        cache.kind = OperandKind::Cache;
                        cache.arg = Some(u64::from(code[at + 1]));
                        self.instructions.push(cache);
                    }
                }
                pos += caches * 2;
            }
        }

        self.mark_jump_targets();
        Decoded { instructions: self.instructions, faults: self.faults }
    }

    /// Second pass: needs every instruction decoded first.
    fn mark_jump_targets(&mut self) {
        let mut targets: BTreeSet<usize> = self.instructions.iter().filter_map(Instruction::jump_target).collect();
        targets.extend(self.env.exception_entries.iter().map(|e| e.target));
        for inst in self.instructions.iter_mut().filter(|i| !i.is_cache) {
            inst.is_jump_target = targets.contains(&inst.offset);
        }
    }
}

/// Decodes `code` against `table`, resolving operands from `env`.
pub fn decode(code: &[u8], table: &OpcodeTable, env: &Environment<'_>, options: &DisassembleOptions) -> Decoded {
    trace!(table = %table.key(), bytes = code.len(), "decoding");
    Decoder { code, table, env, options, instructions: Vec::new(), faults: Vec::new() }.run()
}
