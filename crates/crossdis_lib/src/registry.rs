//! Opcode tables compiled in from `opcodes/*.def`.
//!
//! Every table is built once, on first use, by cloning its parent and
//! replaying its directives. A broken source table is reported on each lookup
//! rather than panicking.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::error::{CrossdisError, Result};
use crate::extended::ExtFormat;
use crate::format::ArgFormat;
use crate::stack::StackRule;
use crate::table::{
    self, Binding, Edit, Implementation, LineTableFormat, OpDef, OpFlag, OpKind, OpcodeTable, OperandEncoding,
    Setting, TableKey, Version,
};

#[allow(dead_code)]
mod tables {
    include!(concat!(env!("OUT_DIR"), "/opcode_tables.rs"));
}

use tables::{RawDirective, RawTable, TABLE_SOURCES};

type Built = BTreeMap<TableKey, Result<Arc<OpcodeTable>>>;

static REGISTRY: Lazy<Built> = Lazy::new(|| build_all(TABLE_SOURCES));

/// The finalized table for `version` under `implementation`.
pub fn get(version: Version, implementation: Implementation) -> Result<Arc<OpcodeTable>> {
    let key = TableKey::new(version, implementation);
    match REGISTRY.get(&key) {
        Some(entry) => entry.clone(),
        None => Err(CrossdisError::UnknownTable(key.to_string())),
    }
}

/// Every shipped table key, in order.
pub fn keys() -> impl Iterator<Item = TableKey> {
    REGISTRY.keys().copied()
}

fn source_key(raw: &RawTable) -> Result<TableKey> {
    let implementation = raw.implementation.parse::<Implementation>()?;
    Ok(TableKey::new(Version::new(raw.version.0, raw.version.1), implementation))
}

fn parent_key(raw: &RawTable) -> Result<Option<TableKey>> {
    let Some(((major, minor), implementation)) = raw.parent else {
        return Ok(None);
    };
    let implementation = implementation.parse::<Implementation>()?;
    Ok(Some(TableKey::new(Version::new(major, minor), implementation)))
}

/// Builds all sources, parents before children.
fn build_all(sources: &[RawTable]) -> Built {
    let mut built = Built::new();
    let mut pending: Vec<&RawTable> = Vec::new();
    for raw in sources {
        match source_key(raw) {
            Ok(_) => pending.push(raw),
            Err(err) => warn!(file = raw.file, "skipping opcode table: {err}"),
        }
    }

    while !pending.is_empty() {
        let before = pending.len();
        let mut waiting = Vec::new();
        for raw in pending {
            let Ok(key) = source_key(raw) else { continue };
            let parent = match parent_key(raw) {
                Ok(parent) => parent,
                Err(err) => {
                    built.insert(key, Err(err));
                    continue;
                }
            };
            let entry = match parent {
                None => build_one(raw, key, None),
                Some(pkey) => match built.get(&pkey) {
                    None => {
                        waiting.push(raw);
                        continue;
                    }
                    Some(Ok(parent)) => build_one(raw, key, Some(parent)),
                    Some(Err(err)) => Err(CrossdisError::inconsistent(
                        key,
                        format!("{}: parent {pkey} failed to build: {err}", raw.file),
                    )),
                },
            };
            built.insert(key, entry);
        }
        if waiting.len() == before {
            for raw in waiting {
                if let Ok(key) = source_key(raw) {
                    built.insert(key, Err(CrossdisError::inconsistent(key, format!("{}: parent table is not shipped", raw.file))));
                }
            }
            break;
        }
        pending = waiting;
    }
    built
}

fn build_one(raw: &RawTable, key: TableKey, parent: Option<&Arc<OpcodeTable>>) -> Result<Arc<OpcodeTable>> {
    let mut edits = Vec::with_capacity(raw.directives.len());
    for directive in raw.directives {
        let edit = to_edit(directive)
            .map_err(|reason| CrossdisError::inconsistent(key, format!("{}:{}: {reason}", raw.file, directive.line)))?;
        edits.push(edit);
    }
    // Replay one edit at a time so a failure can name its source line.
    let mut builder = match parent {
        Some(parent) => parent.to_builder(key),
        None => table::OpcodeTableBuilder::new(key),
    };
    for (edit, directive) in edits.into_iter().zip(raw.directives) {
        builder.apply(edit).map_err(|err| located(err, &format!("{}:{}", raw.file, directive.line)))?;
    }
    let table = builder.into_table().map_err(|err| located(err, raw.file))?;
    debug!(table = %key, parent = ?table.parent(), opcodes = table.len(), "built opcode table");
    Ok(Arc::new(table))
}

fn located(err: CrossdisError, location: &str) -> CrossdisError {
    match err {
        CrossdisError::InconsistentTable { table, reason } => {
            CrossdisError::InconsistentTable { table, reason: format!("{location}: {reason}") }
        }
        other => other,
    }
}

fn number<T: FromStr>(text: &str, what: &str) -> std::result::Result<T, String> {
    text.parse().map_err(|_| format!("bad {what} {text:?}"))
}

fn flag(text: &str) -> std::result::Result<bool, String> {
    match text {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true or false, got {other:?}")),
    }
}

/// `-` clears a binding.
fn optional<T>(text: &str, parse: impl FnOnce(&str) -> std::result::Result<T, String>) -> std::result::Result<Option<T>, String> {
    if text == "-" { Ok(None) } else { parse(text).map(Some) }
}

fn setting(name: &str, value: &str) -> std::result::Result<Setting, String> {
    Ok(match name {
        "wordcode" => Setting::Wordcode(flag(value)?),
        "have_argument" => Setting::HaveArgument(number(value, "opcode")?),
        "extended_arg_shift" => Setting::ExtendedArgShift(number(value, "shift")?),
        "jump_unit" => Setting::JumpUnit(number(value, "jump unit")?),
        "localsplus" => Setting::LocalsPlus(flag(value)?),
        "exception_table" => Setting::ExceptionTable(flag(value)?),
        "line_table" => Setting::LineTable(match value {
            "lnotab" => LineTableFormat::Lnotab,
            "lnotab_signed" => LineTableFormat::LnotabSigned,
            "linetable" => LineTableFormat::Linetable,
            "locations" => LineTableFormat::Locations,
            other => return Err(format!("unknown line table format {other:?}")),
        }),
        other => return Err(format!("unknown setting {other:?}")),
    })
}

fn encoding(name: &str, param: Option<&str>) -> std::result::Result<OperandEncoding, String> {
    Ok(match (name, param) {
        ("plain", None) => OperandEncoding::Plain,
        ("null_push", None) => OperandEncoding::NullPush,
        ("method_flag", None) => OperandEncoding::MethodFlag,
        ("super_method_flag", None) => OperandEncoding::SuperMethodFlag,
        ("nibble_pair", None) => OperandEncoding::NibblePair,
        ("compare_bool", None) => OperandEncoding::CompareBool,
        ("compare_shift", Some(bits)) => OperandEncoding::CompareShift(number(bits, "shift")?),
        (other, _) => return Err(format!("unknown operand encoding {other:?}")),
    })
}

fn definition(args: &[&str]) -> std::result::Result<OpDef, String> {
    let kind: OpKind = args[4].parse()?;
    let mut def = OpDef::new(args[0], number(args[1], "opcode")?, number(args[2], "pop count")?, number(args[3], "push count")?, kind);
    for text in &args[5..] {
        def = def.with(text.parse::<OpFlag>()?);
    }
    Ok(def)
}

/// Converts one parsed directive into a builder edit. Argument counts were
/// checked by the build script.
fn to_edit(directive: &RawDirective) -> std::result::Result<Edit, String> {
    let args = directive.args;
    Ok(match directive.name {
        "SET" => Edit::Setting(setting(args[0], args[1])?),
        "RM" => Edit::remove(args[0], number(args[1], "opcode")?),
        "RM_ALL" => Edit::RemoveAll,
        "DEF" => Edit::Define(definition(args)?),
        "REDEF" => Edit::Redefine(definition(args)?),
        "FMT" => Edit::bind(args[0], Binding::ArgFormat(optional(args[1], ArgFormat::from_str)?)),
        "XFMT" => {
            let format = optional(args[1], |name| ExtFormat::from_directive(name, args.get(2).copied()))?;
            Edit::bind(args[0], Binding::ExtFormat(format))
        }
        "STACK" => Edit::bind(args[0], Binding::StackRule(optional(args[1], StackRule::from_str)?)),
        "ENC" => Edit::bind(args[0], Binding::Encoding(encoding(args[1], args.get(2).copied())?)),
        "CACHE" => Edit::bind(args[0], Binding::CacheEntries(number(args[1], "cache count")?)),
        other => return Err(format!("unknown directive {other}")),
    })
}
