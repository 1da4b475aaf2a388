//! Basic operand rendering.
//!
//! Every opcode that needs more than the generic rendering carries an
//! [`ArgFormat`] in its table entry. Formatting is a pure function of the
//! format, the raw operand and the table's layout settings.

mod names;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::instruction::ArgValue;
use crate::table::OpcodeTable;

pub use names::{BINARY_OPERATORS, INTRINSIC_1, INTRINSIC_2};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgFormat {
    ExtendedArg,
    /// Positional count in the low byte, keyword pairs in the next byte.
    CallPosNamed,
    CallPositional,
    CallEx,
    CallKw,
    MakeFunctionDefaults,
    MakeFunctionCounts,
    MakeFunctionFlags,
    BuildMapUnpackWithCall35,
    BuildMapUnpackWithCall36,
    RaiseVarargsOlder,
    RaiseVarargs,
    RotTwo,
    RotThree,
    RotFour,
    IsOp,
    ContainsOp,
    BinaryOp,
    FormatValue,
    Intrinsic1,
    Intrinsic2,
    ConvertValue,
    FunctionAttribute,
}

impl FromStr for ArgFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "extended_arg" => ArgFormat::ExtendedArg,
            "call_pos_named" => ArgFormat::CallPosNamed,
            "call_positional" => ArgFormat::CallPositional,
            "call_ex" => ArgFormat::CallEx,
            "call_kw" => ArgFormat::CallKw,
            "make_function_defaults" => ArgFormat::MakeFunctionDefaults,
            "make_function_counts" => ArgFormat::MakeFunctionCounts,
            "make_function_flags" => ArgFormat::MakeFunctionFlags,
            "build_map_unpack_with_call35" => ArgFormat::BuildMapUnpackWithCall35,
            "build_map_unpack_with_call36" => ArgFormat::BuildMapUnpackWithCall36,
            "raise_varargs_older" => ArgFormat::RaiseVarargsOlder,
            "raise_varargs" => ArgFormat::RaiseVarargs,
            "rot_two" => ArgFormat::RotTwo,
            "rot_three" => ArgFormat::RotThree,
            "rot_four" => ArgFormat::RotFour,
            "is_op" => ArgFormat::IsOp,
            "contains_op" => ArgFormat::ContainsOp,
            "binary_op" => ArgFormat::BinaryOp,
            "format_value" => ArgFormat::FormatValue,
            "intrinsic1" => ArgFormat::Intrinsic1,
            "intrinsic2" => ArgFormat::Intrinsic2,
            "convert_value" => ArgFormat::ConvertValue,
            "function_attribute" => ArgFormat::FunctionAttribute,
            other => return Err(format!("unknown argument format {other:?}")),
        })
    }
}

fn plural(n: u64) -> &'static str {
    if n == 1 { "" } else { "s" }
}

fn flag_list(flags: u64, words: &[&str]) -> String {
    words
        .iter()
        .enumerate()
        .filter(|(bit, _)| flags & (1 << bit) != 0)
        .map(|(_, word)| *word)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ArgFormat {
    /// Renders `arg`. `shift` is the table's extended-argument shift.
    pub fn render(self, arg: u64, shift: u32) -> String {
        let low = arg & 0xFF;
        let high = (arg >> 8) & 0xFF;
        match self {
            ArgFormat::ExtendedArg => match arg.checked_shl(shift).filter(|v| v >> shift == arg) {
                Some(value) => value.to_string(),
                None => arg.to_string(),
            },
            ArgFormat::CallPosNamed => format!("{low} positional, {high} named"),
            ArgFormat::CallPositional => format!("{arg} positional argument{}", plural(arg)),
            ArgFormat::CallEx => {
                if arg & 0x01 != 0 {
                    "keyword and positional arguments".to_string()
                } else {
                    "positional arguments only".to_string()
                }
            }
            ArgFormat::CallKw => format!("{arg} total positional and keyword args"),
            ArgFormat::MakeFunctionDefaults => format!("{arg} default parameters"),
            ArgFormat::MakeFunctionCounts => {
                let annotations = (arg >> 16) & 0x7FFF;
                if low == 0 && high == 0 && annotations == 0 {
                    "No arguments".to_string()
                } else {
                    format!("{low} positional, {high} keyword only, {annotations} annotated")
                }
            }
            ArgFormat::MakeFunctionFlags => {
                if arg == 0 {
                    "No arguments".to_string()
                } else {
                    flag_list(arg, &names::FUNCTION_FLAGS)
                }
            }
            ArgFormat::BuildMapUnpackWithCall35 => {
                format!("{low} mappings, function at {}", low + (arg >> 8))
            }
            ArgFormat::BuildMapUnpackWithCall36 => format!("{arg} mappings"),
            ArgFormat::RaiseVarargsOlder => match arg {
                0 => "reraise".to_string(),
                1 => "exception".to_string(),
                2 => "exception, parameter".to_string(),
                3 => "exception, parameter, traceback".to_string(),
                n => n.to_string(),
            },
            ArgFormat::RaiseVarargs => match arg {
                0 => "reraise".to_string(),
                1 => "exception instance".to_string(),
                2 => "exception instance with __cause__".to_string(),
                n => n.to_string(),
            },
            ArgFormat::RotTwo => "TOS, TOS1 = TOS1, TOS".to_string(),
            ArgFormat::RotThree => "TOS, TOS1, TOS2 = TOS1, TOS2, TOS".to_string(),
            ArgFormat::RotFour => "TOS, TOS1, TOS2, TOS3 = TOS1, TOS2, TOS3, TOS".to_string(),
            ArgFormat::IsOp => (if arg == 0 { "is" } else { "is not" }).to_string(),
            ArgFormat::ContainsOp => (if arg == 0 { "in" } else { "not in" }).to_string(),
            ArgFormat::BinaryOp => names::lookup(&BINARY_OPERATORS, arg)
                .map(str::to_string)
                .unwrap_or_else(|| arg.to_string()),
            ArgFormat::FormatValue => {
                let conversion = match arg & 0x03 {
                    1 => "!s",
                    2 => "!r",
                    3 => "!a",
                    _ => "",
                };
                conversion.to_string()
            }
            ArgFormat::Intrinsic1 => names::lookup(&INTRINSIC_1, arg)
                .map(str::to_string)
                .unwrap_or_else(|| arg.to_string()),
            ArgFormat::Intrinsic2 => names::lookup(&INTRINSIC_2, arg)
                .map(str::to_string)
                .unwrap_or_else(|| arg.to_string()),
            ArgFormat::ConvertValue => names::lookup(&names::CONVERSIONS, arg)
                .map(str::to_string)
                .unwrap_or_else(|| arg.to_string()),
            ArgFormat::FunctionAttribute => {
                let text = flag_list(arg, &names::FUNCTION_ATTRIBUTES);
                if text.is_empty() { arg.to_string() } else { text }
            }
        }
    }
}

/// Per-table `format_arg` lookup with a generic fallback.
#[derive(Debug, Clone, Copy)]
pub struct BasicFormatter<'a> {
    table: &'a OpcodeTable,
}

impl<'a> BasicFormatter<'a> {
    pub fn new(table: &'a OpcodeTable) -> Self {
        Self { table }
    }

    pub fn format_for(&self, opname: &str) -> Option<ArgFormat> {
        let opcode = self.table.opcode_of(opname)?;
        self.table.info(opcode)?.arg_format
    }

    /// Text for a plain integer operand of `opcode`, empty when the opcode
    /// has no bound format.
    pub fn render(&self, opcode: u16, arg: u64) -> String {
        self.table
            .info(opcode)
            .and_then(|info| info.arg_format)
            .map(|format| format.render(arg, self.table.settings().extended_arg_shift))
            .unwrap_or_default()
    }

    /// Never fails: opcodes without a bound format, and operands that are not
    /// plain integers, get the generic rendering.
    pub fn format_arg(&self, opname: &str, argval: &ArgValue) -> String {
        match (self.format_for(opname), argval) {
            (Some(format), ArgValue::Int(n)) => {
                format.render(*n, self.table.settings().extended_arg_shift)
            }
            _ => argval.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use crate::table::{Implementation, Version};

    #[test]
    fn call_counts() {
        assert_eq!(ArgFormat::CallPosNamed.render(0x0203, 16), "3 positional, 2 named");
        assert_eq!(ArgFormat::CallPositional.render(1, 8), "1 positional argument");
        assert_eq!(ArgFormat::CallPositional.render(0, 8), "0 positional arguments");
        assert_eq!(ArgFormat::CallKw.render(3, 8), "3 total positional and keyword args");
        assert_eq!(ArgFormat::CallEx.render(1, 8), "keyword and positional arguments");
        assert_eq!(ArgFormat::CallEx.render(0, 8), "positional arguments only");
    }

    #[test]
    fn function_construction() {
        assert_eq!(ArgFormat::MakeFunctionFlags.render(0, 8), "No arguments");
        assert_eq!(ArgFormat::MakeFunctionFlags.render(0x09, 8), "default, closure");
        assert_eq!(ArgFormat::MakeFunctionCounts.render(0, 16), "No arguments");
        assert_eq!(
            ArgFormat::MakeFunctionCounts.render(0x0001_0102, 16),
            "2 positional, 1 keyword only, 1 annotated"
        );
        assert_eq!(ArgFormat::MakeFunctionDefaults.render(2, 16), "2 default parameters");
        assert_eq!(ArgFormat::FunctionAttribute.render(8, 8), "closure");
    }

    #[test]
    fn raise_wording_changes_with_version() {
        assert_eq!(ArgFormat::RaiseVarargsOlder.render(2, 16), "exception, parameter");
        assert_eq!(ArgFormat::RaiseVarargs.render(2, 8), "exception instance with __cause__");
        assert_eq!(ArgFormat::RaiseVarargs.render(0, 8), "reraise");
    }

    #[test]
    fn operator_operands() {
        assert_eq!(ArgFormat::IsOp.render(1, 8), "is not");
        assert_eq!(ArgFormat::ContainsOp.render(0, 8), "in");
        assert_eq!(ArgFormat::BinaryOp.render(0, 8), "+");
        assert_eq!(ArgFormat::BinaryOp.render(13, 8), "+=");
        assert_eq!(ArgFormat::BinaryOp.render(99, 8), "99");
        assert_eq!(ArgFormat::FormatValue.render(0x06, 8), "!r");
        assert_eq!(ArgFormat::Intrinsic1.render(6, 8), "INTRINSIC_LIST_TO_TUPLE");
    }

    #[test]
    fn extended_arg_is_shifted() {
        assert_eq!(ArgFormat::ExtendedArg.render(1, 8), "256");
        assert_eq!(ArgFormat::ExtendedArg.render(1, 16), "65536");
        assert_eq!(ArgFormat::BuildMapUnpackWithCall35.render(0x0102, 16), "2 mappings, function at 3");
    }

    #[test]
    fn lookup_by_name_falls_back_to_generic() {
        let table = registry::get(Version::new(3, 9), Implementation::CPython).unwrap();
        let basic = BasicFormatter::new(&table);
        assert_eq!(basic.format_arg("IS_OP", &ArgValue::Int(0)), "is");
        assert_eq!(basic.format_arg("EXTENDED_ARG", &ArgValue::Int(2)), "512");
        assert_eq!(basic.format_arg("LOAD_FAST", &ArgValue::Name("x".into())), "x");
        assert_eq!(basic.format_arg("NOT_AN_OPCODE", &ArgValue::Int(7)), "7");
    }

    #[test]
    fn integer_operands_render_by_opcode() {
        let table = registry::get(Version::new(3, 9), Implementation::CPython).unwrap();
        let basic = BasicFormatter::new(&table);
        let opcode = |name: &str| table.opcode_of(name).unwrap();
        assert_eq!(basic.render(opcode("IS_OP"), 1), "is not");
        assert_eq!(basic.render(opcode("BUILD_LIST"), 3), "");
        assert_eq!(basic.render(0xFFFF, 3), "");
    }
}
