//! Stack-effect resolution.
//!
//! Fixed effects come straight from the table's pop/push counts. A negative
//! count `-(k + 1)` is the variable sentinel and means "operand + k". Opcodes
//! whose effect is not linear in the operand carry an explicit [`StackRule`].

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::table::OpcodeTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackRule {
    /// BUILD_MAP from 3.5: n key/value pairs.
    MapPairs,
    /// BUILD_MAP_UNPACK_WITH_CALL in 3.5: mapping count in the low byte.
    MapUnpackWithCall,
    /// UNPACK_EX: targets before the star in the low byte, after it in the high byte.
    UnpackEx,
    /// CALL_FUNCTION before 3.6: positional count low byte, keyword pairs high byte.
    CallPacked,
    CallPackedVar,
    CallPackedVarKw,
    /// CALL_FUNCTION_EX: bit 0 adds a keyword mapping.
    CallEx,
    CallEx311,
    MakeFunction33,
    MakeClosure33,
    MakeFunction36,
    MakeFunction311,
    /// LOAD_GLOBAL from 3.11: bit 0 also pushes NULL.
    NullPushFlag,
    /// LOAD_ATTR from 3.12: bit 0 pushes the method and self.
    MethodFlag,
    /// LOAD_SUPER_ATTR: pops three, bit 0 pushes two.
    SuperAttr,
    /// FORMAT_VALUE: bit 2 pops a format spec.
    FormatValue,
}

impl FromStr for StackRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "map_pairs" => StackRule::MapPairs,
            "map_unpack_with_call" => StackRule::MapUnpackWithCall,
            "unpack_ex" => StackRule::UnpackEx,
            "call_packed" => StackRule::CallPacked,
            "call_packed_var" => StackRule::CallPackedVar,
            "call_packed_var_kw" => StackRule::CallPackedVarKw,
            "call_ex" => StackRule::CallEx,
            "call_ex311" => StackRule::CallEx311,
            "make_function33" => StackRule::MakeFunction33,
            "make_closure33" => StackRule::MakeClosure33,
            "make_function36" => StackRule::MakeFunction36,
            "make_function311" => StackRule::MakeFunction311,
            "null_push_flag" => StackRule::NullPushFlag,
            "method_flag" => StackRule::MethodFlag,
            "super_attr" => StackRule::SuperAttr,
            "format_value" => StackRule::FormatValue,
            other => return Err(format!("unknown stack rule {other:?}")),
        })
    }
}

impl StackRule {
    /// `None` when the operand is too large for the effect to be represented.
    pub fn effect(self, arg: i64) -> Option<i64> {
        let low = arg & 0xFF;
        let high = (arg >> 8) & 0xFF;
        let flag = arg & 1 != 0;
        let effect = match self {
            StackRule::MapPairs => return arg.checked_mul(2).and_then(|pairs| 1i64.checked_sub(pairs)),
            StackRule::MapUnpackWithCall => 1 - low,
            StackRule::UnpackEx => low + high,
            StackRule::CallPacked => -(low + 2 * high),
            StackRule::CallPackedVar => -(low + 2 * high) - 1,
            StackRule::CallPackedVarKw => -(low + 2 * high) - 2,
            StackRule::CallEx => {
                if flag {
                    -2
                } else {
                    -1
                }
            }
            StackRule::CallEx311 => {
                if flag {
                    -3
                } else {
                    -2
                }
            }
            StackRule::MakeFunction33 | StackRule::MakeClosure33 => {
                let annotations = (arg >> 16) & 0x7FFF;
                let closure = i64::from(self == StackRule::MakeClosure33);
                // code and qualname, defaults, keyword default pairs, annotations
                1 - (2 + low + 2 * high + annotations + closure)
            }
            StackRule::MakeFunction36 => -1 - i64::from((arg & 0x0F).count_ones()),
            StackRule::MakeFunction311 => -i64::from((arg & 0x0F).count_ones()),
            StackRule::NullPushFlag => {
                if flag {
                    2
                } else {
                    1
                }
            }
            StackRule::MethodFlag => i64::from(flag),
            StackRule::SuperAttr => {
                if flag {
                    -1
                } else {
                    -2
                }
            }
            StackRule::FormatValue => {
                if arg & 0x04 != 0 {
                    -1
                } else {
                    0
                }
            }
        };
        Some(effect)
    }
}

/// Resolves a variable count: negative sentinels `-(k + 1)` mean `arg + k`.
fn resolve_count(count: i32, arg: Option<u64>) -> Option<i64> {
    if count >= 0 {
        return Some(i64::from(count));
    }
    let arg = i64::try_from(arg?).ok()?;
    arg.checked_add(i64::from(-count - 1))
}

/// Net stack effect of executing `opcode` with operand `arg`, or `None` when
/// the opcode is undefined or its effect needs an operand that is missing.
pub fn stack_effect(table: &OpcodeTable, opcode: u16, arg: Option<u64>) -> Option<i32> {
    let info = table.info(opcode)?;
    let effect = match info.stack_rule {
        Some(rule) => rule.effect(i64::try_from(arg?).ok()?)?,
        None => resolve_count(info.push, arg)?.checked_sub(resolve_count(info.pop, arg)?)?,
    };
    i32::try_from(effect).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use crate::table::{Implementation, Version};

    fn table(minor: u8) -> std::sync::Arc<OpcodeTable> {
        registry::get(Version::new(3, minor), Implementation::CPython).unwrap()
    }

    fn effect(t: &OpcodeTable, name: &str, arg: Option<u64>) -> Option<i32> {
        stack_effect(t, t.opcode_of(name).unwrap(), arg)
    }

    #[test]
    fn fixed_effects() {
        let t = table(8);
        assert_eq!(effect(&t, "POP_TOP", None), Some(-1));
        assert_eq!(effect(&t, "BINARY_ADD", None), Some(-1));
        assert_eq!(effect(&t, "LOAD_CONST", Some(0)), Some(1));
        assert_eq!(effect(&t, "ROT_FOUR", None), Some(0));
    }

    #[test]
    fn variable_sentinels_use_the_operand() {
        let t = table(8);
        assert_eq!(effect(&t, "BUILD_TUPLE", Some(3)), Some(-2));
        assert_eq!(effect(&t, "BUILD_TUPLE", Some(0)), Some(1));
        assert_eq!(effect(&t, "UNPACK_SEQUENCE", Some(3)), Some(2));
        assert_eq!(effect(&t, "CALL_FUNCTION", Some(2)), Some(-2));
        assert_eq!(effect(&t, "CALL_FUNCTION_KW", Some(2)), Some(-3));
        assert_eq!(effect(&t, "CALL_METHOD", Some(1)), Some(-2));
        assert_eq!(effect(&t, "BUILD_CONST_KEY_MAP", Some(2)), Some(-2));
        assert_eq!(effect(&t, "RAISE_VARARGS", Some(1)), Some(-1));
        assert_eq!(effect(&t, "BUILD_TUPLE", None), None);
    }

    #[test]
    fn explicit_rules() {
        let t = table(8);
        assert_eq!(effect(&t, "BUILD_MAP", Some(2)), Some(-3));
        assert_eq!(effect(&t, "MAKE_FUNCTION", Some(0x08)), Some(-2));
        assert_eq!(effect(&t, "MAKE_FUNCTION", Some(0)), Some(-1));
        assert_eq!(effect(&t, "CALL_FUNCTION_EX", Some(1)), Some(-2));
        assert_eq!(effect(&t, "FORMAT_VALUE", Some(4)), Some(-1));
        assert_eq!(effect(&t, "UNPACK_EX", Some(0x0102)), Some(3));

        let t35 = table(5);
        assert_eq!(effect(&t35, "CALL_FUNCTION", Some(0x0102)), Some(-4));
        assert_eq!(effect(&t35, "MAKE_FUNCTION", Some(1)), Some(-2));

        let t312 = table(12);
        assert_eq!(effect(&t312, "LOAD_GLOBAL", Some(1)), Some(2));
        assert_eq!(effect(&t312, "LOAD_GLOBAL", Some(2)), Some(1));
        assert_eq!(effect(&t312, "LOAD_ATTR", Some(3)), Some(1));
        assert_eq!(effect(&t312, "LOAD_SUPER_ATTR", Some(2)), Some(-2));
        assert_eq!(effect(&t312, "CALL", Some(2)), Some(-3));
        assert_eq!(effect(&t312, "MAKE_FUNCTION", Some(0x01)), Some(-1));
    }

    #[test]
    fn huge_operands_have_no_effect() {
        let t = table(8);
        assert_eq!(effect(&t, "BUILD_MAP", Some(1 << 62)), None);
        assert_eq!(effect(&t, "BUILD_MAP", Some(u64::MAX)), None);
        assert_eq!(effect(&t, "BUILD_TUPLE", Some(i64::MAX as u64)), None);
        assert_eq!(effect(&t, "CALL_FUNCTION_KW", Some(i64::MAX as u64)), None);
        assert_eq!(StackRule::MapPairs.effect(i64::MAX), None);
        assert_eq!(StackRule::MapPairs.effect(3), Some(-5));
        // Masked rules stay defined for any operand.
        assert_eq!(StackRule::CallEx.effect(i64::MAX), Some(-2));
    }

    #[test]
    fn undefined_opcode_has_no_effect() {
        let t = table(8);
        assert_eq!(stack_effect(&t, 255, None), None);
    }
}
