use std::fmt;

use serde::{Deserialize, Serialize};

use crate::code::{CodeObject, hex_bytes};

/// A value from a code object's constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConstantRepr", into = "ConstantRepr")]
pub enum Constant {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    /// Integers outside `i64`, kept as their decimal text.
    BigInt(String),
    Float(f64),
    Complex { real: f64, imag: f64 },
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Constant>),
    FrozenSet(Vec<Constant>),
    Code(Box<CodeObject>),
}

/// JSON shape: scalars map onto JSON scalars, everything else is a
/// single-key object naming the variant.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ConstantRepr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tagged(Tagged),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Tagged {
    Ellipsis(bool),
    BigInt(String),
    /// Non-finite floats: "nan", "inf" or "-inf".
    Float(String),
    Complex { real: f64, imag: f64 },
    Bytes(#[serde(with = "hex_bytes")] Vec<u8>),
    Tuple(Vec<Constant>),
    FrozenSet(Vec<Constant>),
    Code(Box<CodeObject>),
}

impl TryFrom<ConstantRepr> for Constant {
    type Error = String;

    fn try_from(repr: ConstantRepr) -> Result<Self, String> {
        Ok(match repr {
            ConstantRepr::Null => Constant::None,
            ConstantRepr::Bool(b) => Constant::Bool(b),
            ConstantRepr::Int(n) => Constant::Int(n),
            ConstantRepr::Float(x) => Constant::Float(x),
            ConstantRepr::Str(s) => Constant::Str(s),
            ConstantRepr::Tagged(Tagged::Ellipsis(_)) => Constant::Ellipsis,
            ConstantRepr::Tagged(Tagged::BigInt(digits)) => {
                let body = digits.strip_prefix('-').unwrap_or(&digits);
                if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(format!("invalid bigint {digits:?}"));
                }
                Constant::BigInt(digits)
            }
            ConstantRepr::Tagged(Tagged::Float(text)) => match text.as_str() {
                "nan" => Constant::Float(f64::NAN),
                "inf" => Constant::Float(f64::INFINITY),
                "-inf" => Constant::Float(f64::NEG_INFINITY),
                other => Constant::Float(other.parse().map_err(|_| format!("invalid float {other:?}"))?),
            },
            ConstantRepr::Tagged(Tagged::Complex { real, imag }) => Constant::Complex { real, imag },
            ConstantRepr::Tagged(Tagged::Bytes(bytes)) => Constant::Bytes(bytes),
            ConstantRepr::Tagged(Tagged::Tuple(items)) => Constant::Tuple(items),
            ConstantRepr::Tagged(Tagged::FrozenSet(items)) => Constant::FrozenSet(items),
            ConstantRepr::Tagged(Tagged::Code(code)) => Constant::Code(code),
        })
    }
}

impl From<Constant> for ConstantRepr {
    fn from(constant: Constant) -> Self {
        match constant {
            Constant::None => ConstantRepr::Null,
            Constant::Ellipsis => ConstantRepr::Tagged(Tagged::Ellipsis(true)),
            Constant::Bool(b) => ConstantRepr::Bool(b),
            Constant::Int(n) => ConstantRepr::Int(n),
            Constant::BigInt(digits) => ConstantRepr::Tagged(Tagged::BigInt(digits)),
            Constant::Float(x) if x.is_finite() => ConstantRepr::Float(x),
            Constant::Float(x) => ConstantRepr::Tagged(Tagged::Float(float_repr(x))),
            Constant::Complex { real, imag } => ConstantRepr::Tagged(Tagged::Complex { real, imag }),
            Constant::Str(s) => ConstantRepr::Str(s),
            Constant::Bytes(bytes) => ConstantRepr::Tagged(Tagged::Bytes(bytes)),
            Constant::Tuple(items) => ConstantRepr::Tagged(Tagged::Tuple(items)),
            Constant::FrozenSet(items) => ConstantRepr::Tagged(Tagged::FrozenSet(items)),
            Constant::Code(code) => ConstantRepr::Tagged(Tagged::Code(code)),
        }
    }
}

/// Shortest round-trip digits, switching to exponent form outside
/// `1e-4 <= |x| < 1e16`. No trailing `.0` is added.
fn float_digits(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    if x.is_infinite() {
        return (if x > 0.0 { "inf" } else { "-inf" }).to_string();
    }
    let scientific = format!("{x:e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if x == 0.0 || (-4..16).contains(&exponent) {
        return format!("{x}");
    }
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exponent.abs())
}

pub fn float_repr(x: f64) -> String {
    let digits = float_digits(x);
    if x.is_finite() && !digits.contains(['.', 'e']) {
        format!("{digits}.0")
    } else {
        digits
    }
}

fn complex_repr(real: f64, imag: f64) -> String {
    let imag_text = float_digits(imag);
    if real == 0.0 && real.is_sign_positive() {
        return format!("{imag_text}j");
    }
    let sign = if imag_text.starts_with('-') { "" } else { "+" };
    format!("({}{sign}{imag_text}j)", float_digits(real))
}

fn quote_str(s: &str, prefer_double: bool) -> String {
    let has_single = s.contains('\'');
    let has_double = s.contains('"');
    let quote = if prefer_double {
        if has_double && !has_single { '\'' } else { '"' }
    } else if has_single && !has_double {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7F => out.push_str(&format!("\\x{:02x}", c as u32)),
            c if c.is_control() => {
                let code = c as u32;
                if code <= 0xFF {
                    out.push_str(&format!("\\x{code:02x}"));
                } else if code <= 0xFFFF {
                    out.push_str(&format!("\\u{code:04x}"));
                } else {
                    out.push_str(&format!("\\U{code:08x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn bytes_repr(bytes: &[u8]) -> String {
    let quote = if bytes.contains(&b'\'') && !bytes.contains(&b'"') { '"' } else { '\'' };
    let mut out = String::from("b");
    out.push(quote);
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b if b as char == quote => {
                out.push('\\');
                out.push(quote);
            }
            0x20..=0x7E => out.push(b as char),
            b => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push(quote);
    out
}

impl Constant {
    pub fn repr(&self) -> String {
        self.repr_with(false)
    }

    /// The operand-display variant: strings prefer double quotes.
    pub fn repr_double_quoted(&self) -> String {
        self.repr_with(true)
    }

    fn repr_with(&self, prefer_double: bool) -> String {
        let join = |items: &[Constant]| {
            items.iter().map(|c| c.repr_with(prefer_double)).collect::<Vec<_>>().join(", ")
        };
        match self {
            Constant::None => "None".to_string(),
            Constant::Ellipsis => "Ellipsis".to_string(),
            Constant::Bool(true) => "True".to_string(),
            Constant::Bool(false) => "False".to_string(),
            Constant::Int(n) => n.to_string(),
            Constant::BigInt(digits) => digits.clone(),
            Constant::Float(x) => float_repr(*x),
            Constant::Complex { real, imag } => complex_repr(*real, *imag),
            Constant::Str(s) => quote_str(s, prefer_double),
            Constant::Bytes(bytes) => bytes_repr(bytes),
            Constant::Tuple(items) if items.len() == 1 => format!("({},)", join(items)),
            Constant::Tuple(items) => format!("({})", join(items)),
            Constant::FrozenSet(items) if items.is_empty() => "frozenset()".to_string(),
            Constant::FrozenSet(items) => format!("frozenset({{{}}})", join(items)),
            Constant::Code(code) => format!("<code object {}>", code.name),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<&CodeObject> {
        match self {
            Constant::Code(code) => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn float_reprs() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(-0.0), "-0.0");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-7), "1.5e-07");
        assert_eq!(float_repr(123456.789), "123456.789");
        assert_eq!(float_repr(f64::NAN), "nan");
        assert_eq!(float_repr(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn string_quoting() {
        assert_eq!(Constant::Str("abc".into()).repr(), "'abc'");
        assert_eq!(Constant::Str("it's".into()).repr(), "\"it's\"");
        assert_eq!(Constant::Str("abc".into()).repr_double_quoted(), "\"abc\"");
        assert_eq!(Constant::Str("say \"hi\"".into()).repr_double_quoted(), "'say \"hi\"'");
        assert_eq!(Constant::Str("a\nb".into()).repr(), "'a\\nb'");
        assert_eq!(Constant::Bytes(b"\x00ab".to_vec()).repr(), "b'\\x00ab'");
    }

    #[test]
    fn containers() {
        let one = Constant::Tuple(vec![Constant::Int(1)]);
        assert_eq!(one.repr(), "(1,)");
        let pair = Constant::Tuple(vec![Constant::Str("a".into()), Constant::None]);
        assert_eq!(pair.repr(), "('a', None)");
        assert_eq!(Constant::Tuple(vec![]).repr(), "()");
        assert_eq!(Constant::FrozenSet(vec![]).repr(), "frozenset()");
        assert_eq!(Constant::FrozenSet(vec![Constant::Int(2)]).repr(), "frozenset({2})");
        assert_eq!(Constant::Complex { real: 0.0, imag: 2.0 }.repr(), "2j");
        assert_eq!(Constant::Complex { real: 1.0, imag: -2.5 }.repr(), "(1-2.5j)");
    }

    #[test]
    fn json_wire_form() {
        let consts: Vec<Constant> = serde_json::from_str(
            r#"[null, true, 3, 2.5, "s", {"ellipsis": true}, {"bigint": "123456789012345678901234"},
                {"tuple": [1, "x"]}, {"bytes": "6869"}, {"float": "nan"}, {"complex": {"real": 1.0, "imag": 0.5}}]"#,
        )
        .unwrap();
        assert_eq!(consts[0], Constant::None);
        assert_eq!(consts[1], Constant::Bool(true));
        assert_eq!(consts[2], Constant::Int(3));
        assert_eq!(consts[3], Constant::Float(2.5));
        assert_eq!(consts[5], Constant::Ellipsis);
        assert_eq!(consts[6].repr(), "123456789012345678901234");
        assert_eq!(consts[7].repr(), "(1, 'x')");
        assert_eq!(consts[8], Constant::Bytes(b"hi".to_vec()));
        assert!(matches!(consts[9], Constant::Float(x) if x.is_nan()));
        assert_eq!(consts[10].repr(), "(1+0.5j)");

        let back = serde_json::to_string(&consts[7]).unwrap();
        assert_eq!(back, r#"{"tuple":[1,"x"]}"#);
        assert!(serde_json::from_str::<Constant>(r#"{"bigint": "12a"}"#).is_err());
    }
}
