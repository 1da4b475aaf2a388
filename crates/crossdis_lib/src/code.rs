use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constant::Constant;
use crate::error::Result;
use crate::exception_table::{self, ExceptionEntry};
use crate::linestarts;
use crate::table::OpcodeTable;

/// Byte fields are written as hex strings and read from either a hex string
/// or a JSON array of numbers.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Bytes {
        Hex(String),
        Raw(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Bytes::deserialize(deserializer)? {
            Bytes::Hex(text) => {
                let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
                hex::decode(compact).map_err(D::Error::custom)
            }
            Bytes::Raw(bytes) => Ok(bytes),
        }
    }
}

fn first_line() -> u32 {
    1
}

/// A compiled code object as read from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub argcount: u32,
    #[serde(default = "first_line")]
    pub firstlineno: u32,
    #[serde(with = "hex_bytes")]
    pub code: Vec<u8>,
    #[serde(default)]
    pub consts: Vec<Constant>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub varnames: Vec<String>,
    #[serde(default)]
    pub cellvars: Vec<String>,
    #[serde(default)]
    pub freevars: Vec<String>,
    #[serde(default, with = "hex_bytes")]
    pub linetable: Vec<u8>,
    #[serde(default, with = "hex_bytes")]
    pub exceptiontable: Vec<u8>,
}

impl CodeObject {
    pub fn new(name: &str, code: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            argcount: 0,
            firstlineno: 1,
            code,
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            linetable: Vec::new(),
            exceptiontable: Vec::new(),
        }
    }

    /// Code objects nested in the constant pool, in pool order.
    pub fn nested(&self) -> impl Iterator<Item = &CodeObject> {
        self.consts.iter().filter_map(Constant::as_code)
    }

    /// Variable names in merged slot order: locals, then cells that are not
    /// also locals, then free variables.
    pub fn localsplus(&self) -> Vec<&str> {
        let mut slots: Vec<&str> = self.varnames.iter().map(String::as_str).collect();
        for cell in &self.cellvars {
            if !self.varnames.contains(cell) {
                slots.push(cell);
            }
        }
        slots.extend(self.freevars.iter().map(String::as_str));
        slots
    }
}

/// Everything the decoder resolves operands against.
#[derive(Debug, Clone, Default)]
pub struct Environment<'a> {
    pub consts: &'a [Constant],
    pub names: Vec<&'a str>,
    pub locals: Vec<&'a str>,
    pub free: Vec<&'a str>,
    pub linestarts: BTreeMap<usize, u32>,
    pub exception_entries: Vec<ExceptionEntry>,
}

impl<'a> Environment<'a> {
    /// Builds the view `table` expects for `code`: slot numbering, line
    /// starts and the exception table all follow the table's settings.
    pub fn for_code(code: &'a CodeObject, table: &OpcodeTable, dup_lines: bool) -> Result<Self> {
        let settings = table.settings();
        let (locals, free) = if settings.localsplus {
            let slots = code.localsplus();
            (slots.clone(), slots)
        } else {
            let free = code.cellvars.iter().chain(&code.freevars).map(String::as_str).collect();
            (code.varnames.iter().map(String::as_str).collect(), free)
        };
        let linestarts = linestarts::linestarts(code, settings.line_table, dup_lines)?;
        let exception_entries = if settings.exception_table && !code.exceptiontable.is_empty() {
            exception_table::parse(&code.exceptiontable)?
        } else {
            Vec::new()
        };
        Ok(Self {
            consts: &code.consts,
            names: code.names.iter().map(String::as_str).collect(),
            locals,
            free,
            linestarts,
            exception_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_fields_accept_hex_or_arrays() {
        let from_hex: CodeObject =
            serde_json::from_str(r#"{"name": "f", "code": "6400 5300", "linetable": [2, 1]}"#).unwrap();
        assert_eq!(from_hex.code, vec![0x64, 0x00, 0x53, 0x00]);
        assert_eq!(from_hex.linetable, vec![2, 1]);
        assert_eq!(from_hex.firstlineno, 1);

        let from_array: CodeObject = serde_json::from_str(r#"{"code": [100, 0, 83, 0]}"#).unwrap();
        assert_eq!(from_array.code, from_hex.code);
        assert!(serde_json::from_str::<CodeObject>(r#"{"code": "zz"}"#).is_err());
    }

    #[test]
    fn localsplus_skips_cells_that_are_locals() {
        let mut code = CodeObject::new("f", vec![]);
        code.varnames = vec!["a".into(), "b".into()];
        code.cellvars = vec!["b".into(), "c".into()];
        code.freevars = vec!["d".into()];
        assert_eq!(code.localsplus(), vec!["a", "b", "c", "d"]);
    }
}
