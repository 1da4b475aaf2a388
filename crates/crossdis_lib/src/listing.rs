//! Text listings in the layout of the reference `dis` tool.
//!
//! ```text
//!    1    00000 LOAD_NAME                0 (a)
//!         00002 LOAD_NAME                1 (b)
//!         00004 BINARY_ADD           TOS = a + b
//! ```
//!
//! Columns: line number (on line starts only), `>>` for jump targets, offset,
//! opname, raw operand and the resolved operand in parentheses. Extended
//! listings append the reconstructed expression.

use crate::error::CrossdisError;
use crate::extended::Annotation;
use crate::instruction::Instruction;
use crate::table::OpcodeTable;
use crate::{Disassembly, Fault};

const OPNAME_WIDTH: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Style {
    #[default]
    Basic,
    Extended,
}

/// Renders disassemblies produced with one table.
#[derive(Debug, Clone, Copy)]
pub struct Listing<'a> {
    table: &'a OpcodeTable,
    style: Style,
}

fn problem_text(fault: &Fault) -> String {
    match &fault.error {
        CrossdisError::MalformedBytecode { problem, .. } => problem.to_string(),
        other => other.to_string(),
    }
}

impl<'a> Listing<'a> {
    pub fn new(table: &'a OpcodeTable, style: Style) -> Self {
        Self { table, style }
    }

    pub fn render(&self, disassembly: &Disassembly) -> String {
        let mut out = String::new();
        self.render_into(&mut out, disassembly);
        out
    }

    fn render_into(&self, out: &mut String, dis: &Disassembly) {
        for (index, inst) in dis.instructions.iter().enumerate() {
            if index > 0 && inst.starts_line.is_some() {
                out.push('\n');
            }
            out.push_str(&self.line(dis, index, inst));
            out.push('\n');
        }

        // Faults past the last decoded instruction, e.g. a truncated tail.
        for fault in &dis.faults {
            if dis.instructions.iter().any(|i| i.offset == fault.offset) {
                continue;
            }
            let text = format!(
                "{:>4} {:>2} {:05} <malformed: {}> {}",
                "",
                "",
                fault.offset,
                problem_text(fault),
                raw_hex(dis, fault.offset)
            );
            out.push_str(text.trim_end());
            out.push('\n');
        }

        if !dis.exception_entries.is_empty() {
            out.push_str("ExceptionTable:\n");
            for entry in &dis.exception_entries {
                out.push_str(&format!("  {entry}\n"));
            }
        }

        for child in &dis.children {
            out.push_str(&format!("\nDisassembly of <code object {}>:\n", child.name));
            self.render_into(out, child);
        }
    }

    fn line(&self, dis: &Disassembly, index: usize, inst: &Instruction) -> String {
        let line_no = inst.starts_line.map(|l| l.to_string()).unwrap_or_default();
        let marker = if inst.is_jump_target { ">>" } else { "" };
        let mut text = format!(
            "{:>4} {:>2} {:05} {:<width$}",
            line_no,
            marker,
            inst.offset,
            inst.opname,
            width = OPNAME_WIDTH
        );
        if let Some(arg) = inst.arg {
            text.push_str(&format!(" {arg:>5}"));
        }
        let extended = match self.style {
            Style::Extended => dis.annotation(index).and_then(|note| self.extended_text(inst, note)),
            Style::Basic => None,
        };
        match extended {
            Some(tail) => {
                text.push(' ');
                text.push_str(&tail);
            }
            None if !inst.argrepr.is_empty() => text.push_str(&format!(" ({})", inst.argrepr)),
            None => {}
        }
        if let Some(fault) = dis.fault_at(inst.offset) {
            text.push_str(&format!("  <malformed: {}> {}", problem_text(fault), raw_hex(dis, inst.offset)));
        }
        text.trim_end().to_string()
    }

    /// `(argrepr) ; TOS = expr` for value-producing folds, `(argrepr) ; expr`
    /// for statements.
    fn extended_text(&self, inst: &Instruction, note: &Annotation) -> Option<String> {
        let display = note.display.as_deref()?;
        let info = self.table.info(inst.opcode)?;
        info.ext_format?;
        let mut tail = String::new();
        if !inst.argrepr.is_empty() {
            tail.push_str(&format!("({}) ; ", inst.argrepr));
        }
        if info.push > 0 {
            tail.push_str("TOS = ");
        }
        tail.push_str(display.trim_end());
        Some(tail)
    }
}

/// Hex of the bytes from `offset` up to the next decoded instruction.
fn raw_hex(dis: &Disassembly, offset: usize) -> String {
    let len = dis.code.len();
    let start = offset.min(len);
    let end = dis
        .instructions
        .iter()
        .map(|i| i.offset)
        .find(|&o| o > offset)
        .unwrap_or(len)
        .min(len);
    hex::encode(&dis.code[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeObject;
    use crate::constant::Constant;
    use crate::table::{Implementation, Version};
    use crate::{DisassembleOptions, disassemble, registry};
    use pretty_assertions::assert_eq;

    fn table(major: u8, minor: u8) -> std::sync::Arc<OpcodeTable> {
        registry::get(Version::new(major, minor), Implementation::CPython).unwrap()
    }

    fn op(table: &OpcodeTable, name: &str) -> u8 {
        u8::try_from(table.opcode_of(name).unwrap()).unwrap()
    }

    fn sum_module(t: &OpcodeTable) -> CodeObject {
        let mut code = CodeObject::new(
            "<module>",
            vec![
                op(t, "LOAD_NAME"), 0,
                op(t, "LOAD_NAME"), 1,
                op(t, "BINARY_ADD"), 0,
                op(t, "STORE_NAME"), 2,
                op(t, "LOAD_CONST"), 0,
                op(t, "RETURN_VALUE"), 0,
            ],
        );
        code.names = vec!["a".into(), "b".into(), "c".into()];
        code.consts = vec![Constant::None];
        code
    }

    #[test]
    fn basic_listing() {
        let t = table(3, 8);
        let dis = disassemble(&sum_module(&t), &t, &DisassembleOptions::default()).unwrap();
        let text = Listing::new(&t, Style::Basic).render(&dis);
        assert_eq!(
            text,
            concat!(
                "   1    00000 LOAD_NAME                0 (a)\n",
                "        00002 LOAD_NAME                1 (b)\n",
                "        00004 BINARY_ADD\n",
                "        00006 STORE_NAME               2 (c)\n",
                "        00008 LOAD_CONST               0 (None)\n",
                "        00010 RETURN_VALUE\n",
            )
        );
    }

    #[test]
    fn extended_listing() {
        let t = table(3, 8);
        let options = DisassembleOptions { extended: true, ..Default::default() };
        let dis = disassemble(&sum_module(&t), &t, &options).unwrap();
        let text = Listing::new(&t, Style::Extended).render(&dis);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[2], "        00004 BINARY_ADD           TOS = a + b");
        assert_eq!(lines[3], "        00006 STORE_NAME               2 (c) ; c = a + b");
        assert_eq!(lines[5], "        00010 RETURN_VALUE         return None");
        assert_eq!(lines[0], "   1    00000 LOAD_NAME                0 (a)");
    }

    #[test]
    fn malformed_instructions_show_raw_bytes() {
        let t = table(3, 8);
        let code = CodeObject::new("<module>", vec![op(&t, "LOAD_CONST"), 7, op(&t, "RETURN_VALUE"), 0]);
        let dis = disassemble(&code, &t, &DisassembleOptions::default()).unwrap();
        let text = Listing::new(&t, Style::Basic).render(&dis);
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("   1    00000 LOAD_CONST               7 (<index 7>)  <malformed: "), "{first}");
        assert!(first.ends_with("> 6407"), "{first}");
    }

    #[test]
    fn truncated_tail_is_listed() {
        let t = table(2, 7);
        let code = CodeObject::new("<module>", vec![op(&t, "NOP"), op(&t, "LOAD_CONST"), 0]);
        let dis = disassemble(&code, &t, &DisassembleOptions::default()).unwrap();
        let text = Listing::new(&t, Style::Basic).render(&dis);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "   1    00000 NOP");
        assert!(lines[1].starts_with("        00001 <malformed: truncated instruction"), "{}", lines[1]);
        assert!(lines[1].ends_with(" 6400"), "{}", lines[1]);
    }

    #[test]
    fn nested_code_follows_parent() {
        let t = table(3, 8);
        let mut inner = CodeObject::new("f", vec![op(&t, "LOAD_CONST"), 0, op(&t, "RETURN_VALUE"), 0]);
        inner.consts = vec![Constant::Int(1)];
        inner.firstlineno = 2;
        let mut outer = CodeObject::new("<module>", vec![op(&t, "LOAD_CONST"), 0, op(&t, "RETURN_VALUE"), 0]);
        outer.consts = vec![Constant::Code(Box::new(inner.clone())), Constant::Code(Box::new(inner))];
        let dis = disassemble(&outer, &t, &DisassembleOptions::default()).unwrap();
        assert_eq!(dis.children.len(), 2);
        let text = Listing::new(&t, Style::Basic).render(&dis);
        let headers: Vec<&str> = text.lines().filter(|l| l.starts_with("Disassembly of")).collect();
        assert_eq!(headers, vec!["Disassembly of <code object f>:"; 2]);
        assert!(text.contains("   2    00000 LOAD_CONST               0 (1)\n"));
    }
}
