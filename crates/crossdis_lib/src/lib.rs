use std::thread;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod code;
pub mod constant;
pub mod decode;
pub mod error;
pub mod exception_table;
pub mod extended;
pub mod format;
pub mod instruction;
pub mod linestarts;
pub mod listing;
pub mod registry;
pub mod stack;
pub mod table;

pub use code::{CodeObject, Environment};
pub use constant::Constant;
pub use decode::{Decoded, Fault, decode};
pub use error::{CrossdisError, Malformed, Result};
pub use exception_table::ExceptionEntry;
pub use extended::{Annotation, ExtendedFormatter};
pub use format::BasicFormatter;
pub use instruction::{ArgValue, Instruction, OperandKind};
pub use listing::{Listing, Style};
pub use stack::stack_effect;
pub use table::{Implementation, OpClass, OpcodeTable, TableKey, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisassembleOptions {
    /// Emit inline cache words as `CACHE` instructions.
    pub show_caches: bool,
    /// Reconstruct source-like expressions for operators, calls and stores.
    pub extended: bool,
    /// Report a line start for every line-table entry, not just line changes.
    pub dup_lines: bool,
}

impl Default for DisassembleOptions {
    fn default() -> Self {
        Self {
            show_caches: false,
            extended: false,
            dup_lines: false,
        }
    }
}

/// The decoded form of one code object and, recursively, the code objects in
/// its constant pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Disassembly {
    pub name: String,
    pub table: TableKey,
    #[serde(serialize_with = "code::hex_bytes::serialize")]
    pub code: Vec<u8>,
    pub instructions: Vec<Instruction>,
    pub faults: Vec<Fault>,
    /// One entry per instruction when the extended pass ran, else empty.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exception_entries: Vec<ExceptionEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Disassembly>,
}

impl Disassembly {
    pub fn fault_at(&self, offset: usize) -> Option<&Fault> {
        self.faults.iter().find(|f| f.offset == offset)
    }

    pub fn annotation(&self, index: usize) -> Option<&Annotation> {
        self.annotations.get(index)
    }

    /// This code object followed by every nested one, depth first.
    pub fn walk(&self) -> Vec<&Disassembly> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

/// Disassembles `code` and every code object nested in its constants.
///
/// Line and exception tables that cannot be parsed fail the whole call;
/// problems with individual instructions are recorded as faults instead.
/// Sibling code objects are decoded on scoped worker threads that share
/// `table` read-only.
pub fn disassemble(code: &CodeObject, table: &OpcodeTable, options: &DisassembleOptions) -> Result<Disassembly> {
    let env = Environment::for_code(code, table, options.dup_lines)?;
    let Decoded { mut instructions, faults } = decode(&code.code, table, &env, options);
    let annotations = if options.extended {
        ExtendedFormatter::new(table).apply(&mut instructions)
    } else {
        Vec::new()
    };
    debug!(
        name = %code.name,
        table = %table.key(),
        instructions = instructions.len(),
        faults = faults.len(),
        "disassembled"
    );
    let children = disassemble_nested(code, table, options)?;
    Ok(Disassembly {
        name: code.name.clone(),
        table: table.key(),
        code: code.code.clone(),
        instructions,
        faults,
        annotations,
        exception_entries: env.exception_entries,
        children,
    })
}

fn disassemble_nested(code: &CodeObject, table: &OpcodeTable, options: &DisassembleOptions) -> Result<Vec<Disassembly>> {
    let nested: Vec<&CodeObject> = code.nested().collect();
    match nested.as_slice() {
        [] => return Ok(Vec::new()),
        [only] => return Ok(vec![disassemble(only, table, options)?]),
        _ => {}
    }
    thread::scope(|scope| {
        let workers: Vec<_> = nested
            .iter()
            .map(|child| scope.spawn(move || disassemble(child, table, options)))
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    })
}

/// Looks the table up in the registry, then disassembles.
pub fn disassemble_for(
    code: &CodeObject,
    version: Version,
    implementation: Implementation,
    options: &DisassembleOptions,
) -> Result<Disassembly> {
    let table = registry::get(version, implementation)?;
    disassemble(code, &table, options)
}

/// Disassembles and renders a text listing in one step.
pub fn disassemble_to_string(code: &CodeObject, table: &OpcodeTable, options: &DisassembleOptions) -> Result<String> {
    let disassembly = disassemble(code, table, options)?;
    let style = if options.extended { Style::Extended } else { Style::Basic };
    Ok(Listing::new(table, style).render(&disassembly))
}
