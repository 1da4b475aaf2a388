//! Best-effort expression reconstruction over a decoded instruction list.
//!
//! Each instruction whose opcode carries an [`ExtFormat`] is folded with the
//! values left by the instructions before it. Results land in a side table of
//! [`Annotation`]s; a fold never reads past a jump target, since another
//! branch may reach that point with a different stack.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::constant::Constant;
use crate::format::BINARY_OPERATORS;
use crate::instruction::{ArgValue, Instruction};
use crate::table::{OpClass, OpcodeTable};

/// An infix operator symbol, stored as its index in [`BINARY_OPERATORS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfixOp(u8);

impl InfixOp {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        let index = BINARY_OPERATORS.iter().position(|s| *s == symbol)?;
        u8::try_from(index).ok().map(InfixOp)
    }

    pub fn symbol(self) -> &'static str {
        BINARY_OPERATORS.get(usize::from(self.0)).copied().unwrap_or("?")
    }

    /// Augmented assignment (`+=` and friends).
    pub fn is_inplace(self) -> bool {
        self.symbol().ends_with('=')
    }
}

/// Folding rule bound to an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtFormat {
    Infix(InfixOp),
    /// COMPARE_OP, using the resolved operator.
    Compare,
    IsOp,
    ContainsOp,
    /// 3.11 BINARY_OP, operator taken from the operand.
    BinaryOp,
    MatMul,
    Subscript,
    Negate,
    Invert,
    Not,
    Positive,
    ReturnValue,
    ReturnConst,
    DupTop,
    Store,
    StoreAttr,
    StoreSubscr,
    Attr,
    BuildList,
    BuildTuple,
    BuildSet,
    BuildMap,
    /// BUILD_MAP before 3.5: the operand is a size hint and the map starts empty.
    BuildMapHint,
    BuildConstKeyMap,
    BuildSlice,
    BuildString,
    FormatValue,
    CallFunction,
    /// Operand packs positional count in the low byte and keyword pairs above it.
    CallFunctionPacked,
    CallFunctionKw,
    CallMethod,
    Call,
    CallKw,
    ImportName,
    ImportFrom,
    LoadBuildClass,
    MakeFunction,
    MakeFunctionOld,
    RaiseVarargs,
}

impl ExtFormat {
    /// Parses a table directive: a format name and an optional parameter.
    pub fn from_directive(name: &str, param: Option<&str>) -> Result<Self, String> {
        if name == "infix" {
            let symbol = param.ok_or("infix needs an operator symbol")?;
            return InfixOp::from_symbol(symbol)
                .map(ExtFormat::Infix)
                .ok_or_else(|| format!("unknown infix operator {symbol:?}"));
        }
        if let Some(param) = param {
            return Err(format!("extended format {name} takes no parameter, got {param:?}"));
        }
        Ok(match name {
            "compare" => ExtFormat::Compare,
            "is_op" => ExtFormat::IsOp,
            "contains_op" => ExtFormat::ContainsOp,
            "binary_op" => ExtFormat::BinaryOp,
            "matmul" => ExtFormat::MatMul,
            "subscript" => ExtFormat::Subscript,
            "negate" => ExtFormat::Negate,
            "invert" => ExtFormat::Invert,
            "not" => ExtFormat::Not,
            "positive" => ExtFormat::Positive,
            "return_value" => ExtFormat::ReturnValue,
            "return_const" => ExtFormat::ReturnConst,
            "dup_top" => ExtFormat::DupTop,
            "store" => ExtFormat::Store,
            "store_attr" => ExtFormat::StoreAttr,
            "store_subscr" => ExtFormat::StoreSubscr,
            "attr" => ExtFormat::Attr,
            "build_list" => ExtFormat::BuildList,
            "build_tuple" => ExtFormat::BuildTuple,
            "build_set" => ExtFormat::BuildSet,
            "build_map" => ExtFormat::BuildMap,
            "build_map_hint" => ExtFormat::BuildMapHint,
            "build_const_key_map" => ExtFormat::BuildConstKeyMap,
            "build_slice" => ExtFormat::BuildSlice,
            "build_string" => ExtFormat::BuildString,
            "format_value" => ExtFormat::FormatValue,
            "call_function" => ExtFormat::CallFunction,
            "call_function_packed" => ExtFormat::CallFunctionPacked,
            "call_function_kw" => ExtFormat::CallFunctionKw,
            "call_method" => ExtFormat::CallMethod,
            "call" => ExtFormat::Call,
            "call_kw" => ExtFormat::CallKw,
            "import_name" => ExtFormat::ImportName,
            "import_from" => ExtFormat::ImportFrom,
            "load_build_class" => ExtFormat::LoadBuildClass,
            "make_function" => ExtFormat::MakeFunction,
            "make_function_old" => ExtFormat::MakeFunctionOld,
            "raise_varargs" => ExtFormat::RaiseVarargs,
            other => return Err(format!("unknown extended format {other:?}")),
        })
    }

    /// Operator results need parentheses when they become an operand.
    fn is_operator(self) -> bool {
        matches!(
            self,
            ExtFormat::Infix(_)
                | ExtFormat::Compare
                | ExtFormat::IsOp
                | ExtFormat::ContainsOp
                | ExtFormat::BinaryOp
                | ExtFormat::MatMul
                | ExtFormat::Negate
                | ExtFormat::Invert
                | ExtFormat::Not
                | ExtFormat::Positive
        )
    }
}

/// Extended-format result for one instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Annotation {
    /// Expression for the value the instruction leaves on the stack.
    pub tos_str: Option<String>,
    /// Offset of the earliest instruction folded into `tos_str`.
    pub start_offset: Option<usize>,
    /// Text to show in a listing. May be a degraded fragment with `...` for
    /// operands that could not be recovered; such text is never a `tos_str`.
    pub display: Option<String>,
}

enum Fold {
    Folded { text: String, start: usize },
    Degraded(String),
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Miss {
    JumpTarget,
    Unusable,
}

/// A recovered stack value.
struct Value {
    text: String,
    /// Index of the instruction that produced the value.
    index: usize,
    /// Index of the earliest instruction that contributed to it.
    begin: usize,
    grouped: bool,
}

impl Value {
    fn operand(&self) -> String {
        if self.grouped { format!("({})", self.text) } else { self.text.clone() }
    }
}

/// Values in stack order (top first) plus the reason collection stopped, if
/// it stopped early.
struct Operands {
    values: Vec<Value>,
    miss: Option<Miss>,
}

impl Operands {
    fn complete(&self, n: usize) -> bool {
        self.miss.is_none() && self.values.len() == n
    }

    /// Source-order operand texts, `...` standing in for the missing ones.
    fn padded(&self, n: usize) -> Vec<String> {
        self.texts(n, |v| v.text.clone())
    }

    /// Like [`padded`](Self::padded) with operator results parenthesized.
    fn grouped(&self, n: usize) -> Vec<String> {
        self.texts(n, Value::operand)
    }

    fn texts(&self, n: usize, render: impl Fn(&Value) -> String) -> Vec<String> {
        let mut texts: Vec<String> = self.values.iter().map(render).collect();
        texts.resize(n, "...".to_string());
        texts.reverse();
        texts
    }

    /// Offset-bearing index of the deepest operand.
    fn begin(&self) -> Option<usize> {
        self.values.last().map(|v| v.begin)
    }
}

fn strip_wrapper(text: &str) -> &str {
    for prefix in ["push(", "copy("] {
        if let Some(inner) = text.strip_prefix(prefix).and_then(|t| t.strip_suffix(") ")) {
            return inner;
        }
    }
    text
}

fn strip_null_prefix(text: &str) -> &str {
    text.strip_prefix("NULL|self + ").or_else(|| text.strip_prefix("NULL + ")).unwrap_or(text)
}

fn fstring_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '{' => out.push_str("{{"),
            '}' => out.push_str("}}"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Runs the extended pass for one table.
#[derive(Debug, Clone, Copy)]
pub struct ExtendedFormatter<'a> {
    table: &'a OpcodeTable,
}

struct Pass<'a> {
    table: &'a OpcodeTable,
    instructions: &'a [Instruction],
    notes: &'a [Annotation],
}

impl<'a> ExtendedFormatter<'a> {
    pub fn new(table: &'a OpcodeTable) -> Self {
        Self { table }
    }

    /// Annotates every instruction in one forward pass. Instructions that
    /// already carry a `tos_str` keep it, so annotating twice is stable.
    pub fn annotate(&self, instructions: &[Instruction]) -> Vec<Annotation> {
        let mut notes: Vec<Annotation> = Vec::with_capacity(instructions.len());
        for at in 0..instructions.len() {
            let note = Pass { table: self.table, instructions, notes: &notes }.annotation(at);
            notes.push(note);
        }
        notes
    }

    /// Annotates and writes `tos_str` and `start_offset` back. Returns the
    /// annotations for display.
    pub fn apply(&self, instructions: &mut [Instruction]) -> Vec<Annotation> {
        let notes = self.annotate(instructions);
        for (inst, note) in instructions.iter_mut().zip(&notes) {
            inst.tos_str.clone_from(&note.tos_str);
            inst.start_offset = note.start_offset;
        }
        notes
    }
}

impl Pass<'_> {
    fn annotation(&self, at: usize) -> Annotation {
        let inst = &self.instructions[at];
        if let Some(existing) = &inst.tos_str {
            return Annotation {
                tos_str: Some(existing.clone()),
                start_offset: inst.start_offset,
                display: Some(existing.clone()),
            };
        }
        let info = self.table.info(inst.opcode);
        let seed = (info.is_some_and(|i| i.pop == 0) && !inst.is_cache).then_some(inst.offset);
        let Some(format) = info.and_then(|i| i.ext_format) else {
            if inst.has_arg && !inst.argrepr.is_empty() && self.table.is(inst.opcode, OpClass::NullaryLoad) {
                return Annotation {
                    tos_str: Some(inst.argrepr.clone()),
                    start_offset: Some(inst.offset),
                    display: None,
                };
            }
            return Annotation { start_offset: seed, ..Annotation::default() };
        };
        let fold = self.fold(at, format);
        match fold {
            Fold::Folded { text, start } => {
                trace!(offset = inst.offset, start, %text, "folded");
                Annotation { tos_str: Some(text.clone()), start_offset: Some(start), display: Some(text) }
            }
            Fold::Degraded(text) => Annotation { tos_str: None, start_offset: seed, display: Some(text) },
            Fold::Declined => Annotation { start_offset: seed, ..Annotation::default() },
        }
    }

    fn inst(&self, index: usize) -> &Instruction {
        &self.instructions[index]
    }

    fn offset(&self, index: usize) -> usize {
        self.instructions[index].offset
    }

    fn format_of(&self, index: usize) -> Option<ExtFormat> {
        self.table.info(self.inst(index).opcode).and_then(|i| i.ext_format)
    }

    /// The nearest non-cache instruction before `index`.
    fn prev(&self, index: usize) -> Option<usize> {
        (0..index).rev().find(|&k| !self.instructions[k].is_cache)
    }

    fn tos(&self, index: usize) -> Option<&str> {
        self.notes.get(index).and_then(|n| n.tos_str.as_deref())
    }

    fn index_of(&self, offset: usize, below: usize) -> Option<usize> {
        self.instructions[..below].binary_search_by_key(&offset, |i| i.offset).ok()
    }

    /// Index of the earliest instruction folded into the value at `index`.
    fn begin(&self, index: usize) -> usize {
        self.notes
            .get(index)
            .and_then(|n| n.start_offset)
            .and_then(|offset| self.index_of(offset, index + 1))
            .unwrap_or(index)
    }

    fn value(&self, index: usize) -> Result<Value, Miss> {
        let inst = self.inst(index);
        if inst.is_jump_target {
            return Err(Miss::JumpTarget);
        }
        if let Some(tos) = self.tos(index) {
            let grouped = self.format_of(index).is_some_and(ExtFormat::is_operator);
            return Ok(Value { text: strip_wrapper(tos).to_string(), index, begin: self.begin(index), grouped });
        }
        let leaf = self.table.info(inst.opcode).is_some_and(|i| i.pop == 0 && i.push > 0);
        if leaf && !inst.argrepr.is_empty() && self.table.operator_set().contains(&inst.opcode) {
            return Ok(Value { text: inst.argrepr.clone(), index, begin: index, grouped: false });
        }
        Err(Miss::Unusable)
    }

    /// Collects up to `n` values walking down from `cursor` (inclusive).
    fn operands_from(&self, mut cursor: Option<usize>, n: usize) -> Operands {
        let mut values = Vec::with_capacity(n);
        while values.len() < n {
            let Some(index) = cursor else {
                return Operands { values, miss: Some(Miss::Unusable) };
            };
            match self.value(index) {
                Ok(value) => {
                    cursor = self.prev(value.begin);
                    values.push(value);
                }
                Err(miss) => return Operands { values, miss: Some(miss) },
            }
        }
        Operands { values, miss: None }
    }

    fn operands(&self, at: usize, n: usize) -> Operands {
        self.operands_from(self.prev(at), n)
    }

    fn count(&self, at: usize) -> Option<usize> {
        self.inst(at).arg.and_then(|a| usize::try_from(a).ok())
    }

    fn fold(&self, at: usize, format: ExtFormat) -> Fold {
        let inst = self.inst(at);
        match format {
            ExtFormat::Infix(op) => self.infix(at, op.symbol()),
            ExtFormat::Compare => match inst.argval.as_name() {
                Some(symbol) => self.infix(at, symbol),
                None => Fold::Declined,
            },
            ExtFormat::IsOp => self.infix(at, if inst.arg == Some(1) { "is not" } else { "is" }),
            ExtFormat::ContainsOp => self.infix(at, if inst.arg == Some(1) { "not in" } else { "in" }),
            ExtFormat::BinaryOp => {
                match inst.arg.and_then(|a| usize::try_from(a).ok()).and_then(|a| BINARY_OPERATORS.get(a)) {
                    Some(symbol) => self.infix(at, symbol),
                    None => Fold::Declined,
                }
            }
            ExtFormat::MatMul => self.infix(at, "@"),
            ExtFormat::Subscript => self.subscript(at),
            ExtFormat::Negate => self.unary(at, |x| format!("-({x})")),
            ExtFormat::Invert => self.unary(at, |x| format!("~({x})")),
            ExtFormat::Not => self.unary(at, |x| format!("not ({x})")),
            ExtFormat::Positive => self.unary(at, |x| format!("+({x})")),
            ExtFormat::ReturnValue => self.unary(at, |x| format!("return {x}")),
            ExtFormat::ReturnConst => Fold::Folded { text: format!("return {}", inst.argrepr), start: inst.offset },
            ExtFormat::DupTop => match self.prev(at) {
                Some(p) if self.table.is_jump(self.inst(p).opcode) => Fold::Declined,
                _ => self.unary(at, |x| format!("push({x}) ")),
            },
            ExtFormat::Store => self.store(at),
            ExtFormat::StoreAttr => self.store_attr(at),
            ExtFormat::StoreSubscr => self.store_subscr(at),
            ExtFormat::Attr => self.attr(at),
            ExtFormat::BuildList => self.sequence(at, "[", "]", "[]"),
            ExtFormat::BuildTuple => self.sequence(at, "(", ")", "tuple()"),
            ExtFormat::BuildSet => self.sequence(at, "{", "}", "set()"),
            ExtFormat::BuildMap => self.build_map(at),
            ExtFormat::BuildMapHint => Fold::Folded { text: "{}".to_string(), start: inst.offset },
            ExtFormat::BuildConstKeyMap => self.build_const_key_map(at),
            ExtFormat::BuildSlice => self.build_slice(at),
            ExtFormat::BuildString => self.build_string(at),
            ExtFormat::FormatValue => self.format_value(at),
            ExtFormat::CallFunction | ExtFormat::CallMethod | ExtFormat::Call => match self.count(at) {
                Some(_) if self.follows_kw_names(at) => self.call_kw(at),
                Some(n) => self.call(at, self.prev(at), n, &[]),
                None => Fold::Declined,
            },
            ExtFormat::CallFunctionPacked => match inst.arg {
                Some(arg) if (arg >> 8) & 0xFF == 0 => self.call(at, self.prev(at), (arg & 0xFF) as usize, &[]),
                _ => Fold::Declined,
            },
            ExtFormat::CallFunctionKw | ExtFormat::CallKw => self.call_kw(at),
            ExtFormat::ImportName => Fold::Folded { text: format!("import_module({})", inst.argval), start: inst.offset },
            ExtFormat::ImportFrom => self.import_from(at),
            ExtFormat::LoadBuildClass => Fold::Folded { text: "class".to_string(), start: inst.offset },
            ExtFormat::MakeFunction | ExtFormat::MakeFunctionOld => self.make_function(at),
            ExtFormat::RaiseVarargs => self.raise(at),
        }
    }

    /// Shared degrade policy for fixed-arity templates: declined when nothing
    /// was recovered for an ordinary reason, degraded when a jump target or a
    /// deeper operand stopped the walk.
    fn template(&self, ops: &Operands, n: usize, render: impl FnOnce(&[String]) -> String) -> Fold {
        let texts = ops.grouped(n);
        match (ops.complete(n), ops.begin()) {
            (true, Some(begin)) => Fold::Folded { text: render(&texts), start: self.offset(begin) },
            _ if ops.values.is_empty() && ops.miss == Some(Miss::Unusable) => Fold::Declined,
            _ => Fold::Degraded(render(&texts)),
        }
    }

    fn infix(&self, at: usize, symbol: &str) -> Fold {
        let ops = self.operands(at, 2);
        self.template(&ops, 2, |t| format!("{} {symbol} {}", t[0], t[1]))
    }

    fn subscript(&self, at: usize) -> Fold {
        let ops = self.operands(at, 2);
        let index = ops.values.first().map(|v| v.text.clone());
        self.template(&ops, 2, |t| format!("{}[{}]", t[0], index.unwrap_or_else(|| t[1].clone())))
    }

    fn unary(&self, at: usize, render: impl FnOnce(&str) -> String) -> Fold {
        let ops = self.operands(at, 1);
        match ops.values.first() {
            Some(v) => Fold::Folded { text: render(&v.text), start: self.offset(v.begin) },
            None if ops.miss == Some(Miss::JumpTarget) => Fold::Degraded(render("...")),
            None => Fold::Declined,
        }
    }

    fn passes_through(&self, index: usize, target: &str) -> bool {
        match self.format_of(index) {
            Some(ExtFormat::Infix(op)) => op.is_inplace(),
            Some(ExtFormat::BinaryOp) => {
                self.inst(index).arg.and_then(|a| usize::try_from(a).ok()).and_then(|a| BINARY_OPERATORS.get(a)).is_some_and(|s| s.ends_with('='))
            }
            Some(ExtFormat::ImportFrom) => true,
            Some(ExtFormat::MakeFunction | ExtFormat::MakeFunctionOld) => {
                self.tos(index).is_some_and(|t| t.strip_prefix("def ").is_some_and(|rest| rest.starts_with(&format!("{target}("))))
            }
            _ => false,
        }
    }

    fn store(&self, at: usize) -> Fold {
        let inst = self.inst(at);
        if inst.is_jump_target {
            return Fold::Declined;
        }
        let Some(operand) = self.prev(at) else { return Fold::Declined };
        // A store pushes nothing, so its text is never the stored value.
        if self.table.is(self.inst(operand).opcode, OpClass::Store) {
            return Fold::Declined;
        }
        let Ok(value) = self.value(operand) else {
            return Fold::Declined;
        };
        let target = inst.argval.to_string();
        let start = self.offset(value.begin);
        if self.passes_through(value.index, &target) {
            return Fold::Folded { text: value.text, start };
        }
        Fold::Folded { text: format!("{target} = {}", value.text), start }
    }

    fn attr_name(inst: &Instruction) -> String {
        match &inst.argval {
            ArgValue::Name(name) => name.clone(),
            _ => strip_null_prefix(&inst.argrepr).to_string(),
        }
    }

    fn attr(&self, at: usize) -> Fold {
        let Some(base) = self.prev(at).and_then(|p| self.value(p).ok()) else {
            return Fold::Declined;
        };
        let name = Self::attr_name(self.inst(at));
        Fold::Folded { text: format!("{}.{name}", base.operand()), start: self.offset(base.begin) }
    }

    fn store_attr(&self, at: usize) -> Fold {
        let ops = self.operands(at, 2);
        let name = Self::attr_name(self.inst(at));
        // Stack: value below the object.
        self.template(&ops, 2, |t| format!("{}.{name} = {}", t[1], t[0]))
    }

    fn store_subscr(&self, at: usize) -> Fold {
        let ops = self.operands(at, 3);
        // Stack: value, container, key (top).
        self.template(&ops, 3, |t| format!("{}[{}] = {}", t[1], t[2], t[0]))
    }

    fn sequence(&self, at: usize, open: &str, close: &str, empty: &str) -> Fold {
        let inst = self.inst(at);
        let Some(n) = self.count(at) else { return Fold::Declined };
        if n == 0 {
            return Fold::Folded { text: empty.to_string(), start: inst.offset };
        }
        let ops = self.operands(at, n);
        let Some(begin) = ops.begin().filter(|_| ops.complete(n)) else {
            return Fold::Declined;
        };
        let items = ops.padded(n).join(", ");
        let trailing = if n == 1 && open == "(" { "," } else { "" };
        Fold::Folded { text: format!("{open}{items}{trailing}{close}"), start: self.offset(begin) }
    }

    fn build_map(&self, at: usize) -> Fold {
        let inst = self.inst(at);
        let Some(n) = self.count(at) else { return Fold::Declined };
        if n == 0 {
            return Fold::Folded { text: "{}".to_string(), start: inst.offset };
        }
        let ops = self.operands(at, 2 * n);
        let Some(begin) = ops.begin().filter(|_| ops.complete(2 * n)) else {
            return Fold::Declined;
        };
        let texts = ops.padded(2 * n);
        let pairs: Vec<String> = texts.chunks_exact(2).map(|kv| format!("{}: {}", kv[0], kv[1])).collect();
        Fold::Folded { text: format!("{{{}}}", pairs.join(", ")), start: self.offset(begin) }
    }

    fn build_const_key_map(&self, at: usize) -> Fold {
        let inst = self.inst(at);
        let Some(n) = self.count(at) else { return Fold::Declined };
        if n == 0 {
            return Fold::Folded { text: "{}".to_string(), start: inst.offset };
        }
        let Some(keys_at) = self.prev(at) else { return Fold::Declined };
        let keys_inst = self.inst(keys_at);
        let keys = match &keys_inst.argval {
            ArgValue::Const(Constant::Tuple(keys)) if keys.len() == n && !keys_inst.is_jump_target => keys,
            _ => return Fold::Declined,
        };
        let ops = self.operands_from(self.prev(keys_at), n);
        let Some(begin) = ops.begin().filter(|_| ops.complete(n)) else {
            return Fold::Declined;
        };
        let pairs: Vec<String> =
            keys.iter().zip(ops.padded(n)).map(|(k, v)| format!("{}: {v}", k.repr())).collect();
        Fold::Folded { text: format!("{{{}}}", pairs.join(", ")), start: self.offset(begin) }
    }

    fn build_slice(&self, at: usize) -> Fold {
        let n = match self.count(at) {
            Some(n @ (2 | 3)) => n,
            _ => return Fold::Declined,
        };
        let ops = self.operands(at, n);
        let Some(begin) = ops.begin().filter(|_| ops.complete(n)) else {
            return Fold::Declined;
        };
        let parts: Vec<String> =
            ops.padded(n).into_iter().map(|p| if p == "None" { String::new() } else { p }).collect();
        Fold::Folded { text: parts.join(":"), start: self.offset(begin) }
    }

    fn fstring_piece(&self, value: &Value) -> String {
        let inst = self.inst(value.index);
        if let ArgValue::Const(Constant::Str(s)) = &inst.argval {
            if value.begin == value.index {
                return fstring_literal(s);
            }
        }
        if self.format_of(value.index) == Some(ExtFormat::FormatValue) {
            if let Some(inner) = value.text.strip_prefix("f\"").and_then(|t| t.strip_suffix('"')) {
                return inner.to_string();
            }
        }
        format!("{{{}}}", value.text)
    }

    fn build_string(&self, at: usize) -> Fold {
        let inst = self.inst(at);
        let Some(n) = self.count(at) else { return Fold::Declined };
        if n == 0 {
            return Fold::Folded { text: "\"\"".to_string(), start: inst.offset };
        }
        let ops = self.operands(at, n);
        let Some(begin) = ops.begin().filter(|_| ops.complete(n)) else {
            return Fold::Declined;
        };
        let body: String = ops.values.iter().rev().map(|v| self.fstring_piece(v)).collect();
        Fold::Folded { text: format!("f\"{body}\""), start: self.offset(begin) }
    }

    fn format_value(&self, at: usize) -> Fold {
        let Some(flags) = self.inst(at).arg else { return Fold::Declined };
        let conversion = match flags & 0x03 {
            1 => "!s",
            2 => "!r",
            3 => "!a",
            _ => "",
        };
        let has_spec = flags & 0x04 != 0;
        let ops = self.operands(at, if has_spec { 2 } else { 1 });
        let (value, spec) = match (has_spec, ops.values.as_slice()) {
            (false, [value]) => (value, String::new()),
            (true, [spec, value]) => {
                let text = match &self.inst(spec.index).argval {
                    ArgValue::Const(Constant::Str(s)) if spec.begin == spec.index => s.clone(),
                    _ => format!("{{{}}}", spec.text),
                };
                (value, format!(":{text}"))
            }
            _ => return Fold::Declined,
        };
        let Some(begin) = ops.begin() else { return Fold::Declined };
        Fold::Folded { text: format!("f\"{{{}{conversion}{spec}}}\"", value.text), start: self.offset(begin) }
    }

    /// Folds a call whose `positional + keywords.len()` arguments sit below
    /// `cursor`, with the callable under them.
    fn call(&self, at: usize, cursor: Option<usize>, positional: usize, keywords: &[String]) -> Fold {
        let total = positional + keywords.len();
        let ops = self.operands_from(cursor, total);
        if !ops.complete(total) {
            return Fold::Declined;
        }
        let below = match ops.begin() {
            Some(begin) => self.prev(begin),
            None => cursor,
        };
        let Some(mut callee_at) = below else { return Fold::Declined };
        // 3.13 pushes the NULL between the callable and its arguments.
        if self.inst(callee_at).opname == "PUSH_NULL" && !self.inst(callee_at).is_jump_target {
            match self.prev(callee_at) {
                Some(p) => callee_at = p,
                None => return Fold::Declined,
            }
        }
        let Ok(callee) = self.value(callee_at) else { return Fold::Declined };
        let mut start = callee.begin;
        if let Some(p) = self.prev(start) {
            if self.inst(p).opname == "PUSH_NULL" && !self.inst(start).is_jump_target {
                start = p;
            }
        }
        let texts = ops.padded(total);
        let (args, kwargs) = texts.split_at(positional);
        let mut rendered: Vec<String> = args.to_vec();
        rendered.extend(keywords.iter().zip(kwargs).map(|(k, v)| format!("{k}={v}")));
        trace!(offset = self.offset(at), callee = %callee.text, "call");
        Fold::Folded {
            text: format!("{}({})", strip_null_prefix(&callee.text), rendered.join(", ")),
            start: self.offset(start),
        }
    }

    /// CALL preceded by KW_NAMES takes its trailing arguments as keywords.
    fn follows_kw_names(&self, at: usize) -> bool {
        self.prev(at).is_some_and(|p| self.inst(p).opname == "KW_NAMES")
    }

    fn call_kw(&self, at: usize) -> Fold {
        let Some(total) = self.count(at) else { return Fold::Declined };
        let Some(names_at) = self.prev(at) else { return Fold::Declined };
        let names_inst = self.inst(names_at);
        let keywords: Vec<String> = match &names_inst.argval {
            ArgValue::Const(Constant::Tuple(items)) if !names_inst.is_jump_target => {
                match items.iter().map(|c| c.as_str().map(str::to_string)).collect::<Option<Vec<_>>>() {
                    Some(names) => names,
                    None => return Fold::Declined,
                }
            }
            _ => return Fold::Declined,
        };
        let Some(positional) = total.checked_sub(keywords.len()) else {
            return Fold::Declined;
        };
        self.call(at, self.prev(names_at), positional, &keywords)
    }

    fn import_from(&self, at: usize) -> Fold {
        let Some(first) = self.prev(at) else { return Fold::Declined };
        let mut index = first;
        while self.table.is(self.inst(index).opcode, OpClass::Store) {
            let begin = self.begin(index);
            if begin >= index {
                return Fold::Declined;
            }
            index = begin;
        }
        let module = match self.tos(index) {
            Some(text) => text,
            None => self.inst(index).argrepr.as_str(),
        };
        let module = module.strip_prefix("import_module(").and_then(|m| m.strip_suffix(')')).unwrap_or(module);
        if module.is_empty() {
            return Fold::Declined;
        }
        Fold::Folded {
            text: format!("from {module} import {}", self.inst(at).argval),
            start: self.offset(self.begin(first)),
        }
    }

    fn make_function(&self, at: usize) -> Fold {
        // The code object is the top constant, or sits under the qualified
        // name or annotation tuple.
        let mut cursor = self.prev(at);
        for _ in 0..3 {
            let Some(index) = cursor else { break };
            let inst = self.inst(index);
            if let Some(code) = inst.argval.as_const().and_then(Constant::as_code) {
                let signature = if code.argcount == 0 { "" } else { "..." };
                return Fold::Folded { text: format!("def {}({signature}): ...", code.name), start: inst.offset };
            }
            if inst.argval.as_const().is_none() {
                break;
            }
            cursor = self.prev(index);
        }
        Fold::Declined
    }

    fn raise(&self, at: usize) -> Fold {
        let inst = self.inst(at);
        match self.count(at) {
            Some(0) => Fold::Folded { text: "reraise".to_string(), start: inst.offset },
            Some(1) => self.unary(at, |x| format!("raise {x}")),
            Some(2) => {
                let ops = self.operands(at, 2);
                self.template(&ops, 2, |t| format!("raise {} from {}", t[0], t[1]))
            }
            _ => Fold::Declined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DisassembleOptions;
    use crate::code::{CodeObject, Environment};
    use crate::decode::decode;
    use crate::registry;
    use crate::table::{Implementation, Version};
    use pretty_assertions::assert_eq;

    fn run(minor: u8, code: &[u8], consts: Vec<Constant>, names: &[&str]) -> (Vec<Instruction>, Vec<Annotation>) {
        let table = registry::get(Version::new(3, minor), Implementation::CPython).unwrap();
        let env = Environment { consts: &consts, names: names.to_vec(), ..Environment::default() };
        let mut decoded = decode(code, &table, &env, &DisassembleOptions::default());
        assert!(decoded.faults.is_empty(), "{:?}", decoded.faults);
        let notes = ExtendedFormatter::new(&table).apply(&mut decoded.instructions);
        (decoded.instructions, notes)
    }

    fn tos(notes: &[Annotation], index: usize) -> Option<&str> {
        notes[index].tos_str.as_deref()
    }

    #[test]
    fn infix_fold_covers_both_loads() {
        // a + b; c = _
        let code = [101, 0, 101, 1, 23, 0, 90, 2];
        let (insts, notes) = run(8, &code, vec![], &["a", "b", "c"]);
        assert_eq!(tos(&notes, 0), Some("a"));
        assert_eq!(tos(&notes, 2), Some("a + b"));
        assert_eq!(notes[2].start_offset, Some(0));
        assert_eq!(tos(&notes, 3), Some("c = a + b"));
        assert_eq!(insts[3].start_offset, Some(0));
    }

    #[test]
    fn nested_operators_are_parenthesized() {
        // (a + b) * c
        let code = [101, 0, 101, 1, 23, 0, 101, 2, 20, 0];
        let (_, notes) = run(8, &code, vec![], &["a", "b", "c"]);
        assert_eq!(tos(&notes, 4), Some("(a + b) * c"));
    }

    #[test]
    fn jump_target_operand_degrades() {
        let code = [101, 0, 101, 1, 23, 0];
        let table = registry::get(Version::new(3, 8), Implementation::CPython).unwrap();
        let env = Environment { names: vec!["a", "b"], ..Environment::default() };
        let mut insts = decode(&code, &table, &env, &DisassembleOptions::default()).instructions;
        insts[1].is_jump_target = true;
        let notes = ExtendedFormatter::new(&table).annotate(&insts);
        assert_eq!(notes[2].tos_str, None);
        assert_eq!(notes[2].display.as_deref(), Some("... + ..."));

        insts[1].is_jump_target = false;
        insts[0].is_jump_target = true;
        let notes = ExtendedFormatter::new(&table).annotate(&insts);
        assert_eq!(notes[2].tos_str, None);
        assert_eq!(notes[2].display.as_deref(), Some("... + b"));
    }

    #[test]
    fn empty_containers_short_circuit() {
        // BUILD_LIST 0, BUILD_TUPLE 0, BUILD_SET 0, BUILD_MAP 0
        let code = [103, 0, 102, 0, 104, 0, 105, 0];
        let (_, notes) = run(8, &code, vec![], &[]);
        let texts: Vec<_> = (0..4).map(|i| tos(&notes, i).unwrap()).collect();
        assert_eq!(texts, vec!["[]", "tuple()", "set()", "{}"]);
        assert_eq!(notes[1].start_offset, Some(2));
    }

    #[test]
    fn builders_collect_in_source_order() {
        let consts = vec![Constant::Int(1), Constant::Int(2)];
        // (1,) then [1, 2] then {1: 2}
        let code = [100, 0, 102, 1, 100, 0, 100, 1, 103, 2, 100, 0, 100, 1, 105, 1];
        let (_, notes) = run(8, &code, consts, &[]);
        assert_eq!(tos(&notes, 1), Some("(1,)"));
        assert_eq!(tos(&notes, 4), Some("[1, 2]"));
        assert_eq!(notes[4].start_offset, Some(4));
        assert_eq!(tos(&notes, 7), Some("{1: 2}"));
    }

    #[test]
    fn call_folds_callee_and_arguments() {
        let consts = vec![Constant::Int(1), Constant::Str("x".into())];
        // print(a, 1)
        let code = [116, 0, 101, 1, 100, 0, 131, 2, 83, 0];
        let (_, notes) = run(8, &code, consts, &["print", "a"]);
        assert_eq!(tos(&notes, 3), Some("print(a, 1)"));
        assert_eq!(notes[3].start_offset, Some(0));
        assert_eq!(tos(&notes, 4), Some("return print(a, 1)"));
    }

    #[test]
    fn call_with_a_broken_argument_declines() {
        // print(<POP_TOP result>) cannot be recovered
        let code = [116, 0, 1, 0, 131, 1];
        let (_, notes) = run(8, &code, vec![], &["print"]);
        assert_eq!(notes[2], Annotation::default());
    }

    #[test]
    fn attribute_and_store_attr() {
        // a.b ; a.b = c  (STORE_ATTR pops obj then value)
        let code = [101, 0, 106, 1, 101, 2, 101, 0, 95, 1];
        let (_, notes) = run(8, &code, vec![], &["a", "b", "c"]);
        assert_eq!(tos(&notes, 1), Some("a.b"));
        assert_eq!(tos(&notes, 4), Some("a.b = c"));
    }

    #[test]
    fn unary_and_subscript() {
        let code = [101, 0, 11, 0, 101, 1, 101, 2, 25, 0];
        let (_, notes) = run(8, &code, vec![], &["x", "d", "k"]);
        assert_eq!(tos(&notes, 1), Some("-(x)"));
        assert_eq!(tos(&notes, 4), Some("d[k]"));
    }

    #[test]
    fn annotating_twice_is_stable() {
        let code = [101, 0, 101, 1, 23, 0, 90, 2];
        let table = registry::get(Version::new(3, 8), Implementation::CPython).unwrap();
        let env = Environment { names: vec!["a", "b", "c"], ..Environment::default() };
        let mut insts = decode(&code, &table, &env, &DisassembleOptions::default()).instructions;
        let formatter = ExtendedFormatter::new(&table);
        let first = formatter.apply(&mut insts);
        let snapshot = insts.clone();
        let second = formatter.apply(&mut insts);
        assert_eq!(insts, snapshot);
        assert_eq!(
            first.iter().map(|n| &n.tos_str).collect::<Vec<_>>(),
            second.iter().map(|n| &n.tos_str).collect::<Vec<_>>()
        );
    }

    #[test]
    fn make_function_and_store_pass_through() {
        let mut body = CodeObject::new("f", vec![100, 0, 83, 0]);
        body.argcount = 1;
        let consts = vec![Constant::Code(Box::new(body)), Constant::Str("f".into())];
        // LOAD_CONST <code f>, LOAD_CONST 'f', MAKE_FUNCTION 0, STORE_NAME f
        let code = [100, 0, 100, 1, 132, 0, 90, 0];
        let (_, notes) = run(8, &code, consts, &["f"]);
        assert_eq!(tos(&notes, 2), Some("def f(...): ..."));
        assert_eq!(tos(&notes, 3), Some("def f(...): ..."));
    }

    #[test]
    fn store_after_store_declines() {
        // LOAD_NAME a, STORE_NAME x, STORE_NAME y
        let code = [101, 0, 90, 1, 90, 2];
        let (_, notes) = run(8, &code, vec![], &["a", "x", "y"]);
        assert_eq!(tos(&notes, 1), Some("x = a"));
        assert_eq!(tos(&notes, 2), None);
    }

    #[test]
    fn infix_symbols_parse() {
        assert_eq!(ExtFormat::from_directive("infix", Some("//=")).unwrap(), ExtFormat::Infix(InfixOp(15)));
        assert!(InfixOp::from_symbol("+=").unwrap().is_inplace());
        assert!(!InfixOp::from_symbol("**").unwrap().is_inplace());
        assert!(ExtFormat::from_directive("infix", None).is_err());
        assert!(ExtFormat::from_directive("store", Some("x")).is_err());
        assert!(ExtFormat::from_directive("nope", None).is_err());
    }
}
