use std::env;
use std::fs;
use std::path::{Path, PathBuf};

struct Directive {
    line: usize,
    name: String,
    args: Vec<String>,
}

struct Source {
    file: String,
    version: (u8, u8),
    implementation: String,
    parent: Option<((u8, u8), String)>,
    directives: Vec<Directive>,
}

const DIRECTIVES: &[(&str, usize, usize)] = &[
    ("VERSION", 1, 1),
    ("IMPL", 1, 1),
    ("PARENT", 2, 2),
    ("SET", 2, 2),
    ("RM", 2, 2),
    ("RM_ALL", 0, 0),
    ("DEF", 5, 8),
    ("REDEF", 5, 8),
    ("FMT", 2, 2),
    ("XFMT", 2, 3),
    ("STACK", 2, 2),
    ("ENC", 2, 3),
    ("CACHE", 2, 2),
];

fn take_until_paren_close(s: &str) -> Option<&str> {
    let s = s.trim();
    let j = s.rfind(')')?;
    Some(s[..j].trim())
}

fn parse_version(s: &str, file: &str, line: usize) -> (u8, u8) {
    let (major, minor) = s
        .split_once('.')
        .unwrap_or_else(|| panic!("{file}:{line}: version `{s}` is not MAJOR.MINOR"));
    (
        major.trim().parse().expect("version major"),
        minor.trim().parse().expect("version minor"),
    )
}

fn parse_source(path: &Path) -> Source {
    let file = path
        .file_name()
        .and_then(|f| f.to_str())
        .expect("opcode file name")
        .to_string();
    let text = fs::read_to_string(path).expect("read opcode table");

    let mut version = None;
    let mut implementation = None;
    let mut parent = None;
    let mut directives = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let l = match raw.split_once('#') {
            Some((code, _)) => code.trim(),
            None => raw.trim(),
        };
        if l.is_empty() {
            continue;
        }
        let (name, rest) = l
            .split_once('(')
            .unwrap_or_else(|| panic!("{file}:{line}: expected NAME(args)"));
        let name = name.trim();
        let inner = take_until_paren_close(rest)
            .unwrap_or_else(|| panic!("{file}:{line}: missing closing paren"));
        let args: Vec<String> = if inner.is_empty() {
            Vec::new()
        } else {
            inner.split(',').map(|p| p.trim().to_string()).collect()
        };

        let (_, min, max) = DIRECTIVES
            .iter()
            .find(|(d, _, _)| *d == name)
            .unwrap_or_else(|| panic!("{file}:{line}: unknown directive {name}"));
        if args.len() < *min || args.len() > *max {
            panic!("{file}:{line}: {name} takes {min}..={max} arguments, got {}", args.len());
        }

        match name {
            "VERSION" => version = Some(parse_version(&args[0], &file, line)),
            "IMPL" => implementation = Some(args[0].clone()),
            "PARENT" => parent = Some((parse_version(&args[0], &file, line), args[1].clone())),
            _ => {
                if matches!(name, "DEF" | "REDEF" | "RM" | "CACHE") {
                    args[1].parse::<u16>().unwrap_or_else(|_| panic!("{file}:{line}: bad opcode"));
                }
                if matches!(name, "DEF" | "REDEF") {
                    args[2].parse::<i32>().unwrap_or_else(|_| panic!("{file}:{line}: bad pop count"));
                    args[3].parse::<i32>().unwrap_or_else(|_| panic!("{file}:{line}: bad push count"));
                }
                directives.push(Directive { line, name: name.to_string(), args });
            }
        }
    }

    Source {
        version: version.unwrap_or_else(|| panic!("{file}: missing VERSION")),
        implementation: implementation.unwrap_or_else(|| panic!("{file}: missing IMPL")),
        file,
        parent,
        directives,
    }
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let opcode_dir = manifest_dir.join("opcodes");
    println!("cargo:rerun-if-changed={}", opcode_dir.display());

    let mut paths: Vec<PathBuf> = fs::read_dir(&opcode_dir)
        .expect("read opcodes directory")
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|x| x == "def"))
        .collect();
    paths.sort();

    let mut out = String::new();
    out.push_str("#[derive(Debug, Clone, Copy)]\n");
    out.push_str("pub struct RawDirective {\n");
    out.push_str("    pub line: usize,\n");
    out.push_str("    pub name: &'static str,\n");
    out.push_str("    pub args: &'static [&'static str],\n");
    out.push_str("}\n\n");

    out.push_str("#[derive(Debug, Clone, Copy)]\n");
    out.push_str("pub struct RawTable {\n");
    out.push_str("    pub file: &'static str,\n");
    out.push_str("    pub version: (u8, u8),\n");
    out.push_str("    pub implementation: &'static str,\n");
    out.push_str("    pub parent: Option<((u8, u8), &'static str)>,\n");
    out.push_str("    pub directives: &'static [RawDirective],\n");
    out.push_str("}\n\n");

    out.push_str("pub const TABLE_SOURCES: &[RawTable] = &[\n");
    for path in &paths {
        println!("cargo:rerun-if-changed={}", path.display());
        let src = parse_source(path);
        let parent = match &src.parent {
            Some(((maj, min), imp)) => format!("Some((({maj}, {min}), {}))", quoted(imp)),
            None => "None".to_string(),
        };
        out.push_str("    RawTable {\n");
        out.push_str(&format!("        file: {},\n", quoted(&src.file)));
        out.push_str(&format!("        version: ({}, {}),\n", src.version.0, src.version.1));
        out.push_str(&format!("        implementation: {},\n", quoted(&src.implementation)));
        out.push_str(&format!("        parent: {parent},\n"));
        out.push_str("        directives: &[\n");
        for d in &src.directives {
            let args: Vec<String> = d.args.iter().map(|a| quoted(a)).collect();
            out.push_str(&format!(
                "            RawDirective {{ line: {}, name: {}, args: &[{}] }},\n",
                d.line,
                quoted(&d.name),
                args.join(", ")
            ));
        }
        out.push_str("        ],\n");
        out.push_str("    },\n");
    }
    out.push_str("];\n");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    fs::write(out_dir.join("opcode_tables.rs"), out).expect("write generated opcode tables");
}
