use std::path::Path;

use clap::{CommandFactory, Parser};
use crossdis_lib::{
    CodeObject, DisassembleOptions, Disassembly, Implementation, Listing, OpcodeTable, Style, Version, registry, stack_effect,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, FormatCli, ImplementationCli, TablesCommand, TopLevel};

mod cli;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("warn")).unwrap_or_default();
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn implementation(cli: ImplementationCli) -> Implementation {
    match cli {
        ImplementationCli::Cpython => Implementation::CPython,
        ImplementationCli::Pypy => Implementation::PyPy,
    }
}

fn lookup(version: &str, implementation: Implementation) -> std::sync::Arc<OpcodeTable> {
    let version = match version.parse::<Version>() {
        Ok(version) => version,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    match registry::get(version, implementation) {
        Ok(table) => table,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("available tables:");
            for key in registry::keys() {
                eprintln!("  {key}");
            }
            std::process::exit(1);
        }
    }
}

fn read_code(path: &Path) -> CodeObject {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("failed to read {path:?}: {e}");
            std::process::exit(1);
        }
    };
    match serde_json::from_str(&text) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("failed to parse {path:?}: {e}");
            std::process::exit(1);
        }
    }
}

fn options(format: FormatCli, show_caches: bool, dup_lines: bool) -> DisassembleOptions {
    DisassembleOptions { show_caches, extended: format == FormatCli::Extended, dup_lines }
}

fn render(disassembly: &Disassembly, table: &OpcodeTable, format: FormatCli) -> serde_json::Result<String> {
    Ok(match format {
        FormatCli::Basic => Listing::new(table, Style::Basic).render(disassembly),
        FormatCli::Extended => Listing::new(table, Style::Extended).render(disassembly),
        FormatCli::Json => serde_json::to_string_pretty(disassembly)? + "\n",
    })
}

fn disasm(path: &Path, table: &OpcodeTable, format: FormatCli, options: DisassembleOptions) {
    let code = read_code(path);
    info!(path = %path.display(), table = %table.key(), "disassembling");
    let disassembly = match crossdis_lib::disassemble(&code, table, &options) {
        Ok(disassembly) => disassembly,
        Err(e) => {
            eprintln!("disassembly error: {e}");
            std::process::exit(1);
        }
    };
    match render(&disassembly, table, format) {
        Ok(out) => print!("{out}"),
        Err(e) => {
            eprintln!("failed to encode JSON: {e}");
            std::process::exit(1);
        }
    }
    let faults: usize = disassembly.walk().iter().map(|d| d.faults.len()).sum();
    if faults > 0 {
        eprintln!("{faults} malformed instruction(s)");
        std::process::exit(2);
    }
}

fn show_table(table: &OpcodeTable, json: bool) {
    if json {
        match serde_json::to_string_pretty(table) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("failed to encode JSON: {e}");
                std::process::exit(1);
            }
        }
        return;
    }
    let settings = table.settings();
    println!("{}", table.key());
    if let Some(parent) = table.parent() {
        println!("parent: {parent}");
    }
    println!(
        "wordcode: {}, have_argument: {}, extended_arg shift: {}, jump unit: {}",
        settings.wordcode, settings.have_argument, settings.extended_arg_shift, settings.jump_unit
    );
    for (opcode, info) in table.opcodes() {
        let mut line = format!("{:>5} {:<28} pop {:>2} push {:>2}", opcode, info.name, info.pop, info.push);
        match stack_effect(table, opcode, None) {
            Some(effect) => line.push_str(&format!(" effect {effect:+}")),
            None => line.push_str(" effect varies"),
        }
        if info.cache_entries > 0 {
            line.push_str(&format!(" caches {}", info.cache_entries));
        }
        println!("{line}");
    }
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Disasm {
            path,
            python,
            implementation: imp,
            format,
            show_caches,
            dup_lines,
        }) => {
            let table = lookup(&python, implementation(imp));
            disasm(&path, &table, format, options(format, show_caches, dup_lines));
        }
        Some(TopLevel::Tables { command }) => match command {
            TablesCommand::List => {
                for key in registry::keys() {
                    let name = key.to_string();
                    match registry::get(key.version, key.implementation) {
                        Ok(table) => println!("{name:<16} {} opcodes", table.len()),
                        Err(e) => println!("{name:<16} unavailable: {e}"),
                    }
                }
            }
            TablesCommand::Show { version, implementation: imp, json } => {
                let table = lookup(&version, implementation(imp));
                show_table(&table, json);
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("{e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE: &str = r#"{"name": "<module>", "code": "6500 6501 1700 5300", "names": ["a", "b"]}"#;

    fn disasm_args(args: &[&str]) -> (String, FormatCli, DisassembleOptions) {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Some(TopLevel::Disasm { python, format, show_caches, dup_lines, .. }) => {
                (python, format, options(format, show_caches, dup_lines))
            }
            _ => panic!("not a disasm command"),
        }
    }

    fn run(args: &[&str]) -> String {
        let (python, format, options) = disasm_args(args);
        let table = registry::get(python.parse().unwrap(), Implementation::CPython).unwrap();
        let code: CodeObject = serde_json::from_str(CODE).unwrap();
        let disassembly = crossdis_lib::disassemble(&code, &table, &options).unwrap();
        render(&disassembly, &table, format).unwrap()
    }

    #[test]
    fn disasm_defaults() {
        let (python, format, options) = disasm_args(&["crossdis", "disasm", "code.json"]);
        assert_eq!(python, "3.12");
        assert_eq!(format, FormatCli::Basic);
        assert_eq!(options, DisassembleOptions::default());
    }

    #[test]
    fn extended_format_turns_on_annotation() {
        let (_, _, options) =
            disasm_args(&["crossdis", "disasm", "code.json", "--format", "extended", "--show-caches"]);
        assert!(options.extended && options.show_caches && !options.dup_lines);
    }

    #[test]
    fn renders_text_listing() {
        let out = run(&["crossdis", "disasm", "code.json", "--python", "3.8"]);
        assert_eq!(
            out,
            concat!(
                "   1    00000 LOAD_NAME                0 (a)\n",
                "        00002 LOAD_NAME                1 (b)\n",
                "        00004 BINARY_ADD\n",
                "        00006 RETURN_VALUE\n",
            )
        );
    }

    #[test]
    fn renders_extended_listing() {
        let out = run(&["crossdis", "disasm", "code.json", "--python", "3.8", "--format", "extended"]);
        assert!(out.contains("00004 BINARY_ADD           TOS = a + b\n"), "{out}");
        assert!(out.contains("00006 RETURN_VALUE         return a + b\n"), "{out}");
    }

    #[test]
    fn renders_json() {
        let out = run(&["crossdis", "disasm", "code.json", "--python", "3.8", "--format", "json"]);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["name"], "<module>");
        assert_eq!(value["instructions"][2]["opname"], "BINARY_ADD");
        assert_eq!(value["instructions"][2]["stack_effect"], -1);
        assert_eq!(value["instructions"][0]["argrepr"], "a");
    }

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn tables_and_completion_parse() {
        let cli = Cli::try_parse_from(["crossdis", "tables", "show", "2.7", "--impl", "pypy", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(TopLevel::Tables {
                command: TablesCommand::Show { ref version, implementation: ImplementationCli::Pypy, json: true }
            }) if version == "2.7"
        ));
        let cli = Cli::try_parse_from(["crossdis", "completion", "bash"]).unwrap();
        assert!(matches!(cli.command, Some(TopLevel::Completion { shell: clap_complete::Shell::Bash })));
        assert!(Cli::try_parse_from(["crossdis", "disasm", "code.json", "--format", "yaml"]).is_err());
    }
}
