use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImplementationCli {
    Cpython,
    Pypy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatCli {
    Basic,
    Extended,
    Json,
}

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Magenta.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Disassembles a code object stored as JSON
    Disasm {
        /// Path to the code object JSON file
        path: PathBuf,

        /// Python version the bytecode was compiled for, e.g. 3.11
        #[arg(long, default_value = "3.12")]
        python: String,

        /// Python implementation
        #[arg(long = "impl", value_enum, default_value_t = ImplementationCli::Cpython)]
        implementation: ImplementationCli,

        /// Output format
        #[arg(long, value_enum, default_value_t = FormatCli::Basic)]
        format: FormatCli,

        /// List inline cache entries as CACHE instructions
        #[arg(long, default_value_t = false)]
        show_caches: bool,

        /// Show a line number for every line table entry, even repeated ones
        #[arg(long, default_value_t = false)]
        dup_lines: bool,
    },
    /// Inspects the compiled-in opcode tables
    Tables {
        #[command(subcommand)]
        command: TablesCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum TablesCommand {
    /// Lists every shipped table
    List,
    /// Prints the opcodes of one table
    Show {
        /// Python version, e.g. 2.7
        version: String,

        /// Python implementation
        #[arg(long = "impl", value_enum, default_value_t = ImplementationCli::Cpython)]
        implementation: ImplementationCli,

        /// Print the full table as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}
