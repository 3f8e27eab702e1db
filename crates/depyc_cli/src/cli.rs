use std::path::PathBuf;

use clap::{
    builder::{styling::AnsiColor, Styles},
    crate_description, crate_name, crate_version, Parser, Subcommand, ValueEnum,
};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputModeCli {
    Source,
    Disasm,
}

#[derive(Parser)]
#[command(name = crate_name!(),
    version = crate_version!(),
    about = crate_description!(),
    args_conflicts_with_subcommands = true,
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default())
        .usage(AnsiColor::Cyan.on_default())
        .literal(AnsiColor::BrightCyan.on_default())
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<TopLevel>,

    /// Path to the compiled module (.pyc)
    pub path: Option<PathBuf>,

    /// Output mode
    #[arg(long, value_enum, default_value_t = OutputModeCli::Source)]
    pub mode: OutputModeCli,

    /// Suppress the warning banner on incomplete decompiles
    #[arg(long, default_value_t = false)]
    pub no_banner: bool,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}
