use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, OutputModeCli, TopLevel};

mod cli;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            let path = match cli.path {
                Some(path) => path,
                None => {
                    Cli::command().print_help().unwrap();
                    return;
                }
            };
            let mode = match cli.mode {
                OutputModeCli::Source => depyc_lib::OutputMode::Source,
                OutputModeCli::Disasm => depyc_lib::OutputMode::Disasm,
            };
            let options = depyc_lib::DecompileOptions {
                mode,
                warn_banner: !cli.no_banner,
            };
            match std::fs::read(&path) {
                Ok(bytes) => match depyc_lib::decompile_with_options(&bytes, options) {
                    Ok(out) => {
                        print!("{out}");
                    }
                    Err(e) => {
                        eprintln!("decompile error: {e}");
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    eprintln!("failed to read {path:?}: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
