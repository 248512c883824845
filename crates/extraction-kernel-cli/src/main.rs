use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = extraction_kernel_cli::Cli::parse();
    match extraction_kernel_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error[{}]: {err:#}", extraction_kernel_cli::error_kind(&err));
            ExitCode::FAILURE
        }
    }
}
