use clap::Parser;
use quantscript::cli::{Cli, run};

fn main() -> std::process::ExitCode {
    run(Cli::parse())
}
