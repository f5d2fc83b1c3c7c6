use std::io;

use clap::Parser;
use federa::{Cli, run};
use federa_error::ConnectorError;

fn main() {
    let cli = Cli::parse();
    logutil::configure_global_logger(cli.log_level(), cli.log_format.into(), io::stderr);

    let mut stdout = io::stdout().lock();
    match run(&cli.command, &mut stdout) {
        Ok(()) => (),
        Err(err @ ConnectorError::Configuration(_)) => {
            eprintln!("CONFIGURATION ERROR: {err}");
            std::process::exit(2);
        }
        Err(err) => {
            eprintln!("ERROR: {err}");
            std::process::exit(1);
        }
    }
}
