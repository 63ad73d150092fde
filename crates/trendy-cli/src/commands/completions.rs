use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use clap::CommandFactory;
use clap_complete::{generate, Shell};

use crate::cli::Cli;
use crate::error::CliError;

const BIN_NAME: &str = "trendy";

/// Write the completion script for `shell` to `output_path`, or stdout
pub fn run_completions(shell: Shell, output_path: Option<&Path>) -> Result<(), CliError> {
    let mut command = Cli::command();

    match output_path {
        Some(path) => {
            let mut file = File::create(path)?;
            generate(shell, &mut command, BIN_NAME, &mut file);
            file.flush()?;
            println!("{}", path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            generate(shell, &mut command, BIN_NAME, &mut stdout);
            stdout.flush()?;
        }
    }
    Ok(())
}
