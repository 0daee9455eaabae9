//! vecedit - Draw and edit georeferenced vector files

use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(e) = vecedit::cli::run() {
        eprintln!("Error: {:#}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
