//! Binary entrypoint for the Brave Playground terminal client.

use std::process::ExitCode;

use brave_playground::start_playground;

/// Start the terminal client against the configured backend.
fn main() -> ExitCode {
    start_playground::run()
}
