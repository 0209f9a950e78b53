//! Binary entrypoint of the `parley` command line client.

use std::process::ExitCode;

use parley::start_parley;

/// Sign in, send one message and print the conversation transcript.
fn main() -> ExitCode {
    start_parley::run()
}
