//! Entry point for the `osc` command-line interface.
#![forbid(unsafe_code)]

fn main() {
    std::process::exit(osc_cli::run());
}
