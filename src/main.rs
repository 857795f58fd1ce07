use std::process::ExitCode;

fn main() -> ExitCode {
    hybrid_interp::run_cli()
}
