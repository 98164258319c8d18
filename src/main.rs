use std::process::ExitCode;

fn main() -> ExitCode {
  callboard_lib::run()
}
