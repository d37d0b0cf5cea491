use std::process::ExitCode;

fn main() -> ExitCode {
    grocy_desktop_lib::run()
}
