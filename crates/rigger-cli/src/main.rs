use std::process::ExitCode;

fn main() -> ExitCode {
    match rigger_cli::run() {
        // A signal-terminated command reports -1, which wraps to 255
        // like a shell would report it.
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("rigger: {err:#}");
            ExitCode::FAILURE
        }
    }
}
