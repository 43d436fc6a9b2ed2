use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match premia_cli::run_app().await {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            eprintln!("premia failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
