use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match slangdeck::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "slangdeck failed");
            ExitCode::FAILURE
        }
    }
}
