use std::process::ExitCode;

use clap::Parser;

use tiersort::cli::{self, Cli};
use tiersort::logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Usage errors share the invalid-configuration status.
            return if e.use_stderr() {
                ExitCode::from(9)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    logging::init();

    match cli::dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
