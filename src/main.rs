mod cli;
mod config;
mod error;
mod fedora;
mod logging;
mod output;
mod process;
mod report;
mod stages;

use clap::Parser;
use cli::Cli;
use error::PipelineError;

/// Exit status for an error: a failing external command passes its own
/// status through, everything else exits with 1.
fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<PipelineError>()
        .map_or(1, PipelineError::exit_code)
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    output::print_banner();

    match cli.execute().await {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("{} {e:#}", output::Tone::Fatal.paint("Error:"));
            std::process::exit(exit_code(&e));
        }
    }
}
