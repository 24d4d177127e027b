use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use zonewall_api as api;

mod ansi;
mod args;
mod client;
mod commands;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = args::Args::parse();

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .init();

    match args.execute().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err.exit_code();
            error!("Error: {err}");
            ExitCode::from(code)
        }
    }
}

#[macro_export]
macro_rules! println {
    ($($t:tt)*) => {{
        #[allow(clippy::disallowed_macros)]
        let x = anstream::println!($($t)*);
        x
    }};
}

#[macro_export]
macro_rules! eprintln {
    ($($t:tt)*) => {{
        #[allow(clippy::disallowed_macros)]
        let x = anstream::eprintln!($($t)*);
        x
    }};
}

/// A failure at the CLI level: either the daemon's structured error, or a
/// local problem mapped into the same taxonomy for exit codes.
pub use api::ApiError as CliError;
