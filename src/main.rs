mod cli;

use std::process::ExitCode;

use clap::Parser;

use crate::cli::app::App;
use crate::cli::args::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match App::new(cli).run().await {
        Ok(code) => code,
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
