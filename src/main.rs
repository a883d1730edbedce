mod app;
mod command;
mod config;
mod correlator;
mod dispatch;
mod encode;
mod native;
mod protocol;
mod server;
mod state;
mod tui;
mod ui;

use std::{fs::OpenOptions, sync::Mutex};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{WrapErr, eyre},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config = config::Config::parse();
    init_tracing(&config)?;

    let app = app::LicensetapApp::bootstrap(config).await?;
    app.run().await
}

fn init_tracing(config: &config::Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("licensetap=info,licensetap::correlator=debug"))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact();

    // The dashboard owns the terminal, so logs go to a file instead.
    let result = if config.headless {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
            .wrap_err_with(|| format!("failed to open log file {}", config.log_file.display()))?;
        builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
    };

    result.map_err(|err| eyre!(err))
}
