use anyhow::Result;
use clap::Parser;

mod app;
mod cli;
mod logger;
mod scene;

fn main() -> Result<()> {
    let cli = crate::cli::Cli::parse();
    crate::app::run(cli)
}
