mod api;
mod clients;
mod command;
mod enforcer;
mod handles;
mod tc;
mod web;

use clap::Parser;
use command::{run, Options};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    run(options).await?;
    Ok(())
}
