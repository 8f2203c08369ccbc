#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use dets_cli::{init_logging, run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    run_cli(cli)
}
