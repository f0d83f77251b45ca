use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    tradehall_cli::init_tracing();
    let cli = tradehall_cli::Cli::parse();
    tradehall_cli::run_cli(cli)
}
