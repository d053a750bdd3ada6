//! Entry-point for the `sable` binary.

use clap::Parser;
use sable_cli::Cli;
use sable_cli::run_main;

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let cli = Cli::parse();
        if let Err(e) = run_main(cli).await {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
        Ok(())
    })
}
