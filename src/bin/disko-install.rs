use anyhow::Result;

use disko_install::config::{self, Invocation};
use disko_install::{install, preflight};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let run_config = match config::parse_args(&args)? {
        Invocation::Help => {
            println!("{}", config::usage());
            return Ok(());
        }
        Invocation::Run(run_config) => run_config,
    };

    preflight::require_root()?;
    preflight::check_host_tools()?;

    install::run(&run_config)?;
    Ok(())
}
