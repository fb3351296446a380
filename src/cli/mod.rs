#![allow(clippy::print_stdout, clippy::print_stderr)]

use eyre::Result;
use log::LevelFilter;
use stderrlog::{LogLevelNum, StdErrLog};

#[cfg(target_os = "linux")]
mod core_handler;

pub fn build_logger(level: LevelFilter) -> StdErrLog {
    let mut log = stderrlog::new();

    log.module("excore");
    log.verbosity(LogLevelNum::from(level));

    log
}

pub fn main() {
    let result: Result<()> = {
        #[cfg(target_os = "linux")]
        {
            core_handler::main()
        }
        #[cfg(not(target_os = "linux"))]
        {
            Err(eyre::eyre!("excore only supports Linux hosts"))
        }
    };

    match result {
        Ok(_) => (),
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(-1);
        }
    }
}
