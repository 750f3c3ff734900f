use anyhow::{bail, Context, Result};
use args::{Arguments, Command};
use clap::Parser;
use log::info;
use nvme_exerciser::{cases::builtin_cases, config::ExerciserConfig, suite::run_suite};
use simple_logger::SimpleLogger;

mod args;

fn main() -> Result<()> {
    let args = Arguments::parse();
    SimpleLogger::new()
        .with_level(args.log_level)
        .env()
        .init()
        .context("init logger")?;

    match args.command {
        Command::List => {
            for case in builtin_cases() {
                println!("{:<45} {}", case.name, case.description);
            }
            Ok(())
        }
        Command::Run(run) => {
            let config = ExerciserConfig::from(&run);
            info!("run with {config:?}");
            let report = run_suite(&config, &builtin_cases())?;
            println!("{report}");
            if !report.success() {
                bail!("{} of {} cases failed", report.failed(), report.results.len());
            }
            Ok(())
        }
    }
}
