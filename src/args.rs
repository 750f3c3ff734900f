use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use exerciser_core::emulated::{CompletionOrder, EmulatedConfig};
use log::LevelFilter;
use nvme_exerciser::config::ExerciserConfig;

/// Conformance exerciser for NVMe controllers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Arguments {
    /// maximum log level
    #[arg(long, global = true, default_value_t = LevelFilter::Info)]
    pub log_level: LevelFilter,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// run the built-in cases against the emulated controller
    Run(RunArgs),
    /// list the built-in cases
    List,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// only run cases whose name contains this string
    #[arg(long)]
    pub filter: Option<String>,

    /// timeout for a single command in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,

    /// number of entries in each admin ring
    #[arg(long, default_value_t = 16)]
    pub admin_depth: u16,

    /// number of entries in each I/O ring
    #[arg(long, default_value_t = 64)]
    pub io_depth: u16,

    /// order in which the emulated controller posts the completions of a batch
    #[arg(long, value_enum, default_value_t = Order::InOrder)]
    pub completion_order: Order,

    /// delay between a doorbell and the completions of the emulated controller
    #[arg(long, default_value_t = 0)]
    pub latency_ms: u64,

    /// write a dump file for every failed case into this directory
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,

    /// run the remaining cases after a failure
    #[arg(long)]
    pub keep_going: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum Order {
    InOrder,
    Reversed,
}

impl From<Order> for CompletionOrder {
    fn from(value: Order) -> Self {
        match value {
            Order::InOrder => CompletionOrder::InOrder,
            Order::Reversed => CompletionOrder::Reversed,
        }
    }
}

impl From<&RunArgs> for ExerciserConfig {
    fn from(args: &RunArgs) -> Self {
        Self {
            filter: args.filter.clone(),
            timeout: Duration::from_millis(args.timeout_ms),
            admin_depth: args.admin_depth,
            io_depth: args.io_depth,
            dump_dir: args.dump_dir.clone(),
            keep_going: args.keep_going,
            device: EmulatedConfig {
                completion_order: args.completion_order.into(),
                latency: Duration::from_millis(args.latency_ms),
                ..EmulatedConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let args = Arguments::parse_from(["nvme_exerciser", "run"]);
        assert_eq!(args.log_level, LevelFilter::Info);
        let Command::Run(run) = args.command else {
            panic!("expected run command");
        };
        let config = ExerciserConfig::from(&run);
        let default = ExerciserConfig::default();
        assert_eq!(config.timeout, default.timeout);
        assert_eq!(config.admin_depth, default.admin_depth);
        assert_eq!(config.io_depth, default.io_depth);
        assert_eq!(config.device.completion_order, CompletionOrder::InOrder);
        assert!(!config.keep_going);
    }

    #[test]
    fn run_options() {
        let args = Arguments::parse_from([
            "nvme_exerciser",
            "run",
            "--filter",
            "io::",
            "--completion-order",
            "reversed",
            "--latency-ms",
            "3",
            "--keep-going",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.log_level, LevelFilter::Debug);
        let Command::Run(run) = args.command else {
            panic!("expected run command");
        };
        let config = ExerciserConfig::from(&run);
        assert_eq!(config.filter.as_deref(), Some("io::"));
        assert_eq!(config.device.completion_order, CompletionOrder::Reversed);
        assert_eq!(config.device.latency, Duration::from_millis(3));
        assert!(config.keep_going);
    }
}
