use std::borrow::Cow;
use std::path::PathBuf;

use anyhow::Context as AnyhowContext;
use clap::{Parser, Subcommand};
use flexi_logger::{FileSpec, LevelFilter, LogSpecification, Logger, LoggerHandle, WriteMode};

use harrier::{Context, DefaultContext};

mod catalog;
use catalog::Catalog;

mod check;
use check::RunCheck;

mod resolve;
use resolve::Resolve;

mod run;
use run::Run;

mod state;
use state::State;

mod utils;

#[cfg(test)]
mod testing;

const SIMPLE_VERSION_STRING: &'static str =
    include!(concat!(env!("OUT_DIR"), "/simple_version_string"));
const VERSION_STRING: &'static str = include!(concat!(env!("OUT_DIR"), "/version_string"));

#[derive(Parser)]
#[command(name = "harrier")]
#[command(version(SIMPLE_VERSION_STRING))]
#[command(long_version(VERSION_STRING))]
struct Cli {
    /// `-e`, `--log-stderr`: Flag value, when enabled will cause logs to be output to `stderr`
    /// instead of a log file. Disabled by default (logs go to a file by default)
    #[arg(short = 'e', long, help = "Log to stderr instead of a file", action = clap::ArgAction::SetTrue, default_value_t = false)]
    log_stderr: bool,

    /// `-f`, `--log-file`: Path to desired log output file location. Optional, defaults to
    /// `$HARRIER_PROJECT_HOME/harrier_out/log`
    #[arg(short = 'f', long, help = "Send log output to the given file")]
    log_file: Option<PathBuf>,

    /// `-s`, `--log-spec`: Debug options for [flexi_logger](https://docs.rs/flexi_logger/latest/flexi_logger/struct.LogSpecification.html)
    #[arg(short = 's', long, help = "Log spec for flexi_logger")]
    log_spec: Option<String>,

    /// `-l`, `--log-level`: Set the desired log verbosity. Defaults to 0, all values are listed
    /// below:
    ///
    /// | Value | Log Level |
    /// | ----- | --------- |
    /// | **0** | **Warn** |
    /// | 1 | Info |
    /// | 2 | Debug |
    /// | 3 | Trace |
    #[arg(
        short = 'l',
        long,
        help = "Set the log level, 0 = warn, 1 = info, etc",
        long_help = None,
        default_value_t = 0
    )]
    log_level: u8,

    /// The command being called. See [Commands] for the implemented options
    #[command(subcommand)]
    command: Commands,
}

/// The currently implemented commands
#[derive(Subcommand)]
enum Commands {
    /// Display the full version string and exit
    #[command()]
    Version,

    /// Check to see if you are able to use `harrier`
    #[command()]
    RunCheck(RunCheck),

    /// Resolve a plan file and print the order preconditions would be applied in
    ///
    /// Nothing is done to the device.
    #[command()]
    Resolve(Resolve),

    /// Apply a plan on the device, run a command as the test and tear down
    ///
    /// Everything after `--` is run through `adb shell` once the plan is
    /// applied. The exit status is 1 if any run failed or left state behind.
    #[command()]
    Run(Run),

    /// Show the users and owners currently on the device
    #[command()]
    State(State),

    /// Operations on the test app catalog
    #[command()]
    Catalog(Catalog),
}

fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

impl Cli {
    fn configure_loggers(&self, ctx: &DefaultContext) -> anyhow::Result<LoggerHandle> {
        let log_spec = match &self.log_spec {
            Some(s) => {
                LogSpecification::parse(s).with_context(|| format!("parsing log spec {}", s))?
            }
            None => {
                if self.log_level > 0 {
                    LogSpecification::builder()
                        .module("harrier", level_filter(self.log_level))
                        .build()
                } else {
                    LogSpecification::env().with_context(|| "getting log spec from env")?
                }
            }
        };

        let mut logger = Logger::with(log_spec);

        if !self.log_stderr {
            let path = match &self.log_file {
                Some(v) => {
                    if v.is_absolute() {
                        Some(Cow::Borrowed(v))
                    } else {
                        let full_path = std::env::current_dir()?.join(v);
                        Some(Cow::Owned(full_path))
                    }
                }
                None => ctx.get_output_dir().map(|d| Cow::Owned(d.join("log"))).ok(),
            };

            if let Some(p) = &path {
                logger = logger
                    .log_to_file(
                        FileSpec::try_from(p.as_ref()).with_context(|| "creating filespec")?,
                    )
                    .append()
                    .write_mode(WriteMode::BufferAndFlush);
            }
        }

        Ok(logger.start().with_context(|| "starting logger")?)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = &cli.command {
        println!("{}", VERSION_STRING);
        println!("library {}", harrier::version::Version::default());
        return Ok(());
    }

    let ctx = DefaultContext::default();

    let log_handle = cli.configure_loggers(&ctx)?;

    let res = match cli.command {
        Commands::RunCheck(c) => c.run(&ctx),
        Commands::Resolve(c) => c.run(),
        Commands::Run(c) => c.run(&ctx),
        Commands::State(c) => c.run(&ctx),
        Commands::Catalog(c) => c.run(&ctx),

        Commands::Version => panic!("unreachable"),
    };

    log_handle.flush();
    res
}
