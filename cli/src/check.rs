use std::fmt;

use clap::{self, Args};
use harrier::adb::{Adb, ExecAdb};
use harrier::config::HarnessConfig;
use harrier::context::{PROJECT_HOME_ENV, SERIAL_ENV};
use harrier::Context;

#[derive(Args)]
pub struct RunCheck {
    /// Also check that a device is reachable over adb
    #[arg(short = 'D', long)]
    device: bool,
}

#[derive(Debug, PartialEq)]
enum Importance {
    Optional,
    Required,
}

#[derive(Debug, PartialEq)]
enum Status {
    Missing,
    Exists(String),
}

struct Info {
    name: String,
    status: Status,
    importance: Importance,
}

fn check_bin(ctx: &dyn Context, bin: &str, importance: Importance) -> Info {
    let status = match ctx.maybe_get_bin(bin) {
        None => Status::Missing,
        Some(path) => Status::Exists(path),
    };

    Info {
        name: bin.into(),
        status,
        importance,
    }
}

fn check_env(ctx: &dyn Context, env: &str, importance: Importance) -> Info {
    let status = match ctx.maybe_get_env(env) {
        None => Status::Missing,
        Some(env) => Status::Exists(env),
    };

    Info {
        name: env.into(),
        status,
        importance,
    }
}

/// Whether the project configuration loads, and if not why
fn check_config(ctx: &dyn Context) -> Info {
    let status = match HarnessConfig::load(ctx) {
        Ok(_) => match ctx.get_project_config_file() {
            Ok(p) if p.exists() => Status::Exists(p.to_string_lossy().into()),
            _ => Status::Exists("defaults".into()),
        },
        Err(e) => {
            log::error!("loading configuration: {}", e);
            Status::Missing
        }
    };
    Info {
        name: "configuration".into(),
        status,
        importance: Importance::Required,
    }
}

#[cfg(feature = "emoji")]
mod status {
    pub const FAIL: &'static str = "💩";
    pub const OK: &'static str = "🚀";
    pub const MEH: &'static str = "😒";
}

#[cfg(not(feature = "emoji"))]
mod status {
    pub const FAIL: &'static str = "Fail";
    pub const OK: &'static str = "Ok";
    pub const MEH: &'static str = "Meh";
}

use status::*;

impl RunCheck {
    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        let mut checks = vec![check_bin(ctx, "adb", Importance::Required)];

        println!("External programs:");
        #[cfg(feature = "emoji")]
        {
            println!("\n{} = Present", OK);
            println!("{} = Required and missing", FAIL);
            println!("{} = Optional and missing\n", MEH);
        }

        for c in checks.iter() {
            println!("{}", c);
        }

        checks.clear();

        let optional_envs = &[PROJECT_HOME_ENV, SERIAL_ENV, "ANDROID_HOME"];

        println!("\nEnvironmental variables:\n");

        for it in optional_envs {
            checks.push(check_env(ctx, it, Importance::Optional));
        }

        for c in checks.iter() {
            println!("{}", c);
        }

        println!("\nProject:\n");
        let config = check_config(ctx);
        println!("{}", config);

        if self.device {
            println!("\nDevices:\n");
            let cfg = HarnessConfig::load(ctx)?;
            let adb = ExecAdb::new(ctx, &cfg.device)?;
            let devices = adb.get_connected_devices()?;
            if devices.is_empty() {
                println!("{}: no device connected", FAIL);
            }
            for d in devices {
                let chosen = adb.get_serial().map_or(false, |s| s == d);
                println!("{}: {}{}", OK, d, if chosen { " (selected)" } else { "" });
            }
        }

        Ok(())
    }
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.status {
            Status::Missing => {
                write!(
                    f,
                    "{}: {}",
                    match self.importance {
                        Importance::Optional => MEH,
                        Importance::Required => FAIL,
                    },
                    self.name
                )
            }
            Status::Exists(path) => {
                write!(f, "{}: {} ({})", OK, self.name, path)
            }
        }
    }
}
