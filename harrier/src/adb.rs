use std::io;
use std::process::Child;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use crate::command::{run_cmd, run_cmd_timeout, spawn_cmd, CmdOutput};
use crate::config::DeviceConfig;
use crate::precondition::UserId;
use crate::Context;

/// The Adb trait just abstracts some `adb` commands
pub trait Adb: Send + Sync {
    fn get_connected_devices(&self) -> crate::Result<Vec<String>>;

    /// Install the APK at the given path, for a single user if one is given.
    ///
    /// The output is returned as is, `adb install` reports some failures
    /// with a zero exit status.
    fn install(&self, apk: &str, user: Option<UserId>) -> crate::Result<CmdOutput>;

    /// Essentially the same as running `adb shell '...'`, bounded by the
    /// configured command timeout
    fn shell(&self, shell_cmd: &str) -> crate::Result<CmdOutput>;

    /// Start `adb shell '...'` with inherited stdio and no timeout
    fn spawn_shell(&self, shell_cmd: &str) -> io::Result<Child>;
}

lazy_static! {
    static ref DEVICE_NOT_FOUND: Regex = Regex::new(r"device\s+'([^']+)'\s+not\s+found").unwrap();
}

/// Turn errors reported by the `adb` binary itself, rather than by the
/// command run on the device, into their specific variants.
fn check_adb_errors(output: CmdOutput) -> crate::Result<CmdOutput> {
    if output.ok() {
        return Ok(output);
    }
    let stderr = output.stderr_utf8_lossy();
    if stderr.contains("no devices/emulators") {
        return Err(crate::Error::NoAdbDevice);
    }
    if let Some(caps) = DEVICE_NOT_FOUND.captures(&stderr) {
        let serial = caps
            .get(1)
            .map(|m| String::from(m.as_str()))
            .unwrap_or_else(|| "?".into());
        return Err(crate::Error::AdbDeviceNotFound(serial));
    }
    Ok(output)
}

#[derive(Clone)]
/// An `Adb` implementation that just invokes the external `adb` command.
pub struct ExecAdb {
    bin: String,
    serial: Option<String>,
    timeout: Duration,
}

impl ExecAdb {
    /// Creates a new `ExecAdb` from the `[device]` configuration, falling
    /// back to the environment for anything it doesn't set. `can-adb =
    /// false` in the config makes this fail.
    pub fn new(ctx: &dyn Context, cfg: &DeviceConfig) -> crate::Result<Self> {
        if !cfg.can_adb {
            return Err(crate::Error::AdbDisabled);
        }
        let bin = match &cfg.adb {
            Some(v) => v.clone(),
            None => ctx.get_bin("adb")?,
        };
        let serial = cfg
            .serial
            .clone()
            .or_else(|| ctx.maybe_get_env(crate::context::SERIAL_ENV));
        Ok(Self {
            bin,
            serial,
            timeout: cfg.command_timeout,
        })
    }

    pub fn get_serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }
}

macro_rules! adb_cmd {
    ($adb:ident, $($args:expr),*) => {
        if let Some(ref serial) = $adb.serial {
            run_cmd_timeout(&$adb.bin, &["-s", serial, $($args),*], $adb.timeout)
        } else {
            run_cmd_timeout(&$adb.bin, &[$($args),*], $adb.timeout)
        }
    }
}

impl Adb for ExecAdb {
    /// Returns a list of all connected devices (similar to `adb devices -l`)
    fn get_connected_devices(&self) -> crate::Result<Vec<String>> {
        let output = run_cmd(&self.bin, &["devices", "-l"])?;
        if !output.ok() {
            return Err(crate::Error::CommandError(
                output.status.code().unwrap_or(-1),
                output.stderr_utf8_lossy().trim().to_string(),
            ));
        }
        parse_devices(&output.stdout_utf8_lossy())
    }

    fn install(&self, apk: &str, user: Option<UserId>) -> crate::Result<CmdOutput> {
        let out = match user {
            Some(id) => {
                let id = id.to_string();
                adb_cmd!(self, "install", "-r", "-t", "--user", &id, apk)
            }
            None => adb_cmd!(self, "install", "-r", "-t", apk),
        }?;
        check_adb_errors(out)
    }

    fn shell(&self, shell_cmd: &str) -> crate::Result<CmdOutput> {
        check_adb_errors(adb_cmd!(self, "shell", shell_cmd)?)
    }

    fn spawn_shell(&self, shell_cmd: &str) -> io::Result<Child> {
        if let Some(ref serial) = self.serial {
            spawn_cmd(&self.bin, &["-s", serial, "shell", shell_cmd])
        } else {
            spawn_cmd(&self.bin, &["shell", shell_cmd])
        }
    }
}

fn parse_devices(out_str: &str) -> crate::Result<Vec<String>> {
    let mut split = out_str.split('\n');
    // Skip the first line
    if split.next().is_none() {
        return Err(crate::Error::NoAdbDevice);
    }

    let mut device_list = Vec::new();
    for l in split {
        let mut parts = l.split_ascii_whitespace();
        let (Some(id), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };
        if state == "device" {
            device_list.push(id.into());
        }
    }

    if device_list.is_empty() {
        return Err(crate::Error::NoAdbDevice);
    }

    Ok(device_list)
}
