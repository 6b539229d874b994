use std::borrow::Cow;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError};
use log::Level::Debug;
use log::{debug, log_enabled, warn};

pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    #[inline]
    pub fn ok(&self) -> bool {
        self.status.success()
    }

    #[inline]
    pub fn stdout_utf8_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    #[inline]
    pub fn stderr_utf8_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// stdout and stderr joined, useful when a tool is inconsistent about
    /// where it reports errors
    pub fn combined_output(&self) -> String {
        let out = self.stdout_utf8_lossy();
        let err = self.stderr_utf8_lossy();
        match (out.trim().is_empty(), err.trim().is_empty()) {
            (true, _) => err.trim().to_string(),
            (_, true) => out.trim().to_string(),
            _ => format!("{}\n{}", out.trim(), err.trim()),
        }
    }
}

impl From<Output> for CmdOutput {
    fn from(output: Output) -> Self {
        Self {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Quotes a string with single quotes
pub fn quote(s: &str) -> String {
    let mut new = String::with_capacity(s.len() + 2);
    new.push('\'');
    for c in s.chars() {
        if c == '\'' {
            new.push_str("'\"'\"'");
        } else {
            new.push(c);
        }
    }
    new.push('\'');
    new
}

/// Start a command with inherited stdio and return the handle without
/// waiting for it
pub fn spawn_cmd<C, S>(cmd: C, args: &[S]) -> io::Result<Child>
where
    C: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    log_cmd(&cmd, args);
    Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .spawn()
}

pub fn run_cmd<C, S>(cmd: C, args: &[S]) -> io::Result<CmdOutput>
where
    C: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    log_cmd(&cmd, args);
    Command::new(cmd)
        .args(args)
        .output()
        .map(|output| output.into())
}

/// Run a command, killing it if it hasn't finished after `timeout`.
///
/// Both pipes are drained on a helper thread so a chatty child can't block on
/// a full pipe while we wait.
pub fn run_cmd_timeout<C, S>(cmd: C, args: &[S], timeout: Duration) -> crate::Result<CmdOutput>
where
    C: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    log_cmd(&cmd, args);

    let mut child = Command::new(&cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let (tx, rx) = bounded(1);
    let mut out = child.stdout.take();
    let mut err = child.stderr.take();

    thread::spawn(move || {
        let err_reader = thread::spawn(move || -> io::Result<Vec<u8>> {
            let mut buf = Vec::new();
            if let Some(e) = err.as_mut() {
                e.read_to_end(&mut buf)?;
            }
            Ok(buf)
        });
        let mut stdout = Vec::new();
        let res = match out.as_mut().map(|o| o.read_to_end(&mut stdout)) {
            Some(Err(e)) => Err(e),
            _ => match err_reader.join() {
                Ok(Ok(stderr)) => Ok((stdout, stderr)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::Other,
                    "stderr reader panicked",
                )),
            },
        };
        _ = tx.send(res);
    });

    match rx.recv_timeout(timeout) {
        Ok(res) => {
            let (stdout, stderr) = res?;
            let status = child.wait()?;
            Ok(CmdOutput {
                status,
                stdout,
                stderr,
            })
        }
        Err(RecvTimeoutError::Timeout) => {
            kill_child(&mut child);
            Err(crate::Error::CommandTimeout(
                display_cmd(&cmd, args),
                timeout.as_secs(),
            ))
        }
        Err(RecvTimeoutError::Disconnected) => {
            kill_child(&mut child);
            Err(crate::Error::new_generic("command output reader went away"))
        }
    }
}

fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("failed to kill child: {}", e);
    }
    _ = child.wait();
}

fn display_cmd<C, S>(cmd: &C, args: &[S]) -> String
where
    C: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let mut s = cmd.as_ref().to_string_lossy().into_owned();
    for a in args {
        s.push(' ');
        s.push_str(&a.as_ref().to_string_lossy());
    }
    s
}

fn log_cmd<C, S>(cmd: &C, args: &[S])
where
    C: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    if log_enabled!(Debug) {
        debug!("running `{}`", display_cmd(cmd, args));
    }
}
