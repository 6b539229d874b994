use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use clap::{self, Args};
use log::{debug, info};

use harrier::adb::{Adb, ExecAdb};
use harrier::applier::{AdminInfo, FixtureState};
use harrier::command::quote;
use harrier::config::HarnessConfig;
use harrier::device::AdbDevice;
use harrier::events::{EventMonitor, FixtureEvent, TaskCancelCheck};
use harrier::precondition::{UserId, UserSelector};
use harrier::testapp::TestAppProvider;
use harrier::{Context, DeviceState, FixtureContext, TestOutcome, TestRun};

use crate::utils::{plan_runs, quoted_args, task_canceller};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Args)]
pub struct Run {
    /// Only run this variant
    #[arg(short, long)]
    variant: Option<String>,

    /// Print what is applied and undone as it happens
    #[arg(short = 'E', long)]
    events: bool,

    /// Stop after the first run that doesn't succeed
    #[arg(short = 'x', long)]
    fail_fast: bool,

    /// The plan file
    #[arg()]
    plan: PathBuf,

    /// The test command. A single argument is handed to the device shell as
    /// is, several are quoted individually.
    #[arg(last = true, required = true)]
    cmd: Vec<String>,
}

/// Prints fixture events to stderr
struct PrintMonitor;

impl EventMonitor<FixtureEvent> for PrintMonitor {
    fn on_event(&self, evt: FixtureEvent) {
        match evt {
            FixtureEvent::Applying { action } => eprintln!("  apply  {}", action),
            FixtureEvent::Retrying {
                action,
                attempt,
                error,
            } => eprintln!("  retry  {} (attempt {}): {}", action, attempt, error),
            FixtureEvent::ApplyFailed { action, error } => {
                eprintln!("  FAILED {}: {}", action, error)
            }
            FixtureEvent::Undoing { action } => eprintln!("  undo   {}", action),
            FixtureEvent::UndoFailed { action, error } => {
                eprintln!("  FAILED {}: {}", action, error)
            }
            FixtureEvent::Applied { .. }
            | FixtureEvent::TestStarted
            | FixtureEvent::TestFinished { .. } => {}
        }
    }
}

/// Environment describing the fixture to the test command
fn fixture_env(
    state: &FixtureState,
    instrumented: Option<UserId>,
    primary: Option<&AdminInfo>,
) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if let Some(id) = instrumented {
        env.push(("HARRIER_INSTRUMENTED_USER".into(), id.to_string()));
    }
    for (selector, id) in &state.users {
        if *selector == UserSelector::Instrumented {
            continue;
        }
        env.push((env_name("USER", selector.as_str()), id.to_string()));
    }
    if let Some(p) = primary {
        env.push(("HARRIER_PRIMARY_ADMIN".into(), p.component.clone()));
        env.push(("HARRIER_PRIMARY_USER".into(), p.user.to_string()));
    }
    if let Some(d) = &state.device_owner {
        env.push(("HARRIER_DEVICE_OWNER".into(), d.component.clone()));
    }
    for app in state.test_apps.values() {
        env.push((env_name("TEST_APP", &app.key), app.package.clone()));
    }
    env
}

fn env_name(prefix: &str, name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("HARRIER_{}_{}", prefix, name)
}

fn with_env(env: &[(String, String)], cmd: &str) -> String {
    if env.is_empty() {
        return cmd.to_string();
    }
    let exports: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("{}={}", k, quote(v)))
        .collect();
    format!("export {}; {}", exports.join(" "), cmd)
}

/// Run `cmd` on the device until it exits or the run is cancelled
fn run_body(adb: &dyn Adb, cmd: &str, cancel: &TaskCancelCheck) -> anyhow::Result<()> {
    debug!("running test command: {}", cmd);
    let mut child = adb.spawn_shell(cmd)?;
    loop {
        if let Some(status) = child.try_wait()? {
            if status.success() {
                return Ok(());
            }
            bail!("test command failed: {}", status);
        }
        if cancel.was_cancelled() {
            _ = child.kill();
            _ = child.wait();
            bail!("test command cancelled");
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn report(name: &str, run: &TestRun) {
    println!("{}: {}", name, run.outcome);
    for f in run.undo_failures() {
        println!("  left behind: {}", f);
    }
}

#[derive(Default)]
struct Tally {
    passed: usize,
    skipped: usize,
    failed: usize,
}

impl Tally {
    fn add(&mut self, run: &TestRun) {
        if !run.is_success() {
            self.failed += 1;
        } else if matches!(run.outcome, TestOutcome::Skipped(_)) {
            self.skipped += 1;
        } else {
            self.passed += 1;
        }
    }
}

impl Run {
    pub fn command(&self) -> String {
        match self.cmd.as_slice() {
            [single] => single.clone(),
            args => quoted_args(args),
        }
    }

    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        let runs = plan_runs(&self.plan, self.variant.as_deref())?;

        let cfg = HarnessConfig::load(ctx)?;
        let adb = ExecAdb::new(ctx, &cfg.device)?;
        let device = AdbDevice::new(Box::new(adb.clone()), &cfg.retry);
        let catalog = TestAppProvider::from_config(&cfg.catalog, &ctx.get_project_dir()?);
        let mut state = DeviceState::new(Arc::new(device), catalog, &cfg);
        if self.events {
            state = state.with_monitor(Box::new(PrintMonitor));
        }

        let (_signals, cancel) = task_canceller()?;
        let cmd = self.command();
        let mut tally = Tally::default();

        for run in runs {
            if cancel.was_cancelled() {
                break;
            }
            info!("starting run {}", run.name);
            if self.events {
                eprintln!("{}:", run.name);
            }
            let result = state.run_test(run.requests, |fx: &FixtureContext<'_>| {
                let instrumented = fx.user(UserSelector::Instrumented).ok();
                let env = fixture_env(fx.state(), instrumented, fx.primary());
                run_body(&adb, &with_env(&env, &cmd), &cancel)
            });
            report(&run.name, &result);
            tally.add(&result);
            if self.fail_fast && !result.is_success() {
                break;
            }
        }

        println!(
            "{} passed, {} skipped, {} failed",
            tally.passed, tally.skipped, tally.failed
        );
        if tally.failed > 0 {
            bail!("{} runs failed", tally.failed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::process::Command;

    use super::*;
    use crate::testing::{mock_adb, MockAdb};
    use harrier::applier::InstalledApp;
    use harrier::events::TaskCanceller;
    use mockall::predicate::eq;
    use rstest::*;

    fn local_shell(script: &'static str) -> MockAdb {
        let mut adb = MockAdb::new();
        adb.expect_spawn_shell()
            .with(eq("test-cmd"))
            .returning(move |_| Command::new("sh").arg("-c").arg(script).spawn());
        adb
    }

    #[test]
    fn test_body_passes_on_zero_exit() {
        let (_cancel, check) = TaskCanceller::new();
        assert!(run_body(&local_shell("exit 0"), "test-cmd", &check).is_ok());
    }

    #[test]
    fn test_body_fails_on_nonzero_exit() {
        let (_cancel, check) = TaskCanceller::new();
        let err = run_body(&local_shell("exit 3"), "test-cmd", &check).unwrap_err();
        assert!(err.to_string().contains("test command failed"));
    }

    #[test]
    fn test_body_killed_when_cancelled() {
        let (mut cancel, check) = TaskCanceller::new();
        cancel.cancel();
        let err = run_body(&local_shell("sleep 30"), "test-cmd", &check).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[rstest]
    fn test_spawn_error_propagates(mut mock_adb: MockAdb) {
        mock_adb
            .expect_spawn_shell()
            .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no adb")));
        let (_cancel, check) = TaskCanceller::new();
        assert!(run_body(&mock_adb, "anything", &check).is_err());
    }

    #[test]
    fn test_fixture_env() {
        let mut state = FixtureState::default();
        state.users.insert(UserSelector::WorkProfile, 10);
        state.users.insert(UserSelector::Instrumented, 0);
        state.test_apps.insert(
            "helper-app".into(),
            InstalledApp {
                key: "helper-app".into(),
                package: "com.example.helper".into(),
                user: 10,
                admin_component: None,
            },
        );
        let admin = AdminInfo {
            component: "com.example.dpc/.Admin".into(),
            package: "com.example.dpc".into(),
            user: 10,
        };

        let env = fixture_env(&state, Some(0), Some(&admin));
        let get = |k: &str| {
            env.iter()
                .find(|(name, _)| name == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("HARRIER_INSTRUMENTED_USER"), Some("0"));
        assert_eq!(get("HARRIER_USER_WORK_PROFILE"), Some("10"));
        assert_eq!(get("HARRIER_PRIMARY_ADMIN"), Some("com.example.dpc/.Admin"));
        assert_eq!(get("HARRIER_TEST_APP_HELPER_APP"), Some("com.example.helper"));
        assert_eq!(get("HARRIER_USER_INSTRUMENTED"), None);
        assert_eq!(get("HARRIER_DEVICE_OWNER"), None);
    }

    #[test]
    fn test_with_env() {
        assert_eq!(with_env(&[], "ls"), "ls");
        let env = vec![("A".to_string(), "it's".to_string())];
        assert_eq!(with_env(&env, "ls"), "export A='it'\"'\"'s'; ls");
    }
}
